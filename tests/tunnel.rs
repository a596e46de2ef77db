//! End-to-end over loopback TCP: dial, Noise-IK handshake with MAC armor,
//! then framed AEAD traffic in both directions.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;

use tungo::crypto::cookie::{CookieJar, LoadMonitor};
use tungo::crypto::handshake::derive_public;
use tungo::crypto::{
    ClientHandshake, Direction, KeyRing, Msg1Verdict, PeerAcl, ServerHandshake,
};
use tungo::settings::{ConnectionSettings, TransportKind};
use tungo::transport::dial::dial;
use tungo::transport::{LinkReader, LinkWriter};

const MARKER: &[u8] = b"tungo-e2e";
const TUNNEL_IP: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn client_settings(port: u16) -> ConnectionSettings {
    ConnectionSettings {
        transport: TransportKind::Tcp,
        remote_host: "127.0.0.1".into(),
        remote_port: port,
        mtu: 1280,
        tun_name: "tun-e2e".into(),
        tun_addr: TUNNEL_IP,
        tun_prefix: 24,
        session_marker: MARKER.to_vec(),
        dial_timeout_secs: 2,
    }
}

#[tokio::test]
async fn tcp_handshake_and_echo() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client_priv = [0x11u8; 32];
    let server_priv = [0x22u8; 32];
    let server_pub = derive_public(&server_priv);
    let client_pub = derive_public(&client_priv);

    let server = tokio::spawn(async move {
        let (stream, remote) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = LinkReader::Tcp(read_half);
        let mut writer = LinkWriter::Tcp(write_half);

        let jar = CookieJar::new();
        let load = LoadMonitor::new(64);
        let acl = PeerAcl::new(vec![client_pub]);
        let handshake = ServerHandshake::new(&server_priv, MARKER, &acl, &jar, &load);

        let msg1 = reader.recv_handshake().await.unwrap();
        let verdict = handshake
            .process_msg1(&msg1, remote.ip(), unix_now())
            .unwrap();
        let Msg1Verdict::Respond { msg2, established } = verdict else {
            panic!("expected immediate response");
        };
        writer.send_handshake(&msg2).await.unwrap();

        assert_eq!(established.peer_static(), Some(client_pub));
        assert_eq!(established.tunnel_ip(), Some(TUNNEL_IP));
        let mut ring = KeyRing::new(established.into_session(Direction::Server, false), false);

        // Echo one decrypted frame back, re-sealed in our direction.
        let frame = reader.recv_frame().await.unwrap();
        let plaintext = ring
            .decrypt_in_order(frame.epoch, &frame.ciphertext)
            .unwrap();
        let (epoch, nonce, ciphertext) = ring.encrypt(&plaintext).unwrap();
        writer
            .send_frame(epoch, nonce, ring.route_id(), &ciphertext)
            .await
            .unwrap();
        plaintext
    });

    let (mut reader, mut writer) = dial(&client_settings(port)).await.unwrap();
    let hs = ClientHandshake::new(&client_priv, &server_pub, MARKER, TUNNEL_IP).unwrap();
    writer.send_handshake(hs.message()).await.unwrap();
    let msg2 = reader.recv_handshake().await.unwrap();
    let established = hs.finish(&msg2).unwrap();
    let mut ring = KeyRing::new(established.into_session(Direction::Client, false), false);

    let payload = b"ping across the tunnel".to_vec();
    let (epoch, nonce, ciphertext) = ring.encrypt(&payload).unwrap();
    writer
        .send_frame(epoch, nonce, ring.route_id(), &ciphertext)
        .await
        .unwrap();

    let echoed = reader.recv_frame().await.unwrap();
    let plaintext = ring
        .decrypt_in_order(echoed.epoch, &echoed.ciphertext)
        .unwrap();
    assert_eq!(plaintext, payload);

    let server_saw = server.await.unwrap();
    assert_eq!(server_saw, payload);
}

#[tokio::test]
async fn tcp_cookie_exchange_on_loaded_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client_priv = [0x31u8; 32];
    let server_priv = [0x32u8; 32];
    let server_pub = derive_public(&server_priv);

    let server = tokio::spawn(async move {
        let (stream, remote) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = LinkReader::Tcp(read_half);
        let mut writer = LinkWriter::Tcp(write_half);

        let jar = CookieJar::new();
        let load = LoadMonitor::new(64);
        load.force(true);
        let acl = PeerAcl::default();
        let handshake = ServerHandshake::new(&server_priv, MARKER, &acl, &jar, &load);

        loop {
            let msg1 = reader.recv_handshake().await.unwrap();
            match handshake
                .process_msg1(&msg1, remote.ip(), unix_now())
                .unwrap()
            {
                Msg1Verdict::CookieDemand(reply) => {
                    writer.send_handshake(&reply).await.unwrap();
                }
                Msg1Verdict::Respond { msg2, .. } => {
                    writer.send_handshake(&msg2).await.unwrap();
                    return;
                }
            }
        }
    });

    let (mut reader, mut writer) = dial(&client_settings(port)).await.unwrap();
    let mut hs = ClientHandshake::new(&client_priv, &server_pub, MARKER, TUNNEL_IP).unwrap();
    writer.send_handshake(hs.message()).await.unwrap();

    // First reply is the 56-byte cookie demand, distinguishable from MSG2
    // by length alone.
    let reply = reader.recv_handshake().await.unwrap();
    assert_eq!(reply.len(), 56);
    hs.apply_cookie_reply(&reply).unwrap();
    writer.send_handshake(hs.message()).await.unwrap();

    let msg2 = reader.recv_handshake().await.unwrap();
    assert!(hs.finish(&msg2).is_ok());
    server.await.unwrap();
}

#[tokio::test]
async fn udp_registration_queue_handshake_and_frames() {
    use std::sync::Arc;
    use tokio::net::UdpSocket;
    use tungo::transport::queue::RegistrationQueue;

    let server_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = server_socket.local_addr().unwrap().port();

    let client_priv = [0x41u8; 32];
    let server_priv = [0x42u8; 32];
    let server_pub = derive_public(&server_priv);

    let server = {
        let socket = server_socket.clone();
        tokio::spawn(async move {
            // Demux-lite: the first datagram comes from an unknown address
            // and lands in a registration queue feeding the handshake.
            let queue = Arc::new(RegistrationQueue::new());
            let mut buf = vec![0u8; 2048];
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert!(queue.enqueue(&buf[..n]));

            let mut reader = LinkReader::UdpQueue(queue.clone());
            let mut writer = LinkWriter::Udp { socket: socket.clone(), peer: Some(from) };

            let jar = CookieJar::new();
            let load = LoadMonitor::new(64);
            let acl = PeerAcl::default();
            let handshake = ServerHandshake::new(&server_priv, MARKER, &acl, &jar, &load);
            let msg1 = reader.recv_handshake().await.unwrap();
            let Msg1Verdict::Respond { msg2, established } = handshake
                .process_msg1(&msg1, from.ip(), unix_now())
                .unwrap()
            else {
                panic!("expected immediate response");
            };
            writer.send_handshake(&msg2).await.unwrap();
            queue.close();

            let mut ring =
                KeyRing::new(established.into_session(Direction::Server, true), true);

            // One datagram in from the client, one echoed back.
            let (n, _) = socket.recv_from(&mut buf).await.unwrap();
            let parsed = tungo::framing::udp::decode(&buf[..n]).unwrap();
            assert_eq!(parsed.route_id, ring.route_id());
            let plaintext = ring
                .decrypt_datagram(&parsed.nonce, parsed.ciphertext)
                .unwrap();
            let (epoch, nonce, ciphertext) = ring.encrypt(&plaintext).unwrap();
            writer
                .send_frame(epoch, nonce, ring.route_id(), &ciphertext)
                .await
                .unwrap();
            plaintext
        })
    };

    let mut settings = client_settings(port);
    settings.transport = TransportKind::Udp;
    let (mut reader, mut writer) = dial(&settings).await.unwrap();

    let hs = ClientHandshake::new(&client_priv, &server_pub, MARKER, TUNNEL_IP).unwrap();
    writer.send_handshake(hs.message()).await.unwrap();
    let msg2 = reader.recv_handshake().await.unwrap();
    let established = hs.finish(&msg2).unwrap();
    reader.set_route_id(established.route_id());
    let mut ring = KeyRing::new(established.into_session(Direction::Client, true), true);

    let payload = b"datagram through the tunnel".to_vec();
    let (epoch, nonce, ciphertext) = ring.encrypt(&payload).unwrap();
    writer
        .send_frame(epoch, nonce, ring.route_id(), &ciphertext)
        .await
        .unwrap();

    let echoed = reader.recv_frame().await.unwrap();
    let nonce = echoed.nonce.expect("datagram frames carry a nonce");
    let plaintext = ring.decrypt_datagram(&nonce, &echoed.ciphertext).unwrap();
    assert_eq!(plaintext, payload);

    assert_eq!(server.await.unwrap(), payload);
}

#[tokio::test]
async fn ws_handshake_and_frames() {
    use tokio_tungstenite::MaybeTlsStream;
    use tungo::framing::ws;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client_priv = [0x51u8; 32];
    let server_priv = [0x52u8; 32];
    let server_pub = derive_public(&server_priv);

    let server = tokio::spawn(async move {
        let (stream, remote) = listener.accept().await.unwrap();
        let ws_stream = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .unwrap();
        let (ws_reader, ws_writer) = ws::split(ws_stream);
        let mut reader = LinkReader::Ws(ws_reader);
        let mut writer = LinkWriter::Ws(ws_writer);

        let jar = CookieJar::new();
        let load = LoadMonitor::new(64);
        let acl = PeerAcl::default();
        let handshake = ServerHandshake::new(&server_priv, MARKER, &acl, &jar, &load);
        let msg1 = reader.recv_handshake().await.unwrap();
        let Msg1Verdict::Respond { msg2, established } = handshake
            .process_msg1(&msg1, remote.ip(), unix_now())
            .unwrap()
        else {
            panic!("expected immediate response");
        };
        writer.send_handshake(&msg2).await.unwrap();

        let mut ring = KeyRing::new(established.into_session(Direction::Server, false), false);
        let frame = reader.recv_frame().await.unwrap();
        let plaintext = ring
            .decrypt_in_order(frame.epoch, &frame.ciphertext)
            .unwrap();
        let (epoch, nonce, ciphertext) = ring.encrypt(&plaintext).unwrap();
        writer
            .send_frame(epoch, nonce, ring.route_id(), &ciphertext)
            .await
            .unwrap();
        plaintext
    });

    let mut settings = client_settings(port);
    settings.transport = TransportKind::Ws;
    let (mut reader, mut writer) = dial(&settings).await.unwrap();

    let hs = ClientHandshake::new(&client_priv, &server_pub, MARKER, TUNNEL_IP).unwrap();
    writer.send_handshake(hs.message()).await.unwrap();
    let msg2 = reader.recv_handshake().await.unwrap();
    let established = hs.finish(&msg2).unwrap();
    let mut ring = KeyRing::new(established.into_session(Direction::Client, false), false);

    let payload = b"message-framed traffic".to_vec();
    let (epoch, nonce, ciphertext) = ring.encrypt(&payload).unwrap();
    writer
        .send_frame(epoch, nonce, ring.route_id(), &ciphertext)
        .await
        .unwrap();

    let echoed = reader.recv_frame().await.unwrap();
    let plaintext = ring
        .decrypt_in_order(echoed.epoch, &echoed.ciphertext)
        .unwrap();
    assert_eq!(plaintext, payload);

    assert_eq!(server.await.unwrap(), payload);
}
