//! The concurrent packet pumps: TUN→transport and transport→TUN, plus the
//! per-peer writer and timer tasks. Every blocking point selects against
//! the peer's cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT, REKEY_INTERVAL, WRITE_DEADLINE,
};
use crate::crypto::RekeyOutcome;
use crate::error::{Result, TunnelError};
use crate::framing::ControlMsg;
use crate::router::ip::Ipv4View;
use crate::router::peers::{OutFrame, PeerRecord, PeerTable};
use crate::transport::{with_deadline, LinkReader, LinkWriter};

/// Destination lookup for the TUN→transport pump: the client has a single
/// peer, the server routes by destination address.
pub enum Lookup {
    Single(Arc<PeerRecord>),
    Table(Arc<PeerTable>),
}

impl Lookup {
    fn by_dst(&self, dst: std::net::Ipv4Addr) -> Option<Arc<PeerRecord>> {
        match self {
            Lookup::Single(peer) => Some(peer.clone()),
            Lookup::Table(table) => table.by_ip(dst),
        }
    }
}

/// Read IPv4 packets from the TUN, seal them for their destination peer and
/// queue them on the peer's bounded outbound channel. Never blocks on a
/// slow socket: overflow drops the newest frame and counts it.
pub async fn tun_to_transport<R>(mut tun: R, lookup: Lookup, mtu: usize, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; mtu.max(1500)];
    let mut dropped: u64 = 0;
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            res = tun.read(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(error = %err, "TUN: read error");
                    break;
                }
            },
        };
        let Some(view) = Ipv4View::new(&buf[..n]) else {
            continue;
        };
        let Some(peer) = lookup.by_dst(view.destination()) else {
            continue;
        };
        match peer.seal_and_queue(&buf[..n]) {
            Ok(()) => peer.touch_tx(),
            Err(TunnelError::ResourceExhausted(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(dropped, "NET: outbound channel full, dropping");
                }
            }
            // Counter or epoch spent: this session can never send again.
            // Cancelling the peer breaks its pumps, so the server evicts
            // and the client reconnects with a fresh handshake.
            Err(TunnelError::NonceOverflow) | Err(TunnelError::EpochExhausted) => {
                peer.cancel.cancel();
            }
            Err(_) => {}
        }
    }
}

/// Drain the outbound channel onto the socket. A write error or deadline
/// cancels the peer, which tears down the sibling pumps.
pub async fn outbound_writer(
    mut rx: mpsc::Receiver<OutFrame>,
    mut writer: LinkWriter,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let res = with_deadline(
            WRITE_DEADLINE,
            writer.send_frame(frame.epoch, frame.nonce, frame.route_id, &frame.body),
        )
        .await;
        if let Err(err) = res {
            tracing::warn!(error = %err, "NET: write failed");
            cancel.cancel();
            break;
        }
    }
    writer.close().await;
}

/// Where decrypted IPv4 lands: the client writes its own TUN half, server
/// peers share one TUN writer task through a channel.
pub enum TunSink<W> {
    Direct(W),
    Shared(mpsc::Sender<Vec<u8>>),
}

impl<W: AsyncWrite + Unpin> TunSink<W> {
    async fn deliver(&mut self, packet: &[u8]) -> Result<()> {
        match self {
            TunSink::Direct(writer) => {
                writer.write_all(packet).await?;
                Ok(())
            }
            TunSink::Shared(tx) => {
                // The shared writer must never let one peer stall another;
                // overflow drops.
                if tx.try_send(packet.to_vec()).is_err() {
                    tracing::debug!("TUN: shared writer backlogged, dropping");
                }
                Ok(())
            }
        }
    }
}

/// Read frames off the wire, decrypt, and either dispatch control packets
/// or deliver IPv4 to the TUN. Returns the error that broke the loop; the
/// supervisor translates it into eviction (server) or reconnect (client).
pub async fn transport_to_tun<W>(
    mut link: LinkReader,
    mut tun: TunSink<W>,
    peer: Arc<PeerRecord>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let datagram_link = matches!(
        link,
        LinkReader::UdpPinned { .. } | LinkReader::UdpChannel(_) | LinkReader::UdpQueue(_)
    );
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Err(TunnelError::Canceled),
            res = tokio::time::timeout(KEEPALIVE_TIMEOUT, link.recv_frame()) => match res {
                Err(_) => {
                    tracing::info!(ip = %peer.internal_ip, "NET: peer silent past keepalive window");
                    return Err(TunnelError::Timeout);
                }
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => {
                    // A framing error on an ordered stream is unrecoverable;
                    // a malformed datagram is just dropped.
                    if err.is_fatal() || !datagram_link {
                        return Err(err);
                    }
                    if peer.record_decrypt_failure() {
                        return Err(TunnelError::DecryptFail);
                    }
                    continue;
                }
            },
        };
        let decrypted = {
            let mut crypto = peer.crypto.lock();
            match frame.nonce {
                Some(nonce) => crypto.decrypt_datagram(&nonce, &frame.ciphertext),
                None => crypto.decrypt_in_order(frame.epoch, &frame.ciphertext),
            }
        };
        match decrypted {
            Ok(plaintext) => {
                peer.touch_rx();
                if ControlMsg::is_control(&plaintext) {
                    handle_control(&peer, &plaintext);
                } else if let Err(err) = tun.deliver(&plaintext).await {
                    tracing::warn!(error = %err, "TUN: write error");
                    return Err(err);
                }
            }
            // Replays are counted nowhere near the TUN and never escalate
            // on their own.
            Err(TunnelError::ReplayReject) => {}
            Err(TunnelError::DecryptFail) => {
                if peer.record_decrypt_failure() {
                    tracing::info!(ip = %peer.internal_ip, "NET: decrypt failures over threshold");
                    return Err(TunnelError::DecryptFail);
                }
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => {}
        }
    }
}

fn handle_control(peer: &Arc<PeerRecord>, plaintext: &[u8]) {
    match ControlMsg::decode(plaintext) {
        Some(ControlMsg::Keepalive) | None => {}
        Some(ControlMsg::RekeyInit(public)) => {
            let outcome = peer.crypto.lock().handle_init(public);
            match outcome {
                Ok(RekeyOutcome::SendAck(ack)) => {
                    if peer.queue_rekey_ack(ack).is_err() {
                        tracing::warn!("RKY: ack dropped");
                    }
                }
                Ok(_) => {}
                Err(TunnelError::EpochExhausted) => peer.cancel.cancel(),
                Err(err) => tracing::debug!(error = %err, "RKY: init rejected"),
            }
        }
        Some(ControlMsg::RekeyAck(public)) => {
            let outcome = peer.crypto.lock().handle_ack(public);
            match outcome {
                Ok(_) => {}
                Err(TunnelError::EpochExhausted) => peer.cancel.cancel(),
                Err(err) => tracing::debug!(error = %err, "RKY: ack rejected"),
            }
        }
    }
}

/// Keepalive, scheduled rekey and FSM maintenance for one peer.
pub async fn peer_timers(peer: Arc<PeerRecord>, cancel: CancellationToken) {
    let start = tokio::time::Instant::now();
    let mut keepalive =
        tokio::time::interval_at(start + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    let mut rekey = tokio::time::interval_at(start + REKEY_INTERVAL, REKEY_INTERVAL);
    let mut maintenance = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = keepalive.tick() => {
                if peer.idle_tx_since().elapsed() >= KEEPALIVE_INTERVAL {
                    if peer.queue_control(&ControlMsg::Keepalive).is_ok() {
                        peer.touch_tx();
                    }
                }
            }
            _ = rekey.tick() => peer.request_rekey(),
            _ = maintenance.tick() => peer.crypto.lock().maintenance(Instant::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Direction, KeyRing, Session};
    use crate::router::peers::RouteKey;
    use std::net::Ipv4Addr;

    fn key(start: u8) -> [u8; 32] {
        let mut k = [0u8; 32];
        for (i, b) in k.iter_mut().enumerate() {
            *b = start.wrapping_add(i as u8);
        }
        k
    }

    fn peer_pair() -> (Arc<PeerRecord>, mpsc::Receiver<OutFrame>, KeyRing) {
        let id = key(0x41);
        let server = Session::new(id, Direction::Server, 0, key(0x21), key(0x01), false);
        let client = Session::new(id, Direction::Client, 0, key(0x01), key(0x21), false);
        let (tx, rx) = mpsc::channel(16);
        let peer = PeerRecord::new(
            Ipv4Addr::new(10, 0, 0, 2),
            RouteKey::Stream(1),
            KeyRing::new(server, false),
            tx,
            CancellationToken::new(),
            None,
            None,
        );
        (peer, rx, KeyRing::new(client, false))
    }

    fn ipv4_packet(dst: [u8; 4]) -> Vec<u8> {
        let mut buf = vec![0u8; 28];
        buf[0] = 0x45;
        buf[16..20].copy_from_slice(&dst);
        buf
    }

    #[tokio::test]
    async fn tun_packets_are_sealed_and_queued() {
        let (peer, mut rx, mut client_ring) = peer_pair();
        let (mut tun_side, tun_for_pump) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(tun_to_transport(
            tun_for_pump,
            Lookup::Single(peer.clone()),
            1280,
            cancel.clone(),
        ));

        let packet = ipv4_packet([10, 0, 0, 1]);
        tun_side.write_all(&packet).await.unwrap();
        let frame = rx.recv().await.expect("sealed frame");
        assert_eq!(frame.epoch, 0);
        // The queued frame decrypts on the client side to the original
        // packet.
        let plaintext = client_ring
            .decrypt_in_order(frame.epoch, &frame.body)
            .unwrap();
        assert_eq!(plaintext, packet);

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn non_ipv4_from_tun_is_dropped() {
        let (peer, mut rx, _) = peer_pair();
        let (mut tun_side, tun_for_pump) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(tun_to_transport(
            tun_for_pump,
            Lookup::Single(peer.clone()),
            1280,
            cancel.clone(),
        ));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        tun_side.write_all(&v6).await.unwrap();
        // Let the pump consume the first "packet" before writing the next;
        // the duplex pipe has no packet boundaries.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let packet = ipv4_packet([10, 0, 0, 1]);
        tun_side.write_all(&packet).await.unwrap();
        // Only the IPv4 packet comes through.
        let frame = rx.recv().await.expect("sealed frame");
        assert!(frame.body.len() >= packet.len());
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn control_frames_never_reach_the_tun() {
        let (peer, _out_rx, _unused_ring) = peer_pair();
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(4);
        // Reuse the server-side UDP channel variant as a scripted link.
        let link = LinkReader::UdpChannel(frame_rx);
        let (tun_write_half, mut tun_read_half) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();

        // Swap the peer's crypto for a datagram-capable pair.
        let id = key(0x41);
        let server = Session::new(id, Direction::Server, 0, key(0x21), key(0x01), true);
        let client = Session::new(id, Direction::Client, 0, key(0x01), key(0x21), true);
        *peer.crypto.lock() = KeyRing::new(server, true);
        let mut client_udp = KeyRing::new(client, true);

        let pump = tokio::spawn(transport_to_tun(
            link,
            TunSink::Direct(tun_write_half),
            peer.clone(),
            cancel.clone(),
        ));

        // A keepalive control packet followed by a data packet.
        let (_, nonce, ct) = client_udp.encrypt(&ControlMsg::Keepalive.encode()).unwrap();
        frame_tx
            .send(crate::framing::udp::encode(client_udp.route_id(), &nonce, &ct))
            .await
            .unwrap();
        let packet = ipv4_packet([10, 0, 0, 2]);
        let (_, nonce, ct) = client_udp.encrypt(&packet).unwrap();
        frame_tx
            .send(crate::framing::udp::encode(client_udp.route_id(), &nonce, &ct))
            .await
            .unwrap();

        // Only the data packet surfaces on the TUN side.
        let mut delivered = vec![0u8; packet.len()];
        tun_read_half.read_exact(&mut delivered).await.unwrap();
        assert_eq!(delivered, packet);

        cancel.cancel();
        let _ = pump.await.unwrap();
    }

    #[tokio::test]
    async fn rekey_init_draws_ack_and_rotates() {
        let (peer, mut out_rx, mut client_ring) = peer_pair();
        let RekeyOutcome::SendInit(client_pub) = client_ring.start_rekey().unwrap() else {
            panic!("expected init");
        };
        let (_, _, init_ct) = client_ring
            .encrypt(&ControlMsg::RekeyInit(client_pub).encode())
            .unwrap();

        // Feed the encrypted init through the server pump path.
        let plaintext = peer.crypto.lock().decrypt_in_order(0, &init_ct).unwrap();
        handle_control(&peer, &plaintext);

        // The server queued an encrypted RekeyAck and advanced its epoch.
        let ack_frame = out_rx.try_recv().expect("ack queued");
        assert_eq!(peer.crypto.lock().send_epoch(), 1);
        let ack_plain = client_ring
            .decrypt_in_order(ack_frame.epoch, &ack_frame.body)
            .unwrap();
        let Some(ControlMsg::RekeyAck(server_pub)) = ControlMsg::decode(&ack_plain) else {
            panic!("expected rekey ack");
        };
        client_ring.handle_ack(server_pub).unwrap();

        // Server data under epoch 1 confirms the client.
        let (epoch, _, ct) = peer.crypto.lock().encrypt(b"under-new-epoch").unwrap();
        assert_eq!(epoch, 1);
        assert_eq!(
            client_ring.decrypt_in_order(epoch, &ct).unwrap(),
            b"under-new-epoch"
        );
        assert_eq!(client_ring.send_epoch(), 1);
    }
}
