//! Server supervisor: TUN fan-out over the peer table, per-transport
//! listeners, and the UDP demultiplexer with its registration queues.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    COOKIE_SECRET_ROTATE, HANDSHAKE_TIMEOUT, TUN_SINK_CAPACITY, UDP_INBOUND_CAPACITY,
};
use crate::crypto::cookie::{CookieJar, LoadMonitor};
use crate::crypto::{Direction, Established, KeyRing, Msg1Verdict, PeerAcl, ServerHandshake};
use crate::device::TunConfigurator;
use crate::error::TunnelError;
use crate::framing::udp::peek_route_id;
use crate::framing::ws;
use crate::router::pumps::{outbound_writer, peer_timers, transport_to_tun, tun_to_transport};
use crate::router::{Lookup, PeerRecord, PeerTable, RouteKey, TunSink};
use crate::settings::{ServerSettings, TransportKind};
use crate::transport::queue::RegistrationQueue;
use crate::transport::{with_deadline, LinkReader, LinkWriter};

struct ServerCtx {
    settings: ServerSettings,
    table: Arc<PeerTable>,
    jar: CookieJar,
    load: LoadMonitor,
    acl: PeerAcl,
    tun_tx: mpsc::Sender<Vec<u8>>,
    root: CancellationToken,
    conn_seq: AtomicU64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Run the server until cancelled.
pub async fn run(
    settings: ServerSettings,
    configurator: &dyn TunConfigurator,
    root: CancellationToken,
) -> Result<()> {
    let tun_dev = configurator.configure(&settings.conn)?;
    let (tun_reader, mut tun_writer) = tokio::io::split(tun_dev);

    let (tun_tx, mut tun_rx) = mpsc::channel::<Vec<u8>>(TUN_SINK_CAPACITY);
    let ctx = Arc::new(ServerCtx {
        acl: PeerAcl::new(settings.allowed_peers.clone()),
        load: LoadMonitor::new(settings.load_threshold),
        jar: CookieJar::new(),
        table: Arc::new(PeerTable::new()),
        tun_tx,
        root: root.clone(),
        conn_seq: AtomicU64::new(1),
        settings,
    });

    // Single writer drains every peer's decrypted packets onto the TUN.
    let sink_cancel = root.child_token();
    let tun_sink = tokio::spawn(async move {
        loop {
            let packet = tokio::select! {
                _ = sink_cancel.cancelled() => break,
                pkt = tun_rx.recv() => match pkt {
                    Some(pkt) => pkt,
                    None => break,
                },
            };
            if let Err(err) = tun_writer.write_all(&packet).await {
                tracing::warn!(error = %err, "TUN: write error");
                break;
            }
        }
    });

    // TUN→net fan-out across the peer table.
    let tun_pump = tokio::spawn(tun_to_transport(
        tun_reader,
        Lookup::Table(ctx.table.clone()),
        ctx.settings.conn.mtu,
        root.child_token(),
    ));

    // Cookie secret rotation under its own timer.
    {
        let ctx = ctx.clone();
        let cancel = root.child_token();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(COOKIE_SECRET_ROTATE);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => ctx.jar.rotate(),
                }
            }
        });
    }

    let listen = ctx.settings.conn.remote_addr();
    let result = match ctx.settings.conn.transport {
        TransportKind::Tcp => listen_stream(ctx.clone(), &listen, false).await,
        TransportKind::Ws => listen_stream(ctx.clone(), &listen, true).await,
        TransportKind::Udp => listen_udp(ctx.clone(), &listen).await,
    };

    // Drain: evict every peer, then stop the TUN tasks.
    for peer in ctx.table.all() {
        ctx.table.evict(&peer, "shutdown");
    }
    root.cancel();
    let _ = tokio::join!(tun_sink, tun_pump);
    configurator.deconfigure(&ctx.settings.conn);
    result
}

// ----------------------------------------------------------------
// Stream transports (TCP and WebSocket)
// ----------------------------------------------------------------

async fn listen_stream(ctx: Arc<ServerCtx>, listen: &str, websocket: bool) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(listen, websocket, "NET: listening");
    loop {
        let (stream, remote) = tokio::select! {
            _ = ctx.root.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "NET: accept error");
                    continue;
                }
            },
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_stream_peer(ctx, stream, remote, websocket).await {
                tracing::info!(%remote, error = %err, "NET: connection closed");
            }
        });
    }
}

async fn serve_stream_peer(
    ctx: Arc<ServerCtx>,
    stream: TcpStream,
    remote: SocketAddr,
    websocket: bool,
) -> crate::error::Result<()> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = if websocket {
        let ws_stream = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|_| TunnelError::HandshakeFailed)?;
        let (ws_reader, ws_writer) = ws::split(ws_stream);
        (LinkReader::Ws(ws_reader), LinkWriter::Ws(ws_writer))
    } else {
        let (read_half, write_half) = stream.into_split();
        (LinkReader::Tcp(read_half), LinkWriter::Tcp(write_half))
    };

    ctx.load.registration_started();
    let established =
        with_deadline(HANDSHAKE_TIMEOUT, respond(&ctx, &mut reader, &mut writer, remote.ip()))
            .await;
    ctx.load.registration_finished();
    let established = match established {
        Ok(established) => established,
        Err(err) => {
            tracing::info!(%remote, "HSK: handshake failed");
            writer.close().await;
            return Err(err);
        }
    };

    let route = RouteKey::Stream(ctx.conn_seq.fetch_add(1, Ordering::Relaxed));
    let peer = install_peer(&ctx, established, route, None, writer, false)?;
    let result = transport_to_tun(
        reader,
        TunSink::<tokio::io::DuplexStream>::Shared(ctx.tun_tx.clone()),
        peer.clone(),
        peer.cancel.clone(),
    )
    .await;
    ctx.table.evict(&peer, end_reason(&result));
    result
}

// ----------------------------------------------------------------
// UDP: shared socket, demultiplexer, registration queues
// ----------------------------------------------------------------

async fn listen_udp(ctx: Arc<ServerCtx>, listen: &str) -> Result<()> {
    let socket = Arc::new(
        UdpSocket::bind(listen)
            .await
            .with_context(|| format!("binding {listen}"))?,
    );
    tracing::info!(listen, "NET: listening (udp)");
    let registrations: Arc<Mutex<HashMap<SocketAddr, Arc<RegistrationQueue>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut buf = vec![0u8; 65536];
    loop {
        let (len, from) = tokio::select! {
            _ = ctx.root.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "NET: udp recv error");
                    continue;
                }
            },
        };
        let datagram = &buf[..len];

        // Dataplane first: a known route id goes straight to its peer.
        if let Some(route_id) = peek_route_id(datagram) {
            if let Some(peer) = ctx.table.by_route(RouteKey::Udp(route_id)) {
                if let Some(inbound) = &peer.inbound {
                    if inbound.try_send(datagram.to_vec()).is_err() {
                        tracing::debug!("NET: peer inbound backlogged, dropping");
                    }
                }
                continue;
            }
        }

        // Unknown source: registration path.
        register_datagram(&ctx, &socket, &registrations, from, datagram);
    }
}

/// Queue a datagram from an unknown address, creating the per-address
/// registration (bounded by max_registrations) on first contact.
fn register_datagram(
    ctx: &Arc<ServerCtx>,
    socket: &Arc<UdpSocket>,
    registrations: &Arc<Mutex<HashMap<SocketAddr, Arc<RegistrationQueue>>>>,
    from: SocketAddr,
    datagram: &[u8],
) {
    let mut regs = registrations.lock();
    if let Some(queue) = regs.get(&from) {
        queue.enqueue(datagram);
        return;
    }
    if regs.len() >= ctx.settings.max_registrations {
        tracing::debug!(%from, "NET: registration table full, dropping");
        return;
    }
    let queue = Arc::new(RegistrationQueue::with_depth(
        ctx.settings.registration_queue_depth,
    ));
    queue.enqueue(datagram);
    regs.insert(from, queue.clone());
    drop(regs);

    let ctx = ctx.clone();
    let socket = socket.clone();
    let registrations = registrations.clone();
    tokio::spawn(async move {
        ctx.load.registration_started();
        let result = serve_udp_registration(&ctx, socket, queue.clone(), from).await;
        ctx.load.registration_finished();
        queue.close();
        registrations.lock().remove(&from);
        if let Err(err) = result {
            tracing::info!(%from, error = %err, "NET: registration failed");
        }
    });
}

async fn serve_udp_registration(
    ctx: &Arc<ServerCtx>,
    socket: Arc<UdpSocket>,
    queue: Arc<RegistrationQueue>,
    from: SocketAddr,
) -> crate::error::Result<()> {
    let mut reader = LinkReader::UdpQueue(queue);
    let mut writer = LinkWriter::Udp { socket: socket.clone(), peer: Some(from) };
    let established =
        with_deadline(HANDSHAKE_TIMEOUT, respond(ctx, &mut reader, &mut writer, from.ip()))
            .await?;

    let route = RouteKey::Udp(established.route_id());
    let (inbound_tx, inbound_rx) = mpsc::channel(UDP_INBOUND_CAPACITY);
    let peer = install_peer(ctx, established, route, Some(inbound_tx), writer, true)?;
    let pump_ctx = ctx.clone();
    let pump_peer = peer.clone();
    tokio::spawn(async move {
        let result = transport_to_tun(
            LinkReader::UdpChannel(inbound_rx),
            TunSink::<tokio::io::DuplexStream>::Shared(pump_ctx.tun_tx.clone()),
            pump_peer.clone(),
            pump_peer.cancel.clone(),
        )
        .await;
        pump_ctx.table.evict(&pump_peer, end_reason(&result));
    });
    Ok(())
}

// ----------------------------------------------------------------
// Shared registration plumbing
// ----------------------------------------------------------------

/// Drive the responder side of the handshake over any link, including the
/// cookie exchange while under load.
async fn respond(
    ctx: &ServerCtx,
    reader: &mut LinkReader,
    writer: &mut LinkWriter,
    client_ip: IpAddr,
) -> crate::error::Result<Established> {
    let handshake = ServerHandshake::new(
        &ctx.settings.private_key,
        &ctx.settings.conn.session_marker,
        &ctx.acl,
        &ctx.jar,
        &ctx.load,
    );
    loop {
        let msg1 = reader.recv_handshake().await?;
        match handshake.process_msg1(&msg1, client_ip, unix_now())? {
            Msg1Verdict::CookieDemand(reply) => {
                writer.send_handshake(&reply).await?;
            }
            Msg1Verdict::Respond { msg2, established } => {
                writer.send_handshake(&msg2).await?;
                return Ok(established);
            }
        }
    }
}

/// Build the peer record, register it in both indexes (displacing any
/// previous holder of the tunnel IP) and start its writer and timer tasks.
fn install_peer(
    ctx: &Arc<ServerCtx>,
    established: Established,
    route: RouteKey,
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    writer: LinkWriter,
    udp: bool,
) -> crate::error::Result<Arc<PeerRecord>> {
    let tunnel_ip = established.tunnel_ip().ok_or(TunnelError::HandshakeFailed)?;
    let public_key = established.peer_static();
    let keyring = KeyRing::new(established.into_session(Direction::Server, udp), udp);

    let cancel = ctx.root.child_token();
    let (out_tx, out_rx) = mpsc::channel(ctx.settings.outbound_capacity);
    let peer = PeerRecord::new(tunnel_ip, route, keyring, out_tx, cancel, public_key, inbound);

    if let Some(displaced) = ctx.table.register(peer.clone()) {
        displaced.cancel.cancel();
        displaced.zeroize();
        tracing::info!(ip = %tunnel_ip, "NET: displaced stale peer");
    }
    tracing::info!(ip = %tunnel_ip, "NET: peer registered");

    tokio::spawn(outbound_writer(out_rx, writer, peer.cancel.clone()));
    tokio::spawn(peer_timers(peer.clone(), peer.cancel.clone()));
    Ok(peer)
}

fn end_reason(result: &crate::error::Result<()>) -> &'static str {
    match result {
        Ok(()) => "closed",
        Err(TunnelError::Timeout) => "keepalive timeout",
        Err(TunnelError::Canceled) => "canceled",
        Err(TunnelError::DecryptFail) => "decrypt failures",
        Err(TunnelError::TransportClosed) => "transport closed",
        Err(TunnelError::EpochExhausted) => "epoch exhausted",
        Err(_) => "error",
    }
}
