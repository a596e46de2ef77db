//! Client supervisor: dial, handshake, run the pumps, and reconnect with
//! backoff when the session drops. The TUN device is torn down and
//! recreated on every attempt because some platforms cache route state on
//! the interface.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{COOKIE_REPLY_LEN, HANDSHAKE_TIMEOUT};
use crate::crypto::{ClientHandshake, Direction, Established, KeyRing};
use crate::device::TunConfigurator;
use crate::error::TunnelError;
use crate::router::{Lookup, PeerRecord, RouteKey, TunSink};
use crate::router::pumps::{outbound_writer, peer_timers, transport_to_tun, tun_to_transport};
use crate::settings::{ClientSettings, TransportKind};
use crate::transport::dial::dial_with_backoff;
use crate::transport::{with_deadline, LinkReader, LinkWriter};

enum SessionEnd {
    Cancelled,
    Reconnect,
}

/// Run the client until cancelled or out of reconnect attempts.
pub async fn run(
    settings: ClientSettings,
    configurator: &dyn TunConfigurator,
    root: CancellationToken,
) -> Result<()> {
    loop {
        if root.is_cancelled() {
            return Ok(());
        }
        match run_session(&settings, configurator, &root).await? {
            SessionEnd::Cancelled => return Ok(()),
            SessionEnd::Reconnect => {
                configurator.deconfigure(&settings.conn);
                tracing::info!("NET: session ended, reconnecting");
                tokio::select! {
                    _ = root.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

async fn run_session(
    settings: &ClientSettings,
    configurator: &dyn TunConfigurator,
    root: &CancellationToken,
) -> Result<SessionEnd> {
    let (mut reader, mut writer) =
        match dial_with_backoff(&settings.conn, root, settings.max_reconnect_attempts).await {
            Ok(pair) => pair,
            Err(TunnelError::Canceled) => return Ok(SessionEnd::Cancelled),
            Err(err) => return Err(err).context("connecting to server"),
        };

    let established = match handshake(settings, &mut reader, &mut writer).await {
        Ok(established) => established,
        Err(err) => {
            tracing::warn!(error = %err, "HSK: handshake failed");
            writer.close().await;
            return Ok(SessionEnd::Reconnect);
        }
    };
    tracing::info!("HSK: session established");

    let udp = settings.conn.transport == TransportKind::Udp;
    reader.set_route_id(established.route_id());
    let route = match settings.conn.transport {
        TransportKind::Udp => RouteKey::Udp(established.route_id()),
        _ => RouteKey::Stream(0),
    };
    let keyring = KeyRing::new(established.into_session(Direction::Client, udp), udp);

    // Fresh TUN for every session.
    let tun_dev = configurator.configure(&settings.conn)?;
    let (tun_reader, tun_writer) = tokio::io::split(tun_dev);

    let session_cancel = root.child_token();
    let (out_tx, out_rx) = mpsc::channel(settings.outbound_capacity);
    let peer = PeerRecord::new(
        Ipv4Addr::UNSPECIFIED,
        route,
        keyring,
        out_tx,
        session_cancel.clone(),
        Some(settings.server_public),
        None,
    );

    let tun_pump = tokio::spawn(tun_to_transport(
        tun_reader,
        Lookup::Single(peer.clone()),
        settings.conn.mtu,
        session_cancel.clone(),
    ));
    let writer_pump = tokio::spawn(outbound_writer(out_rx, writer, session_cancel.clone()));
    let timers = tokio::spawn(peer_timers(peer.clone(), session_cancel.clone()));

    let rx_result = transport_to_tun(
        reader,
        TunSink::Direct(tun_writer),
        peer.clone(),
        session_cancel.clone(),
    )
    .await;

    session_cancel.cancel();
    let _ = tokio::join!(tun_pump, writer_pump, timers);
    peer.zeroize();
    configurator.deconfigure(&settings.conn);

    if root.is_cancelled() {
        return Ok(SessionEnd::Cancelled);
    }
    if let Err(err) = rx_result {
        tracing::info!(error = %err, "NET: session dropped");
    }
    Ok(SessionEnd::Reconnect)
}

/// MSG1 → (optional cookie loop) → MSG2, under the handshake deadline.
async fn handshake(
    settings: &ClientSettings,
    reader: &mut LinkReader,
    writer: &mut LinkWriter,
) -> crate::error::Result<Established> {
    with_deadline(HANDSHAKE_TIMEOUT, async {
        let mut hs = ClientHandshake::new(
            &settings.private_key,
            &settings.server_public,
            &settings.conn.session_marker,
            settings.conn.tun_addr,
        )?;
        writer.send_handshake(hs.message()).await?;
        loop {
            let reply = reader.recv_handshake().await?;
            if reply.len() == COOKIE_REPLY_LEN {
                hs.apply_cookie_reply(&reply)?;
                writer.send_handshake(hs.message()).await?;
                continue;
            }
            return hs.finish(&reply);
        }
    })
    .await
}
