//! Client-side dialer: connect the configured transport, with a retry loop
//! whose exponential backoff caps at 32 s.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

use super::{with_deadline, LinkReader, LinkWriter};
use crate::constants::DIAL_BACKOFF_CAP;
use crate::error::{Result, TunnelError};
use crate::framing::ws;
use crate::settings::{ConnectionSettings, TransportKind};

/// One connection attempt.
pub async fn dial(settings: &ConnectionSettings) -> Result<(LinkReader, LinkWriter)> {
    match settings.transport {
        TransportKind::Tcp => {
            let stream = with_deadline(settings.dial_timeout(), async {
                Ok(TcpStream::connect(settings.remote_addr()).await?)
            })
            .await?;
            let _ = stream.set_nodelay(true);
            let (reader, writer) = stream.into_split();
            Ok((LinkReader::Tcp(reader), LinkWriter::Tcp(writer)))
        }
        TransportKind::Udp => {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect(settings.remote_addr()).await?;
            let socket = Arc::new(socket);
            Ok((
                LinkReader::UdpPinned {
                    socket: socket.clone(),
                    route_id: None,
                    buf: vec![0u8; 65536],
                },
                LinkWriter::Udp { socket, peer: None },
            ))
        }
        TransportKind::Ws => {
            let url = format!("ws://{}/tungo", settings.remote_addr());
            let (stream, _) = with_deadline(settings.dial_timeout(), async {
                connect_async(url)
                    .await
                    .map_err(|_| TunnelError::TransportClosed)
            })
            .await?;
            let (reader, writer) = ws::split(stream);
            Ok((LinkReader::Ws(reader), LinkWriter::Ws(writer)))
        }
    }
}

/// Dial until connected, cancelled, or out of attempts (0 = unlimited).
pub async fn dial_with_backoff(
    settings: &ConnectionSettings,
    cancel: &CancellationToken,
    max_attempts: u32,
) -> Result<(LinkReader, LinkWriter)> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(TunnelError::Canceled);
        }
        match dial(settings).await {
            Ok(pair) => return Ok(pair),
            Err(err) => {
                attempt += 1;
                if max_attempts != 0 && attempt >= max_attempts {
                    return Err(err);
                }
                let backoff =
                    Duration::from_secs(1u64 << attempt.min(5)).min(DIAL_BACKOFF_CAP);
                tracing::warn!(
                    attempt,
                    backoff_s = backoff.as_secs(),
                    error = %err,
                    "NET: dial failed, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TunnelError::Canceled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TransportKind;

    fn settings(kind: TransportKind, port: u16) -> ConnectionSettings {
        ConnectionSettings {
            transport: kind,
            remote_host: "127.0.0.1".into(),
            remote_port: port,
            mtu: 1280,
            tun_name: "tun-test".into(),
            tun_addr: "10.0.0.2".parse().unwrap(),
            tun_prefix: 24,
            session_marker: vec![],
            dial_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn tcp_dial_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let (reader, _writer) = dial(&settings(TransportKind::Tcp, port)).await.unwrap();
        assert!(matches!(reader, LinkReader::Tcp(_)));
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn bounded_attempts_give_up() {
        // Connecting to a closed port: attempts are bounded, so the dialer
        // surfaces the failure instead of spinning.
        let cancel = CancellationToken::new();
        let res = dial_with_backoff(&settings(TransportKind::Tcp, 1), &cancel, 1).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = dial_with_backoff(&settings(TransportKind::Tcp, 1), &cancel, 0).await;
        assert!(matches!(res, Err(TunnelError::Canceled)));
    }
}
