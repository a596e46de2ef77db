//! WebSocket adapter: one tunnel frame per binary message. Reads consume
//! exactly one binary frame, draining any intervening non-binary traffic;
//! the message boundary replaces the TCP length prefix.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, TunnelError};

fn ws_error(err: tokio_tungstenite::tungstenite::Error) -> TunnelError {
    use tokio_tungstenite::tungstenite::Error;
    match err {
        Error::ConnectionClosed | Error::AlreadyClosed => TunnelError::TransportClosed,
        Error::Io(io) => TunnelError::Io(io),
        _ => TunnelError::TransportClosed,
    }
}

pub struct WsReader<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

pub struct WsWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Split a websocket into the adapter halves the pumps consume.
pub fn split<S>(ws: WebSocketStream<S>) -> (WsReader<S>, WsWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (WsReader { inner: stream }, WsWriter { inner: sink })
}

impl<S> WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next binary message. Text, ping and pong frames are drained; a close
    /// frame or stream end reads as `TransportClosed`.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.inner.next().await {
                None => return Err(TunnelError::TransportClosed),
                Some(Err(err)) => return Err(ws_error(err)),
                Some(Ok(Message::Binary(payload))) => return Ok(payload),
                Some(Ok(Message::Close(_))) => return Err(TunnelError::TransportClosed),
                Some(Ok(_)) => continue,
            }
        }
    }
}

impl<S> WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Emit `payload` as one complete binary message.
    pub async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        self.inner.send(Message::Binary(payload)).await.map_err(ws_error)
    }

    /// Send a normal-closure status; errors are ignored since the peer may
    /// already be gone.
    pub async fn close(&mut self) {
        let frame = CloseFrame { code: CloseCode::Normal, reason: "".into() };
        let _ = self.inner.send(Message::Close(Some(frame))).await;
    }
}
