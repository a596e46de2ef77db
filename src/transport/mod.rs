//! Frame-oriented links over the three concrete transports. Tagged variants
//! rather than trait objects: there are exactly three implementations and
//! the pumps branch on them anyway.

pub mod dial;
pub mod queue;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::MaybeTlsStream;

use crate::constants::{NONCE_LEN, TAG_LEN};
use crate::error::{Result, TunnelError};
use crate::framing::{tcp, udp, ws};
use queue::RegistrationQueue;

pub type WsNet = MaybeTlsStream<TcpStream>;

/// Await `fut` under an I/O deadline, mapping expiry to `Timeout`.
pub async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(TunnelError::Timeout),
    }
}

/// One decrypt-ready frame off the wire.
pub struct InboundFrame {
    pub epoch: u16,
    /// Present on datagram transports; ordered transports derive the nonce
    /// from the receive counter.
    pub nonce: Option<[u8; NONCE_LEN]>,
    pub ciphertext: Vec<u8>,
}

pub enum LinkReader {
    Tcp(OwnedReadHalf),
    Ws(ws::WsReader<WsNet>),
    /// Client side: the connected UDP socket, filtered by our route id.
    UdpPinned {
        socket: Arc<UdpSocket>,
        route_id: Option<u64>,
        buf: Vec<u8>,
    },
    /// Server side: datagrams delivered by the demultiplexer.
    UdpChannel(mpsc::Receiver<Vec<u8>>),
    /// Server side registration: raw handshake datagrams from the queue.
    UdpQueue(Arc<RegistrationQueue>),
}

impl LinkReader {
    /// Read the next data frame.
    pub async fn recv_frame(&mut self) -> Result<InboundFrame> {
        match self {
            LinkReader::Tcp(reader) => {
                let (epoch, ciphertext) = tcp::read_frame(reader).await?;
                Ok(InboundFrame { epoch, nonce: None, ciphertext })
            }
            LinkReader::Ws(reader) => {
                let msg = reader.recv().await?;
                if msg.len() < 2 + TAG_LEN {
                    return Err(TunnelError::DecryptFail);
                }
                let epoch = u16::from_be_bytes(msg[..2].try_into().expect("2 bytes"));
                Ok(InboundFrame { epoch, nonce: None, ciphertext: msg[2..].to_vec() })
            }
            LinkReader::UdpPinned { socket, route_id, buf } => loop {
                let n = socket.recv(buf).await?;
                let Ok(datagram) = udp::decode(&buf[..n]) else {
                    continue;
                };
                if route_id.is_some_and(|id| id != datagram.route_id) {
                    continue;
                }
                let (_, epoch) = crate::crypto::nonce::Nonce::decode(&datagram.nonce);
                return Ok(InboundFrame {
                    epoch,
                    nonce: Some(datagram.nonce),
                    ciphertext: datagram.ciphertext.to_vec(),
                });
            },
            LinkReader::UdpChannel(rx) => {
                let raw = rx.recv().await.ok_or(TunnelError::TransportClosed)?;
                let datagram = udp::decode(&raw)?;
                let (_, epoch) = crate::crypto::nonce::Nonce::decode(&datagram.nonce);
                Ok(InboundFrame {
                    epoch,
                    nonce: Some(datagram.nonce),
                    ciphertext: datagram.ciphertext.to_vec(),
                })
            }
            LinkReader::UdpQueue(_) => Err(TunnelError::TransportClosed),
        }
    }

    /// Read one handshake message.
    pub async fn recv_handshake(&mut self) -> Result<Vec<u8>> {
        match self {
            LinkReader::Tcp(reader) => tcp::read_handshake(reader).await,
            LinkReader::Ws(reader) => reader.recv().await,
            LinkReader::UdpPinned { socket, buf, .. } => {
                let n = socket.recv(buf).await?;
                Ok(buf[..n].to_vec())
            }
            LinkReader::UdpChannel(_) => Err(TunnelError::HandshakeFailed),
            LinkReader::UdpQueue(queue) => {
                let mut buf = vec![0u8; crate::constants::REGISTRATION_SLOT];
                let n = queue.read_into(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    /// Restrict a pinned UDP reader to frames for the established session.
    pub fn set_route_id(&mut self, id: u64) {
        if let LinkReader::UdpPinned { route_id, .. } = self {
            *route_id = Some(id);
        }
    }
}

pub enum LinkWriter {
    Tcp(OwnedWriteHalf),
    Ws(ws::WsWriter<WsNet>),
    /// `peer` is None on the client, whose socket is connected.
    Udp {
        socket: Arc<UdpSocket>,
        peer: Option<SocketAddr>,
    },
}

impl LinkWriter {
    /// Transmit one sealed frame.
    pub async fn send_frame(
        &mut self,
        epoch: u16,
        nonce: [u8; NONCE_LEN],
        route_id: u64,
        ciphertext: &[u8],
    ) -> Result<()> {
        match self {
            LinkWriter::Tcp(writer) => tcp::write_frame(writer, epoch, ciphertext).await,
            LinkWriter::Ws(writer) => {
                let mut msg = Vec::with_capacity(2 + ciphertext.len());
                msg.extend_from_slice(&epoch.to_be_bytes());
                msg.extend_from_slice(ciphertext);
                writer.send(msg).await
            }
            LinkWriter::Udp { socket, peer } => {
                let wire = udp::encode(route_id, &nonce, ciphertext);
                match peer {
                    Some(addr) => socket.send_to(&wire, *addr).await?,
                    None => socket.send(&wire).await?,
                };
                Ok(())
            }
        }
    }

    /// Transmit one handshake message.
    pub async fn send_handshake(&mut self, msg: &[u8]) -> Result<()> {
        match self {
            LinkWriter::Tcp(writer) => tcp::write_handshake(writer, msg).await,
            LinkWriter::Ws(writer) => writer.send(msg.to_vec()).await,
            LinkWriter::Udp { socket, peer } => {
                match peer {
                    Some(addr) => socket.send_to(msg, *addr).await?,
                    None => socket.send(msg).await?,
                };
                Ok(())
            }
        }
    }

    pub async fn close(&mut self) {
        match self {
            LinkWriter::Tcp(writer) => {
                let _ = writer.shutdown().await;
            }
            LinkWriter::Ws(writer) => writer.close().await,
            LinkWriter::Udp { .. } => {}
        }
    }
}
