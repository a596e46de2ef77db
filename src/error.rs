use std::io;

use thiserror::Error;

/// Error kinds surfaced by the tunnel core.
///
/// The pumps treat most of these as per-packet failures (drop and continue);
/// `NonceOverflow`, `EpochExhausted`, `TransportClosed` and `Canceled` break
/// the pump loop and trigger eviction or reconnect.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The 80-bit send counter for the current epoch is spent.
    #[error("nonce counter exhausted")]
    NonceOverflow,

    /// The send epoch reached the safe ceiling; a fresh handshake is required.
    #[error("epoch budget exhausted")]
    EpochExhausted,

    /// Uniform AEAD failure: bad tag, unknown epoch, or malformed frame.
    /// Deliberately carries no detail.
    #[error("decrypt failed")]
    DecryptFail,

    /// UDP replay window rejected the counter.
    #[error("replay rejected")]
    ReplayReject,

    /// Uniform handshake failure. Deliberately carries no detail.
    #[error("handshake failed")]
    HandshakeFailed,

    /// An I/O deadline or protocol timer expired.
    #[error("timed out")]
    Timeout,

    /// The surrounding context was cancelled.
    #[error("canceled")]
    Canceled,

    /// Peer socket EOF or platform-reported close.
    #[error("transport closed")]
    TransportClosed,

    /// A bounded resource (registration queue, peer table, outbound channel)
    /// is full.
    #[error("{0} exhausted")]
    ResourceExhausted(&'static str),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether this error must break a pump loop rather than drop a packet.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::NonceOverflow
                | TunnelError::EpochExhausted
                | TunnelError::TransportClosed
                | TunnelError::Canceled
                | TunnelError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;
