//! TunGo: a point-to-point, authenticated, encrypted IP tunnel over a
//! userspace TUN device, speaking TCP, UDP or WebSocket.
//!
//! Layering, leaf first: crypto primitives (nonce, AAD, replay window),
//! AEAD sessions and the epoch ring, the rekey FSM, the Noise-IK handshake
//! with cookie-based DoS armor, wire framing per transport, and the
//! concurrent TUN↔transport pumps supervised per role by [`client`] and
//! [`server`].

pub mod client;
pub mod constants;
pub mod crypto;
pub mod device;
pub mod error;
pub mod framing;
pub mod router;
pub mod server;
pub mod settings;
pub mod transport;

pub use error::{Result, TunnelError};
pub use settings::{ClientSettings, ConnectionSettings, ServerSettings, TransportKind};
