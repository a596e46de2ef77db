//! Session cryptography: AEAD sessions, nonce/AAD primitives, the replay
//! window, the epoch ring and the rekey FSM, plus handshake and cookie
//! machinery.

pub mod aad;
pub mod cookie;
pub mod handshake;
pub mod nonce;
pub mod rekey;
pub mod replay;
pub mod ring;
pub mod session;

pub use aad::Direction;
pub use handshake::{ClientHandshake, Established, Msg1Verdict, PeerAcl, ServerHandshake};
pub use rekey::{KeyRing, RekeyOutcome};
pub use session::Session;
