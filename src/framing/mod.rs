//! Wire framing: the length-prefixed TCP codec, the route-id datagram
//! codec, the WebSocket message adapter and the in-band control packets.

pub mod control;
pub mod tcp;
pub mod udp;
pub mod ws;

pub use control::ControlMsg;
