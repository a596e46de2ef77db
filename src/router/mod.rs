//! Packet routing: destination lookup, per-peer state and the concurrent
//! pump tasks.

pub mod ip;
pub mod peers;
pub mod pumps;

pub use peers::{OutFrame, PeerRecord, PeerTable, RouteKey};
pub use pumps::{Lookup, TunSink};
