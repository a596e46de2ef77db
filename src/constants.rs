//! Protocol-wide constants. Wire-visible values here are load-bearing;
//! changing any of them breaks interoperability.

use std::time::Duration;

/// Protocol identifier mixed into MAC and cookie key derivation.
pub const PROTOCOL_NAME: &[u8] = b"TunGo";
/// Version byte carried by every handshake message and control packet.
pub const PROTOCOL_VERSION: u8 = 0x01;
/// Noise parameter string for the mutual-authentication handshake.
pub const NOISE_PARAMS: &str = "Noise_IK_25519_ChaChaPoly_SHA256";

pub const KEY_LEN: usize = 32;
pub const SESSION_ID_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const DIRECTION_TAG_LEN: usize = 16;
pub const AAD_LEN: usize = SESSION_ID_LEN + DIRECTION_TAG_LEN + NONCE_LEN;

/// Replay window width in bits (UDP only).
pub const REPLAY_WINDOW: usize = 1024;
/// Sends are refused once the send epoch reaches this value.
pub const MAX_SAFE_EPOCH: u16 = 65_000;
/// Epoch ring keeps at most this many live sessions per peer.
pub const EPOCH_RING_CAPACITY: usize = 4;

pub const REKEY_INTERVAL: Duration = Duration::from_secs(120);
/// A pending rekey that sees no traffic under the new epoch is aborted
/// after this long.
pub const REKEY_PENDING_TIMEOUT: Duration = Duration::from_secs(5);
/// The old epoch is kept decryptable this long after send-epoch activation.
pub const OLD_EPOCH_GRACE: Duration = Duration::from_secs(10);

pub const COOKIE_LEN: usize = 16;
pub const COOKIE_REPLY_LEN: usize = 56;
pub const COOKIE_BUCKET_SECS: u64 = 120;
pub const COOKIE_SECRET_ROTATE: Duration = Duration::from_secs(600);

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
/// No authenticated frame for this long means the peer is gone.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(35);

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-operation I/O deadline; nothing blocks past cancellation by more
/// than this.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(1);
pub const DIAL_BACKOFF_CAP: Duration = Duration::from_secs(32);

/// Route id is the first 8 bytes of the 32-byte session id.
pub const ROUTE_ID_LEN: usize = 8;
/// route-id + nonce + tag; anything shorter cannot be a valid datagram.
pub const UDP_MIN_DATAGRAM: usize = ROUTE_ID_LEN + NONCE_LEN + TAG_LEN;
/// Upper bound on a TCP frame length field (epoch + ciphertext + tag).
pub const MAX_FRAME: usize = 65_535;

pub const OUTBOUND_CAPACITY: usize = 1000;
/// Frames queued toward the shared server-side TUN writer.
pub const TUN_SINK_CAPACITY: usize = 1024;
/// Demuxed datagrams queued toward one UDP peer's pump.
pub const UDP_INBOUND_CAPACITY: usize = 512;
pub const MAX_CONCURRENT_REGISTRATIONS: usize = 1000;
/// Datagram slot size in the registration queue; handshake messages are
/// far smaller.
pub const REGISTRATION_SLOT: usize = 2048;
/// Slots per registration queue.
pub const REGISTRATION_QUEUE_DEPTH: usize = 64;

/// Decrypt failures above this count within [`DECRYPT_FAIL_WINDOW`] evict
/// the peer.
pub const DECRYPT_FAIL_THRESHOLD: u32 = 16;
pub const DECRYPT_FAIL_WINDOW: Duration = Duration::from_secs(10);
