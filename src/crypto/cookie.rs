//! Handshake DoS mitigation: the stateless MAC1 keying, the IP-bound cookie
//! (MAC2) machinery, and the load monitor that decides when cookies are
//! demanded.
//!
//! Cookie value: `BLAKE2s-128(secret, client_ip[16] ∥ bucket[2])` with
//! `bucket = unix_seconds / 120`; the current and previous bucket are both
//! accepted. Cookie replies are sealed with XChaCha20-Poly1305 under a key
//! bound to both static and ephemeral handshake material.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use blake2::digest::consts::U16;
use blake2::digest::Mac;
use blake2::{Blake2s256, Blake2sMac, Digest};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use parking_lot::RwLock;
use rand::RngCore;
use zeroize::Zeroize;

use crate::constants::{
    COOKIE_BUCKET_SECS, COOKIE_LEN, COOKIE_REPLY_LEN, PROTOCOL_NAME, PROTOCOL_VERSION,
};
use crate::error::{Result, TunnelError};

type Mac16 = Blake2sMac<U16>;

const MAC1_LABEL: &[u8] = b"mac1";
const COOKIE_LABEL: &[u8] = b"cookie";

/// Keyed BLAKE2s-128 over the concatenation of `parts`.
pub fn mac16(key: &[u8], parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Mac16 as Mac>::new_from_slice(key).expect("mac key fits blake2s");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time verification counterpart of [`mac16`].
pub fn mac16_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = <Mac16 as Mac>::new_from_slice(key).expect("mac key fits blake2s");
    for part in parts {
        Mac::update(&mut mac, part);
    }
    mac.verify_slice(tag).is_ok()
}

/// MAC1 key: `BLAKE2s-256("mac1" ∥ "TunGo" ∥ 0x01 ∥ server_static_pub)`.
/// Derivable by anyone who knows the server's public key; its only job is
/// forcing attackers to target this server deliberately.
pub fn mac1_key(server_pub: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(MAC1_LABEL);
    hasher.update(PROTOCOL_NAME);
    hasher.update([PROTOCOL_VERSION]);
    hasher.update(server_pub);
    hasher.finalize().into()
}

fn cookie_reply_key(server_pub: &[u8; 32], client_ephemeral: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(COOKIE_LABEL);
    hasher.update(PROTOCOL_NAME);
    hasher.update([PROTOCOL_VERSION]);
    hasher.update(server_pub);
    hasher.update(client_ephemeral);
    hasher.finalize().into()
}

fn ip_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Tracks registration pressure; above the threshold the server demands a
/// valid MAC2 before doing any DH work.
pub struct LoadMonitor {
    in_flight: AtomicUsize,
    threshold: usize,
    forced: AtomicBool,
}

impl LoadMonitor {
    pub fn new(threshold: usize) -> Self {
        Self { in_flight: AtomicUsize::new(0), threshold, forced: AtomicBool::new(false) }
    }

    pub fn registration_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registration_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn under_load(&self) -> bool {
        self.forced.load(Ordering::Relaxed)
            || self.in_flight.load(Ordering::Relaxed) >= self.threshold
    }

    /// Pin the monitor to "under load" regardless of the in-flight count.
    pub fn force(&self, on: bool) {
        self.forced.store(on, Ordering::Relaxed);
    }
}

/// Process-wide cookie secret, rotated by an internal timer.
pub struct CookieJar {
    secret: RwLock<[u8; 32]>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self { secret: RwLock::new(random_secret()) }
    }

    /// Swap in a fresh secret; outstanding cookies die with the old one.
    pub fn rotate(&self) {
        let mut secret = self.secret.write();
        let mut fresh = random_secret();
        secret.copy_from_slice(&fresh);
        fresh.zeroize();
    }

    fn bucket(unix_secs: u64) -> u16 {
        (unix_secs / COOKIE_BUCKET_SECS) as u16
    }

    fn cookie_at(&self, ip: IpAddr, bucket: u16) -> [u8; COOKIE_LEN] {
        let secret = self.secret.read();
        mac16(&*secret, &[&ip_bytes(ip), &bucket.to_be_bytes()])
    }

    /// The cookie a well-behaved client at `ip` should be using right now.
    pub fn cookie(&self, ip: IpAddr, unix_secs: u64) -> [u8; COOKIE_LEN] {
        self.cookie_at(ip, Self::bucket(unix_secs))
    }

    /// MAC2 check over `noise_payload ∥ mac1`, accepting the current and
    /// previous bucket to tolerate clock boundaries.
    pub fn verify_mac2(
        &self,
        ip: IpAddr,
        unix_secs: u64,
        mac2_body: &[u8],
        mac2: &[u8],
    ) -> bool {
        let bucket = Self::bucket(unix_secs);
        for b in [bucket, bucket.wrapping_sub(1)] {
            let cookie = self.cookie_at(ip, b);
            if mac16_verify(&cookie, &[mac2_body], mac2) {
                return true;
            }
        }
        false
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}

fn random_secret() -> [u8; 32] {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

/// MAC2 as the client computes it once it holds a cookie.
pub fn mac2(cookie: &[u8; COOKIE_LEN], mac2_body: &[u8]) -> [u8; 16] {
    mac16(cookie, &[mac2_body])
}

/// Seal a 56-byte cookie reply: `nonce[24] ∥ ciphertext[16] ∥ tag[16]`.
pub fn seal_cookie_reply(
    server_pub: &[u8; 32],
    client_ephemeral: &[u8; 32],
    cookie: &[u8; COOKIE_LEN],
) -> Result<[u8; COOKIE_REPLY_LEN]> {
    let key = cookie_reply_key(server_pub, client_ephemeral);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let mut nonce = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload { msg: cookie, aad: client_ephemeral },
        )
        .map_err(|_| TunnelError::HandshakeFailed)?;
    let mut reply = [0u8; COOKIE_REPLY_LEN];
    reply[..24].copy_from_slice(&nonce);
    reply[24..].copy_from_slice(&sealed);
    Ok(reply)
}

/// Open a cookie reply on the client side.
pub fn open_cookie_reply(
    server_pub: &[u8; 32],
    client_ephemeral: &[u8; 32],
    reply: &[u8],
) -> Result<[u8; COOKIE_LEN]> {
    if reply.len() != COOKIE_REPLY_LEN {
        return Err(TunnelError::HandshakeFailed);
    }
    let key = cookie_reply_key(server_pub, client_ephemeral);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let opened = cipher
        .decrypt(
            XNonce::from_slice(&reply[..24]),
            Payload { msg: &reply[24..], aad: client_ephemeral },
        )
        .map_err(|_| TunnelError::HandshakeFailed)?;
    opened
        .as_slice()
        .try_into()
        .map_err(|_| TunnelError::HandshakeFailed)
}
