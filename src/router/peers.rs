//! Per-peer state and the dual-index peer table. The table maps tunnel IPv4
//! (TUN→net direction) and route key (net→TUN direction) to the same
//! record; both indexes mutate under a single write lock so they can never
//! disagree.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::constants::{DECRYPT_FAIL_THRESHOLD, DECRYPT_FAIL_WINDOW, NONCE_LEN};
use crate::crypto::{KeyRing, RekeyOutcome};
use crate::error::{Result, TunnelError};
use crate::framing::ControlMsg;

/// Net→TUN lookup key: UDP peers by route id, stream peers by connection id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Udp(u64),
    Stream(u64),
}

/// A sealed frame queued for the peer's socket writer.
pub struct OutFrame {
    pub epoch: u16,
    pub nonce: [u8; NONCE_LEN],
    pub route_id: u64,
    pub body: Vec<u8>,
}

struct FailureWindow {
    count: u32,
    window_start: Instant,
}

pub struct PeerRecord {
    pub internal_ip: Ipv4Addr,
    pub route: RouteKey,
    pub crypto: Mutex<KeyRing>,
    pub cancel: CancellationToken,
    /// Client static public key; known on the server side.
    pub public_key: Option<[u8; 32]>,
    /// Where the UDP demultiplexer delivers this peer's datagrams; None on
    /// ordered transports, whose reader owns the connection.
    pub inbound: Option<mpsc::Sender<Vec<u8>>>,
    outbound: mpsc::Sender<OutFrame>,
    last_rx: Mutex<Instant>,
    last_tx: Mutex<Instant>,
    failures: Mutex<FailureWindow>,
}

impl PeerRecord {
    pub fn new(
        internal_ip: Ipv4Addr,
        route: RouteKey,
        crypto: KeyRing,
        outbound: mpsc::Sender<OutFrame>,
        cancel: CancellationToken,
        public_key: Option<[u8; 32]>,
        inbound: Option<mpsc::Sender<Vec<u8>>>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            internal_ip,
            route,
            crypto: Mutex::new(crypto),
            cancel,
            public_key,
            inbound,
            outbound,
            last_rx: Mutex::new(now),
            last_tx: Mutex::new(now),
            failures: Mutex::new(FailureWindow { count: 0, window_start: now }),
        })
    }

    pub fn touch_rx(&self) {
        *self.last_rx.lock() = Instant::now();
    }

    pub fn touch_tx(&self) {
        *self.last_tx.lock() = Instant::now();
    }

    pub fn idle_tx_since(&self) -> Instant {
        *self.last_tx.lock()
    }

    /// Count a decrypt failure; true once the rolling window crosses the
    /// eviction threshold.
    pub fn record_decrypt_failure(&self) -> bool {
        let now = Instant::now();
        let mut window = self.failures.lock();
        if now.duration_since(window.window_start) > DECRYPT_FAIL_WINDOW {
            window.count = 0;
            window.window_start = now;
        }
        window.count += 1;
        window.count > DECRYPT_FAIL_THRESHOLD
    }

    /// Seal an IPv4 packet under the current send epoch and hand it to the
    /// writer. Overflow drops the frame (`ResourceExhausted`) rather than
    /// block the TUN reader.
    pub fn seal_and_queue(&self, plaintext: &[u8]) -> Result<()> {
        let (epoch, nonce, body, route_id) = {
            let mut crypto = self.crypto.lock();
            let (epoch, nonce, body) = crypto.encrypt(plaintext)?;
            (epoch, nonce, body, crypto.route_id())
        };
        self.outbound
            .try_send(OutFrame { epoch, nonce, route_id, body })
            .map_err(|_| TunnelError::ResourceExhausted("outbound channel"))
    }

    /// Seal and queue a control packet.
    pub fn queue_control(&self, msg: &ControlMsg) -> Result<()> {
        self.seal_and_queue(&msg.encode())
    }

    /// Seal and queue a RekeyAck. Unlike other traffic this travels under
    /// the epoch the init arrived on, and sealing it is what promotes the
    /// responder's send epoch.
    pub fn queue_rekey_ack(&self, ack: [u8; 32]) -> Result<()> {
        let payload = ControlMsg::RekeyAck(ack).encode();
        let (epoch, nonce, body, route_id) = {
            let mut crypto = self.crypto.lock();
            let (epoch, nonce, body) = crypto.seal_rekey_ack(&payload)?;
            (epoch, nonce, body, crypto.route_id())
        };
        self.outbound
            .try_send(OutFrame { epoch, nonce, route_id, body })
            .map_err(|_| TunnelError::ResourceExhausted("outbound channel"))
    }

    /// Ask the rekey FSM to start a rotation and transmit its init if one
    /// is due. Epoch exhaustion tears the peer down.
    pub fn request_rekey(&self) {
        let outcome = self.crypto.lock().start_rekey();
        match outcome {
            Ok(RekeyOutcome::SendInit(public)) => {
                if self.queue_control(&ControlMsg::RekeyInit(public)).is_err() {
                    tracing::warn!("RKY: init dropped, outbound full");
                }
            }
            Ok(_) => {}
            Err(TunnelError::EpochExhausted) => {
                tracing::warn!(ip = %self.internal_ip, "RKY: epoch budget exhausted");
                self.cancel.cancel();
            }
            Err(err) => tracing::debug!(error = %err, "RKY: start failed"),
        }
    }

    /// Tear down crypto state. Called once the peer is out of both indexes;
    /// the lock serializes against any in-flight packet operation.
    pub fn zeroize(&self) {
        self.crypto.lock().zeroize();
    }
}

#[derive(Default)]
struct Indexes {
    by_ip: HashMap<Ipv4Addr, Arc<PeerRecord>>,
    by_route: HashMap<RouteKey, Arc<PeerRecord>>,
}

#[derive(Default)]
pub struct PeerTable {
    inner: RwLock<Indexes>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the peer into both indexes. A previous peer holding the same
    /// tunnel IP (a reconnecting client) is displaced and returned for
    /// eviction by the caller.
    pub fn register(&self, peer: Arc<PeerRecord>) -> Option<Arc<PeerRecord>> {
        let mut inner = self.inner.write();
        let displaced = inner.by_ip.remove(&peer.internal_ip);
        if let Some(old) = &displaced {
            inner.by_route.remove(&old.route);
        }
        inner.by_ip.insert(peer.internal_ip, peer.clone());
        inner.by_route.insert(peer.route, peer);
        displaced
    }

    /// Remove the peer from both indexes, provided they still point at this
    /// record. Returns whether anything was removed.
    pub fn unregister(&self, peer: &Arc<PeerRecord>) -> bool {
        let mut inner = self.inner.write();
        let current = inner
            .by_ip
            .get(&peer.internal_ip)
            .is_some_and(|p| Arc::ptr_eq(p, peer));
        if !current {
            return false;
        }
        inner.by_ip.remove(&peer.internal_ip);
        inner.by_route.remove(&peer.route);
        true
    }

    pub fn by_ip(&self, ip: Ipv4Addr) -> Option<Arc<PeerRecord>> {
        self.inner.read().by_ip.get(&ip).cloned()
    }

    pub fn by_route(&self, key: RouteKey) -> Option<Arc<PeerRecord>> {
        self.inner.read().by_route.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<Arc<PeerRecord>> {
        self.inner.read().by_ip.values().cloned().collect()
    }

    /// Full eviction: drop from both indexes, cancel the pumps, zeroize.
    pub fn evict(&self, peer: &Arc<PeerRecord>, reason: &str) {
        if self.unregister(peer) {
            tracing::info!(ip = %peer.internal_ip, reason, "NET: peer evicted");
        }
        peer.cancel.cancel();
        peer.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Direction, Session};

    fn keyring(id_byte: u8) -> KeyRing {
        let session = Session::new(
            [id_byte; 32],
            Direction::Server,
            0,
            [1u8; 32],
            [2u8; 32],
            false,
        );
        KeyRing::new(session, false)
    }

    fn peer(ip: [u8; 4], route: RouteKey, id_byte: u8) -> Arc<PeerRecord> {
        let (tx, _rx) = mpsc::channel(8);
        PeerRecord::new(
            Ipv4Addr::from(ip),
            route,
            keyring(id_byte),
            tx,
            CancellationToken::new(),
            None,
            None,
        )
    }

    #[test]
    fn register_and_lookup_both_indexes() {
        let table = PeerTable::new();
        let p = peer([10, 0, 0, 2], RouteKey::Udp(7), 1);
        assert!(table.register(p.clone()).is_none());
        assert!(table.by_ip(Ipv4Addr::new(10, 0, 0, 2)).is_some());
        assert!(table.by_route(RouteKey::Udp(7)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn reregistering_same_ip_displaces_old_peer() {
        let table = PeerTable::new();
        let old = peer([10, 0, 0, 2], RouteKey::Udp(7), 1);
        let new = peer([10, 0, 0, 2], RouteKey::Udp(9), 2);
        table.register(old.clone());
        let displaced = table.register(new.clone()).expect("old peer displaced");
        assert!(Arc::ptr_eq(&displaced, &old));
        // The old route key must be gone from the second index too.
        assert!(table.by_route(RouteKey::Udp(7)).is_none());
        assert!(table.by_route(RouteKey::Udp(9)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unregister_is_paired_and_identity_checked() {
        let table = PeerTable::new();
        let p = peer([10, 0, 0, 2], RouteKey::Stream(1), 1);
        table.register(p.clone());
        assert!(table.unregister(&p));
        assert!(table.by_ip(p.internal_ip).is_none());
        assert!(table.by_route(p.route).is_none());
        // A stale handle cannot remove a newer registration.
        let newer = peer([10, 0, 0, 2], RouteKey::Stream(2), 2);
        table.register(newer.clone());
        assert!(!table.unregister(&p));
        assert!(table.by_ip(newer.internal_ip).is_some());
    }

    #[test]
    fn evict_cancels_and_zeroizes() {
        let table = PeerTable::new();
        let p = peer([10, 0, 0, 3], RouteKey::Udp(3), 1);
        table.register(p.clone());
        table.evict(&p, "test");
        assert!(p.cancel.is_cancelled());
        assert!(table.is_empty());
        // Crypto is unusable after eviction.
        assert!(p.crypto.lock().encrypt(b"x").is_err());
    }

    #[test]
    fn failure_window_thresholds() {
        let p = peer([10, 0, 0, 4], RouteKey::Udp(4), 1);
        for _ in 0..DECRYPT_FAIL_THRESHOLD {
            assert!(!p.record_decrypt_failure());
        }
        assert!(p.record_decrypt_failure());
    }
}
