//! Transport-key rotation: a per-peer key ring (epoch → session) driven by a
//! small FSM. New keys come from an X25519 exchange HKDF-chained onto the
//! current keys, so compromise of one epoch does not unwind the next.
//!
//! Convergence is asymmetric. The responder counts an authenticated
//! RekeyInit as proof the peer committed its DH share and activates its send
//! epoch as soon as its RekeyAck is written; the initiator keeps sending
//! under the old epoch until the first successful decrypt under the new one.

use std::time::Instant;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroize;

use crate::constants::{
    KEY_LEN, MAX_SAFE_EPOCH, NONCE_LEN, OLD_EPOCH_GRACE, REKEY_PENDING_TIMEOUT, SESSION_ID_LEN,
};
use crate::crypto::aad::Direction;
use crate::crypto::nonce::Nonce;
use crate::crypto::ring::EpochRing;
use crate::crypto::session::Session;
use crate::error::{Result, TunnelError};

const REKEY_INFO_C2S: &[u8] = b"tungo-rekey-c2s";
const REKEY_INFO_S2C: &[u8] = b"tungo-rekey-s2c";

/// What the caller must transmit after feeding an event into the ring.
#[derive(Debug, PartialEq, Eq)]
pub enum RekeyOutcome {
    Quiet,
    /// Send this ephemeral public key as a RekeyInit control packet.
    SendInit([u8; 32]),
    /// Send this ephemeral public key as a RekeyAck control packet.
    SendAck([u8; 32]),
}

enum RekeyState {
    Stable,
    Rekeying {
        started_at: Instant,
        my_priv: StaticSecret,
    },
    Pending {
        new_epoch: u16,
        started_at: Instant,
        armed_until: Instant,
        confirmed: bool,
    },
}

impl RekeyState {
    fn name(&self) -> &'static str {
        match self {
            RekeyState::Stable => "stable",
            RekeyState::Rekeying { .. } => "rekeying",
            RekeyState::Pending { .. } => "pending",
        }
    }
}

/// Dual-epoch key ring plus rekey FSM for one peer.
///
/// Owned behind the peer's crypto lock; every method takes `&mut self`, which
/// also serializes the nonce counters underneath.
pub struct KeyRing {
    direction: Direction,
    session_id: [u8; SESSION_ID_LEN],
    udp_replay: bool,
    ring: EpochRing,
    send_epoch: u16,
    state: RekeyState,
    /// Our ephemeral public key from the last responder exchange, replayed
    /// verbatim when the peer retransmits its RekeyInit.
    last_ack_pub: Option<[u8; 32]>,
    last_init_pub: Option<[u8; 32]>,
    /// Epoch RekeyAcks are sealed under: the one the init arrived on. The
    /// initiator cannot decrypt anything newer until it processes the ack.
    reply_epoch: Option<u16>,
    /// New epoch to promote once the first ack for it has been sealed.
    pending_activation: Option<u16>,
    /// Previous send epoch scheduled for eviction after the grace period.
    retiring: Option<(u16, Instant)>,
}

impl KeyRing {
    pub fn new(initial: Session, udp_replay: bool) -> Self {
        Self {
            direction: initial.direction(),
            session_id: *initial.session_id(),
            udp_replay,
            send_epoch: initial.epoch(),
            state: RekeyState::Stable,
            last_ack_pub: None,
            last_init_pub: None,
            reply_epoch: None,
            pending_activation: None,
            retiring: None,
            ring: {
                let mut ring = EpochRing::new();
                ring.insert(initial);
                ring
            },
        }
    }

    pub fn send_epoch(&self) -> u16 {
        self.send_epoch
    }

    pub fn recv_epochs(&self) -> Vec<u16> {
        let mut epochs: Vec<u16> = self.ring.epochs().collect();
        epochs.sort_unstable();
        epochs
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }

    pub fn route_id(&self) -> u64 {
        u64::from_be_bytes(self.session_id[..8].try_into().expect("8 bytes"))
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Seal a packet under the current send epoch.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(u16, [u8; NONCE_LEN], Vec<u8>)> {
        if self.send_epoch >= MAX_SAFE_EPOCH {
            return Err(TunnelError::EpochExhausted);
        }
        // The send-epoch session is always resident: activation only points
        // at installed epochs and eviction never targets the send epoch.
        let session = self
            .ring
            .get_mut(self.send_epoch)
            .ok_or(TunnelError::DecryptFail)?;
        let (ciphertext, nonce) = session.encrypt(plaintext)?;
        Ok((self.send_epoch, nonce, ciphertext))
    }

    /// Decrypt an ordered-transport frame under the epoch its header names.
    pub fn decrypt_in_order(&mut self, epoch: u16, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let session = self.ring.get_mut(epoch).ok_or(TunnelError::DecryptFail)?;
        let plaintext = session.decrypt_in_order(ciphertext)?;
        self.note_epoch_decrypt(epoch);
        Ok(plaintext)
    }

    /// Decrypt a datagram; the epoch rides in `nonce[10..12]`.
    pub fn decrypt_datagram(&mut self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let (_, epoch) = Nonce::decode(nonce);
        let session = self.ring.get_mut(epoch).ok_or(TunnelError::DecryptFail)?;
        let plaintext = session.decrypt_with_nonce(nonce, ciphertext)?;
        self.note_epoch_decrypt(epoch);
        Ok(plaintext)
    }

    /// Begin a locally-initiated rekey. Suppressed (Quiet) unless Stable.
    pub fn start_rekey(&mut self) -> Result<RekeyOutcome> {
        if !matches!(self.state, RekeyState::Stable) {
            return Ok(RekeyOutcome::Quiet);
        }
        self.next_epoch()?;
        let my_priv = StaticSecret::random_from_rng(OsRng);
        let my_pub = PublicKey::from(&my_priv);
        self.state = RekeyState::Rekeying { started_at: Instant::now(), my_priv };
        Ok(RekeyOutcome::SendInit(*my_pub.as_bytes()))
    }

    /// Peer asked for a rekey (authenticated RekeyInit under the current
    /// epoch).
    pub fn handle_init(&mut self, peer_pub: [u8; 32]) -> Result<RekeyOutcome> {
        // Retransmitted init: replay our previous ack, do not rekey twice.
        if self.last_init_pub == Some(peer_pub) {
            return Ok(match self.last_ack_pub {
                Some(ack) => RekeyOutcome::SendAck(ack),
                None => RekeyOutcome::Quiet,
            });
        }
        // Simultaneous initiation: the server yields and answers as
        // responder; the client holds its own attempt and waits for the ack
        // its init will draw.
        let respond = match &self.state {
            RekeyState::Stable => true,
            RekeyState::Rekeying { .. } => self.direction == Direction::Server,
            RekeyState::Pending { .. } => false,
        };
        if !respond {
            return Ok(RekeyOutcome::Quiet);
        }
        self.state = RekeyState::Stable;
        self.respond_to_init(peer_pub)
    }

    /// Peer answered our RekeyInit.
    pub fn handle_ack(&mut self, peer_pub: [u8; 32]) -> Result<RekeyOutcome> {
        let RekeyState::Rekeying { started_at, .. } = &self.state else {
            return Ok(RekeyOutcome::Quiet);
        };
        let started_at = *started_at;
        let new_epoch = self.next_epoch()?;
        let RekeyState::Rekeying { my_priv, .. } =
            std::mem::replace(&mut self.state, RekeyState::Stable)
        else {
            unreachable!("matched above");
        };
        let shared = my_priv.diffie_hellman(&PublicKey::from(peer_pub));
        self.install_epoch(new_epoch, &shared)?;
        // my_priv and shared zeroize on drop here.
        self.state = RekeyState::Pending {
            new_epoch,
            started_at,
            armed_until: started_at + REKEY_PENDING_TIMEOUT,
            confirmed: false,
        };
        Ok(RekeyOutcome::Quiet)
    }

    fn respond_to_init(&mut self, peer_pub: [u8; 32]) -> Result<RekeyOutcome> {
        let new_epoch = self.next_epoch()?;
        let my_priv = StaticSecret::random_from_rng(OsRng);
        let my_pub = PublicKey::from(&my_priv);
        let shared = my_priv.diffie_hellman(&PublicKey::from(peer_pub));
        self.install_epoch(new_epoch, &shared)?;
        // The init arrived under the current epoch's AEAD, which is the
        // peer's proof of commitment. Send activates once the ack has been
        // sealed ([`KeyRing::seal_rekey_ack`]); traffic under the new epoch
        // then reaches the initiator and confirms it.
        self.reply_epoch = Some(self.send_epoch);
        self.pending_activation = Some(new_epoch);
        self.last_init_pub = Some(peer_pub);
        self.last_ack_pub = Some(*my_pub.as_bytes());
        Ok(RekeyOutcome::SendAck(*my_pub.as_bytes()))
    }

    /// Seal a RekeyAck payload under the epoch its init arrived on (the
    /// only epoch the initiator can still read), and promote the new epoch
    /// once the first ack for it is out.
    pub fn seal_rekey_ack(&mut self, payload: &[u8]) -> Result<(u16, [u8; NONCE_LEN], Vec<u8>)> {
        let epoch = self.reply_epoch.ok_or(TunnelError::DecryptFail)?;
        let session = self.ring.get_mut(epoch).ok_or(TunnelError::DecryptFail)?;
        let (ciphertext, nonce) = session.encrypt(payload)?;
        if let Some(new_epoch) = self.pending_activation.take() {
            self.activate(new_epoch);
        }
        Ok((epoch, nonce, ciphertext))
    }

    fn next_epoch(&self) -> Result<u16> {
        let next = self
            .send_epoch
            .checked_add(1)
            .ok_or(TunnelError::EpochExhausted)?;
        if next >= MAX_SAFE_EPOCH {
            return Err(TunnelError::EpochExhausted);
        }
        Ok(next)
    }

    /// Derive the new key pair from the DH shared secret chained onto the
    /// current keys, and install the new epoch in the recv ring.
    fn install_epoch(&mut self, new_epoch: u16, shared: &SharedSecret) -> Result<()> {
        let current = self
            .ring
            .get(self.send_epoch)
            .ok_or(TunnelError::DecryptFail)?;
        let (cur_c2s, cur_s2c) = match self.direction {
            Direction::Client => (current.send_key(), current.recv_key()),
            Direction::Server => (current.recv_key(), current.send_key()),
        };
        let mut c2s = [0u8; KEY_LEN];
        let mut s2c = [0u8; KEY_LEN];
        Hkdf::<Sha256>::new(Some(cur_c2s.as_slice()), shared.as_bytes())
            .expand(REKEY_INFO_C2S, &mut c2s)
            .map_err(|_| TunnelError::HandshakeFailed)?;
        Hkdf::<Sha256>::new(Some(cur_s2c.as_slice()), shared.as_bytes())
            .expand(REKEY_INFO_S2C, &mut s2c)
            .map_err(|_| TunnelError::HandshakeFailed)?;
        let (send_key, recv_key) = match self.direction {
            Direction::Client => (c2s, s2c),
            Direction::Server => (s2c, c2s),
        };
        self.ring.insert(Session::new(
            self.session_id,
            self.direction,
            new_epoch,
            send_key,
            recv_key,
            self.udp_replay,
        ));
        c2s.zeroize();
        s2c.zeroize();
        Ok(())
    }

    fn note_epoch_decrypt(&mut self, epoch: u16) {
        let target = match &mut self.state {
            RekeyState::Pending { new_epoch, confirmed, .. } if epoch == *new_epoch => {
                *confirmed = true;
                Some(*new_epoch)
            }
            _ => None,
        };
        if let Some(epoch) = target {
            self.activate(epoch);
        }
    }

    /// The single writer of `send_epoch`; never moves it backwards.
    fn activate(&mut self, new_epoch: u16) {
        if new_epoch <= self.send_epoch {
            return;
        }
        let old = self.send_epoch;
        self.send_epoch = new_epoch;
        self.retiring = Some((old, Instant::now()));
        self.state = RekeyState::Stable;
        tracing::debug!(old, new = new_epoch, "RKY: send epoch advanced");
    }

    /// Abort overdue rekeys and evict the retired epoch past its grace.
    /// Driven by the per-peer timer task.
    pub fn maintenance(&mut self, now: Instant) {
        match &self.state {
            RekeyState::Rekeying { started_at, .. }
                if now >= *started_at + REKEY_PENDING_TIMEOUT =>
            {
                // my_priv zeroizes on drop.
                self.state = RekeyState::Stable;
                tracing::debug!("RKY: init unanswered, aborted");
            }
            RekeyState::Pending { new_epoch, armed_until, confirmed, .. }
                if !*confirmed && now >= *armed_until =>
            {
                let epoch = *new_epoch;
                self.ring.evict(epoch);
                self.state = RekeyState::Stable;
                tracing::debug!(epoch, "RKY: pending epoch unconfirmed, aborted");
            }
            _ => {}
        }
        if let Some((old, at)) = self.retiring {
            if now >= at + OLD_EPOCH_GRACE {
                self.ring.evict(old);
                self.retiring = None;
                tracing::debug!(epoch = old, "RKY: retired epoch evicted");
            }
        }
    }

    pub fn zeroize(&mut self) {
        self.ring.zeroize_all();
        self.state = RekeyState::Stable;
        self.last_ack_pub = None;
        self.last_init_pub = None;
        self.reply_epoch = None;
        self.pending_activation = None;
        self.retiring = None;
    }
}
