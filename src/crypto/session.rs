//! AEAD session state for one epoch: send/recv ChaCha20-Poly1305 instances,
//! direction-bound AAD, nonce counters and (UDP) the replay window.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key};
use zeroize::Zeroize;

use crate::constants::{KEY_LEN, NONCE_LEN, SESSION_ID_LEN};
use crate::crypto::aad::{AadScratch, Direction};
use crate::crypto::nonce::Nonce;
use crate::crypto::replay::SlidingWindow;
use crate::error::{Result, TunnelError};

pub struct Session {
    session_id: [u8; SESSION_ID_LEN],
    direction: Direction,
    epoch: u16,
    // Key buffers are retained alongside the cipher instances: the AEAD
    // objects do not expose their schedules, so zeroization targets these,
    // and the rekey KDF salts on them.
    send_key: [u8; KEY_LEN],
    recv_key: [u8; KEY_LEN],
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    send_nonce: Nonce,
    recv_nonce: Nonce,
    send_aad: AadScratch,
    recv_aad: AadScratch,
    replay: Option<SlidingWindow>,
    retired: bool,
}

impl Session {
    /// `with_replay` is set for UDP sessions only; ordered transports rely
    /// on the stream for replay protection.
    pub fn new(
        session_id: [u8; SESSION_ID_LEN],
        direction: Direction,
        epoch: u16,
        send_key: [u8; KEY_LEN],
        recv_key: [u8; KEY_LEN],
        with_replay: bool,
    ) -> Self {
        Self {
            send_cipher: ChaCha20Poly1305::new(Key::from_slice(&send_key)),
            recv_cipher: ChaCha20Poly1305::new(Key::from_slice(&recv_key)),
            send_nonce: Nonce::new(epoch),
            recv_nonce: Nonce::new(epoch),
            send_aad: AadScratch::new(&session_id, direction.send_tag()),
            recv_aad: AadScratch::new(&session_id, direction.recv_tag()),
            replay: with_replay.then(SlidingWindow::new),
            retired: false,
            session_id,
            direction,
            epoch,
            send_key,
            recv_key,
        }
    }

    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }

    /// First 8 bytes of the session id, big-endian: the UDP demux key.
    pub fn route_id(&self) -> u64 {
        u64::from_be_bytes(self.session_id[..8].try_into().expect("8 bytes"))
    }

    pub(crate) fn send_key(&self) -> &[u8; KEY_LEN] {
        &self.send_key
    }

    pub(crate) fn recv_key(&self) -> &[u8; KEY_LEN] {
        &self.recv_key
    }

    /// Seal `plaintext` under the next send nonce. Returns the ciphertext
    /// (tag appended) and the 12-byte wire nonce.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
        if self.retired {
            return Err(TunnelError::NonceOverflow);
        }
        let nonce = self.send_nonce.next()?;
        let aad = self.send_aad.with_nonce(&nonce);
        let ciphertext = self
            .send_cipher
            .encrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                Payload { msg: plaintext, aad },
            )
            .map_err(|_| TunnelError::DecryptFail)?;
        Ok((ciphertext, nonce))
    }

    /// Decrypt the next in-order frame (TCP/WS). The receive counter only
    /// commits on success, so an injected garbage frame cannot desync the
    /// stream.
    pub fn decrypt_in_order(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.retired {
            return Err(TunnelError::DecryptFail);
        }
        let mut next = self.recv_nonce;
        let nonce = next.next().map_err(|_| TunnelError::DecryptFail)?;
        let aad = self.recv_aad.with_nonce(&nonce);
        let plaintext = self
            .recv_cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(&nonce),
                Payload { msg: ciphertext, aad },
            )
            .map_err(|_| TunnelError::DecryptFail)?;
        self.recv_nonce = next;
        Ok(plaintext)
    }

    /// Decrypt a datagram under its explicit wire nonce (UDP). Replay
    /// admission is checked before the AEAD and committed only after it.
    pub fn decrypt_with_nonce(
        &mut self,
        nonce: &[u8; NONCE_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if self.retired {
            return Err(TunnelError::DecryptFail);
        }
        let (counter, epoch) = Nonce::decode(nonce);
        if epoch != self.epoch {
            return Err(TunnelError::DecryptFail);
        }
        let window = self.replay.as_ref().ok_or(TunnelError::DecryptFail)?;
        if !window.check(counter) {
            return Err(TunnelError::ReplayReject);
        }
        let aad = self.recv_aad.with_nonce(nonce);
        let plaintext = self
            .recv_cipher
            .decrypt(
                chacha20poly1305::Nonce::from_slice(nonce),
                Payload { msg: ciphertext, aad },
            )
            .map_err(|_| TunnelError::DecryptFail)?;
        self.replay
            .as_mut()
            .expect("checked above")
            .accept(counter);
        Ok(plaintext)
    }

    /// Wipe key material, the AAD buffers and the replay window. The session
    /// stays allocated but every further operation fails cleanly.
    pub fn zeroize(&mut self) {
        self.send_key.zeroize();
        self.recv_key.zeroize();
        // The AEAD objects keep an internal schedule; dropping them here is
        // the closest this crate can get to wiping it.
        self.send_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.send_key));
        self.recv_cipher = ChaCha20Poly1305::new(Key::from_slice(&self.recv_key));
        self.send_aad.zeroize();
        self.recv_aad.zeroize();
        if let Some(window) = &mut self.replay {
            window.zeroize();
        }
        self.send_nonce.saturate();
        self.retired = true;
    }

    pub fn retired(&self) -> bool {
        self.retired
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.retired {
            self.zeroize();
        }
    }
}
