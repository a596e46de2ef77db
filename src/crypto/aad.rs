//! Associated-data construction: `session_id[32] ∥ direction_tag[16] ∥
//! nonce[12]`, 60 bytes. The first 48 bytes are frozen at construction;
//! per-packet work is a 12-byte write.

use zeroize::Zeroize;

use crate::constants::{AAD_LEN, NONCE_LEN, SESSION_ID_LEN};

pub const CLIENT_TO_SERVER: &[u8; 16] = b"client-to-server";
pub const SERVER_TO_CLIENT: &[u8; 16] = b"server-to-client";

/// Which end of the tunnel this session belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

impl Direction {
    /// Tag authenticated into packets this side sends.
    pub fn send_tag(self) -> &'static [u8; 16] {
        match self {
            Direction::Client => CLIENT_TO_SERVER,
            Direction::Server => SERVER_TO_CLIENT,
        }
    }

    /// Tag expected on packets this side receives.
    pub fn recv_tag(self) -> &'static [u8; 16] {
        match self {
            Direction::Client => SERVER_TO_CLIENT,
            Direction::Server => CLIENT_TO_SERVER,
        }
    }
}

/// Preallocated 60-byte AAD buffer bound to one session and direction.
pub struct AadScratch {
    buf: [u8; AAD_LEN],
}

impl AadScratch {
    pub fn new(session_id: &[u8; SESSION_ID_LEN], tag: &[u8; 16]) -> Self {
        let mut buf = [0u8; AAD_LEN];
        buf[..SESSION_ID_LEN].copy_from_slice(session_id);
        buf[SESSION_ID_LEN..SESSION_ID_LEN + 16].copy_from_slice(tag);
        Self { buf }
    }

    /// Write the per-packet nonce into bytes 48..60 and return the full AAD.
    pub fn with_nonce(&mut self, nonce: &[u8; NONCE_LEN]) -> &[u8] {
        self.buf[AAD_LEN - NONCE_LEN..].copy_from_slice(nonce);
        &self.buf
    }

    pub fn zeroize(&mut self) {
        self.buf.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let id = [0x41u8; 32];
        let mut aad = AadScratch::new(&id, Direction::Client.send_tag());
        let out = aad.with_nonce(&[9u8; 12]);
        assert_eq!(out.len(), AAD_LEN);
        assert_eq!(&out[..32], &id);
        assert_eq!(&out[32..48], b"client-to-server");
        assert_eq!(&out[48..], &[9u8; 12]);
    }

    #[test]
    fn prefix_frozen_across_packets() {
        let mut aad = AadScratch::new(&[1u8; 32], Direction::Server.send_tag());
        let first = aad.with_nonce(&[1u8; 12]).to_vec();
        let second = aad.with_nonce(&[2u8; 12]).to_vec();
        assert_eq!(&first[..48], &second[..48]);
        assert_ne!(&first[48..], &second[48..]);
    }

    #[test]
    fn tags_mirror() {
        assert_eq!(Direction::Client.send_tag(), Direction::Server.recv_tag());
        assert_eq!(Direction::Server.send_tag(), Direction::Client.recv_tag());
        assert_eq!(CLIENT_TO_SERVER.len(), 16);
        assert_eq!(SERVER_TO_CLIENT.len(), 16);
    }
}
