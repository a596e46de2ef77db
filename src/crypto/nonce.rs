//! Per-packet nonce: an 80-bit counter plus a 16-bit epoch, encoded
//! big-endian as `counter_low[8] ∥ counter_high[2] ∥ epoch[2]`.

use crate::constants::NONCE_LEN;
use crate::error::{Result, TunnelError};

/// Monotonic nonce counter for one direction of one session.
///
/// The epoch is fixed for the lifetime of the counter; only the 80-bit
/// counter advances. Callers must serialize access (the session lock does),
/// since two encryptions observing the same counter would reuse an AEAD
/// nonce.
#[derive(Clone, Copy, Debug)]
pub struct Nonce {
    low: u64,
    high: u16,
    epoch: u16,
}

impl Nonce {
    pub fn new(epoch: u16) -> Self {
        Self { low: 0, high: 0, epoch }
    }

    /// Start from an explicit counter position. Used by tests and by
    /// [`Nonce::saturate`].
    pub fn at(epoch: u16, high: u16, low: u64) -> Self {
        Self { low, high, epoch }
    }

    pub fn epoch(&self) -> u16 {
        self.epoch
    }

    /// The 80-bit counter as a single integer, for replay-window math.
    pub fn counter(&self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }

    /// Advance the counter and return the wire encoding of the new value.
    ///
    /// Fails with `NonceOverflow` without mutating once both counter fields
    /// are spent.
    pub fn next(&mut self) -> Result<[u8; NONCE_LEN]> {
        if self.low == u64::MAX && self.high == u16::MAX {
            return Err(TunnelError::NonceOverflow);
        }
        let (low, carry) = self.low.overflowing_add(1);
        self.low = low;
        if carry {
            self.high += 1;
        }
        Ok(self.encode())
    }

    /// Pin the counter at its final value so that every further `next`
    /// reports `NonceOverflow`. Used when a session is retired.
    pub fn saturate(&mut self) {
        self.low = u64::MAX;
        self.high = u16::MAX;
    }

    pub fn encode(&self) -> [u8; NONCE_LEN] {
        let mut out = [0u8; NONCE_LEN];
        out[..8].copy_from_slice(&self.low.to_be_bytes());
        out[8..10].copy_from_slice(&self.high.to_be_bytes());
        out[10..12].copy_from_slice(&self.epoch.to_be_bytes());
        out
    }

    /// Split a wire nonce into its 80-bit counter and epoch.
    pub fn decode(bytes: &[u8; NONCE_LEN]) -> (u128, u16) {
        let low = u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes"));
        let high = u16::from_be_bytes(bytes[8..10].try_into().expect("2 bytes"));
        let epoch = u16::from_be_bytes(bytes[10..12].try_into().expect("2 bytes"));
        (((high as u128) << 64) | low as u128, epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_value_is_one() {
        let mut n = Nonce::new(7);
        let bytes = n.next().unwrap();
        assert_eq!(&bytes[..8], &1u64.to_be_bytes());
        assert_eq!(&bytes[8..10], &[0, 0]);
        assert_eq!(&bytes[10..12], &7u16.to_be_bytes());
    }

    #[test]
    fn carry_into_high() {
        let mut n = Nonce::at(0, 0, u64::MAX);
        let bytes = n.next().unwrap();
        let (counter, _) = Nonce::decode(&bytes);
        assert_eq!(counter, 1u128 << 64);
    }

    #[test]
    fn overflow_does_not_mutate() {
        let mut n = Nonce::at(0, u16::MAX, u64::MAX - 1);
        assert!(n.next().is_ok());
        assert!(matches!(n.next(), Err(TunnelError::NonceOverflow)));
        // Still pinned at the final value on retry.
        assert!(matches!(n.next(), Err(TunnelError::NonceOverflow)));
        assert_eq!(n.counter(), ((u16::MAX as u128) << 64) | u64::MAX as u128);
    }

    #[test]
    fn successive_nonces_increase() {
        let mut n = Nonce::new(3);
        let a = n.next().unwrap();
        let b = n.next().unwrap();
        assert!(Nonce::decode(&a).0 < Nonce::decode(&b).0);
    }

    #[test]
    fn roundtrip() {
        let n = Nonce::at(0x0102, 0x0304, 0x05060708090a0b0c);
        let (counter, epoch) = Nonce::decode(&n.encode());
        assert_eq!(counter, n.counter());
        assert_eq!(epoch, 0x0102);
    }
}
