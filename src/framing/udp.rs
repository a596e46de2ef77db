//! Datagram framing: `route-id[8, BE] ∥ nonce[12] ∥ ciphertext+tag`. The
//! route id is the first 8 bytes of the destination session id and keys the
//! server-side demultiplexer; the epoch rides in `nonce[10..12]`.

use crate::constants::{NONCE_LEN, ROUTE_ID_LEN, UDP_MIN_DATAGRAM};
use crate::error::{Result, TunnelError};

pub struct Datagram<'a> {
    pub route_id: u64,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: &'a [u8],
}

pub fn encode(route_id: u64, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ROUTE_ID_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&route_id.to_be_bytes());
    out.extend_from_slice(nonce);
    out.extend_from_slice(ciphertext);
    out
}

pub fn decode(datagram: &[u8]) -> Result<Datagram<'_>> {
    if datagram.len() < UDP_MIN_DATAGRAM {
        return Err(TunnelError::DecryptFail);
    }
    let route_id = u64::from_be_bytes(datagram[..ROUTE_ID_LEN].try_into().expect("8 bytes"));
    let nonce: [u8; NONCE_LEN] = datagram[ROUTE_ID_LEN..ROUTE_ID_LEN + NONCE_LEN]
        .try_into()
        .expect("12 bytes");
    Ok(Datagram { route_id, nonce, ciphertext: &datagram[ROUTE_ID_LEN + NONCE_LEN..] })
}

/// Peek the route id without validating the rest; the demultiplexer uses
/// this to pick a peer before any crypto work.
pub fn peek_route_id(datagram: &[u8]) -> Option<u64> {
    if datagram.len() < UDP_MIN_DATAGRAM {
        return None;
    }
    Some(u64::from_be_bytes(datagram[..ROUTE_ID_LEN].try_into().ok()?))
}
