//! In-band control plane. Control packets ride inside the encrypted payload
//! and are recognized by their first byte, `0xFF`; raw IPv4 always starts
//! with `0x4?`, so the two can never collide.

use crate::constants::PROTOCOL_VERSION;

pub const CONTROL_PREFIX: u8 = 0xFF;

const TYPE_REKEY_INIT: u8 = 0x02;
const TYPE_REKEY_ACK: u8 = 0x03;
const TYPE_KEEPALIVE: u8 = 0x04;

pub const KEEPALIVE_LEN: usize = 3;
pub const REKEY_LEN: usize = 35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    RekeyInit([u8; 32]),
    RekeyAck([u8; 32]),
    Keepalive,
}

impl ControlMsg {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlMsg::Keepalive => {
                vec![CONTROL_PREFIX, PROTOCOL_VERSION, TYPE_KEEPALIVE]
            }
            ControlMsg::RekeyInit(public) => {
                let mut out = Vec::with_capacity(REKEY_LEN);
                out.extend_from_slice(&[CONTROL_PREFIX, PROTOCOL_VERSION, TYPE_REKEY_INIT]);
                out.extend_from_slice(public);
                out
            }
            ControlMsg::RekeyAck(public) => {
                let mut out = Vec::with_capacity(REKEY_LEN);
                out.extend_from_slice(&[CONTROL_PREFIX, PROTOCOL_VERSION, TYPE_REKEY_ACK]);
                out.extend_from_slice(public);
                out
            }
        }
    }

    /// Parse a decrypted payload that starts with the control prefix.
    /// Returns None for malformed or unknown control packets, which the
    /// router drops silently.
    pub fn decode(payload: &[u8]) -> Option<ControlMsg> {
        if payload.len() < KEEPALIVE_LEN
            || payload[0] != CONTROL_PREFIX
            || payload[1] != PROTOCOL_VERSION
        {
            return None;
        }
        match payload[2] {
            TYPE_KEEPALIVE if payload.len() == KEEPALIVE_LEN => Some(ControlMsg::Keepalive),
            TYPE_REKEY_INIT if payload.len() == REKEY_LEN => {
                Some(ControlMsg::RekeyInit(payload[3..].try_into().ok()?))
            }
            TYPE_REKEY_ACK if payload.len() == REKEY_LEN => {
                Some(ControlMsg::RekeyAck(payload[3..].try_into().ok()?))
            }
            _ => None,
        }
    }

    /// Whether a decrypted payload belongs to the control plane at all.
    pub fn is_control(payload: &[u8]) -> bool {
        payload.first() == Some(&CONTROL_PREFIX)
    }
}
