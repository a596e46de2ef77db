//! Typed configuration records. The binary layer deserializes these from
//! JSON; the library only ever sees the typed values. Key material is
//! hex-encoded on disk, 32 bytes each.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    Ws,
}

/// Immutable per-tunnel settings shared by both roles. On the server,
/// `remote_host`/`remote_port` are the listen address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub transport: TransportKind,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    #[serde(default = "default_tun_name")]
    pub tun_name: String,
    /// Tunnel-interface IPv4 address; the client also requests this address
    /// from the server during the handshake.
    pub tun_addr: Ipv4Addr,
    #[serde(default = "default_tun_prefix")]
    pub tun_prefix: u8,
    /// Deployment marker mixed into the handshake as the Noise prologue;
    /// both ends must agree on it.
    #[serde(default, with = "hex_bytes")]
    pub session_marker: Vec<u8>,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl ConnectionSettings {
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientSettings {
    pub conn: ConnectionSettings,
    #[serde(with = "hex_key")]
    pub private_key: [u8; 32],
    #[serde(with = "hex_key")]
    pub server_public: [u8; 32],
    /// 0 means retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_outbound")]
    pub outbound_capacity: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSettings {
    pub conn: ConnectionSettings,
    #[serde(with = "hex_key")]
    pub private_key: [u8; 32],
    /// Client static public keys admitted by the handshake; empty admits
    /// any authenticated key.
    #[serde(default, with = "hex_key_list")]
    pub allowed_peers: Vec<[u8; 32]>,
    #[serde(default = "default_outbound")]
    pub outbound_capacity: usize,
    #[serde(default = "default_registrations")]
    pub max_registrations: usize,
    #[serde(default = "default_queue_depth")]
    pub registration_queue_depth: usize,
    /// In-flight registrations above this demand cookies.
    #[serde(default = "default_load_threshold")]
    pub load_threshold: usize,
}

fn default_mtu() -> usize {
    1280
}

fn default_tun_name() -> String {
    "tun0".to_string()
}

fn default_tun_prefix() -> u8 {
    24
}

fn default_dial_timeout() -> u64 {
    5
}

fn default_outbound() -> usize {
    crate::constants::OUTBOUND_CAPACITY
}

fn default_registrations() -> usize {
    crate::constants::MAX_CONCURRENT_REGISTRATIONS
}

fn default_queue_depth() -> usize {
    crate::constants::REGISTRATION_QUEUE_DEPTH
}

fn default_load_threshold() -> usize {
    64
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(de)?;
        let bytes = hex::decode(text.trim()).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("key must be exactly 32 bytes"))
    }
}

mod hex_key_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(keys: &[[u8; 32]], ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_seq(keys.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<[u8; 32]>, D::Error> {
        let texts = Vec::<String>::deserialize(de)?;
        texts
            .into_iter()
            .map(|t| {
                hex::decode(t.trim())
                    .map_err(serde::de::Error::custom)?
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("key must be exactly 32 bytes"))
            })
            .collect()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(de)?;
        hex::decode(text.trim()).map_err(serde::de::Error::custom)
    }
}
