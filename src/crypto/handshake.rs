//! Noise-IK mutual authentication with WireGuard-style DoS armor.
//!
//! MSG1 (client→server): `version[1] ∥ noise_ik_msg1 ∥ mac1[16] ∥ mac2[16]`.
//! MSG2 (server→client): the raw second Noise IK message; by then Noise has
//! authenticated both peers, so no MACs are appended.
//!
//! The server's verification order is fixed: length, version, MAC1
//! (stateless), MAC2 under load, and only then any DH work. The client's
//! requested tunnel IPv4 rides as the encrypted MSG1 payload.

use std::net::{IpAddr, Ipv4Addr};

use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{COOKIE_REPLY_LEN, NOISE_PARAMS, PROTOCOL_VERSION, SESSION_ID_LEN};
use crate::crypto::aad::Direction;
use crate::crypto::cookie::{
    self, mac1_key, mac16, mac16_verify, CookieJar, LoadMonitor,
};
use crate::crypto::session::Session;
use crate::error::{Result, TunnelError};

/// version + minimal noise_ik_msg1 (e ∥ encrypted static) + MAC1 + MAC2.
pub const MSG1_MIN_LEN: usize = 1 + 80 + 16 + 16;
/// e ∥ encrypted empty payload.
pub const MSG2_LEN: usize = 48;

const MAC_TRAILER: usize = 32;

/// Derive the X25519 public key for a stored private key.
pub fn derive_public(private: &[u8; 32]) -> [u8; 32] {
    *PublicKey::from(&StaticSecret::from(*private)).as_bytes()
}

/// Allow-list of client static public keys; empty admits any key that
/// completes the handshake.
#[derive(Clone, Default)]
pub struct PeerAcl {
    allowed: Vec<[u8; 32]>,
}

impl PeerAcl {
    pub fn new(allowed: Vec<[u8; 32]>) -> Self {
        Self { allowed }
    }

    pub fn allows(&self, peer: &[u8; 32]) -> bool {
        self.allowed.is_empty() || self.allowed.contains(peer)
    }
}

/// Transport keys and identity produced by a completed handshake.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Established {
    session_id: [u8; SESSION_ID_LEN],
    c2s_key: [u8; 32],
    s2c_key: [u8; 32],
    #[zeroize(skip)]
    peer_static: Option<[u8; 32]>,
    #[zeroize(skip)]
    tunnel_ip: Option<Ipv4Addr>,
}

impl Established {
    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }

    pub fn route_id(&self) -> u64 {
        u64::from_be_bytes(self.session_id[..8].try_into().expect("8 bytes"))
    }

    /// Client static public key, known on the server side.
    pub fn peer_static(&self) -> Option<[u8; 32]> {
        self.peer_static
    }

    /// Tunnel address the client asked for, known on the server side.
    pub fn tunnel_ip(&self) -> Option<Ipv4Addr> {
        self.tunnel_ip
    }

    /// Build the epoch-0 session for this side of the tunnel.
    pub fn into_session(self, direction: Direction, udp_replay: bool) -> Session {
        let (send_key, recv_key) = match direction {
            Direction::Client => (self.c2s_key, self.s2c_key),
            Direction::Server => (self.s2c_key, self.c2s_key),
        };
        Session::new(self.session_id, direction, 0, send_key, recv_key, udp_replay)
        // `self` drops here and zeroizes its key copies.
    }
}

fn noise_error(_: snow::Error) -> TunnelError {
    TunnelError::HandshakeFailed
}

/// Client side of the handshake. Create, send [`ClientHandshake::message`],
/// then feed whatever comes back to [`ClientHandshake::apply_cookie_reply`]
/// (56 bytes) or [`ClientHandshake::finish`] (MSG2).
pub struct ClientHandshake {
    noise: snow::HandshakeState,
    msg1: Vec<u8>,
    server_pub: [u8; 32],
    ephemeral_pub: [u8; 32],
}

impl ClientHandshake {
    pub fn new(
        local_priv: &[u8; 32],
        server_pub: &[u8; 32],
        prologue: &[u8],
        tunnel_ip: Ipv4Addr,
    ) -> Result<Self> {
        let params = NOISE_PARAMS.parse().map_err(|_| TunnelError::HandshakeFailed)?;
        let mut noise = snow::Builder::new(params)
            .local_private_key(local_priv)
            .remote_public_key(server_pub)
            .prologue(prologue)
            .build_initiator()
            .map_err(noise_error)?;

        let mut noise1 = vec![0u8; 256];
        let len = noise
            .write_message(&tunnel_ip.octets(), &mut noise1)
            .map_err(noise_error)?;
        noise1.truncate(len);
        let ephemeral_pub: [u8; 32] =
            noise1[..32].try_into().map_err(|_| TunnelError::HandshakeFailed)?;

        let key = mac1_key(server_pub);
        let mac1 = mac16(&key, &[&noise1]);
        let mut msg1 = Vec::with_capacity(1 + noise1.len() + MAC_TRAILER);
        msg1.push(PROTOCOL_VERSION);
        msg1.extend_from_slice(&noise1);
        msg1.extend_from_slice(&mac1);
        msg1.extend_from_slice(&[0u8; 16]);

        Ok(Self { noise, msg1, server_pub: *server_pub, ephemeral_pub })
    }

    /// The MSG1 bytes to transmit (current MAC2 included).
    pub fn message(&self) -> &[u8] {
        &self.msg1
    }

    /// The server demanded a cookie: open the reply and stamp a fresh MAC2
    /// into MSG1, which must then be retransmitted verbatim.
    pub fn apply_cookie_reply(&mut self, reply: &[u8]) -> Result<()> {
        let cookie = cookie::open_cookie_reply(&self.server_pub, &self.ephemeral_pub, reply)?;
        let body_end = self.msg1.len() - 16;
        let tag = cookie::mac2(&cookie, &self.msg1[1..body_end]);
        self.msg1[body_end..].copy_from_slice(&tag);
        Ok(())
    }

    /// Consume the server's MSG2 and derive the transport keys.
    pub fn finish(mut self, msg2: &[u8]) -> Result<Established> {
        if msg2.len() != MSG2_LEN {
            return Err(TunnelError::HandshakeFailed);
        }
        let mut payload = [0u8; 16];
        self.noise.read_message(msg2, &mut payload).map_err(noise_error)?;
        split_state(&mut self.noise, None, None)
    }
}

/// Outcome of processing one MSG1 on the server.
pub enum Msg1Verdict {
    /// Under load and MAC2 missing or stale: transmit this 56-byte cookie
    /// reply and keep the registration open.
    CookieDemand([u8; COOKIE_REPLY_LEN]),
    /// Handshake complete: transmit MSG2 and install the session.
    Respond { msg2: Vec<u8>, established: Established },
}

/// Server side of the handshake; stateless across MSG1 attempts.
pub struct ServerHandshake<'a> {
    local_priv: &'a [u8; 32],
    local_pub: [u8; 32],
    mac1_key: [u8; 32],
    prologue: &'a [u8],
    acl: &'a PeerAcl,
    jar: &'a CookieJar,
    load: &'a LoadMonitor,
}

impl<'a> ServerHandshake<'a> {
    pub fn new(
        local_priv: &'a [u8; 32],
        prologue: &'a [u8],
        acl: &'a PeerAcl,
        jar: &'a CookieJar,
        load: &'a LoadMonitor,
    ) -> Self {
        let local_pub = derive_public(local_priv);
        Self {
            mac1_key: mac1_key(&local_pub),
            local_priv,
            local_pub,
            prologue,
            acl,
            jar,
            load,
        }
    }

    /// Run the fixed verification ladder over one MSG1.
    ///
    /// Anything before step 5 costs no DH work and allocates no per-peer
    /// state; every failure collapses into `HandshakeFailed`.
    pub fn process_msg1(
        &self,
        msg1: &[u8],
        client_ip: IpAddr,
        unix_secs: u64,
    ) -> Result<Msg1Verdict> {
        // 1. Structure.
        if msg1.len() < MSG1_MIN_LEN {
            return Err(TunnelError::HandshakeFailed);
        }
        // 2. Version.
        if msg1[0] != PROTOCOL_VERSION {
            return Err(TunnelError::HandshakeFailed);
        }
        let body_end = msg1.len() - 16;
        let noise1 = &msg1[1..msg1.len() - MAC_TRAILER];
        let mac1 = &msg1[msg1.len() - MAC_TRAILER..body_end];
        let mac2 = &msg1[body_end..];

        // 3. Stateless MAC1.
        if !mac16_verify(&self.mac1_key, &[noise1], mac1) {
            return Err(TunnelError::HandshakeFailed);
        }

        // 4. Cookie gate while under pressure.
        if self.load.under_load()
            && !self.jar.verify_mac2(client_ip, unix_secs, &msg1[1..body_end], mac2)
        {
            let ephemeral: [u8; 32] =
                noise1[..32].try_into().map_err(|_| TunnelError::HandshakeFailed)?;
            let cookie = self.jar.cookie(client_ip, unix_secs);
            let reply = cookie::seal_cookie_reply(&self.local_pub, &ephemeral, &cookie)?;
            return Ok(Msg1Verdict::CookieDemand(reply));
        }

        // 5. Noise IK responder: decode e, run the DH ladder, recover the
        // client's static key.
        let params = NOISE_PARAMS.parse().map_err(|_| TunnelError::HandshakeFailed)?;
        let mut noise = snow::Builder::new(params)
            .local_private_key(self.local_priv)
            .prologue(self.prologue)
            .build_responder()
            .map_err(noise_error)?;
        let mut payload = vec![0u8; noise1.len()];
        let payload_len = noise.read_message(noise1, &mut payload).map_err(noise_error)?;
        let peer_static: [u8; 32] = noise
            .get_remote_static()
            .ok_or(TunnelError::HandshakeFailed)?
            .try_into()
            .map_err(|_| TunnelError::HandshakeFailed)?;
        if !self.acl.allows(&peer_static) {
            return Err(TunnelError::HandshakeFailed);
        }
        let tunnel_ip = if payload_len == 4 {
            let octets: [u8; 4] =
                payload[..4].try_into().map_err(|_| TunnelError::HandshakeFailed)?;
            Some(Ipv4Addr::from(octets))
        } else {
            None
        };

        let mut msg2 = vec![0u8; 128];
        let len = noise.write_message(&[], &mut msg2).map_err(noise_error)?;
        msg2.truncate(len);

        // 6. Transport keys; DH material inside the noise state zeroizes on
        // drop.
        let established = split_state(&mut noise, Some(peer_static), tunnel_ip)?;
        Ok(Msg1Verdict::Respond { msg2, established })
    }
}

fn split_state(
    noise: &mut snow::HandshakeState,
    peer_static: Option<[u8; 32]>,
    tunnel_ip: Option<Ipv4Addr>,
) -> Result<Established> {
    if !noise.is_handshake_finished() {
        return Err(TunnelError::HandshakeFailed);
    }
    let session_id: [u8; SESSION_ID_LEN] = noise
        .get_handshake_hash()
        .try_into()
        .map_err(|_| TunnelError::HandshakeFailed)?;
    let (c2s_key, s2c_key) = noise.dangerously_get_raw_split();
    Ok(Established { session_id, c2s_key, s2c_key, peer_static, tunnel_ip })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    const MARKER: &[u8] = b"tungo-test-net";
    const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4));
    const TUNNEL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    struct Fixture {
        client_priv: [u8; 32],
        client_pub: [u8; 32],
        server_priv: [u8; 32],
        server_pub: [u8; 32],
        jar: CookieJar,
        load: LoadMonitor,
    }

    impl Fixture {
        fn new() -> Self {
            let client_priv = StaticSecret::random_from_rng(OsRng).to_bytes();
            let server_priv = StaticSecret::random_from_rng(OsRng).to_bytes();
            Self {
                client_pub: derive_public(&client_priv),
                server_pub: derive_public(&server_priv),
                client_priv,
                server_priv,
                jar: CookieJar::new(),
                load: LoadMonitor::new(64),
            }
        }

        fn server<'a>(&'a self, acl: &'a PeerAcl) -> ServerHandshake<'a> {
            ServerHandshake::new(&self.server_priv, MARKER, acl, &self.jar, &self.load)
        }

        fn client(&self) -> ClientHandshake {
            ClientHandshake::new(&self.client_priv, &self.server_pub, MARKER, TUNNEL_IP)
                .unwrap()
        }
    }

    #[test]
    fn happy_path_derives_matching_sessions() {
        let fx = Fixture::new();
        let acl = PeerAcl::default();
        let client = fx.client();
        let verdict = fx
            .server(&acl)
            .process_msg1(client.message(), CLIENT_IP, 1_000_000)
            .unwrap();
        let Msg1Verdict::Respond { msg2, established: server_est } = verdict else {
            panic!("expected immediate response");
        };
        assert_eq!(msg2.len(), MSG2_LEN);
        assert_eq!(server_est.peer_static(), Some(fx.client_pub));
        assert_eq!(server_est.tunnel_ip(), Some(TUNNEL_IP));

        let client_est = client.finish(&msg2).unwrap();
        assert_eq!(client_est.session_id(), server_est.session_id());
        assert_eq!(client_est.route_id(), server_est.route_id());

        let mut c = client_est.into_session(Direction::Client, false);
        let mut s = server_est.into_session(Direction::Server, false);
        let (ct, _) = c.encrypt(b"through the tunnel").unwrap();
        assert_eq!(s.decrypt_in_order(&ct).unwrap(), b"through the tunnel");
        let (ct, _) = s.encrypt(b"and back").unwrap();
        assert_eq!(c.decrypt_in_order(&ct).unwrap(), b"and back");
    }

    #[test]
    fn garbage_mac1_rejected_statelessly() {
        let fx = Fixture::new();
        let acl = PeerAcl::default();
        let mut msg1 = vec![PROTOCOL_VERSION];
        msg1.extend_from_slice(&[0x5au8; 80]);
        msg1.extend_from_slice(&[0u8; 32]);
        let res = fx.server(&acl).process_msg1(&msg1, CLIENT_IP, 1_000_000);
        assert!(matches!(res, Err(TunnelError::HandshakeFailed)));
    }

    #[test]
    fn short_or_wrong_version_rejected() {
        let fx = Fixture::new();
        let acl = PeerAcl::default();
        let server = fx.server(&acl);
        assert!(server.process_msg1(&[0u8; 40], CLIENT_IP, 0).is_err());

        let client = fx.client();
        let mut msg1 = client.message().to_vec();
        msg1[0] = 0x02;
        assert!(server.process_msg1(&msg1, CLIENT_IP, 0).is_err());
    }

    #[test]
    fn cookie_challenge_roundtrip() {
        let fx = Fixture::new();
        let acl = PeerAcl::default();
        fx.load.force(true);
        let mut client = fx.client();

        let verdict = fx
            .server(&acl)
            .process_msg1(client.message(), CLIENT_IP, 1_000_000)
            .unwrap();
        let Msg1Verdict::CookieDemand(reply) = verdict else {
            panic!("expected cookie demand under load");
        };
        assert_eq!(reply.len(), COOKIE_REPLY_LEN);

        client.apply_cookie_reply(&reply).unwrap();
        let verdict = fx
            .server(&acl)
            .process_msg1(client.message(), CLIENT_IP, 1_000_000)
            .unwrap();
        let Msg1Verdict::Respond { msg2, .. } = verdict else {
            panic!("expected response after cookie");
        };
        assert!(client.finish(&msg2).is_ok());
    }

    #[test]
    fn cookie_is_ip_bound() {
        let fx = Fixture::new();
        let acl = PeerAcl::default();
        fx.load.force(true);
        let mut client = fx.client();
        let Msg1Verdict::CookieDemand(reply) = fx
            .server(&acl)
            .process_msg1(client.message(), CLIENT_IP, 1_000_000)
            .unwrap()
        else {
            panic!("expected cookie demand");
        };
        client.apply_cookie_reply(&reply).unwrap();
        // Same MSG1 resent from a different address: cookie no longer
        // matches, so the server demands again instead of responding.
        let other = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 99));
        let verdict = fx
            .server(&acl)
            .process_msg1(client.message(), other, 1_000_000)
            .unwrap();
        assert!(matches!(verdict, Msg1Verdict::CookieDemand(_)));
    }

    #[test]
    fn acl_rejects_unknown_static_key() {
        let fx = Fixture::new();
        let acl = PeerAcl::new(vec![[0xee; 32]]);
        let client = fx.client();
        let res = fx.server(&acl).process_msg1(client.message(), CLIENT_IP, 0);
        assert!(matches!(res, Err(TunnelError::HandshakeFailed)));
    }

    #[test]
    fn prologue_mismatch_fails() {
        let fx = Fixture::new();
        let acl = PeerAcl::default();
        let client =
            ClientHandshake::new(&fx.client_priv, &fx.server_pub, b"other-net", TUNNEL_IP)
                .unwrap();
        let res = fx.server(&acl).process_msg1(client.message(), CLIENT_IP, 0);
        assert!(matches!(res, Err(TunnelError::HandshakeFailed)));
    }
}
