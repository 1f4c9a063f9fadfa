//! The BEP 10 extended handshake and the BEP 11 ut_pex gossip payloads.
//!
//! PEX rides on the extension protocol: both sides advertise the message ids
//! they chose for each extension in their extended handshake's `m`
//! dictionary, then exchange compact peer lists under those ids.

use std::{
    collections::{HashMap, HashSet},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

/// The extended message id of the extended handshake itself.
pub(crate) const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// The message id under which *we* want to receive ut_pex messages,
/// advertised in our extended handshake.
pub(crate) const OUR_UT_PEX_ID: u8 = 1;

/// The `v` field of our extended handshake.
const CLIENT_VERSION: &str = concat!("torrid ", env!("CARGO_PKG_VERSION"));

/// The bencoded body of an extended handshake (extended message id 0).
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ExtendedHandshake {
    /// Maps extension names to the message ids the sender wants them
    /// received under.
    #[serde(default)]
    pub m: HashMap<String, i64>,
    /// The sender's listen port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<i64>,
    /// The sender's client name and version. Not necessarily UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,
}

impl ExtendedHandshake {
    /// Our handshake: we support ut_pex and advertise our listen port.
    pub fn ours(listen_port: u16) -> Self {
        let mut m = HashMap::new();
        m.insert("ut_pex".to_string(), OUR_UT_PEX_ID as i64);
        Self {
            m,
            p: Some(listen_port as i64),
            v: Some(ByteBuf::from(CLIENT_VERSION.as_bytes().to_vec())),
        }
    }

    /// The id the peer wants ut_pex messages sent under, if it advertised
    /// the extension.
    pub fn ut_pex_id(&self) -> Option<u8> {
        self.m
            .get("ut_pex")
            .and_then(|id| u8::try_from(*id).ok())
            .filter(|id| *id != 0)
    }

    /// The peer's client version for logging.
    pub fn client_version(&self) -> Option<String> {
        self.v
            .as_ref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("extended handshake serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_bencode::Result<Self> {
        serde_bencode::from_bytes(bytes)
    }
}

/// The bencoded body of a ut_pex message. We only produce and consume
/// `added`; `added.f` flags and `dropped` are ignored on receipt.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PexMessage {
    /// Compact 6-byte records of newly known IPv4 peers.
    #[serde(default)]
    pub added: ByteBuf,
    /// Compact records of peers the sender lost. Always empty from us.
    #[serde(default)]
    pub dropped: ByteBuf,
}

impl PexMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("pex message serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_bencode::Result<Self> {
        serde_bencode::from_bytes(bytes)
    }

    /// Decodes and validates the `added` records: 6 bytes each, 4-byte IPv4
    /// followed by a big endian port. Unroutable records are dropped,
    /// trailing garbage is ignored.
    pub fn added_peers(&self) -> Vec<SocketAddr> {
        self.added
            .chunks_exact(6)
            .filter_map(|record| {
                let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
                let port = u16::from_be_bytes([record[4], record[5]]);
                if ip.is_unspecified() || port == 0 {
                    return None;
                }
                Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
            })
            .collect()
    }
}

/// Packs IPv4 endpoints into the compact 6-byte wire records.
fn encode_compact(addrs: &[SocketAddrV4]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(addrs.len() * 6);
    for addr in addrs {
        bytes.extend_from_slice(&addr.ip().octets());
        bytes.extend_from_slice(&addr.port().to_be_bytes());
    }
    bytes
}

/// Per-session PEX bookkeeping: the negotiated ids, the peers already
/// gossiped to this session's remote, and the gossip clock.
#[derive(Debug, Default)]
pub(crate) struct PexState {
    /// The id the *peer* wants ut_pex messages sent under. `None` until
    /// (and unless) the extension is negotiated.
    peer_ut_pex_id: Option<u8>,
    /// Endpoints already sent to this peer; each is gossiped at most once.
    sent: HashSet<SocketAddr>,
    last_gossip: Option<Instant>,
}

impl PexState {
    /// Records the peer's side of the negotiation. Per convention, a peer
    /// that sends an extended handshake without naming ut_pex is still
    /// assumed to accept it under the default id.
    pub fn on_extended_handshake(&mut self, handshake: &ExtendedHandshake) {
        self.peer_ut_pex_id =
            Some(handshake.ut_pex_id().unwrap_or(OUR_UT_PEX_ID));
    }

    pub fn supports_pex(&self) -> bool {
        self.peer_ut_pex_id.is_some()
    }

    /// Whether the gossip period has elapsed for this session.
    pub fn is_due(&self, now: Instant, interval: std::time::Duration) -> bool {
        self.supports_pex()
            && self
                .last_gossip
                .map_or(true, |last| now.duration_since(last) >= interval)
    }

    /// Builds the next gossip message for this peer, or `None` when there
    /// is nothing new to tell it.
    ///
    /// Never includes the peer's own address, our own address, endpoints
    /// already sent to this peer, or anything that isn't IPv4.
    pub fn gossip(
        &mut self,
        now: Instant,
        candidates: &[SocketAddr],
        peer_addr: SocketAddr,
        own_addr: Option<SocketAddr>,
    ) -> Option<(u8, Vec<u8>)> {
        let peer_ut_pex_id = self.peer_ut_pex_id?;
        self.last_gossip = Some(now);

        let fresh: Vec<SocketAddrV4> = candidates
            .iter()
            .filter(|addr| {
                **addr != peer_addr
                    && Some(**addr) != own_addr
                    && !self.sent.contains(*addr)
            })
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) if !v4.ip().is_unspecified() && v4.port() != 0 => {
                    Some(*v4)
                }
                _ => None,
            })
            .collect();
        if fresh.is_empty() {
            return None;
        }

        for addr in &fresh {
            self.sent.insert(SocketAddr::V4(*addr));
        }
        let msg = PexMessage {
            added: ByteBuf::from(encode_compact(&fresh)),
            dropped: ByteBuf::new(),
        };
        Some((peer_ut_pex_id, msg.to_bytes()))
    }
}
