//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::PeerId;

/// The default torrid client id.
pub const TORRID_CLIENT_ID: &PeerId = b"td-00000000000000000";

/// The listen port advertised in the extended handshake when no listener is
/// configured.
pub(crate) const DEFAULT_ADVERTISED_PORT: u16 = 6881;

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default torrid client id, [`TORRID_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *TORRID_CLIENT_ID,
                listen_addr: None,
                external_addr: None,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to other peers.
    pub client_id: PeerId,
    /// Where to accept incoming peer connections. When `None` the engine is
    /// leech-only and never listens.
    pub listen_addr: Option<SocketAddr>,
    /// Our address as the swarm sees it, used to filter ourselves out of PEX
    /// gossip. PEX filtering by port alone is done when this is `None`.
    pub external_addr: Option<SocketAddr>,
}

/// Configuration for a torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's files are placed upon download
    /// and from which they are seeded.
    pub download_dir: PathBuf,

    /// Below this many connected peers the supervisor asks the tracker
    /// channel for a refresh on every tick.
    pub min_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// How many block requests a session keeps outstanding within its
    /// claimed piece. All outstanding requests always target the one claimed
    /// piece.
    pub max_inflight_requests: usize,

    /// A session is abandoned after this many consecutive download failures
    /// (block timeouts, chokes mid-piece).
    pub max_consecutive_failures: u32,

    /// TCP connect timeout for outbound sessions.
    pub connect_timeout: Duration,

    /// How long to wait for the remote handshake.
    pub handshake_timeout: Duration,

    /// Total time to wait for an unchoke after expressing interest before
    /// abandoning the peer.
    pub unchoke_timeout: Duration,

    /// While choked and waiting, interest is re-expressed this often.
    pub interested_resend_interval: Duration,

    /// How long to wait for the peer's bitfield after the handshake before
    /// assuming the peer has every piece.
    pub bitfield_timeout: Duration,

    /// A requested block not served within this window counts as a download
    /// failure.
    pub block_timeout: Duration,

    /// A piece claim held this long without completing is swept back into
    /// the pool.
    pub max_claim_age: Duration,

    /// The supervisor's housekeeping period: reaping, claim sweeps, tracker
    /// refreshes and PEX candidate pushes.
    pub tick_interval: Duration,

    /// Per-session period for ut_pex gossip.
    pub pex_interval: Duration,

    /// PEX gossip is suppressed while at least this many peers are
    /// connected.
    pub pex_peer_cap: usize,

    /// Upper bound on the known-peer candidate pool.
    pub known_peer_cap: usize,

    /// How long a misbehaving endpoint is kept out of the dial pool.
    pub cooloff: Duration,

    /// How long teardown waits for sessions to finish before aborting them.
    pub shutdown_grace: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except
    /// for the download directory, as it is not sensible to guess that for
    /// the user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            min_peer_count: 5,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            // the conservative wire default: one outstanding request at a
            // time. Raising it pipelines more blocks, still within the one
            // claimed piece.
            max_inflight_requests: 1,
            max_consecutive_failures: 5,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            unchoke_timeout: Duration::from_secs(10),
            interested_resend_interval: Duration::from_secs(3),
            bitfield_timeout: Duration::from_millis(500),
            block_timeout: Duration::from_secs(5),
            max_claim_age: Duration::from_secs(120),
            tick_interval: Duration::from_secs(10),
            pex_interval: Duration::from_secs(45),
            pex_peer_cap: 40,
            known_peer_cap: 512,
            cooloff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
