//! The swarm supervisor: owns every peer session of the torrent, feeds them
//! endpoints, fans out Have announcements, sweeps stale piece claims and
//! decides when the torrent is done.
//!
//! Sessions and supervisor form a cycle (sessions report up, the supervisor
//! commands down), resolved with channels in both directions: a session only
//! ever holds an event sender, the supervisor only per-session command
//! senders. Nobody holds a pointer into anybody.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, RwLock},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    conf::{Conf, DEFAULT_ADVERTISED_PORT},
    counter::PeerCounters,
    disk::{Alert, AlertReceiver, DiskHandle},
    engine::{AnnounceEvent, PeerBatch, TrackerRequest},
    error::{Error, Result},
    peer::{CommandSender as SessionCommandSender, PeerSession, SessionCommand},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    PeerId, PeerSource, PieceIndex, Sha1Hash,
};

/// Torrent-wide immutable facts shared with every session.
pub(crate) struct SharedStatus {
    /// The torrent's info hash, verified against every handshake.
    pub info_hash: Sha1Hash,
    /// Our own peer id, sent in every handshake.
    pub client_id: PeerId,
    /// The on-disk geometry of the torrent.
    pub storage: StorageInfo,
    /// The port advertised in the extended handshake.
    pub listen_port: u16,
    /// Our address as the swarm sees it, if known; PEX filters it out of
    /// gossip.
    pub external_addr: Option<SocketAddr>,
}

/// What sessions report up to the supervisor.
#[derive(Debug)]
pub(crate) enum SwarmEvent {
    /// A piece completed and verified; every session should announce it.
    PieceVerified { piece_index: PieceIndex },
    /// A PEX message brought new endpoints.
    PeersDiscovered { addrs: Vec<SocketAddr> },
    /// A session ended, cleanly or not.
    SessionClosed {
        addr: SocketAddr,
        error: Option<Error>,
    },
}

/// The supervisor's record of one running session.
struct SessionHandle {
    cmd_chan: SessionCommandSender,
    source: PeerSource,
    join: JoinHandle<()>,
}

/// An endpoint we have heard of, whether or not we're connected to it. The
/// candidate pool for PEX gossip and reconnection.
struct KnownPeer {
    #[allow(dead_code)]
    first_seen: Instant,
    last_seen: Instant,
    source: PeerSource,
    /// Set when the peer misbehaved; it is not re-dialled before this.
    cooloff_until: Option<Instant>,
}

pub(crate) struct Torrent {
    shared: Arc<SharedStatus>,
    piece_picker: Arc<RwLock<PiecePicker>>,
    disk: DiskHandle,
    disk_alert_port: AlertReceiver,
    conf: Conf,
    counters: PeerCounters,
    sessions: HashMap<SocketAddr, SessionHandle>,
    known_peers: HashMap<SocketAddr, KnownPeer>,
    /// Kept so each spawned session can be handed a sender.
    events_chan: mpsc::UnboundedSender<SwarmEvent>,
    events_port: mpsc::UnboundedReceiver<SwarmEvent>,
    tracker_chan: mpsc::UnboundedSender<TrackerRequest>,
    peer_port: mpsc::UnboundedReceiver<PeerBatch>,
    listener: Option<TcpListener>,
}

impl Torrent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conf: Conf,
        info_hash: Sha1Hash,
        storage: StorageInfo,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        disk_alert_port: AlertReceiver,
        tracker_chan: mpsc::UnboundedSender<TrackerRequest>,
        peer_port: mpsc::UnboundedReceiver<PeerBatch>,
        listener: Option<TcpListener>,
    ) -> Self {
        let listen_port = listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|addr| addr.port())
            .unwrap_or(DEFAULT_ADVERTISED_PORT);
        let shared = Arc::new(SharedStatus {
            info_hash,
            client_id: conf.engine.client_id,
            storage,
            listen_port,
            external_addr: conf.engine.external_addr,
        });
        let (events_chan, events_port) = mpsc::unbounded_channel();
        Self {
            shared,
            piece_picker,
            disk,
            disk_alert_port,
            conf,
            counters: PeerCounters::default(),
            sessions: HashMap::new(),
            known_peers: HashMap::new(),
            events_chan,
            events_port,
            tracker_chan,
            peer_port,
            listener,
        }
    }

    /// Runs the swarm to convergence: returns `Ok(())` once every piece is
    /// written, or on a clean external shutdown; returns the storage error
    /// if the disk gives up.
    pub async fn run(mut self, mut shutdown_port: oneshot::Receiver<()>) -> Result<()> {
        let listener = self.listener.take();
        if let Some(listener) = &listener {
            log::info!(
                "Accepting peer connections on {}",
                listener.local_addr()?
            );
        }

        let _ = self
            .tracker_chan
            .send(TrackerRequest::Announce(AnnounceEvent::Started));
        let _ = self.tracker_chan.send(TrackerRequest::Refresh);

        // everything may already be on disk from an earlier run
        if self.piece_picker.read().await.is_complete() {
            log::info!("Torrent already complete on disk");
            self.finish(AnnounceEvent::Completed).await;
            return Ok(());
        }

        let mut tick = time::interval(self.conf.torrent.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = self.events_port.recv() => {
                    self.handle_event(event);
                }
                Some(alert) = self.disk_alert_port.recv() => {
                    match alert {
                        Alert::PieceWritten { piece_index } => {
                            log::debug!("Piece {} persisted", piece_index);
                        }
                        Alert::DownloadComplete => {
                            log::info!("Download complete");
                            self.finish(AnnounceEvent::Completed).await;
                            return Ok(());
                        }
                        Alert::Failure(e) => {
                            log::error!("Storage gave up: {}", e);
                            self.finish(AnnounceEvent::Stopped).await;
                            return Err(e);
                        }
                    }
                }
                Some(batch) = self.peer_port.recv() => {
                    for (addr, source) in batch {
                        self.add_peer(addr, source);
                    }
                }
                accepted = accept(&listener) => {
                    match accepted {
                        Ok((socket, addr)) => self.accept_peer(socket, addr),
                        Err(e) => log::warn!("Failed to accept connection: {}", e),
                    }
                }
                _ = tick.tick() => {
                    self.on_tick().await;
                }
                _ = &mut shutdown_port => {
                    log::info!("Shutdown requested");
                    self.finish(AnnounceEvent::Stopped).await;
                    return Ok(());
                }
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::PieceVerified { piece_index } => {
                log::debug!("Broadcasting have {} to the swarm", piece_index);
                for handle in self.sessions.values() {
                    // a session that already died misses nothing
                    let _ = handle.cmd_chan.send(SessionCommand::Have(piece_index));
                }
            }
            SwarmEvent::PeersDiscovered { addrs } => {
                for addr in addrs {
                    self.add_peer(addr, PeerSource::Pex);
                }
            }
            SwarmEvent::SessionClosed { addr, error } => {
                self.remove_session(addr, error);
            }
        }
    }

    /// Registers an endpoint in the candidate pool and connects to it if
    /// there is room.
    fn add_peer(&mut self, addr: SocketAddr, source: PeerSource) {
        let now = Instant::now();
        match self.known_peers.get_mut(&addr) {
            Some(known) => known.last_seen = now,
            None => {
                // the pool is bounded; beyond the cap we just forget new
                // endpoints until old ones age out with the map
                if self.known_peers.len() >= self.conf.torrent.known_peer_cap {
                    return;
                }
                self.known_peers.insert(
                    addr,
                    KnownPeer {
                        first_seen: now,
                        last_seen: now,
                        source,
                        cooloff_until: None,
                    },
                );
            }
        }

        if Some(addr) == self.shared.external_addr {
            return;
        }
        if self.sessions.contains_key(&addr) {
            return;
        }
        if let Some(known) = self.known_peers.get(&addr) {
            if known.cooloff_until.map_or(false, |until| now < until) {
                log::debug!("Peer {} still in cooloff", addr);
                return;
            }
        }
        if self.sessions.len() >= self.conf.torrent.max_connected_peer_count {
            return;
        }

        log::info!("Adding peer {} (source: {:?})", addr, source);
        self.spawn_session(addr, source, None);
    }

    /// Handles an inbound connection from the listener.
    fn accept_peer(&mut self, socket: TcpStream, addr: SocketAddr) {
        if self.sessions.contains_key(&addr)
            || self.sessions.len() >= self.conf.torrent.max_connected_peer_count
        {
            log::debug!("Rejecting incoming connection from {}", addr);
            return;
        }
        let now = Instant::now();
        self.known_peers.entry(addr).or_insert(KnownPeer {
            first_seen: now,
            last_seen: now,
            source: PeerSource::Incoming,
            cooloff_until: None,
        });
        log::info!("Accepted incoming peer {}", addr);
        self.spawn_session(addr, PeerSource::Incoming, Some(socket));
    }

    fn spawn_session(
        &mut self,
        addr: SocketAddr,
        source: PeerSource,
        socket: Option<TcpStream>,
    ) {
        let (mut session, cmd_chan) = PeerSession::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.piece_picker),
            self.disk.clone(),
            self.events_chan.clone(),
            addr,
            self.conf.torrent.clone(),
        );
        let events_chan = self.events_chan.clone();
        let join = tokio::spawn(async move {
            let result = match socket {
                Some(socket) => session.start_inbound(socket).await,
                None => session.start_outbound().await,
            };
            if let Err(e) = &result {
                log::info!("Peer {} session ended: {}", addr, e);
            }
            // the supervisor may already be finishing; it reaps us either way
            let _ = events_chan.send(SwarmEvent::SessionClosed {
                addr,
                error: result.err(),
            });
        });

        self.counters.register(source);
        self.sessions.insert(
            addr,
            SessionHandle {
                cmd_chan,
                source,
                join,
            },
        );
    }

    /// Reaps a finished session and starts the cooloff clock for peers that
    /// broke the protocol or served bad data.
    fn remove_session(&mut self, addr: SocketAddr, error: Option<Error>) {
        let handle = match self.sessions.remove(&addr) {
            Some(handle) => handle,
            None => return,
        };
        self.counters.deregister(handle.source);

        if let Some(known) = self.known_peers.get_mut(&addr) {
            known.last_seen = Instant::now();
            if error.as_ref().map_or(false, |e| e.is_protocol_violation()) {
                log::info!("Peer {} put in cooloff", addr);
                known.cooloff_until =
                    Some(Instant::now() + self.conf.torrent.cooloff);
            }
        }
        log::info!(
            "Session {} reaped, {} peers connected",
            addr,
            self.sessions.len()
        );
    }

    /// The supervisor's housekeeping: claim sweeps, tracker refreshes,
    /// reconnects from the known pool, and pushing gossip candidates.
    async fn on_tick(&mut self) {
        let now = Instant::now();

        let counts = self.counters.snapshot();
        log::debug!("Swarm tick: {:?} ({} connected)", counts, counts.total());

        self.piece_picker.write().await.sweep_expired(now);

        let starving =
            self.sessions.len() < self.conf.torrent.min_peer_count;
        if starving && !self.piece_picker.read().await.is_complete() {
            log::debug!(
                "Only {} peers connected, requesting a tracker refresh",
                self.sessions.len()
            );
            let _ = self.tracker_chan.send(TrackerRequest::Refresh);

            // also retry endpoints we already know about
            let retries: Vec<(SocketAddr, PeerSource)> = self
                .known_peers
                .iter()
                .filter(|(addr, known)| {
                    !self.sessions.contains_key(*addr)
                        && !known.cooloff_until.map_or(false, |until| now < until)
                })
                .map(|(addr, known)| (*addr, known.source))
                .take(
                    self.conf
                        .torrent
                        .max_connected_peer_count
                        .saturating_sub(self.sessions.len()),
                )
                .collect();
            for (addr, source) in retries {
                self.add_peer(addr, source);
            }
        }

        // push the gossip candidate pool; each session's own 45 s timer
        // does the rest. Above the cap the swarm is loud enough already, so
        // the pools are cleared until it thins out.
        let candidates: Vec<SocketAddr> =
            if self.sessions.len() < self.conf.torrent.pex_peer_cap {
                self.known_peers.keys().copied().collect()
            } else {
                Vec::new()
            };
        for handle in self.sessions.values() {
            let _ = handle
                .cmd_chan
                .send(SessionCommand::PexCandidates(candidates.clone()));
        }
    }

    /// Announces the final event, closes every session within the grace
    /// period and stops the disk task.
    async fn finish(&mut self, event: AnnounceEvent) {
        log::info!("Finishing torrent (event: {:?})", event);
        let _ = self.tracker_chan.send(TrackerRequest::Announce(event));

        // The completion alert can race the last session events: a Have
        // broadcast still queued must go out before the shutdowns, or the
        // swarm never learns of the final piece. New endpoints, on the
        // other hand, are of no use to a finishing torrent.
        while let Ok(event) = self.events_port.try_recv() {
            match event {
                SwarmEvent::PeersDiscovered { .. } => {}
                other => self.handle_event(other),
            }
        }

        for handle in self.sessions.values() {
            let _ = handle.cmd_chan.send(SessionCommand::Shutdown);
        }
        let deadline = Instant::now() + self.conf.torrent.shutdown_grace;
        for (addr, handle) in self.sessions.drain() {
            let mut join = handle.join;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if time::timeout(remaining, &mut join).await.is_err() {
                log::warn!("Session {} didn't finish in time, aborting it", addr);
                join.abort();
            }
            self.counters.deregister(handle.source);
        }

        self.disk.shutdown();
    }
}

/// Accepts from the listener, or parks forever when we're leech-only.
async fn accept(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
