//! A peer session: one task driving one TCP connection through handshake,
//! choke/interest negotiation, the block request pipeline, serving, and PEX.
//!
//! The session owns both directions of its socket. A single `select!` loop
//! decodes inbound frames and dispatches by variant: control-plane frames
//! mutate session state in place, data-plane Piece frames go through a small
//! bounded inbox drained by the download routine. The session never holds a
//! pointer back into the swarm; everything it has to say goes out over the
//! event channel it was created with.

mod codec;
mod pex;

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, RwLock},
    time::{self, timeout, MissedTickBehavior},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    conf::TorrentConf,
    disk::DiskHandle,
    download::piece_blocks,
    error::{Error, Result},
    piece_picker::{DeliveryResult, PiecePicker},
    torrent::{SharedStatus, SwarmEvent},
    Bitfield, BlockInfo, PeerId, PieceIndex, BLOCK_LEN,
};
use codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use pex::{ExtendedHandshake, PexMessage, PexState, EXTENDED_HANDSHAKE_ID, OUR_UT_PEX_ID};

/// The largest block a remote may request from us. Mainline clients reject
/// anything past 128 KiB, and so do we.
const MAX_REQUEST_LEN: u32 = 8 * BLOCK_LEN;

/// How many received-but-undelivered data frames a session buffers before
/// concluding the peer is flooding us.
const INBOX_LEN: usize = 64;

/// How often the session looks at its timers.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// The commands the swarm supervisor sends a session.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Announce a freshly verified piece to the remote.
    Have(PieceIndex),
    /// The current gossip candidate pool; the session's PEX timer decides
    /// when and what to actually send.
    PexCandidates(Vec<SocketAddr>),
    /// Finish up and close the connection.
    Shutdown,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<SessionCommand>;
type CommandReceiver = mpsc::UnboundedReceiver<SessionCommand>;

type MessageSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;

/// At any given time, a connection with a peer is in one of the below
/// states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// The state during which the TCP connection is established.
    Connecting,
    /// Exchanging the 68 byte BitTorrent handshake.
    Handshaking,
    /// The normal state of a session; all framed messages flow here.
    Active,
    /// Tearing down: the claim is released and the socket closed.
    Dying,
}

/// The four BEP 3 flow control flags. Both sides start out choked and not
/// interested.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    /// If we choke the peer, we don't serve its requests.
    am_choking: bool,
    /// If we're interested, the peer has pieces we don't have.
    am_interested: bool,
    /// If the peer chokes us, we must not request blocks from it.
    peer_choking: bool,
    /// If the peer is interested, it means to download pieces we have.
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// The piece claim a session is downloading: the block cursor and the
/// requests in flight, all targeting the single claimed piece.
struct CurrentDownload {
    piece_index: PieceIndex,
    /// All blocks of the piece, in offset order.
    blocks: Vec<BlockInfo>,
    /// Index of the next block to request.
    next_block: usize,
    /// Requests awaiting their Piece reply, with the time they went out.
    outgoing: Vec<(BlockInfo, Instant)>,
}

impl CurrentDownload {
    fn new(piece_index: PieceIndex, piece_len: u32) -> Self {
        Self {
            piece_index,
            blocks: piece_blocks(piece_index, piece_len).collect(),
            next_block: 0,
            outgoing: Vec::new(),
        }
    }
}

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece arbiter, shared with every other session of the torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// The entity used to read verified blocks when serving.
    disk: DiskHandle,
    /// Where session-to-swarm notifications go (verified pieces, PEX
    /// discoveries).
    events: mpsc::UnboundedSender<SwarmEvent>,
    /// The port on which the session receives supervisor commands.
    cmd_port: CommandReceiver,
    /// The remote address of the peer; the stable session key.
    addr: SocketAddr,
    conf: TorrentConf,
    status: Status,
    /// The peer's piece availability, `None` until its bitfield arrives (or
    /// the wait times out and full availability is assumed).
    peer_pieces: Option<Bitfield>,
    /// Set after a successful handshake.
    peer_id: Option<PeerId>,
    peer_supports_extensions: bool,
    pex: PexState,
    /// The latest candidate pool pushed by the supervisor.
    pex_candidates: Vec<SocketAddr>,
    /// The in-progress piece download, if any.
    claim: Option<CurrentDownload>,
    /// Received data frames awaiting the download routine.
    inbox: VecDeque<(BlockInfo, Vec<u8>)>,
    /// Reset on every verified piece; the session dies when it hits the
    /// configured maximum.
    consecutive_failures: u32,
    /// When the handshake completed; starts the bitfield wait.
    handshake_done_at: Option<Instant>,
    /// When the current wait-for-unchoke window started. `None` while
    /// unchoked.
    interest_expressed_at: Option<Instant>,
    /// When we last sent Interested, for the resend cadence.
    last_interested_sent: Option<Instant>,
}

impl PeerSession {
    /// Creates a new session for the peer at the given address and returns
    /// it together with the supervisor's command handle.
    pub fn new(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        disk: DiskHandle,
        events: mpsc::UnboundedSender<SwarmEvent>,
        addr: SocketAddr,
        conf: TorrentConf,
    ) -> (Self, CommandSender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                disk,
                events,
                cmd_port,
                addr,
                conf,
                status: Status::default(),
                peer_pieces: None,
                peer_id: None,
                peer_supports_extensions: false,
                pex: PexState::default(),
                pex_candidates: Vec::new(),
                claim: None,
                inbox: VecDeque::new(),
                consecutive_failures: 0,
                handshake_done_at: None,
                interest_expressed_at: None,
                last_interested_sent: None,
            },
            cmd_chan,
        )
    }

    /// Dials the peer and runs the session until the connection closes, an
    /// error occurs, or the supervisor asks for shutdown. Any piece claim is
    /// released before returning.
    pub async fn start_outbound(&mut self) -> Result<()> {
        log::info!("Connecting to peer {}", self.addr);
        let result = self.connect_and_run().await;
        self.shut_down().await;
        result
    }

    /// Like [`PeerSession::start_outbound`], but over an already accepted
    /// socket: the remote handshakes first and we reply.
    pub async fn start_inbound(&mut self, socket: TcpStream) -> Result<()> {
        log::info!("Peer {} connected to us", self.addr);
        let result = self.establish(socket, false).await;
        self.shut_down().await;
        result
    }

    async fn connect_and_run(&mut self) -> Result<()> {
        let socket = timeout(self.conf.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::PeerTimeout("connect"))??;
        log::info!("Connected to peer {}", self.addr);
        self.establish(socket, true).await
    }

    /// Exchanges handshakes, switches to the message codec and enters the
    /// session loop.
    async fn establish(&mut self, socket: TcpStream, outbound: bool) -> Result<()> {
        self.status.state = State::Handshaking;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let ours = Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        if outbound {
            socket.send(ours).await?;
        }

        let theirs = timeout(self.conf.handshake_timeout, socket.next())
            .await
            .map_err(|_| Error::PeerTimeout("handshake"))?
            .ok_or(Error::PeerDisconnected)??;
        log::debug!("Peer {} handshake: {:?}", self.addr, theirs);

        if theirs.info_hash != self.torrent.info_hash {
            log::warn!("Peer {} handshake has wrong info hash", self.addr);
            return Err(Error::ProtocolViolation("info hash mismatch"));
        }
        if theirs.peer_id == self.torrent.client_id {
            return Err(Error::ProtocolViolation("connected to ourselves"));
        }
        self.peer_id = Some(theirs.peer_id);
        self.peer_supports_extensions = theirs.supports_extensions();

        if !outbound {
            socket.send(ours).await?;
        }

        // Switch to the peer message codec, keeping the buffers: the peer
        // may have pipelined messages right after its handshake and those
        // bytes must not be lost.
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new::<Message>(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::Active;
        self.handshake_done_at = Some(Instant::now());
        log::info!("Peer {} session state: {:?}", self.addr, self.status.state);

        self.run(socket).await
    }

    /// The main session loop: frames in, commands in, timers, and after
    /// every wakeup a turn of the download routine.
    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, mut stream) = socket.split();

        if self.peer_supports_extensions {
            let ours = ExtendedHandshake::ours(self.torrent.listen_port);
            sink.send(Message::Extended {
                id: EXTENDED_HANDSHAKE_ID,
                payload: ours.to_bytes(),
            })
            .await?;
        }

        // advertise anything we already have, then express interest: the
        // download side of the session starts here
        let own_pieces = self.piece_picker.read().await.own_pieces().clone();
        if own_pieces.any() {
            sink.send(Message::Bitfield(own_pieces)).await?;
        }
        self.express_interest(&mut sink).await?;

        let mut tick = time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_msg = stream.next() => {
                    let msg = maybe_msg.ok_or(Error::PeerDisconnected)??;
                    log::trace!("Peer {} sent {}", self.addr, msg.kind());
                    self.handle_msg(&mut sink, msg).await?;
                }
                Some(cmd) = self.cmd_port.recv() => {
                    match cmd {
                        SessionCommand::Have(piece_index) => {
                            sink.send(Message::Have { piece_index }).await?;
                        }
                        SessionCommand::PexCandidates(addrs) => {
                            self.pex_candidates = addrs;
                        }
                        SessionCommand::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            return Ok(());
                        }
                    }
                }
                _ = tick.tick() => {
                    self.on_tick(&mut sink).await?;
                }
            }
            self.advance_download(&mut sink).await?;
        }
    }

    /// Applies one inbound frame. Control-plane messages mutate session
    /// state right here; data-plane Piece frames only enter the inbox.
    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.peer_choking {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.peer_choking = true;
                    // a choke mid-piece abandons the claim; interest stays
                    // and the unchoke wait starts over
                    self.download_failure("choked mid-piece").await?;
                    self.interest_expressed_at = Some(Instant::now());
                }
            }
            Message::Unchoke => {
                if self.status.peer_choking {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.peer_choking = false;
                    self.interest_expressed_at = None;
                }
            }
            Message::Interested => {
                if !self.status.peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.peer_interested = true;
                }
                // the whole choking algorithm: an interested peer is
                // immediately unchoked
                if self.status.am_choking {
                    self.status.am_choking = false;
                    sink.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                if self.status.peer_interested {
                    log::info!("Peer {} is no longer interested", self.addr);
                    self.status.peer_interested = false;
                }
            }
            Message::Have { piece_index } => {
                if piece_index >= self.torrent.storage.piece_count {
                    return Err(Error::ProtocolViolation("have index out of bounds"));
                }
                // a peer that never sent a bitfield starts out with nothing
                let piece_count = self.torrent.storage.piece_count;
                let peer_pieces = self
                    .peer_pieces
                    .get_or_insert_with(|| Bitfield::repeat(false, piece_count));
                peer_pieces.set(piece_index, true);
            }
            Message::Bitfield(bitfield) => {
                self.handle_bitfield(bitfield)?;
            }
            Message::Request(block) => {
                self.handle_request(sink, block).await?;
            }
            Message::Cancel(block) => {
                // requests are served inline, so there is never a queued
                // request left to cancel
                log::debug!("Peer {} canceled {:?}", self.addr, block);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                self.handle_block(piece_index, offset, data)?;
            }
            Message::Extended { id, payload } => {
                self.handle_extended(id, payload)?;
            }
        }
        Ok(())
    }

    /// Stores the peer's piece availability. Only valid directly after the
    /// handshake, before any Have built a partial view.
    fn handle_bitfield(&mut self, mut bitfield: Bitfield) -> Result<()> {
        if self.peer_pieces.is_some() {
            return Err(Error::ProtocolViolation("bitfield not after handshake"));
        }

        let piece_count = self.torrent.storage.piece_count;
        // the wire bitfield is padded to a byte boundary, nothing more
        if bitfield.len() != (piece_count + 7) / 8 * 8 {
            return Err(Error::ProtocolViolation("bitfield has wrong size"));
        }
        bitfield.truncate(piece_count);
        log::info!(
            "Peer {} has {} of {} pieces",
            self.addr,
            bitfield.count_ones(),
            piece_count
        );
        self.peer_pieces = Some(bitfield);
        Ok(())
    }

    /// Serves a Request from the remote out of verified storage.
    async fn handle_request(
        &mut self,
        sink: &mut MessageSink,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.am_choking {
            // a choked peer must not request; don't serve, don't escalate
            log::warn!("Choked peer {} sent a request", self.addr);
            return Ok(());
        }
        if block.len == 0 || block.len > MAX_REQUEST_LEN {
            return Err(Error::ProtocolViolation("bad request length"));
        }

        // only verified pieces are served; a remote never observes a
        // partial piece
        let have_piece = self
            .piece_picker
            .read()
            .await
            .own_pieces()
            .get(block.piece_index)
            .map_or(false, |b| *b);
        if !have_piece {
            return Err(Error::ProtocolViolation("request for missing piece"));
        }

        let data = self.disk.read_block(block).await?;
        log::debug!("Serving {:?} to peer {}", block, self.addr);
        sink.send(Message::Piece {
            piece_index: block.piece_index,
            offset: block.offset,
            data,
        })
        .await?;
        Ok(())
    }

    /// Accepts a data-plane frame into the inbox if it answers one of our
    /// outstanding requests; unsolicited blocks are dropped.
    fn handle_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::EmptyBlock);
        }

        let claim = match &mut self.claim {
            Some(claim) => claim,
            None => {
                log::warn!(
                    "Peer {} sent block for unclaimed piece {}",
                    self.addr,
                    piece_index
                );
                return Ok(());
            }
        };

        let position = claim.outgoing.iter().position(|(block, _)| {
            block.piece_index == piece_index && block.offset == offset
        });
        let (block, _) = match position {
            Some(position) => claim.outgoing.remove(position),
            None => {
                log::warn!(
                    "Peer {} sent unrequested block {}:{}",
                    self.addr,
                    piece_index,
                    offset
                );
                return Ok(());
            }
        };
        if data.len() as u32 != block.len {
            return Err(Error::ProtocolViolation("block length mismatch"));
        }

        if self.inbox.len() >= INBOX_LEN {
            return Err(Error::InboxFull);
        }
        self.inbox.push_back((block, data));
        Ok(())
    }

    /// Applies a BEP 10 frame: the extended handshake, or a ut_pex message
    /// under the id we advertised. Unparseable payloads are logged and
    /// dropped rather than escalated; unknown ids are ignored.
    fn handle_extended(&mut self, id: u8, payload: Vec<u8>) -> Result<()> {
        if id == EXTENDED_HANDSHAKE_ID {
            match ExtendedHandshake::from_bytes(&payload) {
                Ok(handshake) => {
                    log::info!(
                        "Peer {} extended handshake (client: {})",
                        self.addr,
                        handshake.client_version().unwrap_or_default()
                    );
                    self.pex.on_extended_handshake(&handshake);
                }
                Err(e) => {
                    log::warn!(
                        "Ignoring unparseable extended handshake from {}: {}",
                        self.addr,
                        e
                    );
                }
            }
        } else if id == OUR_UT_PEX_ID {
            match PexMessage::from_bytes(&payload) {
                Ok(msg) => {
                    let addrs = msg.added_peers();
                    if !addrs.is_empty() {
                        log::info!(
                            "Peer {} gossiped {} endpoints",
                            self.addr,
                            addrs.len()
                        );
                        self.events.send(SwarmEvent::PeersDiscovered { addrs })?;
                    }
                }
                Err(e) => {
                    log::warn!("Ignoring bad pex message from {}: {}", self.addr, e);
                }
            }
        } else {
            log::debug!("Peer {} sent unknown extended id {}", self.addr, id);
        }
        Ok(())
    }

    /// One turn of the download routine: drain delivered blocks into the
    /// arbiter, then keep the request pipeline full.
    async fn advance_download(&mut self, sink: &mut MessageSink) -> Result<()> {
        while let Some((block, data)) = self.inbox.pop_front() {
            let result = self
                .piece_picker
                .write()
                .await
                .deliver_block(block.piece_index, block.offset, &data, self.addr)
                .map_err(|e| match e {
                    Error::InvalidPieceIndex | Error::InvalidBlockInfo => {
                        Error::ProtocolViolation("block out of bounds")
                    }
                    other => other,
                })?;
            match result {
                DeliveryResult::Accepted => {}
                DeliveryResult::Verified => {
                    log::info!(
                        "Piece {} verified via peer {}",
                        block.piece_index,
                        self.addr
                    );
                    self.claim = None;
                    self.consecutive_failures = 0;
                    self.events.send(SwarmEvent::PieceVerified {
                        piece_index: block.piece_index,
                    })?;
                }
                DeliveryResult::HashFailed => {
                    // the sender is the proximate liar; no retry with it
                    return Err(Error::PieceHashMismatch);
                }
            }
        }

        if self.status.peer_choking {
            return Ok(());
        }

        if self.claim.is_none() {
            // grace period for the bitfield; a peer still silent after it
            // is assumed to have everything
            if self.peer_pieces.is_none() {
                let waited = self
                    .handshake_done_at
                    .map_or(Duration::ZERO, |at| at.elapsed());
                if waited < self.conf.bitfield_timeout {
                    return Ok(());
                }
            }
            let picked = self
                .piece_picker
                .write()
                .await
                .pick_piece(self.peer_pieces.as_ref(), self.addr);
            match picked {
                Some(piece_index) => {
                    let piece_len = self.torrent.storage.piece_len(piece_index)?;
                    log::info!(
                        "Peer {} session downloading piece {}",
                        self.addr,
                        piece_index
                    );
                    self.claim = Some(CurrentDownload::new(piece_index, piece_len));
                }
                // nothing for us right now; a Have or another session's
                // failure may change that later
                None => return Ok(()),
            }
        }

        if let Some(claim) = &mut self.claim {
            while claim.outgoing.len() < self.conf.max_inflight_requests
                && claim.next_block < claim.blocks.len()
            {
                let block = claim.blocks[claim.next_block];
                claim.next_block += 1;
                claim.outgoing.push((block, Instant::now()));
                sink.send(Message::Request(block)).await?;
            }
        }
        Ok(())
    }

    /// Timer work: the unchoke wait, block request timeouts and the PEX
    /// gossip cadence.
    async fn on_tick(&mut self, sink: &mut MessageSink) -> Result<()> {
        let now = Instant::now();

        if self.status.peer_choking
            && self.status.am_interested
            && self.wants_download().await
        {
            if let Some(since) = self.interest_expressed_at {
                if now.duration_since(since) >= self.conf.unchoke_timeout {
                    log::info!("Peer {} kept us choked too long", self.addr);
                    return Err(Error::PeerTimeout("unchoke"));
                }
                let resend_due = self.last_interested_sent.map_or(true, |at| {
                    now.duration_since(at) >= self.conf.interested_resend_interval
                });
                if resend_due {
                    sink.send(Message::Interested).await?;
                    self.last_interested_sent = Some(now);
                }
            }
        }

        let timed_out = self.claim.as_ref().map_or(false, |claim| {
            claim
                .outgoing
                .iter()
                .any(|(_, at)| now.duration_since(*at) > self.conf.block_timeout)
        });
        if timed_out {
            self.download_failure("block request timed out").await?;
        }

        if self.pex.is_due(now, self.conf.pex_interval) {
            let gossip = self.pex.gossip(
                now,
                &self.pex_candidates,
                self.addr,
                self.torrent.external_addr,
            );
            if let Some((id, payload)) = gossip {
                log::debug!("Gossiping peers to {}", self.addr);
                sink.send(Message::Extended { id, payload }).await?;
            }
        }

        Ok(())
    }

    /// Whether this peer plausibly has pieces we still need; governs how
    /// aggressively we treat being choked.
    async fn wants_download(&self) -> bool {
        let picker = self.piece_picker.read().await;
        if picker.is_complete() {
            return false;
        }
        match &self.peer_pieces {
            Some(peer_pieces) => picker.is_interested_in(peer_pieces),
            // availability unknown: assume it has something for us
            None => true,
        }
    }

    /// Expresses interest and opens the wait-for-unchoke window.
    async fn express_interest(&mut self, sink: &mut MessageSink) -> Result<()> {
        sink.send(Message::Interested).await?;
        self.status.am_interested = true;
        let now = Instant::now();
        self.last_interested_sent = Some(now);
        if self.status.peer_choking {
            self.interest_expressed_at = Some(now);
        }
        Ok(())
    }

    /// Abandons the current claim as a failure and counts it; the session
    /// dies when failures accumulate without a verified piece in between.
    /// A no-op without a claim.
    async fn download_failure(&mut self, reason: &'static str) -> Result<()> {
        if let Some(claim) = self.claim.take() {
            log::info!(
                "Peer {} download of piece {} failed: {}",
                self.addr,
                claim.piece_index,
                reason
            );
            self.piece_picker
                .write()
                .await
                .release(claim.piece_index, self.addr, false);
            self.inbox.clear();
            self.consecutive_failures += 1;
            if self.consecutive_failures >= self.conf.max_consecutive_failures {
                return Err(Error::TooManyFailures);
            }
        }
        Ok(())
    }

    /// Releases every resource the session holds. Run on every exit path,
    /// clean or not.
    async fn shut_down(&mut self) {
        self.status.state = State::Dying;
        if let Some(claim) = self.claim.take() {
            self.piece_picker
                .write()
                .await
                .release(claim.piece_index, self.addr, false);
        }
        self.inbox.clear();
        let peer_id = self
            .peer_id
            .map(|id| String::from_utf8_lossy(&id).into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        log::info!("Peer {} ({}) session closed", self.addr, peer_id);
    }
}
