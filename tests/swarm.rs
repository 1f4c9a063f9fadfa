//! End-to-end scenarios: the engine against scripted remote peers speaking
//! raw BEP 3 over localhost sockets.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};

use torrid::{
    conf::Conf,
    descriptor::{Descriptor, FileEntry},
    engine::{self, AnnounceEvent, PeerBatch, TrackerRequest},
    PeerSource,
};

const BLOCK_LEN: u32 = 16384;
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// harness

struct TestDir(PathBuf);

impl TestDir {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("torrid-swarm-{}", name));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Splits a download's bytes into pieces and builds its descriptor.
fn build_descriptor(
    name: &str,
    files: Vec<(&str, u64)>,
    piece_len: u32,
    content: &[u8],
) -> (Descriptor, Vec<Vec<u8>>) {
    let total: u64 = files.iter().map(|(_, len)| len).sum();
    assert_eq!(total as usize, content.len());

    let pieces: Vec<Vec<u8>> = content
        .chunks(piece_len as usize)
        .map(|chunk| chunk.to_vec())
        .collect();
    let descriptor = Descriptor {
        name: name.to_string(),
        info_hash: [0x42; 20],
        piece_len,
        piece_hashes: pieces.iter().map(|p| Sha1::digest(p).into()).collect(),
        files: files
            .into_iter()
            .map(|(path, len)| FileEntry {
                path: PathBuf::from(path),
                len,
            })
            .collect(),
    };
    (descriptor, pieces)
}

/// A configuration with test-friendly timers.
fn test_conf(dir: &TestDir) -> Conf {
    let mut conf = Conf::new(dir.0.clone());
    conf.torrent.tick_interval = Duration::from_secs(1);
    conf.torrent.unchoke_timeout = Duration::from_secs(2);
    conf.torrent.interested_resend_interval = Duration::from_millis(500);
    conf.torrent.block_timeout = Duration::from_secs(2);
    conf.torrent.cooloff = Duration::from_secs(60);
    conf
}

struct EngineChans {
    tracker_port: mpsc::UnboundedReceiver<TrackerRequest>,
    peer_chan: mpsc::UnboundedSender<PeerBatch>,
    _shutdown_chan: oneshot::Sender<()>,
}

/// Spawns the engine and returns the channel ends the tracker client would
/// normally hold.
fn start_engine(
    conf: Conf,
    descriptor: Descriptor,
) -> (tokio::task::JoinHandle<torrid::error::Result<()>>, EngineChans) {
    let (tracker_chan, tracker_port) = mpsc::unbounded_channel();
    let (peer_chan, peer_port) = mpsc::unbounded_channel();
    let (shutdown_chan, shutdown_port) = oneshot::channel();
    let join = tokio::spawn(engine::run(
        conf,
        descriptor,
        tracker_chan,
        peer_port,
        shutdown_port,
    ));
    (
        join,
        EngineChans {
            tracker_port,
            peer_chan,
            _shutdown_chan: shutdown_chan,
        },
    )
}

// ---------------------------------------------------------------------------
// scripted remote peers

#[derive(Clone, Copy, PartialEq)]
enum Serve {
    /// Serve every requested block correctly.
    Correct,
    /// Serve garbage bytes of the right length.
    Garbage,
    /// Serve the first requested block, then choke and go silent.
    ChokeAfterFirstBlock,
    /// Serve the first requested block, then keep the connection open but
    /// never answer again.
    StallAfterFirstBlock,
}

#[derive(Debug, Default)]
struct SeedReport {
    requests: usize,
    interested: usize,
    haves: Vec<usize>,
}

async fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.ok()?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        // keep-alive
        return Some((u8::MAX, Vec::new()));
    }
    let mut payload = vec![0; len as usize];
    stream.read_exact(&mut payload).await.ok()?;
    let id = payload.remove(0);
    Some((id, payload))
}

async fn write_frame(stream: &mut TcpStream, id: u8, payload: &[u8]) {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
    frame.push(id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

/// Reads the engine's handshake and replies with ours.
async fn exchange_handshake(
    stream: &mut TcpStream,
    info_hash: [u8; 20],
    peer_id: &[u8; 20],
    extensions: bool,
) {
    let mut theirs = [0u8; 68];
    stream.read_exact(&mut theirs).await.unwrap();
    assert_eq!(theirs[0], 19);
    assert_eq!(&theirs[1..20], b"BitTorrent protocol");
    assert_eq!(&theirs[28..48], &info_hash);

    let mut ours = Vec::with_capacity(68);
    ours.push(19);
    ours.extend_from_slice(b"BitTorrent protocol");
    let mut reserved = [0u8; 8];
    if extensions {
        reserved[5] |= 0x10;
    }
    ours.extend_from_slice(&reserved);
    ours.extend_from_slice(&info_hash);
    ours.extend_from_slice(peer_id);
    stream.write_all(&ours).await.unwrap();
}

fn full_bitfield(piece_count: usize) -> Vec<u8> {
    let mut bits = vec![0u8; (piece_count + 7) / 8];
    for piece in 0..piece_count {
        bits[piece / 8] |= 0x80 >> (piece % 8);
    }
    bits
}

/// Starts a scripted seed that accepts one engine connection, offers every
/// piece and answers requests per `mode`. The report resolves when the
/// connection closes.
async fn scripted_seed(
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    pieces: Vec<Vec<u8>>,
    mode: Serve,
) -> (SocketAddr, oneshot::Receiver<SeedReport>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (report_chan, report_port) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        exchange_handshake(&mut stream, info_hash, &peer_id, false).await;

        write_frame(&mut stream, 5, &full_bitfield(pieces.len())).await;
        write_frame(&mut stream, 1, &[]).await; // unchoke

        let mut report = SeedReport::default();
        let mut choked = false;
        let mut served = 0usize;
        while let Some((id, payload)) = read_frame(&mut stream).await {
            match id {
                2 => report.interested += 1,
                4 => {
                    let index =
                        u32::from_be_bytes(payload[..4].try_into().unwrap());
                    report.haves.push(index as usize);
                }
                6 => {
                    report.requests += 1;
                    if choked
                        || (mode == Serve::StallAfterFirstBlock && served > 0)
                    {
                        continue;
                    }
                    let index =
                        u32::from_be_bytes(payload[0..4].try_into().unwrap());
                    let begin =
                        u32::from_be_bytes(payload[4..8].try_into().unwrap());
                    let length =
                        u32::from_be_bytes(payload[8..12].try_into().unwrap());

                    let block = match mode {
                        Serve::Garbage => vec![0xee; length as usize],
                        _ => pieces[index as usize]
                            [begin as usize..(begin + length) as usize]
                            .to_vec(),
                    };
                    let mut reply = Vec::with_capacity(8 + block.len());
                    reply.extend_from_slice(&index.to_be_bytes());
                    reply.extend_from_slice(&begin.to_be_bytes());
                    reply.extend_from_slice(&block);
                    write_frame(&mut stream, 7, &reply).await;
                    served += 1;

                    if mode == Serve::ChokeAfterFirstBlock {
                        write_frame(&mut stream, 0, &[]).await; // choke
                        choked = true;
                    }
                }
                _ => {}
            }
        }
        let _ = report_chan.send(report);
    });

    (addr, report_port)
}

fn batch(addr: SocketAddr) -> PeerBatch {
    vec![(addr, PeerSource::Tracker)]
}

fn drain_tracker(
    port: &mut mpsc::UnboundedReceiver<TrackerRequest>,
) -> Vec<TrackerRequest> {
    let mut requests = Vec::new();
    while let Ok(request) = port.try_recv() {
        requests.push(request);
    }
    requests
}

// ---------------------------------------------------------------------------
// scenarios

#[tokio::test]
async fn test_single_piece_single_peer() {
    let dir = TestDir::new("single-piece");
    let content = vec![0u8; 16384];
    let (descriptor, pieces) =
        build_descriptor("zeros.bin", vec![("zeros.bin", 16384)], BLOCK_LEN, &content);

    let (seed_addr, _report) =
        scripted_seed(descriptor.info_hash, [b'S'; 20], pieces, Serve::Correct).await;

    let (join, mut chans) = start_engine(test_conf(&dir), descriptor);
    chans.peer_chan.send(batch(seed_addr)).unwrap();

    timeout(TEST_TIMEOUT, join).await.unwrap().unwrap().unwrap();

    // the artefact: 16384 zero bytes and a full one-bit progress bitmap
    let out = std::fs::read(dir.0.join("zeros.bin")).unwrap();
    assert_eq!(out, content);
    let sidecar = std::fs::read(dir.0.join("zeros.bin.progress")).unwrap();
    assert_eq!(sidecar, vec![0x80]);

    let requests = drain_tracker(&mut chans.tracker_port);
    assert_eq!(
        requests.first(),
        Some(&TrackerRequest::Announce(AnnounceEvent::Started))
    );
    assert_eq!(
        requests.last(),
        Some(&TrackerRequest::Announce(AnnounceEvent::Completed))
    );
}

#[tokio::test]
async fn test_bad_hash_then_good_peer() {
    let dir = TestDir::new("bad-hash");
    let content: Vec<u8> = (0..20000u32).map(|i| (i % 241) as u8).collect();
    let (descriptor, pieces) =
        build_descriptor("mixed.bin", vec![("mixed.bin", 20000)], BLOCK_LEN, &content);

    let (bad_addr, _bad_report) = scripted_seed(
        descriptor.info_hash,
        [b'A'; 20],
        pieces.clone(),
        Serve::Garbage,
    )
    .await;
    let (good_addr, good_report) = scripted_seed(
        descriptor.info_hash,
        [b'B'; 20],
        pieces,
        Serve::Correct,
    )
    .await;

    let (join, chans) = start_engine(test_conf(&dir), descriptor);
    chans
        .peer_chan
        .send(vec![
            (bad_addr, PeerSource::Tracker),
            (good_addr, PeerSource::Tracker),
        ])
        .unwrap();

    timeout(TEST_TIMEOUT, join).await.unwrap().unwrap().unwrap();

    let out = std::fs::read(dir.0.join("mixed.bin")).unwrap();
    assert_eq!(out, content);

    // the surviving peer saw exactly one Have per piece
    let report = good_report.await.unwrap();
    let mut haves = report.haves;
    haves.sort_unstable();
    assert_eq!(haves, vec![0, 1]);
}

#[tokio::test]
async fn test_choke_mid_piece() {
    let dir = TestDir::new("choke");
    // one piece of three blocks
    let piece_len = 3 * BLOCK_LEN;
    let content: Vec<u8> = (0..piece_len).map(|i| (i % 199) as u8).collect();
    let (descriptor, pieces) = build_descriptor(
        "choked.bin",
        vec![("choked.bin", piece_len as u64)],
        piece_len,
        &content,
    );

    let (choker_addr, choker_report) = scripted_seed(
        descriptor.info_hash,
        [b'A'; 20],
        pieces.clone(),
        Serve::ChokeAfterFirstBlock,
    )
    .await;

    let (join, chans) = start_engine(test_conf(&dir), descriptor);
    chans.peer_chan.send(batch(choker_addr)).unwrap();

    // let the choker serve its single block and choke before help arrives
    sleep(Duration::from_secs(1)).await;
    let (good_addr, _good_report) = scripted_seed(
        [0x42; 20],
        [b'B'; 20],
        pieces,
        Serve::Correct,
    )
    .await;
    chans.peer_chan.send(batch(good_addr)).unwrap();

    timeout(TEST_TIMEOUT, join).await.unwrap().unwrap().unwrap();

    let out = std::fs::read(dir.0.join("choked.bin")).unwrap();
    assert_eq!(out, content);

    let report = choker_report.await.unwrap();
    // one request outstanding at a time, and the follow-up for the second
    // block may race the choke; nothing is requested after the choke is
    // seen
    assert!(report.requests <= 2);
    // interest was re-expressed while waiting for an unchoke
    assert!(report.interested >= 2, "interested sent {} times", report.interested);
}

#[tokio::test]
async fn test_claim_timeout_frees_stalled_piece() {
    let dir = TestDir::new("claim-timeout");
    // one piece of three blocks
    let piece_len = 3 * BLOCK_LEN;
    let content: Vec<u8> = (0..piece_len).map(|i| (i % 233) as u8).collect();
    let (descriptor, pieces) = build_descriptor(
        "stalled.bin",
        vec![("stalled.bin", piece_len as u64)],
        piece_len,
        &content,
    );

    // the block timeout is pushed out of the way so the stalled claim can
    // only come back through the supervisor's claim-age sweep
    let mut conf = test_conf(&dir);
    conf.torrent.block_timeout = Duration::from_secs(60);
    conf.torrent.max_claim_age = Duration::from_secs(2);

    let (stall_addr, stall_report) = scripted_seed(
        descriptor.info_hash,
        [b'A'; 20],
        pieces.clone(),
        Serve::StallAfterFirstBlock,
    )
    .await;

    let (join, chans) = start_engine(conf, descriptor);
    chans.peer_chan.send(batch(stall_addr)).unwrap();

    // let the staller claim the piece and serve its single block
    sleep(Duration::from_secs(1)).await;
    let (good_addr, good_report) =
        scripted_seed([0x42; 20], [b'B'; 20], pieces, Serve::Correct).await;
    chans.peer_chan.send(batch(good_addr)).unwrap();

    timeout(TEST_TIMEOUT, join).await.unwrap().unwrap().unwrap();

    let out = std::fs::read(dir.0.join("stalled.bin")).unwrap();
    assert_eq!(out, content);

    // the staller was asked and answered once, then sat on its claim; the
    // sweep made the piece selectable again and the second peer served
    // every block of it fresh
    let stalled = stall_report.await.unwrap();
    assert!(stalled.requests >= 1);
    let good = good_report.await.unwrap();
    assert_eq!(good.requests, 3);
}

#[tokio::test]
async fn test_multi_file_straddle() {
    let dir = TestDir::new("straddle");
    let content: Vec<u8> = (0..20000u32).map(|i| (i % 251) as u8).collect();
    let (descriptor, pieces) = build_descriptor(
        "archive",
        vec![("a", 10000), ("b", 10000)],
        BLOCK_LEN,
        &content,
    );

    let (seed_addr, _report) =
        scripted_seed(descriptor.info_hash, [b'S'; 20], pieces, Serve::Correct).await;

    let (join, chans) = start_engine(test_conf(&dir), descriptor);
    chans.peer_chan.send(batch(seed_addr)).unwrap();

    timeout(TEST_TIMEOUT, join).await.unwrap().unwrap().unwrap();

    // piece 0 straddles the file boundary: 10000 bytes into "a", 6384
    // into "b"
    let a = std::fs::read(dir.0.join("archive").join("a")).unwrap();
    let b = std::fs::read(dir.0.join("archive").join("b")).unwrap();
    assert_eq!(a, &content[..10000]);
    assert_eq!(b, &content[10000..]);
}

#[tokio::test]
async fn test_pex_discovery() {
    let dir = TestDir::new("pex");
    let content = vec![0xabu8; 16384];
    let (descriptor, pieces) =
        build_descriptor("gossiped.bin", vec![("gossiped.bin", 16384)], BLOCK_LEN, &content);

    // the seed that actually has the data; the engine learns about it only
    // through gossip
    let (seed_addr, seed_report) =
        scripted_seed(descriptor.info_hash, [b'Z'; 20], pieces, Serve::Correct).await;

    // the gossiper: extension-capable, no pieces, announces the seed over
    // ut_pex
    let info_hash = descriptor.info_hash;
    let gossiper = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gossiper_addr = gossiper.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = gossiper.accept().await.unwrap();
        exchange_handshake(&mut stream, info_hash, &[b'X'; 20], true).await;
        // an empty bitfield: nothing to download here
        write_frame(&mut stream, 5, &[0u8]).await;
        // extended handshake advertising ut_pex under id 1
        let mut payload = vec![0u8];
        payload.extend_from_slice(b"d1:md6:ut_pexi1eee");
        write_frame(&mut stream, 20, &payload).await;

        // gossip the seed's endpoint under the id the engine advertised
        let SocketAddr::V4(seed_v4) = seed_addr else {
            panic!("seed should be IPv4");
        };
        let mut compact = Vec::new();
        compact.extend_from_slice(&seed_v4.ip().octets());
        compact.extend_from_slice(&seed_v4.port().to_be_bytes());
        let mut pex = vec![1u8];
        pex.extend_from_slice(b"d5:added6:");
        pex.extend_from_slice(&compact);
        pex.extend_from_slice(b"7:dropped0:e");
        write_frame(&mut stream, 20, &pex).await;

        // linger until the engine hangs up
        while read_frame(&mut stream).await.is_some() {}
    });

    let (join, chans) = start_engine(test_conf(&dir), descriptor);
    chans.peer_chan.send(batch(gossiper_addr)).unwrap();

    timeout(TEST_TIMEOUT, join).await.unwrap().unwrap().unwrap();

    let out = std::fs::read(dir.0.join("gossiped.bin")).unwrap();
    assert_eq!(out, content);

    // the gossiped seed was dialled and used
    let report = seed_report.await.unwrap();
    assert!(report.requests > 0);
}
