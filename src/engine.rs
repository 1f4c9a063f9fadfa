//! The engine wires everything together: it validates the descriptor,
//! allocates storage and re-verifies old progress, seeds the piece arbiter,
//! spawns the disk task and runs the swarm supervisor to convergence.
//!
//! The tracker client lives outside the crate and talks to the engine over
//! two channels: it receives [`TrackerRequest`]s (refresh wishes and
//! announce events) and feeds back batches of `(address, source)` endpoint
//! candidates. A blocking tracker implementation simply runs on its own
//! task; the engine's event loop never waits on it.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, RwLock},
    task,
};

use crate::{
    conf::Conf,
    descriptor::Descriptor,
    disk::{Disk, DiskHandle, Storage},
    error::Result,
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    torrent::Torrent,
    PeerSource,
};

/// The announce events the engine asks the external tracker client to
/// deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
}

/// What the engine sends to the external tracker client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerRequest {
    /// The swarm is starving; a fresh peer list would be welcome.
    Refresh,
    /// A lifecycle announce.
    Announce(AnnounceEvent),
}

/// A batch of endpoint candidates flowing into the engine.
pub type PeerBatch = Vec<(SocketAddr, PeerSource)>;

/// Downloads (and meanwhile seeds) the torrent described by `descriptor`
/// until every piece is verified on disk.
///
/// Returns `Ok(())` on full verification or on a clean shutdown through
/// `shutdown_port` (dropping the sender counts as a shutdown request).
/// Startup problems (invalid descriptor, unwritable download directory,
/// listener bind failure) and storage giving up mid-download are errors;
/// callers map those to a non-zero exit.
pub async fn run(
    conf: Conf,
    descriptor: Descriptor,
    tracker_chan: mpsc::UnboundedSender<TrackerRequest>,
    peer_port: mpsc::UnboundedReceiver<PeerBatch>,
    shutdown_port: oneshot::Receiver<()>,
) -> Result<()> {
    descriptor.validate()?;
    let storage_info =
        StorageInfo::new(&descriptor, conf.torrent.download_dir.clone());
    log::info!(
        "Starting torrent {} ({} pieces of {} bytes, {} files)",
        hex::encode(descriptor.info_hash),
        storage_info.piece_count,
        storage_info.piece_len,
        storage_info.files.len()
    );

    // allocation and the re-verification scan are blocking and possibly
    // expensive; keep them off the event loop
    let (storage, own_pieces) = {
        let info = storage_info.clone();
        let piece_hashes = descriptor.piece_hashes.clone();
        task::spawn_blocking(move || Storage::new(info, piece_hashes))
            .await
            .expect("storage allocation task panicked")?
    };

    let (disk_cmd_chan, disk_cmd_port) = mpsc::unbounded_channel();
    let (disk_alert_chan, disk_alert_port) = mpsc::unbounded_channel();
    let disk_handle = DiskHandle::new(disk_cmd_chan);
    let mut disk = Disk::new(
        storage,
        own_pieces.clone(),
        disk_cmd_port,
        disk_alert_chan,
    );
    let disk_join = tokio::spawn(async move {
        if let Err(e) = disk.start().await {
            log::error!("Disk task exited with an error: {}", e);
        }
    });

    let piece_picker = Arc::new(RwLock::new(PiecePicker::new(
        &storage_info,
        descriptor.piece_hashes.clone(),
        own_pieces,
        disk_handle.clone(),
        conf.torrent.max_claim_age,
    )));

    // binding early makes a taken port a startup error, not a mid-download
    // surprise
    let listener = match conf.engine.listen_addr {
        Some(addr) => Some(TcpListener::bind(addr).await?),
        None => None,
    };

    let torrent = Torrent::new(
        conf,
        descriptor.info_hash,
        storage_info,
        piece_picker,
        disk_handle,
        disk_alert_port,
        tracker_chan,
        peer_port,
        listener,
    );
    let result = torrent.run(shutdown_port).await;

    // the supervisor told the disk to shut down; wait for its queue to
    // drain so the sidecar and files are settled when we return
    let _ = disk_join.await;
    result
}
