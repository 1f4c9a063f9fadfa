//! Storage: pre-allocation, scatter writes, startup verification and block
//! reads, all behind the disk task's command loop.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use lru::LruCache;
use nix::{
    errno::Errno,
    sys::uio::{pread, pwrite},
};
use sha1::{Digest, Sha1};
use tokio::task;

use super::{Alert, AlertSender, Command, CommandReceiver};
use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PieceIndex, Sha1Hash,
};

/// How many whole pieces the read cache holds. Serving all blocks of one
/// piece costs a single read this way.
const PIECE_READ_CACHE_LEN: usize = 8;

/// The entity responsible for scattering verified pieces to disk, persisting
/// the progress sidecar and serving block reads.
pub(crate) struct Disk {
    storage: Arc<Storage>,
    /// The pieces whose bytes are on disk. The sidecar always matches this
    /// at the point of persistence.
    own_pieces: Bitfield,
    /// Whole-piece read cache for serving remote Request messages.
    read_cache: LruCache<PieceIndex, Arc<Vec<u8>>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` alerts the swarm supervisor.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` around an already allocated storage and the
    /// bitmap its startup scan produced.
    pub fn new(
        storage: Storage,
        own_pieces: Bitfield,
        cmd_port: CommandReceiver,
        alert_chan: AlertSender,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            own_pieces,
            read_cache: LruCache::new(
                NonZeroUsize::new(PIECE_READ_CACHE_LEN).expect("nonzero cache size"),
            ),
            cmd_port,
            alert_chan,
        }
    }

    /// Runs the disk event loop until shutdown or an unrecoverable storage
    /// error.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::WritePiece { piece_index, data } => {
                    self.write_piece(piece_index, data).await?;
                }
                Command::ReadBlock { block, result_chan } => {
                    let result = self.read_block(block).await;
                    // the requesting session may be gone by now
                    let _ = result_chan.send(result);
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk IO event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Writes a verified piece and persists the updated sidecar.
    ///
    /// A failed write is retried once; a second failure alerts the
    /// supervisor, which shuts the torrent down (disk corruption must not
    /// propagate silently).
    async fn write_piece(
        &mut self,
        piece_index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        let data = Arc::new(data);
        // the sidecar bitmap this write commits, with the new piece included
        let mut bitmap = self.own_pieces.clone();
        if piece_index < bitmap.len() {
            bitmap.set(piece_index, true);
        }
        let sidecar = bitmap.as_raw_slice().to_vec();

        let mut last_error = None;
        for attempt in 0..2 {
            let storage = Arc::clone(&self.storage);
            let data = Arc::clone(&data);
            let sidecar = sidecar.clone();
            let result = task::spawn_blocking(move || {
                storage.write_piece(piece_index, &data, &sidecar)
            })
            .await
            .expect("disk IO write task panicked");

            match result {
                Ok(()) => {
                    self.own_pieces = bitmap;
                    log::info!(
                        "Piece {} written ({} of {} on disk)",
                        piece_index,
                        self.own_pieces.count_ones(),
                        self.own_pieces.len()
                    );
                    self.alert_chan.send(Alert::PieceWritten { piece_index })?;
                    if self.own_pieces.all() {
                        self.alert_chan.send(Alert::DownloadComplete)?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "Piece {} write attempt {} failed: {}",
                        piece_index,
                        attempt + 1,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            log::error!("Piece {} write failed twice, giving up: {}", piece_index, e);
        }
        self.alert_chan.send(Alert::Failure(Error::StorageFailure))?;
        Err(Error::StorageFailure)
    }

    /// Serves a block of an already written piece, going through the
    /// whole-piece read cache.
    async fn read_block(&mut self, block: BlockInfo) -> Result<Vec<u8>> {
        if block.piece_index >= self.own_pieces.len()
            || !self.own_pieces[block.piece_index]
        {
            return Err(Error::InvalidPieceIndex);
        }
        let piece_len = self.storage.info.piece_len(block.piece_index)?;
        let in_bounds = block
            .offset
            .checked_add(block.len)
            .map_or(false, |end| end <= piece_len);
        if block.len == 0 || !in_bounds {
            return Err(Error::InvalidBlockInfo);
        }

        let piece = match self.read_cache.get(&block.piece_index) {
            Some(piece) => Arc::clone(piece),
            None => {
                let storage = Arc::clone(&self.storage);
                let piece = task::spawn_blocking(move || {
                    storage.read_piece(block.piece_index)
                })
                .await
                .expect("disk IO read task panicked")?;
                let piece = Arc::new(piece);
                self.read_cache.put(block.piece_index, Arc::clone(&piece));
                piece
            }
        };

        let (offset, len) = (block.offset as usize, block.len as usize);
        Ok(piece[offset..offset + len].to_vec())
    }
}

/// The allocated files of a torrent and the geometry to address them.
pub(crate) struct Storage {
    info: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    /// One coarse lock per file: piece writes are large and infrequent
    /// relative to the message rate, so finer granularity buys nothing.
    files: Vec<Mutex<TorrentFile>>,
}

impl Storage {
    /// Creates the torrent's directory structure, pre-allocates every file
    /// to its declared length and re-verifies any progress recorded by the
    /// sidecar.
    ///
    /// Returns the storage and the bitmap of pieces whose on-disk bytes
    /// hash correctly; the picker is seeded with it.
    pub fn new(
        info: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
    ) -> Result<(Self, Bitfield)> {
        fs::create_dir_all(&info.download_dir)?;

        let mut files = Vec::with_capacity(info.files.len());
        for index in 0..info.files.len() {
            let path = info.file_path(index);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| {
                    log::error!("Failed to open file {:?}: {}", path, e);
                    Error::Io(e)
                })?;
            let len = info.files[index].len;
            if handle.metadata()?.len() != len {
                handle.set_len(len)?;
            }
            files.push(Mutex::new(TorrentFile { path, handle }));
        }

        let storage = Self {
            info,
            piece_hashes,
            files,
        };
        let own_pieces = storage.verify_existing()?;
        Ok((storage, own_pieces))
    }

    /// Re-verifies the pieces the sidecar claims are done: each one is read
    /// back, hashed and compared; bits that don't check out are cleared.
    /// Pieces the sidecar doesn't claim start out missing.
    fn verify_existing(&self) -> Result<Bitfield> {
        let piece_count = self.info.piece_count;
        let mut own_pieces = Bitfield::repeat(false, piece_count);

        let bytes = match fs::read(&self.info.sidecar_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(own_pieces);
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.len() != (piece_count + 7) / 8 {
            log::warn!(
                "Progress sidecar {:?} has wrong size, ignoring it",
                self.info.sidecar_path
            );
            return Ok(own_pieces);
        }

        let mut recorded = Bitfield::from_vec(bytes);
        recorded.truncate(piece_count);

        let mut cleared = 0;
        for piece_index in recorded.iter_ones() {
            let piece = self.read_piece(piece_index)?;
            let digest = Sha1::digest(&piece);
            if digest.as_slice() == self.piece_hashes[piece_index] {
                own_pieces.set(piece_index, true);
            } else {
                log::warn!(
                    "Sidecar piece {} does not verify, re-downloading it",
                    piece_index
                );
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.save_sidecar(own_pieces.as_raw_slice())?;
        }
        log::info!(
            "Resuming with {} of {} pieces verified on disk",
            own_pieces.count_ones(),
            piece_count
        );
        Ok(own_pieces)
    }

    /// Scatters a piece's bytes across the files it intersects, makes them
    /// durable and persists the given sidecar bitmap.
    fn write_piece(
        &self,
        piece_index: PieceIndex,
        data: &[u8],
        sidecar: &[u8],
    ) -> Result<()> {
        let piece_len = self.info.piece_len(piece_index)?;
        if data.len() != piece_len as usize {
            return Err(Error::InvalidBlockInfo);
        }

        let slices = self.info.block_slices(piece_index, 0, piece_len)?;
        let mut consumed = 0;
        for (file_index, slice) in &slices {
            let file = self.files[*file_index].lock().expect("file lock poisoned");
            file.write_all_at(
                &data[consumed..consumed + slice.len as usize],
                slice.offset,
            )?;
            consumed += slice.len as usize;
        }
        debug_assert_eq!(consumed, data.len());

        // make the piece durable before the sidecar claims it: after a
        // crash a set sidecar bit must imply verified bytes on disk
        for (file_index, _) in &slices {
            let file = self.files[*file_index].lock().expect("file lock poisoned");
            file.handle.sync_data()?;
        }
        self.save_sidecar(sidecar)
    }

    /// Reads a whole piece back from its file slices.
    fn read_piece(&self, piece_index: PieceIndex) -> Result<Vec<u8>> {
        let piece_len = self.info.piece_len(piece_index)?;
        let mut data = vec![0; piece_len as usize];

        let slices = self.info.block_slices(piece_index, 0, piece_len)?;
        let mut filled = 0;
        for (file_index, slice) in slices {
            let file = self.files[file_index].lock().expect("file lock poisoned");
            file.read_exact_at(
                &mut data[filled..filled + slice.len as usize],
                slice.offset,
            )?;
            filled += slice.len as usize;
        }
        debug_assert_eq!(filled, data.len());
        Ok(data)
    }

    /// Atomically replaces the progress sidecar: write a temporary next to
    /// it, sync, rename over.
    fn save_sidecar(&self, bitmap: &[u8]) -> Result<()> {
        let tmp_path = sidecar_tmp_path(&self.info.sidecar_path);
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bitmap)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.info.sidecar_path)?;
        Ok(())
    }
}

fn sidecar_tmp_path(sidecar_path: &Path) -> PathBuf {
    let mut os_string = sidecar_path.to_path_buf().into_os_string();
    os_string.push(".tmp");
    PathBuf::from(os_string)
}

struct TorrentFile {
    path: PathBuf,
    handle: File,
}

impl TorrentFile {
    /// Writes the whole buffer at the file offset. IO syscalls are not
    /// guaranteed to write the whole input in one go, so this loops until
    /// every byte is down or an error occurs.
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match pwrite(&self.handle, buf, offset as i64) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "pwrite returned zero",
                    )));
                }
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("File {:?} write error: {}", self.path, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Fills the whole buffer from the file offset, looping like
    /// `write_all_at`.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match pread(&self.handle, buf, offset as i64) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "pread hit end of file",
                    )));
                }
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("File {:?} read error: {}", self.path, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}
