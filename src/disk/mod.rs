//! The disk task: the only place where file IO happens.
//!
//! The rest of the engine talks to it over a command channel and hears back
//! over an alert channel, so no session or picker critical section ever
//! blocks on the file system.

mod io;

pub(crate) use io::{Disk, Storage};

use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    BlockInfo, PieceIndex,
};

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;
pub(crate) type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub(crate) type AlertSender = mpsc::UnboundedSender<Alert>;
pub(crate) type AlertReceiver = mpsc::UnboundedReceiver<Alert>;

/// The commands the disk task receives.
pub(crate) enum Command {
    /// Scatter a verified piece's bytes across its file slices and persist
    /// the updated progress bitmap.
    WritePiece {
        piece_index: PieceIndex,
        data: Vec<u8>,
    },
    /// Read a block of a verified piece for serving to a remote peer.
    ReadBlock {
        block: BlockInfo,
        result_chan: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// Drain and stop the disk task.
    Shutdown,
}

/// The notifications the disk task sends the swarm supervisor.
#[derive(Debug)]
pub(crate) enum Alert {
    /// A piece's bytes are on disk and the sidecar reflects it.
    PieceWritten { piece_index: PieceIndex },
    /// Every piece of the torrent is written: the download artefact is
    /// complete.
    DownloadComplete,
    /// A write failed twice; storage cannot be trusted and the torrent
    /// must shut down.
    Failure(Error),
}

/// A cheaply clonable handle used to send commands to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    pub fn new(chan: CommandSender) -> Self {
        Self(chan)
    }

    /// Queues a verified piece for writing. The disk task reports the
    /// outcome on the alert channel.
    pub fn write_piece(&self, piece_index: PieceIndex, data: Vec<u8>) -> Result<()> {
        self.0
            .send(Command::WritePiece { piece_index, data })
            .map_err(|_| Error::Channel)
    }

    /// Reads a block of an already verified piece, for serving Request
    /// messages.
    pub async fn read_block(&self, block: BlockInfo) -> Result<Vec<u8>> {
        let (result_chan, result_port) = oneshot::channel();
        self.0
            .send(Command::ReadBlock { block, result_chan })
            .map_err(|_| Error::Channel)?;
        result_port.await?
    }

    /// Asks the disk task to finish. Queued writes are drained first.
    pub fn shutdown(&self) {
        // the task being gone already achieves the same thing
        let _ = self.0.send(Command::Shutdown);
    }
}
