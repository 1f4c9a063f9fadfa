//! The error type shared by all parts of the engine.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by the engine and its parts.
///
/// Variants are a value-typed classification of the failure policies: most
/// are scoped to a single peer session (the session is torn down, the swarm
/// carries on), while descriptor, bind and storage errors abort the torrent.
#[derive(Debug)]
pub enum Error {
    /// The torrent descriptor failed validation. The torrent refuses to
    /// start.
    InvalidDescriptor(&'static str),
    /// A piece index was out of bounds for the torrent.
    InvalidPieceIndex,
    /// A block's offset or length doesn't fit its piece.
    InvalidBlockInfo,
    /// The remote peer broke the wire protocol (bad handshake, malformed
    /// frame, oversized frame, wrong-size bitfield). The session is dropped
    /// and the endpoint is put in cooloff.
    ProtocolViolation(&'static str),
    /// A completed piece did not hash to its expected digest. The session
    /// that served it is dropped.
    PieceHashMismatch,
    /// A peer-scoped wait expired (connect, handshake, unchoke, block). The
    /// parameter names the wait for logging.
    PeerTimeout(&'static str),
    /// The session accumulated too many consecutive download failures and is
    /// abandoned.
    TooManyFailures,
    /// The remote closed the connection.
    PeerDisconnected,
    /// A Piece frame carried no bytes. Useless and suspicious, so the
    /// session is dropped.
    EmptyBlock,
    /// The session's data-frame inbox overflowed, which means the peer is
    /// flooding us with blocks faster than we drain them.
    InboxFull,
    /// A piece write failed twice in a row. Storage is not trustworthy any
    /// more, so the torrent shuts down rather than continue silently.
    StorageFailure,
    /// An mpsc or oneshot endpoint was dropped, meaning the task on the other
    /// side is gone. Treated like a shutdown signal by sessions.
    Channel,
    /// An IO error, with the operation that produced it.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidDescriptor(what) => {
                write!(f, "invalid torrent descriptor: {}", what)
            }
            Error::InvalidPieceIndex => write!(f, "piece index out of bounds"),
            Error::InvalidBlockInfo => write!(f, "block out of piece bounds"),
            Error::ProtocolViolation(what) => {
                write!(f, "peer protocol violation: {}", what)
            }
            Error::PieceHashMismatch => write!(f, "piece hash mismatch"),
            Error::PeerTimeout(what) => write!(f, "peer timed out: {}", what),
            Error::TooManyFailures => {
                write!(f, "too many consecutive peer failures")
            }
            Error::PeerDisconnected => write!(f, "peer closed the connection"),
            Error::EmptyBlock => write!(f, "peer sent an empty block"),
            Error::InboxFull => write!(f, "session inbox overflow"),
            Error::StorageFailure => write!(f, "storage write failed twice"),
            Error::Channel => write!(f, "channel to a peer task closed"),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(e as i32))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Channel
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Channel
    }
}

impl Error {
    /// Whether the swarm should put the peer's endpoint in cooloff before
    /// re-dialling it.
    pub(crate) fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_) | Error::PieceHashMismatch)
    }
}
