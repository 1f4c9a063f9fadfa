// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod conf;
mod counter;
pub mod descriptor;
mod disk;
mod download;
pub mod engine;
pub mod error;
mod peer;
mod piece_picker;
pub mod storage_info;
mod torrent;

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;

/// The index of a piece within the torrent.
///
/// The wire carries piece indices as 4-byte big endian integers; in the
/// source we use `usize` like every other Rust index type and convert at the
/// codec boundary.
pub type PieceIndex = usize;

/// The index of a file within the torrent's file list.
pub type FileIndex = usize;

/// A 20 byte peer identifier, ours or a remote's. Opaque to the protocol.
pub type PeerId = [u8; 20];

/// A SHA-1 digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// Piece availability, one bit per piece index.
///
/// Packed MSB first to match the wire format of the bitfield message: bit 0
/// of byte 0 is piece 7, the highest bit of byte 0 is piece 0. A set bit
/// means the owner of the bitfield has that piece verified.
pub type Bitfield = BitVec<u8, Msb0>;

/// The origin of a peer endpoint.
///
/// Only used for bookkeeping: all peers are treated the same once connected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSource {
    /// The endpoint came from a tracker announce.
    Tracker,
    /// The endpoint was gossiped to us over ut_pex.
    Pex,
    /// The peer connected to our listening socket.
    Incoming,
}

/// The canonical 16 KiB transfer block. Every Request we send is this long,
/// except possibly the final block of a piece.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// One block of one piece: the unit of the Request and Piece messages, and
/// the granularity at which downloads make progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The piece this block belongs to.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset of the block within its piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}

/// Returns the length of the block at the given index within a piece of the
/// given length.
///
/// # Panics
///
/// Panics if the block index is past the end of the piece.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns how many blocks a piece of the given length comprises, counting
/// a trailing short block.
pub(crate) fn block_count(piece_len: u32) -> usize {
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
