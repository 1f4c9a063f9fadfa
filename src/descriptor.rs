//! The torrent descriptor record handed to the engine.
//!
//! Decoding .torrent metafiles is not this crate's job: whatever parses the
//! bencoded metainfo is expected to construct a [`Descriptor`] and pass it to
//! the engine. The descriptor is validated once at startup and is immutable
//! afterwards.

use std::path::{Component, PathBuf};

use crate::{
    error::{Error, Result},
    Sha1Hash,
};

/// A file entry of the torrent: its path relative to the download root and
/// its length in bytes. Zero-length files are allowed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub len: u64,
}

/// The immutable description of a torrent, as extracted from its metainfo.
#[derive(Clone, Debug)]
pub struct Descriptor {
    /// The name of the torrent: the output file name for single file
    /// torrents, the output directory name otherwise.
    pub name: String,
    /// The SHA-1 hash of the torrent's bencoded info dictionary, identifying
    /// the swarm in every handshake.
    pub info_hash: Sha1Hash,
    /// The nominal piece length. The last piece may be shorter.
    pub piece_len: u32,
    /// One expected SHA-1 digest per piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The torrent's files in on-wire order. A single entry means a single
    /// file torrent.
    pub files: Vec<FileEntry>,
}

impl Descriptor {
    /// The total length of the download, in bytes.
    pub fn total_len(&self) -> u64 {
        self.files.iter().map(|f| f.len).sum()
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        let piece_len = self.piece_len as u64;
        ((self.total_len() + piece_len - 1) / piece_len) as usize
    }

    /// Whether the torrent is a directory of files rather than a single
    /// file.
    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    /// Checks the descriptor's internal consistency.
    ///
    /// A descriptor that fails any of these checks cannot be downloaded
    /// correctly, so the engine refuses to start rather than guess at
    /// repaired values.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidDescriptor("empty name"));
        }
        // the name becomes a path component of the download directory
        let name_path = PathBuf::from(&self.name);
        let mut components = name_path.components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(Error::InvalidDescriptor("name is not a plain file name")),
        }

        if self.piece_len == 0 {
            return Err(Error::InvalidDescriptor("zero piece length"));
        }
        if self.files.is_empty() {
            return Err(Error::InvalidDescriptor("no files"));
        }
        for file in &self.files {
            if file.path.as_os_str().is_empty() {
                return Err(Error::InvalidDescriptor("empty file path"));
            }
            if !file
                .path
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(Error::InvalidDescriptor(
                    "file path escapes the download directory",
                ));
            }
        }

        let total_len = self.total_len();
        if total_len == 0 {
            return Err(Error::InvalidDescriptor("zero length download"));
        }
        if self.piece_hashes.is_empty() {
            return Err(Error::InvalidDescriptor("no piece hashes"));
        }
        if self.piece_count() != self.piece_hashes.len() {
            return Err(Error::InvalidDescriptor(
                "piece hash count doesn't match the download length",
            ));
        }
        // follows from the count check, but it's the invariant the rest of
        // the engine builds on, so assert it explicitly
        let last_piece_len =
            total_len - (self.piece_count() as u64 - 1) * self.piece_len as u64;
        if last_piece_len == 0 || last_piece_len > self.piece_len as u64 {
            return Err(Error::InvalidDescriptor("invalid last piece length"));
        }

        Ok(())
    }
}
