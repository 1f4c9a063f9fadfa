//! Geometry of a torrent on disk: where each file lives, where each piece's
//! bytes land, and how a byte range of the logical download maps onto
//! per-file slices.

use std::{ops::Range, path::PathBuf};

use crate::{
    descriptor::Descriptor,
    error::{Error, Result},
    FileIndex, PieceIndex,
};

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's path relative to the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes. Zero-length files are permitted; they
    /// are created on disk but never contain piece bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the
    /// last bytes' offsets in the torrent. Empty for zero-length files.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_offset + self.len
    }

    /// Returns the slice in file that overlaps with the torrent byte range
    /// starting at the given offset, or `None` when the ranges don't
    /// overlap (which is always the case for zero-length files).
    pub(crate) fn get_slice(&self, torrent_offset: u64, len: u64) -> Option<FileSlice> {
        let range = self.byte_range();
        let start = torrent_offset.max(range.start);
        let end = (torrent_offset + len).min(range.end);
        if start >= end {
            return None;
        }
        Some(FileSlice {
            offset: start - self.torrent_offset,
            len: end - start,
        })
    }
}

/// Represents the location of a range of bytes within a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileSlice {
    /// The byte offset in file, relative to the file's start.
    pub offset: u64,
    /// The length of the slice, in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count
/// and length, download length, file layout, etc.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The directory the files are created in: the download directory
    /// itself for single file torrents, the download directory joined by
    /// the torrent's name for multi file torrents.
    pub download_dir: PathBuf,
    /// The progress sidecar: a packed bitmap of verified pieces living next
    /// to the download, at `<download_dir>/<name>.progress`.
    pub sidecar_path: PathBuf,
    /// The torrent's files with their precomputed torrent offsets.
    pub files: Vec<FileInfo>,
}

impl StorageInfo {
    /// Derives the on-disk layout from a validated descriptor.
    pub fn new(descriptor: &Descriptor, download_dir: impl Into<PathBuf>) -> Self {
        let download_dir = download_dir.into();
        let sidecar_path =
            download_dir.join(format!("{}.progress", descriptor.name));

        // a multi file torrent gets its own directory so its entries don't
        // scatter across the download directory
        let (download_dir, files) = if descriptor.is_multi_file() {
            let mut offset = 0;
            let files = descriptor
                .files
                .iter()
                .map(|f| {
                    let info = FileInfo {
                        path: f.path.clone(),
                        len: f.len,
                        torrent_offset: offset,
                    };
                    offset += f.len;
                    info
                })
                .collect();
            (download_dir.join(&descriptor.name), files)
        } else {
            let file = &descriptor.files[0];
            (
                download_dir,
                vec![FileInfo {
                    path: PathBuf::from(&descriptor.name),
                    len: file.len,
                    torrent_offset: 0,
                }],
            )
        };

        let piece_count = descriptor.piece_count();
        let download_len = descriptor.total_len();
        let piece_len = descriptor.piece_len;
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            sidecar_path,
            files,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            log::error!("Piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the piece's first byte offset in the torrent.
    pub(crate) fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Maps a byte range of the logical download onto the file slices that
    /// contain it, in file order. Zero-length files never appear in the
    /// result.
    ///
    /// The returned slice lengths sum to `len`, provided the range lies
    /// within the download.
    pub(crate) fn byte_range_slices(
        &self,
        torrent_offset: u64,
        len: u64,
    ) -> Vec<(FileIndex, FileSlice)> {
        let mut slices = Vec::new();
        for (index, file) in self.files.iter().enumerate() {
            // files are laid out in offset order, so once past the range's
            // end nothing else can intersect
            if file.torrent_offset >= torrent_offset + len {
                break;
            }
            if let Some(slice) = file.get_slice(torrent_offset, len) {
                slices.push((index, slice));
            }
        }
        slices
    }

    /// Maps a block range of a piece onto file slices.
    pub(crate) fn block_slices(
        &self,
        index: PieceIndex,
        offset: u32,
        len: u32,
    ) -> Result<Vec<(FileIndex, FileSlice)>> {
        let piece_len = self.piece_len(index)?;
        let in_bounds = offset
            .checked_add(len)
            .map_or(false, |end| end <= piece_len);
        if len == 0 || !in_bounds {
            return Err(Error::InvalidBlockInfo);
        }
        Ok(self.byte_range_slices(
            self.piece_offset(index) + offset as u64,
            len as u64,
        ))
    }

    /// The absolute path of the file at the given index.
    pub(crate) fn file_path(&self, index: FileIndex) -> PathBuf {
        self.download_dir.join(&self.files[index].path)
    }
}
