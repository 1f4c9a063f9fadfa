//! In-memory assembly of a single piece from its blocks.

use crate::{
    block_count,
    error::{Error, Result},
    Bitfield, BlockInfo, PieceIndex, BLOCK_LEN,
};

/// The write buffer of one in-progress piece.
///
/// Blocks may arrive out of order and may overlap; a write is recorded at
/// block granularity, so a range marks every block slot it wholly covers.
/// Since all traffic is made of 16 KiB blocks (with a possibly shorter final
/// block), full coverage of the slots is equivalent to full coverage of the
/// piece's bytes.
#[derive(Debug)]
pub(crate) struct PieceBuffer {
    /// The piece's bytes, allocated up front to the piece's exact length.
    data: Vec<u8>,
    /// One bit per block slot, set when the slot's bytes have been written.
    received: Bitfield,
}

impl PieceBuffer {
    pub fn new(piece_len: u32) -> Self {
        debug_assert!(piece_len > 0);
        Self {
            data: vec![0; piece_len as usize],
            received: Bitfield::repeat(false, block_count(piece_len)),
        }
    }

    /// Copies a block's bytes into the buffer and records the covered block
    /// slots. Re-delivering a range is idempotent.
    ///
    /// Fails if the range doesn't fit the piece.
    pub fn add_block(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let offset = offset as usize;
        let end = offset
            .checked_add(bytes.len())
            .ok_or(Error::InvalidBlockInfo)?;
        if bytes.is_empty() || end > self.data.len() {
            return Err(Error::InvalidBlockInfo);
        }

        self.data[offset..end].copy_from_slice(bytes);

        // mark every block slot wholly contained in the written range
        let block_len = BLOCK_LEN as usize;
        let first_slot = (offset + block_len - 1) / block_len;
        for slot in first_slot..self.received.len() {
            let slot_start = slot * block_len;
            let slot_end = (slot_start + block_len).min(self.data.len());
            if slot_end > end {
                break;
            }
            self.received.set(slot, true);
        }
        Ok(())
    }

    /// True once every byte of the piece has been covered by a write.
    pub fn is_complete(&self) -> bool {
        self.received.all()
    }

    /// Consumes the buffer, yielding the assembled piece.
    pub fn into_bytes(self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        self.data
    }
}

/// Iterates the blocks of a piece in offset order, yielding the
/// `(piece, offset, len)` triples the request pipeline sends out.
pub(crate) fn piece_blocks(
    piece_index: PieceIndex,
    piece_len: u32,
) -> impl Iterator<Item = BlockInfo> {
    (0..block_count(piece_len)).map(move |index| BlockInfo {
        piece_index,
        offset: index as u32 * BLOCK_LEN,
        len: crate::block_len(piece_len, index),
    })
}
