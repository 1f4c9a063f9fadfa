//! The piece arbiter: the single serialisation point for piece ownership.
//!
//! Every peer session shares one `PiecePicker` behind an `RwLock`. The picker
//! decides which piece a session downloads next, enforces that a piece is
//! claimed by at most one session at a time, verifies completed pieces
//! against their expected hashes and hands verified data to the disk task.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use rand::{distributions::WeightedIndex, prelude::*};
use sha1::{Digest, Sha1};

use crate::{
    disk::DiskHandle,
    download::PieceBuffer,
    error::{Error, Result},
    storage_info::StorageInfo,
    Bitfield, PieceIndex, Sha1Hash,
};

/// Per-failure decay of a piece's selection weight. A piece that keeps
/// failing (bad hashes, expired claims) is still retried, just exponentially
/// less eagerly than clean pieces.
const FAILURE_WEIGHT_BASE: f64 = 0.8;

/// The outcome of feeding one received block to the arbiter.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeliveryResult {
    /// The block was absorbed; the piece is still incomplete.
    Accepted,
    /// The block completed its piece and the piece hash checked out. The
    /// assembled data is on its way to disk.
    Verified,
    /// The block completed its piece but the hash did not match. The piece
    /// is back in the pool; whoever served it should be dropped.
    HashFailed,
}

/// The download state of one piece.
enum PieceState {
    /// No session is working on the piece.
    Missing,
    /// Claimed by a single session, which assembles the piece in `buffer`.
    Busy {
        since: Instant,
        owner: SocketAddr,
        buffer: PieceBuffer,
    },
    /// Downloaded and hash-verified. Never leaves this state.
    Verified,
}

struct Piece {
    state: PieceState,
    /// How many times the piece failed verification or had its claim
    /// expire. Drives the selection weight decay.
    failed_attempts: u32,
}

pub(crate) struct PiecePicker {
    pieces: Vec<Piece>,
    /// One bit per piece, set iff Verified. Mirrors `pieces` at all times.
    own_pieces: Bitfield,
    piece_hashes: Vec<Sha1Hash>,
    /// Each piece's exact length, precomputed from the storage geometry.
    piece_lens: Vec<u32>,
    disk: DiskHandle,
    max_claim_age: Duration,
    rng: StdRng,
}

impl PiecePicker {
    /// Creates a picker seeded with the pieces already verified on disk by
    /// the startup scan.
    pub fn new(
        info: &StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        own_pieces: Bitfield,
        disk: DiskHandle,
        max_claim_age: Duration,
    ) -> Self {
        debug_assert_eq!(own_pieces.len(), info.piece_count);
        debug_assert_eq!(piece_hashes.len(), info.piece_count);

        let pieces: Vec<_> = (0..info.piece_count)
            .map(|index| Piece {
                state: if own_pieces[index] {
                    PieceState::Verified
                } else {
                    PieceState::Missing
                },
                failed_attempts: 0,
            })
            .collect();
        let piece_lens = (0..info.piece_count)
            .map(|index| info.piece_len(index).expect("piece index in range"))
            .collect();

        Self {
            pieces,
            own_pieces,
            piece_hashes,
            piece_lens,
            disk,
            max_claim_age,
            rng: StdRng::from_entropy(),
        }
    }

    /// Like [`PiecePicker::new`], but with a deterministic tie-break.
    #[cfg(test)]
    pub fn with_seed(
        info: &StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        own_pieces: Bitfield,
        disk: DiskHandle,
        max_claim_age: Duration,
        seed: u64,
    ) -> Self {
        let mut picker =
            Self::new(info, piece_hashes, own_pieces, disk, max_claim_age);
        picker.rng = StdRng::seed_from_u64(seed);
        picker
    }

    /// Picks the next piece for the session at `owner` to download and
    /// claims it.
    ///
    /// Eligible pieces are Missing and available at the peer; when the
    /// peer's bitfield is not yet known, every Missing piece is eligible.
    /// Among the eligible, the draw is weighted-random with weight
    /// `0.8^failed_attempts`, so repeatedly failing pieces back off without
    /// ever becoming unselectable.
    ///
    /// When nothing is eligible, expired claims are swept and the draw is
    /// retried once, so a stuck claim cannot starve the swarm.
    pub fn pick_piece(
        &mut self,
        peer_pieces: Option<&Bitfield>,
        owner: SocketAddr,
    ) -> Option<PieceIndex> {
        let mut candidates = self.eligible_pieces(peer_pieces);
        if candidates.is_empty() {
            if self.sweep_expired(Instant::now()) == 0 {
                return None;
            }
            candidates = self.eligible_pieces(peer_pieces);
            if candidates.is_empty() {
                return None;
            }
        }

        let weights: Vec<f64> = candidates
            .iter()
            .map(|index| {
                FAILURE_WEIGHT_BASE.powi(self.pieces[*index].failed_attempts as i32)
            })
            .collect();
        // all weights are positive powers of 0.8 and the set is non-empty,
        // so the distribution is always constructible
        let distribution =
            WeightedIndex::new(&weights).expect("non-empty positive weights");
        let index = candidates[distribution.sample(&mut self.rng)];

        log::debug!("Picked piece {} for {}", index, owner);
        self.pieces[index].state = PieceState::Busy {
            since: Instant::now(),
            owner,
            buffer: PieceBuffer::new(self.piece_lens[index]),
        };
        Some(index)
    }

    fn eligible_pieces(&self, peer_pieces: Option<&Bitfield>) -> Vec<PieceIndex> {
        (0..self.pieces.len())
            .filter(|index| {
                matches!(self.pieces[*index].state, PieceState::Missing)
                    && peer_pieces
                        .map_or(true, |pieces| pieces.get(*index).map_or(false, |b| *b))
            })
            .collect()
    }

    /// Feeds one received block to the piece claimed by `owner`.
    ///
    /// Blocks for pieces the session no longer owns (e.g. after a claim
    /// sweep) are dropped silently, as the piece may already be claimed by
    /// someone else.
    pub fn deliver_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: &[u8],
        owner: SocketAddr,
    ) -> Result<DeliveryResult> {
        let piece = self
            .pieces
            .get_mut(piece_index)
            .ok_or(Error::InvalidPieceIndex)?;

        let buffer = match &mut piece.state {
            PieceState::Busy { owner: claimant, buffer, .. } if *claimant == owner => {
                buffer
            }
            _ => {
                log::warn!(
                    "Dropping block for piece {} not claimed by {}",
                    piece_index,
                    owner
                );
                return Ok(DeliveryResult::Accepted);
            }
        };

        buffer.add_block(offset, data)?;
        if !buffer.is_complete() {
            return Ok(DeliveryResult::Accepted);
        }

        // swap the claim out so the buffer can be consumed
        let state = std::mem::replace(&mut piece.state, PieceState::Missing);
        let buffer = match state {
            PieceState::Busy { buffer, .. } => buffer,
            _ => unreachable!("claim checked above"),
        };
        let bytes = buffer.into_bytes();

        let digest = Sha1::digest(&bytes);
        if digest.as_slice() != self.piece_hashes[piece_index] {
            log::warn!(
                "Piece {} hash mismatch (served by {})",
                piece_index,
                owner
            );
            piece.failed_attempts += 1;
            return Ok(DeliveryResult::HashFailed);
        }

        log::info!("Piece {} verified", piece_index);
        piece.state = PieceState::Verified;
        self.own_pieces.set(piece_index, true);
        self.disk.write_piece(piece_index, bytes)?;
        Ok(DeliveryResult::Verified)
    }

    /// Releases `owner`'s claim. With `success == false` (abandoned
    /// download, dying session) the piece returns to the pool with a
    /// failure tick.
    ///
    /// Only the claim owner can release: a session whose claim was already
    /// swept and handed to someone else must not yank it from the new
    /// owner.
    pub fn release(&mut self, piece_index: PieceIndex, owner: SocketAddr, success: bool) {
        let piece = match self.pieces.get_mut(piece_index) {
            Some(piece) => piece,
            None => return,
        };
        match &piece.state {
            PieceState::Busy { owner: claimant, .. } if *claimant == owner => {}
            _ => return,
        }
        if !success {
            piece.state = PieceState::Missing;
            piece.failed_attempts += 1;
            log::debug!("Released piece {} back into the pool", piece_index);
        }
    }

    /// Releases every claim older than the max claim age as a failure and
    /// returns how many were released. Stuck sessions thus cannot pin a
    /// piece forever.
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let mut released = 0;
        for (index, piece) in self.pieces.iter_mut().enumerate() {
            if let PieceState::Busy { since, owner, .. } = &piece.state {
                if now.duration_since(*since) > self.max_claim_age {
                    log::info!(
                        "Sweeping piece {} claim held too long by {}",
                        index,
                        owner
                    );
                    piece.state = PieceState::Missing;
                    piece.failed_attempts += 1;
                    released += 1;
                }
            }
        }
        released
    }

    /// The pieces we have verified, one bit per piece.
    pub fn own_pieces(&self) -> &Bitfield {
        &self.own_pieces
    }

    /// True once every piece is verified.
    pub fn is_complete(&self) -> bool {
        self.own_pieces.all()
    }

    /// Whether the peer owns pieces that we are still missing; drives the
    /// interested flag.
    pub fn is_interested_in(&self, peer_pieces: &Bitfield) -> bool {
        peer_pieces
            .iter_ones()
            .any(|index| index < self.pieces.len() && !self.own_pieces[index])
    }

    #[cfg(test)]
    fn failed_attempts(&self, piece_index: PieceIndex) -> u32 {
        self.pieces[piece_index].failed_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Descriptor, FileEntry};
    use crate::BLOCK_LEN;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn test_picker(piece_count: usize) -> (PiecePicker, crate::disk::CommandReceiver) {
        let piece_len = BLOCK_LEN;
        let descriptor = Descriptor {
            name: "picker-test".to_string(),
            info_hash: [7; 20],
            piece_len,
            piece_hashes: (0..piece_count)
                .map(|index| {
                    Sha1::digest(&piece_bytes(index, piece_len)).into()
                })
                .collect(),
            files: vec![FileEntry {
                path: PathBuf::from("picker-test"),
                len: piece_count as u64 * piece_len as u64,
            }],
        };
        let info = StorageInfo::new(&descriptor, "/tmp");
        let (chan, port) = tokio::sync::mpsc::unbounded_channel();
        let picker = PiecePicker::with_seed(
            &info,
            descriptor.piece_hashes.clone(),
            Bitfield::repeat(false, piece_count),
            DiskHandle::new(chan),
            Duration::from_secs(120),
            42,
        );
        (picker, port)
    }

    fn piece_bytes(index: usize, piece_len: u32) -> Vec<u8> {
        vec![index as u8; piece_len as usize]
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_claims_are_exclusive() {
        let (mut picker, _port) = test_picker(2);
        let first = picker.pick_piece(None, addr(1)).unwrap();
        let second = picker.pick_piece(None, addr(2)).unwrap();
        assert_ne!(first, second);
        assert_eq!(picker.pick_piece(None, addr(3)), None);
    }

    #[test]
    fn test_peer_bitfield_constrains_choice() {
        let (mut picker, _port) = test_picker(4);
        let mut peer_pieces = Bitfield::repeat(false, 4);
        peer_pieces.set(2, true);
        assert_eq!(picker.pick_piece(Some(&peer_pieces), addr(1)), Some(2));
        assert_eq!(picker.pick_piece(Some(&peer_pieces), addr(2)), None);
    }

    #[test]
    fn test_verified_delivery() {
        let (mut picker, mut port) = test_picker(1);
        let owner = addr(1);
        let piece = picker.pick_piece(None, owner).unwrap();

        let bytes = piece_bytes(piece, BLOCK_LEN);
        let result = picker.deliver_block(piece, 0, &bytes, owner).unwrap();
        assert_eq!(result, DeliveryResult::Verified);
        assert!(picker.is_complete());
        assert!(picker.own_pieces()[piece]);

        // the assembled data went to the disk channel
        match port.try_recv().unwrap() {
            crate::disk::Command::WritePiece { piece_index, data } => {
                assert_eq!(piece_index, piece);
                assert_eq!(data, bytes);
            }
            _ => panic!("expected a piece write"),
        }
    }

    #[test]
    fn test_hash_failure_returns_piece_to_pool() {
        let (mut picker, mut port) = test_picker(1);
        let owner = addr(1);
        let piece = picker.pick_piece(None, owner).unwrap();

        let bad = vec![0xee; BLOCK_LEN as usize];
        let result = picker.deliver_block(piece, 0, &bad, owner).unwrap();
        assert_eq!(result, DeliveryResult::HashFailed);
        assert_eq!(picker.failed_attempts(piece), 1);
        assert!(!picker.is_complete());
        assert!(port.try_recv().is_err());

        // the piece is selectable again and a correct delivery verifies
        let piece = picker.pick_piece(None, owner).unwrap();
        let result = picker
            .deliver_block(piece, 0, &piece_bytes(piece, BLOCK_LEN), owner)
            .unwrap();
        assert_eq!(result, DeliveryResult::Verified);
    }

    #[test]
    fn test_foreign_blocks_are_dropped() {
        let (mut picker, mut port) = test_picker(1);
        let piece = picker.pick_piece(None, addr(1)).unwrap();

        // a session that doesn't own the claim cannot complete the piece
        let result = picker
            .deliver_block(piece, 0, &piece_bytes(piece, BLOCK_LEN), addr(2))
            .unwrap();
        assert_eq!(result, DeliveryResult::Accepted);
        assert!(!picker.is_complete());
        assert!(port.try_recv().is_err());
    }

    #[test]
    fn test_release_failure_bumps_attempts() {
        let (mut picker, _port) = test_picker(1);
        let piece = picker.pick_piece(None, addr(1)).unwrap();
        picker.release(piece, addr(1), false);
        assert_eq!(picker.failed_attempts(piece), 1);
        // selectable again
        assert_eq!(picker.pick_piece(None, addr(2)), Some(piece));
    }

    #[test]
    fn test_only_the_owner_can_release() {
        let (mut picker, _port) = test_picker(1);
        let piece = picker.pick_piece(None, addr(1)).unwrap();

        // a stranger's release leaves the claim alone
        picker.release(piece, addr(2), false);
        assert_eq!(picker.failed_attempts(piece), 0);
        assert_eq!(picker.pick_piece(None, addr(2)), None);

        picker.release(piece, addr(1), false);
        assert_eq!(picker.pick_piece(None, addr(2)), Some(piece));
    }

    #[test]
    fn test_sweep_releases_stale_claims() {
        let (mut picker, _port) = test_picker(1);
        let piece = picker.pick_piece(None, addr(1)).unwrap();

        // young claims survive a sweep
        assert_eq!(picker.sweep_expired(Instant::now()), 0);

        let late = Instant::now() + Duration::from_secs(121);
        assert_eq!(picker.sweep_expired(late), 1);
        assert_eq!(picker.failed_attempts(piece), 1);
        assert_eq!(picker.pick_piece(None, addr(2)), Some(piece));
    }

    #[test]
    fn test_failed_pieces_back_off() {
        let (mut picker, _port) = test_picker(2);
        // fail piece 0 many times
        for _ in 0..8 {
            let mut only_zero = Bitfield::repeat(false, 2);
            only_zero.set(0, true);
            let piece = picker.pick_piece(Some(&only_zero), addr(1)).unwrap();
            assert_eq!(piece, 0);
            picker.release(piece, addr(1), false);
        }

        // with both pieces on offer, the clean piece wins most draws
        let mut zero_wins = 0;
        for _ in 0..100 {
            let piece = picker.pick_piece(None, addr(1)).unwrap();
            if piece == 0 {
                zero_wins += 1;
            }
            // put it back without a failure tick
            picker.pieces[piece].state = PieceState::Missing;
        }
        assert!(zero_wins < 50, "failing piece won {} of 100 draws", zero_wins);
    }

    #[test]
    fn test_interest() {
        let (mut picker, _port) = test_picker(2);
        let mut peer_pieces = Bitfield::repeat(false, 2);
        assert!(!picker.is_interested_in(&peer_pieces));
        peer_pieces.set(1, true);
        assert!(picker.is_interested_in(&peer_pieces));

        // once we verify piece 1, the peer has nothing for us
        let piece = picker.pick_piece(Some(&peer_pieces), addr(1)).unwrap();
        picker
            .deliver_block(piece, 0, &piece_bytes(piece, BLOCK_LEN), addr(1))
            .unwrap();
        assert!(!picker.is_interested_in(&peer_pieces));
    }
}
