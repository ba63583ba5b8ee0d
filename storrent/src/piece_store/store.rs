use std::collections::{BTreeMap, HashSet};
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex, MutexGuard,
};

use sha1::{Digest, Sha1};
use tracing::warn;

use crate::torrent_parser::torrent::Torrent;
use crate::BLOCK_SIZE;

/// Outcome of a `try_finalize` call.
#[derive(Debug, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// All blocks present and the SHA-1 matched; the piece is now verified.
    Verified,
    /// All blocks present but the SHA-1 did not match; block state was reset.
    Mismatch,
    /// Not all blocks received yet.
    Incomplete,
    /// The piece had already been verified; nothing was done.
    AlreadyVerified,
}

/// Posible `PieceStore` errors.
#[derive(Debug)]
pub enum PieceStoreError {
    PoisonedLock,
    InvalidDigestCount,
}

/// Per-piece block state. Block buffers are keyed by offset so assembly
/// walks them in order; they only exist while the piece is unverified.
#[derive(Debug, Default)]
struct PieceState {
    requested: HashSet<u32>,
    received: BTreeMap<u32, Vec<u8>>,
    verified: bool,
}

/// Block bookkeeping and SHA-1 verification for every piece of the torrent.
///
/// One store is shared by all peer sessions; a single lock serializes block
/// delivery and finalization. The verified flag of a piece flips false to
/// true exactly once and never back.
#[derive(Debug)]
pub struct PieceStore {
    pieces: Mutex<Vec<PieceState>>,
    digests: Vec<[u8; 20]>,
    piece_length: u32,
    total_length: u64,
    total_pieces: u32,
    verified_count: AtomicUsize,
    verified_bytes: AtomicU64,
}

impl PieceStore {
    pub fn new(torrent: &Torrent) -> Result<Self, PieceStoreError> {
        let total_pieces = torrent.total_pieces();

        if torrent.info.pieces.len() != total_pieces as usize * 20 {
            return Err(PieceStoreError::InvalidDigestCount);
        }
        let digests = torrent
            .info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut digest = [0u8; 20];
                digest.copy_from_slice(chunk);
                digest
            })
            .collect();

        let mut pieces = Vec::with_capacity(total_pieces as usize);
        pieces.resize_with(total_pieces as usize, PieceState::default);

        Ok(Self {
            pieces: Mutex::new(pieces),
            digests,
            piece_length: torrent.piece_length(),
            total_length: torrent.total_length(),
            total_pieces,
            verified_count: AtomicUsize::new(0),
            verified_bytes: AtomicU64::new(0),
        })
    }

    /// Returns the size in bytes of the given piece.
    pub fn piece_size(&self, piece: u32) -> u32 {
        if piece + 1 == self.total_pieces {
            let remainder = (self.total_length % self.piece_length as u64) as u32;
            if remainder != 0 {
                return remainder;
            }
        }
        self.piece_length
    }

    /// Returns how many blocks the given piece splits into.
    pub fn block_count(&self, piece: u32) -> u32 {
        (self.piece_size(piece) + BLOCK_SIZE - 1) / BLOCK_SIZE
    }

    /// Returns the length of the block starting at `offset` within `piece`.
    pub fn block_size(&self, piece: u32, offset: u32) -> u32 {
        (self.piece_size(piece) - offset).min(BLOCK_SIZE)
    }

    pub fn total_pieces(&self) -> u32 {
        self.total_pieces
    }

    /// True iff the piece is not yet verified and the block at `offset` has
    /// not been received.
    pub fn needed(&self, piece: u32, offset: u32) -> Result<bool, PieceStoreError> {
        let pieces = self.lock_pieces()?;
        Ok(match pieces.get(piece as usize) {
            Some(state) => !state.verified && !state.received.contains_key(&offset),
            None => false,
        })
    }

    /// Marks a block as requested. Idempotent; out-of-range indices are
    /// ignored.
    pub fn add_requested(&self, piece: u32, offset: u32) -> Result<(), PieceStoreError> {
        let mut pieces = self.lock_pieces()?;
        if let Some(state) = pieces.get_mut(piece as usize) {
            if !state.verified {
                state.requested.insert(offset);
            }
        }
        Ok(())
    }

    /// Clears a block's requested mark. Idempotent.
    pub fn remove_requested(&self, piece: u32, offset: u32) -> Result<(), PieceStoreError> {
        let mut pieces = self.lock_pieces()?;
        if let Some(state) = pieces.get_mut(piece as usize) {
            state.requested.remove(&offset);
        }
        Ok(())
    }

    /// Stores a received block. Returns false without storing anything for
    /// duplicates, verified pieces, and blocks whose offset or length does
    /// not match the descriptor; the first delivery of a block always wins.
    pub fn add_received(
        &self,
        piece: u32,
        offset: u32,
        block: &[u8],
    ) -> Result<bool, PieceStoreError> {
        if piece >= self.total_pieces
            || offset % BLOCK_SIZE != 0
            || offset >= self.piece_size(piece)
            || block.len() as u32 != self.block_size(piece, offset)
        {
            return Ok(false);
        }

        let mut pieces = self.lock_pieces()?;
        let state = match pieces.get_mut(piece as usize) {
            Some(state) => state,
            None => return Ok(false),
        };
        if state.verified || state.received.contains_key(&offset) {
            return Ok(false);
        }

        state.received.insert(offset, block.to_vec());
        Ok(true)
    }

    /// Assembles and hash-checks the piece once every block is present.
    ///
    /// On a match the piece becomes verified and its block buffers are
    /// released; the caller must then (and only then) advertise the piece.
    /// On a mismatch all requested/received state for the piece is reset so
    /// the blocks flow through the normal request path again.
    pub fn try_finalize(&self, piece: u32) -> Result<FinalizeOutcome, PieceStoreError> {
        let mut pieces = self.lock_pieces()?;
        let state = match pieces.get_mut(piece as usize) {
            Some(state) => state,
            None => return Ok(FinalizeOutcome::Incomplete),
        };

        if state.verified {
            return Ok(FinalizeOutcome::AlreadyVerified);
        }
        if state.received.len() as u32 != self.block_count(piece) {
            return Ok(FinalizeOutcome::Incomplete);
        }

        let mut hasher = Sha1::new();
        for block in state.received.values() {
            hasher.update(block);
        }
        let digest = hasher.finalize();

        if digest.as_slice() == self.digests[piece as usize] {
            state.verified = true;
            state.received.clear();
            state.requested.clear();
            self.verified_count.fetch_add(1, Ordering::Relaxed);
            self.verified_bytes
                .fetch_add(self.piece_size(piece) as u64, Ordering::Relaxed);
            Ok(FinalizeOutcome::Verified)
        } else {
            warn!("piece {} failed hash check, resetting its blocks", piece);
            state.received.clear();
            state.requested.clear();
            Ok(FinalizeOutcome::Mismatch)
        }
    }

    pub fn is_verified(&self, piece: u32) -> Result<bool, PieceStoreError> {
        let pieces = self.lock_pieces()?;
        Ok(pieces
            .get(piece as usize)
            .map(|state| state.verified)
            .unwrap_or(false))
    }

    /// True iff every piece is verified.
    pub fn is_done(&self) -> bool {
        self.verified_count.load(Ordering::Relaxed) == self.total_pieces as usize
    }

    pub fn verified_count(&self) -> usize {
        self.verified_count.load(Ordering::Relaxed)
    }

    /// Bytes of payload already verified.
    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes.load(Ordering::Relaxed)
    }

    /// Share of the payload already verified, in percent.
    pub fn progress_pct(&self) -> f64 {
        if self.total_length == 0 {
            return 100.0;
        }
        self.verified_bytes.load(Ordering::Relaxed) as f64 * 100.0 / self.total_length as f64
    }

    /// Our bitfield: bit `piece` set iff verified, MSB-first.
    pub fn bitfield(&self) -> Result<Vec<u8>, PieceStoreError> {
        let pieces = self.lock_pieces()?;
        let mut bytes = vec![0u8; (self.total_pieces as usize + 7) / 8];
        for (index, state) in pieces.iter().enumerate() {
            if state.verified {
                bytes[index / 8] |= 1 << (7 - (index % 8));
            }
        }
        Ok(bytes)
    }

    fn lock_pieces(&self) -> Result<MutexGuard<Vec<PieceState>>, PieceStoreError> {
        self.pieces
            .lock()
            .map_err(|_| PieceStoreError::PoisonedLock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_parser::info::Info;

    #[test]
    fn test_single_block_piece_verifies() {
        let data = vec![7u8; 16384];
        let store = create_store(&[&data[..]]);

        assert!(store.needed(0, 0).unwrap());
        assert!(store.add_received(0, 0, &data).unwrap());
        assert_eq!(store.try_finalize(0).unwrap(), FinalizeOutcome::Verified);
        assert!(store.is_done());
        assert_eq!(store.bitfield().unwrap(), vec![0x80]);
        assert!(!store.needed(0, 0).unwrap());
    }

    #[test]
    fn test_finalize_incomplete() {
        let data = vec![1u8; 32768];
        let store = create_store(&[&data[..]]);

        assert!(store.add_received(0, 0, &data[..16384]).unwrap());
        assert_eq!(store.try_finalize(0).unwrap(), FinalizeOutcome::Incomplete);
    }

    #[test]
    fn test_corruption_resets_piece() {
        let data = vec![3u8; 32768];
        let store = create_store(&[&data[..]]);

        assert!(store.add_received(0, 0, &data[..16384]).unwrap());
        assert!(store.add_received(0, 16384, &vec![9u8; 16384]).unwrap());
        assert_eq!(store.try_finalize(0).unwrap(), FinalizeOutcome::Mismatch);

        // both blocks needed again after the reset
        assert!(store.needed(0, 0).unwrap());
        assert!(store.needed(0, 16384).unwrap());
        assert_eq!(store.bitfield().unwrap(), vec![0x00]);

        // the retry with correct bytes verifies
        assert!(store.add_received(0, 0, &data[..16384]).unwrap());
        assert!(store.add_received(0, 16384, &data[16384..]).unwrap());
        assert_eq!(store.try_finalize(0).unwrap(), FinalizeOutcome::Verified);
    }

    #[test]
    fn test_finalize_is_idempotent_after_verify() {
        let data = vec![7u8; 16384];
        let store = create_store(&[&data[..]]);

        store.add_received(0, 0, &data).unwrap();
        assert_eq!(store.try_finalize(0).unwrap(), FinalizeOutcome::Verified);
        assert_eq!(
            store.try_finalize(0).unwrap(),
            FinalizeOutcome::AlreadyVerified
        );
        assert_eq!(store.verified_count(), 1);
    }

    #[test]
    fn test_duplicate_block_keeps_first_bytes() {
        let data = vec![5u8; 16384];
        let store = create_store(&[&data[..]]);

        assert!(store.add_received(0, 0, &data).unwrap());
        assert!(!store.add_received(0, 0, &vec![0u8; 16384]).unwrap());
        // first bytes won: the piece still verifies against the digest of `data`
        assert_eq!(store.try_finalize(0).unwrap(), FinalizeOutcome::Verified);
    }

    #[test]
    fn test_rejects_wrong_length_block() {
        let data = vec![5u8; 16384];
        let store = create_store(&[&data[..]]);

        assert!(!store.add_received(0, 0, &data[..100]).unwrap());
        assert!(store.needed(0, 0).unwrap());
    }

    #[test]
    fn test_rejects_out_of_range() {
        let data = vec![5u8; 16384];
        let store = create_store(&[&data[..]]);

        assert!(!store.add_received(1, 0, &data).unwrap());
        assert!(!store.add_received(0, 16384, &data).unwrap());
        assert!(!store.needed(1, 0).unwrap());
    }

    #[test]
    fn test_requested_marks_are_idempotent() {
        let data = vec![5u8; 16384];
        let store = create_store(&[&data[..]]);

        store.add_requested(0, 0).unwrap();
        store.add_requested(0, 0).unwrap();
        store.remove_requested(0, 0).unwrap();
        store.remove_requested(0, 0).unwrap();
        // out of range is a no-op
        store.add_requested(9, 0).unwrap();
    }

    #[test]
    fn test_last_piece_and_block_sizes() {
        // 40000 bytes in 16384-byte pieces: pieces of 16384, 16384, 7232
        let store = create_store_with_sizes(40000, 16384, 3);
        assert_eq!(store.piece_size(0), 16384);
        assert_eq!(store.piece_size(2), 7232);
        assert_eq!(store.block_count(2), 1);
        assert_eq!(store.block_size(2, 0), 7232);

        // 40000 bytes in 32768-byte pieces: last piece 7232
        let store = create_store_with_sizes(40000, 32768, 2);
        assert_eq!(store.block_count(0), 2);
        assert_eq!(store.block_size(0, 16384), 16384);
        assert_eq!(store.block_count(1), 1);
    }

    #[test]
    fn test_progress_pct() {
        let data = vec![7u8; 16384];
        let store = create_store(&[&data[..]]);
        assert_eq!(store.progress_pct(), 0.0);
        store.add_received(0, 0, &data).unwrap();
        store.try_finalize(0).unwrap();
        assert_eq!(store.progress_pct(), 100.0);
    }

    // Auxiliary functions

    /// Builds a store whose pieces are exactly the given byte slices.
    fn create_store(pieces: &[&[u8]]) -> PieceStore {
        let piece_length = pieces[0].len() as i64;
        let length: i64 = pieces.iter().map(|piece| piece.len() as i64).sum();
        let mut digests = Vec::new();
        for piece in pieces {
            digests.extend(Sha1::digest(piece));
        }
        PieceStore::new(&create_torrent(length, piece_length, digests)).unwrap()
    }

    fn create_store_with_sizes(length: i64, piece_length: i64, pieces: usize) -> PieceStore {
        PieceStore::new(&create_torrent(length, piece_length, vec![0u8; pieces * 20])).unwrap()
    }

    fn create_torrent(length: i64, piece_length: i64, pieces: Vec<u8>) -> Torrent {
        Torrent {
            announce_url: "http://example.com/announce".to_string(),
            info: Info {
                length,
                name: "test".to_string(),
                piece_length,
                pieces,
                files: vec![],
            },
            info_hash: "00".repeat(20),
        }
    }
}
