use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::BLOCK_SIZE;

/// How long a computed rarest-piece ordering stays valid.
const RAREST_CACHE_TTL: Duration = Duration::from_secs(1);

/// One unit of work: a block to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

/// Posible `RequestQueue` errors.
#[derive(Debug)]
pub enum RequestQueueError {
    PoisonedLock,
}

/// Queued pieces ordered by swarm frequency, cheapest first. Recomputing
/// this on every dequeue is the contention hotspot, so the ordering is kept
/// for up to a second and dropped whenever availability changes.
#[derive(Debug)]
struct RarestCache {
    order: Vec<u32>,
    computed_at: Instant,
}

#[derive(Debug, Default)]
struct QueueInner {
    blocks: VecDeque<BlockRequest>,
    /// How many connected peers have each piece.
    frequency: HashMap<u32, usize>,
    /// Piece sets per peer key, kept to maintain `frequency`.
    peer_pieces: HashMap<String, HashSet<u32>>,
    rarest: Option<RarestCache>,
}

/// Global work queue of blocks, with rarest-first selection filtered by
/// per-peer availability.
///
/// All peer sessions share one queue; a dequeued block is owned by the
/// session that took it until it is delivered, times out, or the session
/// closes (the latter two `push_front` it back).
#[derive(Debug, Default)]
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes every block of the piece, in ascending offset order.
    pub fn enqueue_piece(&self, piece: u32, piece_size: u32) -> Result<(), RequestQueueError> {
        let mut inner = self.lock_inner()?;
        let mut offset = 0;
        while offset < piece_size {
            let length = (piece_size - offset).min(BLOCK_SIZE);
            inner.blocks.push_back(BlockRequest {
                piece,
                offset,
                length,
            });
            offset += length;
        }
        Ok(())
    }

    /// Requeues a block at the head, ahead of everything else. Used when a
    /// request times out, a session closes, or a send fails.
    pub fn push_front(&self, block: BlockRequest) -> Result<(), RequestQueueError> {
        let mut inner = self.lock_inner()?;
        inner.blocks.push_front(block);
        Ok(())
    }

    /// Replaces a peer's available-piece set, updating the frequency map and
    /// invalidating the rarest-piece ordering.
    pub fn update_peer_pieces(
        &self,
        peer_key: &str,
        pieces: HashSet<u32>,
    ) -> Result<(), RequestQueueError> {
        let mut inner = self.lock_inner()?;

        if let Some(old) = inner.peer_pieces.remove(peer_key) {
            for piece in &old {
                decrement(&mut inner.frequency, *piece);
            }
        }
        for piece in &pieces {
            *inner.frequency.entry(*piece).or_insert(0) += 1;
        }
        inner.peer_pieces.insert(peer_key.to_string(), pieces);
        inner.rarest = None;
        Ok(())
    }

    /// Records that a peer announced one more piece (a HAVE message).
    pub fn add_peer_piece(&self, peer_key: &str, piece: u32) -> Result<(), RequestQueueError> {
        let mut inner = self.lock_inner()?;
        let newly_added = inner
            .peer_pieces
            .entry(peer_key.to_string())
            .or_default()
            .insert(piece);
        if newly_added {
            *inner.frequency.entry(piece).or_insert(0) += 1;
            inner.rarest = None;
        }
        Ok(())
    }

    /// Forgets a disconnected peer, decrementing its pieces' frequencies.
    pub fn remove_peer(&self, peer_key: &str) -> Result<(), RequestQueueError> {
        let mut inner = self.lock_inner()?;
        if let Some(old) = inner.peer_pieces.remove(peer_key) {
            for piece in &old {
                decrement(&mut inner.frequency, *piece);
            }
            inner.rarest = None;
        }
        Ok(())
    }

    /// Takes the next block for the given peer.
    ///
    /// Selection order: with no known availability the plain FIFO head;
    /// otherwise the first block of the rarest queued piece the peer has,
    /// falling back to any queued block the peer has, else nothing.
    pub fn dequeue(&self, peer_key: &str) -> Result<Option<BlockRequest>, RequestQueueError> {
        let mut inner = self.lock_inner()?;

        let available = inner.peer_pieces.get(peer_key).cloned().unwrap_or_default();

        let position = if available.is_empty() {
            if inner.blocks.is_empty() {
                None
            } else {
                Some(0)
            }
        } else {
            Self::rarest_position(&mut inner, &available)
                .or_else(|| inner.blocks.iter().position(|b| available.contains(&b.piece)))
        };

        match position {
            Some(position) => Ok(inner.blocks.remove(position)),
            None => Ok(None),
        }
    }

    /// Requeues a block at the tail. Endgame uses this to leave a copy of a
    /// requested block up for grabs so other sessions can duplicate it.
    pub fn push_back(&self, block: BlockRequest) -> Result<(), RequestQueueError> {
        let mut inner = self.lock_inner()?;
        inner.blocks.push_back(block);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.blocks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first queued block of the rarest piece the peer has,
    /// using (and refreshing when stale) the cached frequency ordering.
    fn rarest_position(inner: &mut QueueInner, available: &HashSet<u32>) -> Option<usize> {
        let stale = match &inner.rarest {
            Some(cache) => cache.computed_at.elapsed() >= RAREST_CACHE_TTL,
            None => true,
        };
        if stale {
            let queued: HashSet<u32> = inner.blocks.iter().map(|b| b.piece).collect();
            let mut order: Vec<u32> = queued.into_iter().collect();
            order.sort_by_key(|piece| inner.frequency.get(piece).copied().unwrap_or(0));
            inner.rarest = Some(RarestCache {
                order,
                computed_at: Instant::now(),
            });
        }

        let order = &inner.rarest.as_ref()?.order;
        for piece in order {
            if available.contains(piece) {
                if let Some(position) = inner.blocks.iter().position(|b| b.piece == *piece) {
                    return Some(position);
                }
            }
        }
        None
    }

    fn lock_inner(&self) -> Result<MutexGuard<QueueInner>, RequestQueueError> {
        self.inner.lock().map_err(|_| RequestQueueError::PoisonedLock)
    }
}

fn decrement(frequency: &mut HashMap<u32, usize>, piece: u32) {
    if let Some(count) = frequency.get_mut(&piece) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            frequency.remove(&piece);
        }
    }
}
