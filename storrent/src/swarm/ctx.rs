use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    mpsc::Sender,
    Arc, Mutex,
};

use tracing::{info, warn};

use crate::config::cfg::Cfg;
use crate::file_layer::FileLayer;
use crate::piece_store::PieceStore;
use crate::request_queue::{BlockRequest, RequestQueue};
use crate::swarm::registry::SessionRegistry;
use crate::torrent_parser::torrent::Torrent;

/// Endgame entry thresholds: nearly done, with a short work queue left.
const ENDGAME_PROGRESS_PCT: f64 = 95.0;
const ENDGAME_MAX_QUEUE_LEN: usize = 50;

/// Events the peer pool reacts to.
#[derive(Debug)]
pub enum PoolEvent {
    /// A session closed; a dial slot is free again.
    SessionClosed,
    /// Dialing this key never produced a session; the peer may be retried
    /// if discovery hands it to us again.
    ConnectFailed(String),
}

/// Everything a peer session may ask of the rest of the swarm, as one
/// explicit interface: shared bookkeeping, HAVE broadcasts, duplicate
/// cancellation, endgame state, and close notification.
#[derive(Debug)]
pub struct SwarmCtx {
    pub torrent: Arc<Torrent>,
    pub config: Cfg,
    pub store: Arc<PieceStore>,
    pub queue: Arc<RequestQueue>,
    pub registry: Arc<SessionRegistry>,
    pub files: Arc<FileLayer>,
    /// Our peer id, "-qB4250-" plus 12 random bytes.
    pub client_peer_id: String,
    pub info_hash: Vec<u8>,
    pub downloaded: AtomicU64,
    pub uploaded: AtomicU64,
    pub seeds: AtomicUsize,
    pub leechers: AtomicUsize,
    endgame: AtomicBool,
    shutdown: AtomicBool,
    pool_events: Mutex<Sender<PoolEvent>>,
}

impl SwarmCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        torrent: Arc<Torrent>,
        config: Cfg,
        store: Arc<PieceStore>,
        queue: Arc<RequestQueue>,
        registry: Arc<SessionRegistry>,
        files: Arc<FileLayer>,
        client_peer_id: String,
        info_hash: Vec<u8>,
        pool_events: Sender<PoolEvent>,
    ) -> Self {
        Self {
            torrent,
            config,
            store,
            queue,
            registry,
            files,
            client_peer_id,
            info_hash,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            seeds: AtomicUsize::new(0),
            leechers: AtomicUsize::new(0),
            endgame: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            pool_events: Mutex::new(pool_events),
        }
    }

    /// Endgame is a property of the swarm; sessions read it on every pump.
    pub fn is_endgame(&self) -> bool {
        self.endgame.load(Ordering::Relaxed)
    }

    /// Flips the swarm into endgame once the last stretch is reached.
    /// Endgame is terminal; there is no way back.
    pub fn maybe_enter_endgame(&self) {
        if self.is_endgame() {
            return;
        }
        if self.store.progress_pct() > ENDGAME_PROGRESS_PCT
            && self.queue.len() < ENDGAME_MAX_QUEUE_LEN
            && !self.endgame.swap(true, Ordering::SeqCst)
        {
            info!("entering endgame, {} blocks left", self.queue.len());
            self.republish_outstanding_blocks();
        }
    }

    /// Copies every block currently in flight on some session back into the
    /// queue, so the remaining stragglers get requested redundantly and the
    /// fastest delivery wins.
    fn republish_outstanding_blocks(&self) {
        for handle in self.registry.snapshot() {
            if let Ok(status) = handle.lock_status() {
                for ((piece, offset), request) in status.active_requests.iter() {
                    let _ = self.queue.push_back(BlockRequest {
                        piece: *piece,
                        offset: *offset,
                        length: request.length,
                    });
                }
            }
        }
    }

    /// Runs the post-verification fanout for a piece: HAVE to every open
    /// session, then an endgame check. Must only be called by the session
    /// whose `try_finalize` returned verified.
    pub fn piece_verified(&self, piece: u32) {
        self.registry.broadcast_have(piece);
        info!(
            "piece {} verified ({} / {})",
            piece,
            self.store.verified_count(),
            self.store.total_pieces(),
        );
        self.maybe_enter_endgame();
    }

    /// Tears down the bookkeeping of a closed session: its in-flight blocks
    /// go back to the front of the queue (unless another peer delivered them
    /// meanwhile), its availability leaves the frequency map, and the pool
    /// gets a free slot.
    pub fn session_closed(&self, key: &str) {
        let handle = match self.registry.remove(key) {
            Ok(Some(handle)) => handle,
            _ => return,
        };
        handle.close();

        let held: Vec<BlockRequest> = match handle.lock_status() {
            Ok(mut status) => {
                status.pending_count = 0;
                status
                    .active_requests
                    .drain()
                    .map(|((piece, offset), request)| BlockRequest {
                        piece,
                        offset,
                        length: request.length,
                    })
                    .collect()
            }
            Err(_) => vec![],
        };

        for block in held {
            if let Err(err) = self.store.remove_requested(block.piece, block.offset) {
                warn!("releasing block {:?} failed: {:?}", block, err);
            }
            if self.store.needed(block.piece, block.offset).unwrap_or(false) {
                let _ = self.queue.push_front(block);
            }
        }

        let _ = self.queue.remove_peer(key);
        self.notify_pool(PoolEvent::SessionClosed);
    }

    /// Tells the pool a dial attempt died before ever becoming a session.
    pub fn connect_failed(&self, key: String) {
        self.notify_pool(PoolEvent::ConnectFailed(key));
    }

    /// Frees a dial slot without touching the known-peers set (used when a
    /// dial lost the race against an already-registered session).
    pub fn session_slot_released(&self) {
        self.notify_pool(PoolEvent::SessionClosed);
    }

    fn notify_pool(&self, event: PoolEvent) {
        if let Ok(sender) = self.pool_events.lock() {
            let _ = sender.send(event);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
