use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{error, info, warn};

use crate::bt_server::server::BtServer;
use crate::config::cfg::Cfg;
use crate::file_layer::{FileLayer, FileLayerError};
use crate::peer::bt_peer::BtPeer;
use crate::piece_store::{PieceStore, PieceStoreError};
use crate::request_queue::{RequestQueue, RequestQueueError};
use crate::swarm::choking::{self, ChokingController};
use crate::swarm::ctx::{PoolEvent, SwarmCtx};
use crate::swarm::peer_pool::PeerPool;
use crate::swarm::progress::ProgressSnapshot;
use crate::swarm::registry::SessionRegistry;
use crate::swarm::supervisor::TimeoutSupervisor;
use crate::swarm::watchdog::StallReason;
use crate::torrent_parser::torrent::Torrent;
use crate::tracker::http::query_params::AnnounceEvent;
use crate::tracker::tracker_handler::{AnnounceStats, TrackerHandler};

/// Posible `Swarm` errors. The only user-visible fatal conditions: a file
/// that cannot be opened (including a traversal attempt) and a watchdog
/// stall.
#[derive(Debug)]
pub enum SwarmError {
    FileLayerError(FileLayerError),
    PieceStoreError(PieceStoreError),
    RequestQueueError(RequestQueueError),
    InvalidInfoHash,
    Stalled(StallReason),
    AlreadyRunning,
}

/// Top-level driver: owns the descriptor, wires every component, consumes
/// discovery, and reports progress while the swarm does the work.
pub struct Swarm {
    ctx: Arc<SwarmCtx>,
    choking: Arc<ChokingController>,
    discovery_tx: Sender<BtPeer>,
    discovery_rx: Mutex<Option<Receiver<BtPeer>>>,
    events_rx: Mutex<Option<Receiver<PoolEvent>>>,
}

impl Swarm {
    /// Builds the whole engine for one torrent. Opening the file layout
    /// happens here, so path traversal and unopenable files fail before any
    /// peer is contacted.
    pub fn new(torrent: Torrent, config: Cfg) -> Result<Self, SwarmError> {
        let torrent = Arc::new(torrent);
        let client_peer_id = generate_peer_id();
        let info_hash = torrent
            .info_hash_bytes()
            .map_err(|_| SwarmError::InvalidInfoHash)?;

        let files = Arc::new(
            FileLayer::new(&torrent, &config.download_directory)
                .map_err(SwarmError::FileLayerError)?,
        );
        let store = Arc::new(PieceStore::new(&torrent).map_err(SwarmError::PieceStoreError)?);

        let queue = Arc::new(RequestQueue::new());
        for piece in 0..torrent.total_pieces() {
            queue
                .enqueue_piece(piece, torrent.piece_size(piece))
                .map_err(SwarmError::RequestQueueError)?;
        }

        let registry = Arc::new(SessionRegistry::new());
        let choking = Arc::new(ChokingController::new(registry.clone()));

        let (events_tx, events_rx) = mpsc::channel();
        let (discovery_tx, discovery_rx) = mpsc::channel();

        let ctx = Arc::new(SwarmCtx::new(
            torrent,
            config,
            store,
            queue,
            registry,
            files,
            client_peer_id,
            info_hash,
            events_tx,
        ));

        Ok(Self {
            ctx,
            choking,
            discovery_tx,
            discovery_rx: Mutex::new(Some(discovery_rx)),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// A sender any discovery source (tracker, DHT, manual) can feed
    /// candidates into.
    pub fn discovery_sender(&self) -> Sender<BtPeer> {
        self.discovery_tx.clone()
    }

    pub fn progress_snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::collect(&self.ctx)
    }

    /// Runs the download to completion (or a terminal stall), spawning the
    /// announcer, pool, choking, supervisor and listener threads, and
    /// logging one progress line per second meanwhile.
    pub fn run(&self) -> Result<(), SwarmError> {
        let discovery_rx = self
            .discovery_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(SwarmError::AlreadyRunning)?;
        let events_rx = self
            .events_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(SwarmError::AlreadyRunning)?;
        let (stall_tx, stall_rx) = mpsc::channel();

        self.spawn_announcer();
        self.spawn_pool(discovery_rx, events_rx);
        self.spawn_choking();
        self.spawn_supervisor(stall_tx);
        self.spawn_listener();

        info!(
            "downloading '{}': {} pieces, {} bytes",
            self.ctx.torrent.name(),
            self.ctx.store.total_pieces(),
            self.ctx.torrent.total_length(),
        );

        loop {
            if self.ctx.store.is_done() {
                info!("'{}' download complete", self.ctx.torrent.name());
                self.ctx.request_shutdown();
                return Ok(());
            }
            if let Ok(reason) = stall_rx.try_recv() {
                error!("giving up: {:?}", reason);
                self.ctx.request_shutdown();
                return Err(SwarmError::Stalled(reason));
            }

            let snapshot = self.progress_snapshot();
            info!(
                "{:5.1}% ({}/{} pieces) down {:.0} KiB/s up {:.0} KiB/s peers {} (seeds {} leechers {})",
                snapshot.progress_pct,
                snapshot.verified_pieces,
                snapshot.total_pieces,
                snapshot.download_bps / 1024.0,
                snapshot.upload_bps / 1024.0,
                snapshot.peers,
                snapshot.seeds,
                snapshot.leechers,
            );
            thread::sleep(Duration::from_secs(1));
        }
    }

    fn spawn_announcer(&self) {
        let ctx = self.ctx.clone();
        let discovery_tx = self.discovery_tx.clone();
        thread::spawn(move || announce_loop(ctx, discovery_tx));
    }

    fn spawn_pool(&self, discovery_rx: Receiver<BtPeer>, events_rx: Receiver<PoolEvent>) {
        let pool = PeerPool::new(
            self.ctx.clone(),
            self.choking.clone(),
            discovery_rx,
            events_rx,
        );
        thread::spawn(move || pool.run());
    }

    fn spawn_choking(&self) {
        let ctx = self.ctx.clone();
        let controller = self.choking.clone();
        thread::spawn(move || {
            let rounds_per_optimistic = (choking::OPTIMISTIC_INTERVAL.as_secs()
                / choking::ROUND_INTERVAL.as_secs())
            .max(1);
            let mut rounds: u64 = 0;
            while !ctx.is_shutdown() {
                thread::sleep(choking::ROUND_INTERVAL);
                rounds += 1;
                controller.run_round();
                if rounds % rounds_per_optimistic == 0 {
                    controller.run_optimistic();
                }
            }
        });
    }

    fn spawn_supervisor(&self, stall_tx: Sender<StallReason>) {
        let supervisor = TimeoutSupervisor::new(self.ctx.clone(), stall_tx);
        thread::spawn(move || supervisor.run());
    }

    fn spawn_listener(&self) {
        let server = BtServer::new(self.ctx.clone(), self.choking.clone());
        thread::spawn(move || {
            if let Err(err) = server.init() {
                warn!("incoming-connection server failed: {:?}", err);
            }
        });
    }
}

/// Announces on the tracker's cadence, feeding discovered peers to the pool
/// and swarm stats to the snapshot counters.
fn announce_loop(ctx: Arc<SwarmCtx>, discovery_tx: Sender<BtPeer>) {
    let handler = match TrackerHandler::new(
        &ctx.torrent,
        ctx.config.tcp_port,
        ctx.client_peer_id.clone(),
    ) {
        Ok(handler) => handler,
        Err(err) => {
            // soft failure: other discovery sources may still feed the pool,
            // and the watchdog is the backstop
            warn!("tracker unusable: {:?}", err);
            return;
        }
    };

    let mut event = Some(AnnounceEvent::Started);
    let mut completed_sent = false;

    while !ctx.is_shutdown() {
        if ctx.store.is_done() && !completed_sent {
            event = Some(AnnounceEvent::Completed);
            completed_sent = true;
        }

        let total = ctx.torrent.total_length();
        let stats = AnnounceStats {
            uploaded: ctx.uploaded.load(Ordering::Relaxed),
            downloaded: ctx.downloaded.load(Ordering::Relaxed),
            left: total.saturating_sub(ctx.store.verified_bytes()),
        };

        let interval = match handler.announce(stats, event.take()) {
            Ok(response) => {
                ctx.seeds
                    .store(response.complete.max(0) as usize, Ordering::Relaxed);
                ctx.leechers
                    .store(response.incomplete.max(0) as usize, Ordering::Relaxed);
                info!("tracker returned {} peers", response.peers.len());
                for peer in response.peers {
                    let _ = discovery_tx.send(peer);
                }
                response.interval.clamp(30, 1800) as u64
            }
            Err(err) => {
                warn!("announce failed: {:?}", err);
                60
            }
        };

        for _ in 0..interval {
            if ctx.is_shutdown() {
                return;
            }
            thread::sleep(Duration::from_secs(1));
        }
    }
}

/// Our peer id: the conventional "-qB4250-" prefix plus 12 random bytes.
fn generate_peer_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    format!("-qB4250-{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_parser::info::Info;
    use std::fs;

    #[test]
    fn test_peer_id_shape() {
        let peer_id = generate_peer_id();
        assert_eq!(peer_id.len(), 20);
        assert!(peer_id.starts_with("-qB4250-"));
    }

    #[test]
    fn test_new_fills_the_queue() {
        let dir = "./test_swarm_new_fills_queue";
        let _ = fs::remove_dir_all(dir);
        let swarm = Swarm::new(create_test_torrent(), test_cfg(dir)).unwrap();

        // 40000 bytes in 16384-byte pieces: three pieces, one block each
        assert_eq!(swarm.ctx.queue.len(), 3);
        assert!(!swarm.ctx.store.is_done());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_path_traversal_aborts_before_networking() {
        let dir = "./test_swarm_traversal";
        let _ = fs::remove_dir_all(dir);
        let mut torrent = create_test_torrent();
        torrent.info.files = vec![crate::torrent_parser::info::TorrentFile {
            path: vec!["..".to_string(), "etc".to_string(), "passwd".to_string()],
            length: 40000,
        }];

        let result = Swarm::new(torrent, test_cfg(dir));
        assert!(matches!(
            result,
            Err(SwarmError::FileLayerError(FileLayerError::PathTraversal(_)))
        ));
        fs::remove_dir_all(dir).unwrap();
    }

    // Auxiliary functions

    fn create_test_torrent() -> Torrent {
        Torrent {
            announce_url: "http://tracker.example/announce".to_string(),
            info: Info {
                length: 40000,
                name: "swarm_test.bin".to_string(),
                piece_length: 16384,
                pieces: vec![0u8; 3 * 20],
                files: vec![],
            },
            info_hash: "2c".repeat(20),
        }
    }

    fn test_cfg(dir: &str) -> Cfg {
        Cfg {
            download_directory: dir.to_string(),
            ..Cfg::default()
        }
    }
}
