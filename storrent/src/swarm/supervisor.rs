use std::sync::{mpsc::Sender, Arc};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::peer::peer_session::PeerSession;
use crate::request_queue::BlockRequest;
use crate::swarm::ctx::SwarmCtx;
use crate::swarm::watchdog::{StallReason, Watchdog};

const TICK: Duration = Duration::from_secs(5);
/// Watchdog check: every 2nd tick (10 s).
const WATCHDOG_TICKS: u64 = 2;
/// Peer health sweep: every 6th tick (30 s).
const HEALTH_TICKS: u64 = 6;
/// Keep-alive: every 18th tick (90 s).
const KEEP_ALIVE_TICKS: u64 = 18;

const PEER_INACTIVITY: Duration = Duration::from_secs(120);

/// Owns every periodic duty of the swarm: block-request timeouts, the
/// progress watchdog, dead-peer sweeps, and keep-alives. Sessions never run
/// their own timers.
pub struct TimeoutSupervisor {
    ctx: Arc<SwarmCtx>,
    watchdog: Watchdog,
    stall_tx: Sender<StallReason>,
}

impl TimeoutSupervisor {
    pub fn new(ctx: Arc<SwarmCtx>, stall_tx: Sender<StallReason>) -> Self {
        let watchdog = Watchdog::new(&ctx.config, ctx.torrent.total_length());
        Self {
            ctx,
            watchdog,
            stall_tx,
        }
    }

    /// Blocks until shutdown, running each duty on its cadence.
    pub fn run(mut self) {
        let mut ticks: u64 = 0;
        while !self.ctx.is_shutdown() {
            thread::sleep(TICK);
            ticks += 1;

            self.expire_block_requests();
            if ticks % WATCHDOG_TICKS == 0 {
                self.check_watchdog();
            }
            if ticks % HEALTH_TICKS == 0 {
                self.sweep_dead_peers();
            }
            if ticks % KEEP_ALIVE_TICKS == 0 {
                self.send_keep_alives();
            }
        }
    }

    /// Returns every block that sat unanswered past the timeout to the head
    /// of the queue and refills the pipelines that shrank.
    fn expire_block_requests(&self) {
        let timeout = Duration::from_secs(self.ctx.config.block_timeout_secs);

        for handle in self.ctx.registry.snapshot() {
            if handle.is_closed() {
                continue;
            }

            let (expired, should_pump) = match handle.lock_status() {
                Ok(mut status) => {
                    let stale: Vec<(u32, u32)> = status
                        .active_requests
                        .iter()
                        .filter(|(_, request)| request.requested_at.elapsed() > timeout)
                        .map(|(key, _)| *key)
                        .collect();

                    let mut expired = Vec::with_capacity(stale.len());
                    for key in stale {
                        if let Some(request) = status.active_requests.remove(&key) {
                            status.pending_count = status.pending_count.saturating_sub(1);
                            expired.push(BlockRequest {
                                piece: key.0,
                                offset: key.1,
                                length: request.length,
                            });
                        }
                    }
                    let should_pump = !expired.is_empty() && !status.choked_by_remote;
                    (expired, should_pump)
                }
                Err(_) => continue,
            };

            for block in &expired {
                debug!("request {:?} timed out on {}", block, handle.key());
                let _ = self.ctx.store.remove_requested(block.piece, block.offset);
                let _ = self.ctx.queue.push_front(*block);
            }

            if should_pump && !handle.is_closed() {
                if let Err(err) = PeerSession::pump(&handle, &self.ctx) {
                    debug!("pump after timeout failed on {}: {:?}", handle.key(), err);
                }
            }
        }
    }

    fn check_watchdog(&mut self) {
        let downloaded = self
            .ctx
            .downloaded
            .load(std::sync::atomic::Ordering::Relaxed);

        let mut speed = 0.0;
        for handle in self.ctx.registry.snapshot() {
            if let Ok(status) = handle.lock_status() {
                speed += status.download_rate_bps;
            }
        }

        if let Some(reason) = self.watchdog.check(downloaded, speed) {
            warn!("download stalled: {:?}", reason);
            let _ = self.stall_tx.send(reason);
        }
    }

    /// Destroys sessions that owe us blocks but have been mute for too long.
    fn sweep_dead_peers(&self) {
        for handle in self.ctx.registry.snapshot() {
            let dead = match handle.lock_status() {
                Ok(status) => {
                    status.last_inbound.elapsed() > PEER_INACTIVITY
                        && !status.active_requests.is_empty()
                }
                Err(_) => false,
            };
            if dead {
                info!("closing inactive peer {}", handle.key());
                handle.close();
            }
        }
    }

    fn send_keep_alives(&self) {
        for handle in self.ctx.registry.snapshot() {
            if !handle.is_closed() {
                let _ = handle.send_keep_alive();
            }
        }
    }
}
