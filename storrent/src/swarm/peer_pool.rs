use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::peer::bt_peer::BtPeer;
use crate::peer::peer_session::PeerSession;
use crate::swarm::choking::ChokingController;
use crate::swarm::ctx::{PoolEvent, SwarmCtx};

const TICK: Duration = Duration::from_secs(1);

/// Keeps the number of live sessions at or below the configured cap.
///
/// Consumes discovered `(ip, port)` candidates (whatever their source),
/// dedupes them by `"ip:port"`, and dials from its pending queue whenever a
/// slot frees up. Failed dials drop back out of the known set so a peer
/// rediscovered later gets another chance.
pub struct PeerPool {
    ctx: Arc<SwarmCtx>,
    choking: Arc<ChokingController>,
    discovery_rx: Receiver<BtPeer>,
    events_rx: Receiver<PoolEvent>,
    known: HashSet<String>,
    pending: VecDeque<BtPeer>,
    /// Dials spawned but not yet settled into the registry.
    in_flight: usize,
}

impl PeerPool {
    pub fn new(
        ctx: Arc<SwarmCtx>,
        choking: Arc<ChokingController>,
        discovery_rx: Receiver<BtPeer>,
        events_rx: Receiver<PoolEvent>,
    ) -> Self {
        Self {
            ctx,
            choking,
            discovery_rx,
            events_rx,
            known: HashSet::new(),
            pending: VecDeque::new(),
            in_flight: 0,
        }
    }

    /// Blocks until shutdown, dialing on every tick and on every freed slot.
    pub fn run(mut self) {
        while !self.ctx.is_shutdown() {
            self.drain_discovery();
            if !self.ctx.store.is_done() {
                self.dial_up_to_cap();
            }

            match self.events_rx.recv_timeout(TICK) {
                Ok(event) => self.apply_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(event) = self.events_rx.try_recv() {
                self.apply_event(event);
            }
        }
    }

    fn drain_discovery(&mut self) {
        while let Ok(peer) = self.discovery_rx.try_recv() {
            if self.known.insert(peer.key()) {
                self.pending.push_back(peer);
            }
        }
    }

    fn apply_event(&mut self, event: PoolEvent) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if let PoolEvent::ConnectFailed(key) = event {
            // the address stays retryable if discovery surfaces it again
            self.known.remove(&key);
        }
    }

    fn dial_up_to_cap(&mut self) {
        while self.ctx.registry.len() + self.in_flight < self.ctx.config.max_peers {
            let peer = match self.pending.pop_front() {
                Some(peer) => peer,
                None => break,
            };
            if let Ok(Some(_)) = self.ctx.registry.get(&peer.key()) {
                continue;
            }

            let ctx = self.ctx.clone();
            let choking = self.choking.clone();
            let builder = thread::Builder::new().name(format!("peer {}", peer.key()));

            self.in_flight += 1;
            match builder.spawn(move || PeerSession::run_outgoing(peer, ctx, choking)) {
                Ok(_) => {}
                Err(err) => {
                    warn!("spawning a session thread failed: {}", err);
                    self.in_flight = self.in_flight.saturating_sub(1);
                }
            }
        }
    }
}
