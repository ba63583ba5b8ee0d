use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::prelude::IteratorRandom;
use rand::Rng;

use crate::peer::peer_message::Message;
use crate::peer::session_handle::SessionHandle;
use crate::peer::session_status::ChokeSent;
use crate::swarm::registry::SessionRegistry;

/// Peers unchoked for uploading to us, plus the optimistic slot.
pub const REGULAR_UNCHOKE_SLOTS: usize = 4;
/// Random unchokes granted per optimistic pass.
pub const OPTIMISTIC_UNCHOKE_SLOTS: usize = 2;

pub const ROUND_INTERVAL: Duration = Duration::from_secs(10);
pub const OPTIMISTIC_INTERVAL: Duration = Duration::from_secs(30);

/// Tit-for-tat choking across every live session.
///
/// A round keeps the best uploaders unchoked and chokes the rest; every
/// third round a couple of random choked peers get an optimistic chance to
/// prove themselves. Decisions are made for the whole round first, then
/// messages go out, and only where the decision differs from what the peer
/// last heard.
#[derive(Debug)]
pub struct ChokingController {
    registry: Arc<SessionRegistry>,
    current_optimistic: Mutex<Option<String>>,
}

impl ChokingController {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            current_optimistic: Mutex::new(None),
        }
    }

    /// One choking round. Also run once whenever a peer registers so a
    /// fresh session does not sit choked for most of an interval.
    pub fn run_round(&self) {
        let handles = self.registry.snapshot();

        let mut stats: Vec<(String, f64)> = Vec::with_capacity(handles.len());
        for handle in &handles {
            if handle.is_closed() {
                continue;
            }
            if let Ok(status) = handle.lock_status() {
                stats.push((handle.key().to_string(), status.download_rate_bps));
            }
        }

        let optimistic = self
            .current_optimistic
            .lock()
            .map(|current| current.clone())
            .unwrap_or(None);

        let unchoked = select_unchoke_set(&stats, optimistic.as_deref(), &mut rand::thread_rng());

        for handle in &handles {
            if handle.is_closed() {
                continue;
            }
            Self::apply_choke(handle, unchoked.contains(handle.key()));
        }
    }

    /// Optimistic pass: unchoke up to two random currently-choked peers;
    /// the first becomes the protected optimistic peer for the next rounds.
    pub fn run_optimistic(&self) {
        let handles = self.registry.snapshot();

        let choked: Vec<&Arc<SessionHandle>> = handles
            .iter()
            .filter(|handle| {
                !handle.is_closed()
                    && handle
                        .lock_status()
                        .map(|status| status.choking_remote)
                        .unwrap_or(false)
            })
            .collect();

        let picked = choked
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), OPTIMISTIC_UNCHOKE_SLOTS);

        for (index, handle) in picked.iter().enumerate() {
            if index == 0 {
                if let Ok(mut current) = self.current_optimistic.lock() {
                    *current = Some(handle.key().to_string());
                }
            }
            Self::apply_choke(handle, true);
        }
    }

    /// Records the decision and sends the message only when it changes what
    /// the peer last heard from us.
    fn apply_choke(handle: &SessionHandle, unchoked: bool) {
        let desired = if unchoked {
            ChokeSent::Unchoke
        } else {
            ChokeSent::Choke
        };

        let must_send = match handle.lock_status() {
            Ok(mut status) => {
                status.choking_remote = !unchoked;
                if status.last_sent_choke_state == desired {
                    false
                } else {
                    status.last_sent_choke_state = desired;
                    true
                }
            }
            Err(_) => false,
        };

        if must_send {
            let message = if unchoked {
                Message::unchoke()
            } else {
                Message::choke()
            };
            let _ = handle.send(&message);
        }
    }
}

/// Picks the set of peer keys to leave unchoked this round: the top
/// uploaders by observed download rate, the current optimistic peer, and,
/// while fewer than the regular slots qualify, random fills so a cold swarm
/// still bootstraps.
pub fn select_unchoke_set<R: Rng>(
    stats: &[(String, f64)],
    optimistic: Option<&str>,
    rng: &mut R,
) -> HashSet<String> {
    let mut by_rate: Vec<&(String, f64)> = stats.iter().filter(|(_, rate)| *rate > 0.0).collect();
    by_rate.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut unchoked: HashSet<String> = by_rate
        .iter()
        .take(REGULAR_UNCHOKE_SLOTS)
        .map(|(key, _)| key.clone())
        .collect();

    if let Some(optimistic) = optimistic {
        if stats.iter().any(|(key, _)| key == optimistic) {
            unchoked.insert(optimistic.to_string());
        }
    }

    let regulars = unchoked.len().min(REGULAR_UNCHOKE_SLOTS);
    if regulars < REGULAR_UNCHOKE_SLOTS {
        let missing = REGULAR_UNCHOKE_SLOTS - regulars;
        let fills = stats
            .iter()
            .filter(|(key, _)| !unchoked.contains(key))
            .choose_multiple(rng, missing);
        for (key, _) in fills {
            unchoked.insert(key.clone());
        }
    }

    unchoked
}
