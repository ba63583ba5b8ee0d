use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::peer::peer_message::Request;

/// Pipeline depth a fresh session starts with.
pub const INITIAL_PIPELINE: usize = 10;
pub const MIN_PIPELINE: usize = 8;
pub const MAX_PIPELINE: usize = 100;
/// Depth used in endgame while no RTT sample has tuned the adaptive value.
pub const ENDGAME_PIPELINE: usize = 5;

/// RTT below this grows the pipeline, above `RTT_SLOW` shrinks it.
const RTT_FAST: Duration = Duration::from_millis(300);
const RTT_SLOW: Duration = Duration::from_millis(800);

/// Smoothing factor for the latency and throughput EMAs.
const EMA_ALPHA: f64 = 0.3;

/// Upload abuse limits.
pub const MAX_UPLOAD_REQUESTS_PER_MINUTE: usize = 1000;
pub const UPLOAD_BYTES_PER_SECOND: u64 = 256 * 1024;
pub const MAX_PENDING_UPLOADS: usize = 1000;

const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Last choke/unchoke actually written to the peer, kept to suppress
/// redundant messages round after round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeSent {
    Unset,
    Choke,
    Unchoke,
}

/// One in-flight block request on this session.
#[derive(Debug, Clone, Copy)]
pub struct ActiveRequest {
    pub length: u32,
    pub requested_at: Instant,
}

#[derive(Debug)]
struct RateWindow {
    start: Instant,
    bytes: u64,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            bytes: 0,
        }
    }

    /// Accumulates bytes; once a full window has elapsed, folds the observed
    /// speed into `rate` with an EMA and starts a new window.
    fn record(&mut self, bytes: u64, rate: &mut f64) {
        self.bytes += bytes;
        let elapsed = self.start.elapsed();
        if elapsed >= RATE_WINDOW {
            let observed = self.bytes as f64 / elapsed.as_secs_f64();
            *rate = (1.0 - EMA_ALPHA) * *rate + EMA_ALPHA * observed;
            self.start = Instant::now();
            self.bytes = 0;
        }
    }
}

/// The mutable protocol state of one peer session, shared between the
/// session thread and the controller threads through the session handle.
#[derive(Debug)]
pub struct SessionStatus {
    pub remote_peer_id: Option<Vec<u8>>,
    /// The remote choked us.
    pub choked_by_remote: bool,
    /// We told the remote we want its pieces.
    pub interested_in_remote: bool,
    /// We are choking the remote.
    pub choking_remote: bool,
    /// The remote told us it wants our pieces.
    pub interested_in_us: bool,
    pub available_pieces: HashSet<u32>,
    pub active_requests: HashMap<(u32, u32), ActiveRequest>,
    /// Mirrors `active_requests.len()` for cheap pipeline checks, except
    /// after a choke, which zeroes it while the entries linger.
    pub pending_count: usize,
    pub max_pipeline: usize,
    /// EMA over observed block RTTs; `None` until the first sample.
    pub rolling_latency_ms: Option<f64>,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    /// Bytes per second, EMA over one-second windows.
    pub download_rate_bps: f64,
    pub upload_rate_bps: f64,
    pub last_sent_choke_state: ChokeSent,
    pub last_inbound: Instant,
    pub pending_uploads: VecDeque<Request>,
    pub protocol_errors: u32,
    download_window: RateWindow,
    upload_window: RateWindow,
    upload_request_times: VecDeque<Instant>,
    served_window_start: Instant,
    served_window_bytes: u64,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            remote_peer_id: None,
            choked_by_remote: true,
            interested_in_remote: false,
            choking_remote: true,
            interested_in_us: false,
            available_pieces: HashSet::new(),
            active_requests: HashMap::new(),
            pending_count: 0,
            max_pipeline: INITIAL_PIPELINE,
            rolling_latency_ms: None,
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            download_rate_bps: 0.0,
            upload_rate_bps: 0.0,
            last_sent_choke_state: ChokeSent::Unset,
            last_inbound: Instant::now(),
            pending_uploads: VecDeque::new(),
            protocol_errors: 0,
            download_window: RateWindow::new(),
            upload_window: RateWindow::new(),
            upload_request_times: VecDeque::new(),
            served_window_start: Instant::now(),
            served_window_bytes: 0,
        }
    }

    /// Folds a block round-trip into the latency EMA and adapts the
    /// pipeline depth: fast peers earn a deeper pipeline, slow ones lose it.
    pub fn note_block_rtt(&mut self, rtt: Duration) {
        let rtt_ms = rtt.as_secs_f64() * 1000.0;
        self.rolling_latency_ms = Some(match self.rolling_latency_ms {
            Some(rolling) => (1.0 - EMA_ALPHA) * rolling + EMA_ALPHA * rtt_ms,
            None => rtt_ms,
        });

        if rtt < RTT_FAST {
            self.max_pipeline = (self.max_pipeline + 1).min(MAX_PIPELINE);
        } else if rtt > RTT_SLOW {
            self.max_pipeline = self.max_pipeline.saturating_sub(1).max(MIN_PIPELINE);
        }
    }

    /// The pipeline depth currently in force. In endgame an untuned session
    /// runs shallow so surplus duplicate requests stay cheap to cancel.
    pub fn effective_pipeline(&self, endgame: bool) -> usize {
        if endgame && self.rolling_latency_ms.is_none() {
            ENDGAME_PIPELINE
        } else {
            self.max_pipeline
        }
    }

    pub fn record_downloaded(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
        self.download_window.record(bytes, &mut self.download_rate_bps);
    }

    pub fn record_uploaded(&mut self, bytes: u64) {
        self.uploaded_bytes += bytes;
        self.upload_window.record(bytes, &mut self.upload_rate_bps);
    }

    /// Counts one inbound upload request against the per-minute limit.
    /// Returns false when the peer crossed it and must be closed.
    pub fn note_upload_request(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.upload_request_times.front() {
            if now.duration_since(*oldest) > Duration::from_secs(60) {
                self.upload_request_times.pop_front();
            } else {
                break;
            }
        }
        self.upload_request_times.push_back(now);
        self.upload_request_times.len() <= MAX_UPLOAD_REQUESTS_PER_MINUTE
    }

    /// Tries to take `bytes` out of the per-second upload budget. Returns
    /// false when the window is exhausted and the request must wait.
    pub fn take_upload_budget(&mut self, now: Instant, bytes: u64) -> bool {
        if now.duration_since(self.served_window_start) >= RATE_WINDOW {
            self.served_window_start = now;
            self.served_window_bytes = 0;
        }
        if self.served_window_bytes + bytes > UPLOAD_BYTES_PER_SECOND {
            return false;
        }
        self.served_window_bytes += bytes;
        true
    }

    /// Queues a request the budget could not cover; overflow past the cap
    /// is dropped.
    pub fn defer_upload(&mut self, request: Request) {
        if self.pending_uploads.len() < MAX_PENDING_UPLOADS {
            self.pending_uploads.push_back(request);
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}
