use std::time::{Duration, Instant};

use crate::config::cfg::Cfg;

/// Why the watchdog declared the download dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    /// No downloaded-byte progress for the configured window.
    NoProgress,
    /// Download speed stayed below the minimum for the configured window.
    BelowMinSpeed,
    /// The download as a whole ran out of time.
    TotalTimeout,
}

/// Deadline tracker for the whole download. Checked periodically by the
/// supervisor; fires at most once, and a trigger is terminal.
#[derive(Debug)]
pub struct Watchdog {
    stall: Duration,
    min_speed_bps: u64,
    min_speed_window: Duration,
    max_total: Duration,
    started: Instant,
    last_progress: Instant,
    last_downloaded: u64,
    slow_since: Option<Instant>,
    triggered: bool,
}

impl Watchdog {
    /// Builds the watchdog from the config. A zero `max_total_secs` derives
    /// the total deadline from the payload size: at least a day, and a
    /// minute per MiB for anything bigger.
    pub fn new(config: &Cfg, total_bytes: u64) -> Self {
        let max_total = if config.max_total_secs > 0 {
            Duration::from_secs(config.max_total_secs)
        } else {
            let mib = total_bytes / (1024 * 1024);
            Duration::from_secs((mib * 60).max(24 * 60 * 60))
        };

        let now = Instant::now();
        Self {
            stall: Duration::from_secs(config.stall_secs),
            min_speed_bps: config.min_speed_bps,
            min_speed_window: Duration::from_secs(config.min_speed_window_secs),
            max_total,
            started: now,
            last_progress: now,
            last_downloaded: 0,
            slow_since: None,
            triggered: false,
        }
    }

    /// Feeds the current totals in; returns the terminal stall reason the
    /// first time a deadline is crossed, `None` forever after.
    pub fn check(&mut self, downloaded: u64, speed_bps: f64) -> Option<StallReason> {
        if self.triggered {
            return None;
        }
        let now = Instant::now();

        if downloaded > self.last_downloaded {
            self.last_downloaded = downloaded;
            self.last_progress = now;
        }

        if speed_bps < self.min_speed_bps as f64 {
            if self.slow_since.is_none() {
                self.slow_since = Some(now);
            }
        } else {
            self.slow_since = None;
        }

        let reason = if now.duration_since(self.last_progress) > self.stall {
            Some(StallReason::NoProgress)
        } else if self
            .slow_since
            .map(|since| now.duration_since(since) > self.min_speed_window)
            .unwrap_or(false)
        {
            Some(StallReason::BelowMinSpeed)
        } else if now.duration_since(self.started) > self.max_total {
            Some(StallReason::TotalTimeout)
        } else {
            None
        };

        if reason.is_some() {
            self.triggered = true;
        }
        reason
    }
}
