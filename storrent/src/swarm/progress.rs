use std::sync::atomic::Ordering;

use crate::swarm::ctx::SwarmCtx;

/// Point-in-time view of the transfer, polled once per second by whatever
/// renders progress.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    /// Bytes per second, summed over the live sessions' EMAs.
    pub download_bps: f64,
    pub upload_bps: f64,
    pub peers: usize,
    pub seeds: usize,
    pub leechers: usize,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    pub progress_pct: f64,
}

impl ProgressSnapshot {
    pub fn collect(ctx: &SwarmCtx) -> Self {
        let mut download_bps = 0.0;
        let mut upload_bps = 0.0;
        for handle in ctx.registry.snapshot() {
            if let Ok(status) = handle.lock_status() {
                download_bps += status.download_rate_bps;
                upload_bps += status.upload_rate_bps;
            }
        }

        Self {
            downloaded_bytes: ctx.downloaded.load(Ordering::Relaxed),
            uploaded_bytes: ctx.uploaded.load(Ordering::Relaxed),
            download_bps,
            upload_bps,
            peers: ctx.registry.len(),
            seeds: ctx.seeds.load(Ordering::Relaxed),
            leechers: ctx.leechers.load(Ordering::Relaxed),
            verified_pieces: ctx.store.verified_count(),
            total_pieces: ctx.store.total_pieces() as usize,
            progress_pct: ctx.store.progress_pct(),
        }
    }
}
