use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Pipeline counters (monotonic) and gauges. Counters are bumped by the
/// component that observes the event; gauges are overwritten by their
/// owner (queue/workers by the pool, sizes by the runner's sampler).
/// Readers are eventually consistent; no cross-counter atomicity.
#[derive(Default)]
pub struct Stats {
    pub total_processed: AtomicU64,
    pub matched: AtomicU64,
    pub dedup_hit: AtomicU64,
    pub dns_resolved: AtomicU64,
    pub dns_failed: AtomicU64,
    pub private_ip: AtomicU64,
    pub http_active: AtomicU64,
    pub http_timeout: AtomicU64,
    pub fingerprinter_sent: AtomicU64,
    pub fingerprinter_failed: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub notifications_failed: AtomicU64,
    pub queue_dropped: AtomicU64,
    pub persist_errors: AtomicU64,
    pub retry_enqueued: AtomicU64,

    pub queue_size: AtomicU64,
    pub worker_count: AtomicU64,
    pub dedup_size: AtomicU64,
    pub wildcard_count: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct StatsSnapshot {
    pub total_processed: u64,
    pub matched: u64,
    pub dedup_hit: u64,
    pub dns_resolved: u64,
    pub dns_failed: u64,
    pub private_ip: u64,
    pub http_active: u64,
    pub http_timeout: u64,
    pub fingerprinter_sent: u64,
    pub fingerprinter_failed: u64,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub queue_dropped: u64,
    pub persist_errors: u64,
    pub retry_enqueued: u64,
    pub queue_size: u64,
    pub worker_count: u64,
    pub dedup_size: u64,
    pub wildcard_count: u64,
    pub match_rate: f64,
    pub resolve_rate: f64,
    pub uptime_secs: u64,
    pub domains_per_sec: f64,
}

/// Delta state between reports: remember the last counter values and
/// derive rates from the difference.
pub struct Reporter {
    stats: Arc<Stats>,
    start: Instant,
    last_processed: u64,
    last_tick: Instant,
}

impl Reporter {
    pub fn new(stats: Arc<Stats>) -> Self {
        let now = Instant::now();
        Self { stats, start: now, last_processed: 0, last_tick: now }
    }

    pub fn snapshot(&mut self) -> StatsSnapshot {
        let s = &self.stats;
        let total_processed = s.total_processed.load(Ordering::Relaxed);
        let matched = s.matched.load(Ordering::Relaxed);
        let dns_resolved = s.dns_resolved.load(Ordering::Relaxed);
        let dns_failed = s.dns_failed.load(Ordering::Relaxed);

        let now = Instant::now();
        let window = now.duration_since(self.last_tick).as_secs_f64().max(1.0);
        let delta = total_processed.saturating_sub(self.last_processed);
        self.last_processed = total_processed;
        self.last_tick = now;

        let dns_total = dns_resolved + dns_failed;
        StatsSnapshot {
            total_processed,
            matched,
            dedup_hit: s.dedup_hit.load(Ordering::Relaxed),
            dns_resolved,
            dns_failed,
            private_ip: s.private_ip.load(Ordering::Relaxed),
            http_active: s.http_active.load(Ordering::Relaxed),
            http_timeout: s.http_timeout.load(Ordering::Relaxed),
            fingerprinter_sent: s.fingerprinter_sent.load(Ordering::Relaxed),
            fingerprinter_failed: s.fingerprinter_failed.load(Ordering::Relaxed),
            notifications_sent: s.notifications_sent.load(Ordering::Relaxed),
            notifications_failed: s.notifications_failed.load(Ordering::Relaxed),
            queue_dropped: s.queue_dropped.load(Ordering::Relaxed),
            persist_errors: s.persist_errors.load(Ordering::Relaxed),
            retry_enqueued: s.retry_enqueued.load(Ordering::Relaxed),
            queue_size: s.queue_size.load(Ordering::Relaxed),
            worker_count: s.worker_count.load(Ordering::Relaxed),
            dedup_size: s.dedup_size.load(Ordering::Relaxed),
            wildcard_count: s.wildcard_count.load(Ordering::Relaxed),
            match_rate: ratio(matched, total_processed),
            resolve_rate: ratio(dns_resolved, dns_total),
            uptime_secs: self.start.elapsed().as_secs(),
            domains_per_sec: delta as f64 / window,
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Log a condensed stats line every `interval_secs`. Best-effort, never
/// blocks pipeline progress.
pub fn spawn_console_reporter(
    stats: Arc<Stats>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rep = Reporter::new(stats);
        let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
        tick.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let snap = rep.snapshot();
                    log_snapshot(&snap);
                }
            }
        }
    })
}

pub fn log_snapshot(snap: &StatsSnapshot) {
    info!(
        processed = snap.total_processed,
        matched = snap.matched,
        dedup_hit = snap.dedup_hit,
        resolved = snap.dns_resolved,
        dns_failed = snap.dns_failed,
        private_ip = snap.private_ip,
        http_active = snap.http_active,
        queue = snap.queue_size,
        workers = snap.worker_count,
        wildcards = snap.wildcard_count,
        dropped = snap.queue_dropped,
        match_rate = format!("{:.4}", snap.match_rate),
        rate = format!("{:.1}/s", snap.domains_per_sec),
        uptime = snap.uptime_secs,
        "stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_computed_from_counters() {
        let stats = Stats::new();
        stats.total_processed.store(1000, Ordering::Relaxed);
        stats.matched.store(10, Ordering::Relaxed);
        stats.dns_resolved.store(8, Ordering::Relaxed);
        stats.dns_failed.store(2, Ordering::Relaxed);
        let mut rep = Reporter::new(stats);
        let snap = rep.snapshot();
        assert!((snap.match_rate - 0.01).abs() < 1e-9);
        assert!((snap.resolve_rate - 0.8).abs() < 1e-9);
    }

    #[test]
    fn empty_counters_do_not_divide_by_zero() {
        let mut rep = Reporter::new(Stats::new());
        let snap = rep.snapshot();
        assert_eq!(snap.match_rate, 0.0);
        assert_eq!(snap.resolve_rate, 0.0);
        assert_eq!(snap.domains_per_sec, 0.0);
    }

    #[test]
    fn delta_rate_uses_the_window_between_snapshots() {
        let stats = Stats::new();
        let mut rep = Reporter::new(stats.clone());
        let _ = rep.snapshot();
        stats.total_processed.store(500, Ordering::Relaxed);
        let snap = rep.snapshot();
        // 500 new names over a window clamped to >= 1s.
        assert!(snap.domains_per_sec > 0.0);
        assert!(snap.domains_per_sec <= 500.0);
    }
}
