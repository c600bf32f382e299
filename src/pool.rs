use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OverflowPolicy;
use crate::pipeline::PipelineContext;
use crate::stats::Stats;

/// How long a queue-depth condition must hold before the supervisor
/// resizes the worker set.
const SCALE_HOLD: Duration = Duration::from_secs(60);
const SCALE_UP_DEPTH: usize = 20_000;
const SCALE_DOWN_DEPTH: usize = 10_000;
/// Throttle for the overflow warning so a sustained burst does not spam
/// the log.
const DROP_WARN_EVERY: u64 = 1_000;

/// Ingest-side handle onto the queue. Applies the configured overflow
/// policy; `Drop` sheds the newest name and counts it, `Block` awaits
/// capacity.
#[derive(Clone)]
pub struct JobSender {
    tx: mpsc::Sender<String>,
    policy: OverflowPolicy,
    stats: Arc<Stats>,
    dropped_since_warn: Arc<AtomicU64>,
}

impl JobSender {
    pub async fn submit(&self, name: String) {
        match self.policy {
            OverflowPolicy::Drop => {
                if let Err(mpsc::error::TrySendError::Full(lost)) = self.tx.try_send(name) {
                    self.stats.queue_dropped.fetch_add(1, Ordering::Relaxed);
                    let n = self.dropped_since_warn.fetch_add(1, Ordering::Relaxed);
                    if n % DROP_WARN_EVERY == 0 {
                        warn!(example = %lost, "ingest queue full, dropping newest");
                    }
                }
            }
            OverflowPolicy::Block => {
                // Channel closure only happens on shutdown; the name is
                // lost either way then.
                let _ = self.tx.send(name).await;
            }
        }
    }

    /// Current queue depth, derived from the channel's free capacity.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Bounded-concurrency consumer of ingested names. Worker tasks share
/// one receiver; a supervisor grows the set by 1.5x under sustained
/// queue pressure and shrinks it back once the queue drains. Excess
/// workers retire themselves on their next loop iteration.
pub struct WorkerPool {
    sender: JobSender,
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
    ctx: Arc<PipelineContext>,
    stats: Arc<Stats>,
    min_workers: usize,
    max_workers: usize,
    worker_target: Arc<AtomicUsize>,
    live_workers: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(
        queue_max: usize,
        policy: OverflowPolicy,
        min_workers: usize,
        max_workers: usize,
        ctx: Arc<PipelineContext>,
        stats: Arc<Stats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_max);
        let sender = JobSender {
            tx,
            policy,
            stats: stats.clone(),
            dropped_since_warn: Arc::new(AtomicU64::new(0)),
        };
        Self {
            sender,
            rx: Arc::new(Mutex::new(rx)),
            ctx,
            stats,
            min_workers,
            max_workers,
            worker_target: Arc::new(AtomicUsize::new(min_workers)),
            live_workers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn sender(&self) -> JobSender {
        self.sender.clone()
    }

    /// Spawn the initial workers plus the scaling supervisor. Workers
    /// stop when the queue closes and drains, or when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        for _ in 0..self.min_workers {
            self.spawn_worker(cancel.clone());
        }
        self.spawn_supervisor(cancel)
    }

    fn spawn_worker(&self, cancel: CancellationToken) {
        let rx = self.rx.clone();
        let ctx = self.ctx.clone();
        let target = self.worker_target.clone();
        let live = self.live_workers.clone();
        let stats = self.stats.clone();
        live.fetch_add(1, Ordering::Relaxed);
        stats.worker_count.store(live.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
        tokio::spawn(async move {
            loop {
                if try_retire(&live, &target) {
                    debug!("scaling down, worker retiring");
                    stats.worker_count.store(live.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
                    return;
                }
                // Hold the receiver lock only for the pop itself.
                let name = {
                    let mut guard = rx.lock().await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        popped = guard.recv() => popped,
                    }
                };
                let Some(name) = name else { break };
                ctx.process(&name).await;
            }
            live.fetch_sub(1, Ordering::Relaxed);
            stats.worker_count.store(live.load(Ordering::Relaxed) as u64, Ordering::Relaxed);
        });
    }

    fn spawn_supervisor(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let sender = self.sender.clone();
        let stats = self.stats.clone();
        let target = self.worker_target.clone();
        let live = self.live_workers.clone();
        let min = self.min_workers;
        let max = self.max_workers;
        let pool = self.handle();
        let supervisor_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(1));
            let mut high_since: Option<Instant> = None;
            let mut low_since: Option<Instant> = None;
            loop {
                tokio::select! {
                    biased;
                    _ = supervisor_cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let depth = sender.depth();
                stats.queue_size.store(depth as u64, Ordering::Relaxed);

                if depth > SCALE_UP_DEPTH {
                    low_since = None;
                    let held = *high_since.get_or_insert_with(Instant::now);
                    if held.elapsed() >= SCALE_HOLD {
                        let current = target.load(Ordering::Relaxed);
                        let next = ((current as f64 * 1.5).ceil() as usize).min(max);
                        if next > current {
                            info!(from = current, to = next, depth, "scaling workers up");
                            target.store(next, Ordering::Relaxed);
                            // Top up from the live count so stragglers
                            // from an earlier scale-down are not doubled.
                            let live_now = live.load(Ordering::Relaxed);
                            for _ in live_now..next {
                                pool.spawn_worker(cancel.clone());
                            }
                        }
                        high_since = Some(Instant::now());
                    }
                } else if depth < SCALE_DOWN_DEPTH {
                    high_since = None;
                    let held = *low_since.get_or_insert_with(Instant::now);
                    if held.elapsed() >= SCALE_HOLD {
                        let current = target.load(Ordering::Relaxed);
                        if current > min {
                            info!(from = current, to = min, depth, "scaling workers down");
                            target.store(min, Ordering::Relaxed);
                        }
                        low_since = Some(Instant::now());
                    }
                } else {
                    high_since = None;
                    low_since = None;
                }
            }
        })
    }

    /// Shallow handle for the supervisor to spawn workers with.
    fn handle(&self) -> WorkerPool {
        WorkerPool {
            sender: self.sender.clone(),
            rx: self.rx.clone(),
            ctx: self.ctx.clone(),
            stats: self.stats.clone(),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            worker_target: self.worker_target.clone(),
            live_workers: self.live_workers.clone(),
        }
    }

    /// Wait until the queue is empty or `deadline` passes. Used by the
    /// orchestrator during shutdown; jobs still running afterwards are
    /// abandoned when the main token fires.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.sender.depth() == 0 {
                return true;
            }
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub fn worker_count(&self) -> usize {
        self.live_workers.load(Ordering::Relaxed)
    }
}

/// Decrement `live` iff it currently exceeds `target`. The winning
/// worker exits; losers re-check on their next iteration.
fn try_retire(live: &AtomicUsize, target: &AtomicUsize) -> bool {
    loop {
        let l = live.load(Ordering::Relaxed);
        let t = target.load(Ordering::Relaxed);
        if l <= t {
            return false;
        }
        if live
            .compare_exchange(l, l - 1, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;

    fn test_sender(capacity: usize, policy: OverflowPolicy) -> (JobSender, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sender = JobSender {
            tx,
            policy,
            stats: Stats::new(),
            dropped_since_warn: Arc::new(AtomicU64::new(0)),
        };
        (sender, rx)
    }

    #[tokio::test]
    async fn drop_policy_sheds_newest_and_counts() {
        let (sender, mut rx) = test_sender(2, OverflowPolicy::Drop);
        sender.submit("a".into()).await;
        sender.submit("b".into()).await;
        sender.submit("c".into()).await; // over capacity, dropped
        assert_eq!(sender.stats.queue_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(sender.depth(), 2);
        assert_eq!(rx.recv().await.unwrap(), "a");
        assert_eq!(rx.recv().await.unwrap(), "b");
    }

    #[tokio::test]
    async fn queue_depth_never_exceeds_capacity() {
        let (sender, _rx) = test_sender(8, OverflowPolicy::Drop);
        for i in 0..100 {
            sender.submit(format!("h{}", i)).await;
        }
        assert_eq!(sender.depth(), 8);
        assert_eq!(sender.stats.queue_dropped.load(Ordering::Relaxed), 92);
    }

    #[tokio::test]
    async fn block_policy_waits_for_capacity() {
        let (sender, mut rx) = test_sender(1, OverflowPolicy::Block);
        sender.submit("a".into()).await;
        let s2 = sender.clone();
        let handle = tokio::spawn(async move {
            s2.submit("b".into()).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "submit should be blocked on a full queue");
        assert_eq!(rx.recv().await.unwrap(), "a");
        handle.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "b");
        assert_eq!(sender.stats.queue_dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn retire_only_when_over_target() {
        let live = AtomicUsize::new(5);
        let target = AtomicUsize::new(3);
        assert!(try_retire(&live, &target));
        assert!(try_retire(&live, &target));
        assert_eq!(live.load(Ordering::Relaxed), 3);
        assert!(!try_retire(&live, &target));
        assert_eq!(live.load(Ordering::Relaxed), 3);
    }
}
