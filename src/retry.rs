use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Db, UnresolvableInsert};
use crate::pipeline::PipelineContext;
use crate::resolver::Resolution;

/// Worker-side insertions are buffered and flushed in one transaction.
const FLUSH_THRESHOLD: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Rows retried per sweep, oldest retry counts first.
const SWEEP_LIMIT: i64 = 1_000;
/// Rows older than this are purged no matter how their retries went.
const BATCH_PURGE_AGE: Duration = Duration::from_secs(3 * 24 * 3600);
/// Exhausted rows linger this long before the sweep drops them.
const RETRY_HARD_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Collects transiently unresolvable names from the workers. The buffer
/// is guarded by a plain mutex; the flush path copies out under the
/// lock and writes outside it.
pub struct RetryBuffer {
    db: Arc<Db>,
    buf: Mutex<Vec<UnresolvableInsert>>,
}

impl RetryBuffer {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db, buf: Mutex::new(Vec::new()) }
    }

    pub async fn push(&self, domain: String, wildcard_ref: String) {
        let batch = {
            let mut buf = self.buf.lock().unwrap();
            buf.push(UnresolvableInsert { domain, wildcard_ref });
            if buf.len() >= FLUSH_THRESHOLD {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.write(batch).await;
        }
    }

    pub async fn flush(&self) {
        let batch = std::mem::take(&mut *self.buf.lock().unwrap());
        if !batch.is_empty() {
            self.write(batch).await;
        }
    }

    pub fn pending(&self) -> usize {
        self.buf.lock().unwrap().len()
    }

    async fn write(&self, batch: Vec<UnresolvableInsert>) {
        let n = batch.len();
        if let Err(e) = self.db.insert_unresolvables(&batch).await {
            error!(count = n, "failed to flush unresolvable batch: {:#}", e);
        } else {
            debug!(count = n, "unresolvable batch flushed");
        }
    }

    pub fn spawn_flusher(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Final flush so shutdown loses nothing buffered.
                        self.flush().await;
                        break;
                    }
                    _ = tick.tick() => self.flush().await,
                }
            }
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub purged: u64,
    pub exhausted: u64,
    pub resolved: u64,
    pub still_failing: u64,
}

/// Periodic job draining `unresolvable_domains` back through the
/// resolve/probe/notify path.
pub struct RetrySweeper {
    ctx: Arc<PipelineContext>,
    interval: Duration,
    max_retries: i64,
}

impl RetrySweeper {
    pub fn new(ctx: Arc<PipelineContext>, interval_secs: u64, max_retries: i64) -> Self {
        Self {
            ctx,
            interval: Duration::from_secs(interval_secs.max(60)),
            max_retries,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepOutcome> {
        let db = &self.ctx.db;
        let mut outcome = SweepOutcome::default();

        outcome.purged = db.purge_unresolvables_older_than(BATCH_PURGE_AGE).await?;
        outcome.purged += db
            .purge_exhausted_unresolvables(self.max_retries, RETRY_HARD_TTL)
            .await?;

        let rows = db.select_unresolvables(SWEEP_LIMIT).await?;
        for row in rows {
            if row.retry_count > self.max_retries {
                db.delete_unresolvable(&row.domain).await?;
                outcome.exhausted += 1;
                continue;
            }
            match self.ctx.resolver.resolve(&row.domain).await {
                Resolution::Public(ip) => {
                    let program = {
                        let snapshot = self.ctx.index.snapshot();
                        snapshot
                            .matches(&row.domain)
                            .map(|p| p.program.clone())
                            .unwrap_or_default()
                    };
                    self.ctx.finish(&row.domain, &ip.to_string(), &program).await;
                    db.delete_unresolvable(&row.domain).await?;
                    outcome.resolved += 1;
                }
                Resolution::PrivateOnly => {
                    self.ctx.stats.private_ip.fetch_add(1, Ordering::Relaxed);
                    db.delete_unresolvable(&row.domain).await?;
                }
                Resolution::Failed(_) => {
                    db.bump_unresolvable(&row.domain).await?;
                    outcome.still_failing += 1;
                }
            }
        }
        Ok(outcome)
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.tick().await; // first sweep waits one full interval
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        match self.sweep_once().await {
                            Ok(out) => info!(
                                purged = out.purged,
                                exhausted = out.exhausted,
                                resolved = out.resolved,
                                still_failing = out.still_failing,
                                "retry sweep finished"
                            ),
                            Err(e) => warn!("retry sweep failed: {:#}", e),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Arc<Db> {
        Arc::new(Db::connect("sqlite::memory:", 1).await.unwrap())
    }

    #[tokio::test]
    async fn buffer_flushes_on_threshold() {
        let db = memory_db().await;
        let buf = RetryBuffer::new(db.clone());
        for i in 0..FLUSH_THRESHOLD - 1 {
            buf.push(format!("h{}.example.com", i), "example.com".into()).await;
        }
        assert_eq!(buf.pending(), FLUSH_THRESHOLD - 1);
        assert!(db.select_unresolvables(1000).await.unwrap().is_empty());

        buf.push("last.example.com".into(), "example.com".into()).await;
        assert_eq!(buf.pending(), 0);
        assert_eq!(db.select_unresolvables(1000).await.unwrap().len(), FLUSH_THRESHOLD);
    }

    #[tokio::test]
    async fn explicit_flush_drains_partial_buffer() {
        let db = memory_db().await;
        let buf = RetryBuffer::new(db.clone());
        buf.push("a.example.com".into(), "example.com".into()).await;
        buf.push("b.example.com".into(), "example.com".into()).await;
        buf.flush().await;
        assert_eq!(buf.pending(), 0);
        assert_eq!(db.select_unresolvables(1000).await.unwrap().len(), 2);
        // flushing an empty buffer is a no-op
        buf.flush().await;
    }
}
