use anyhow::{bail, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::dedup::Deduplicator;
use crate::fingerprint::Fingerprinter;
use crate::ingest::IngestClient;
use crate::notify::Notifier;
use crate::pipeline::PipelineContext;
use crate::pool::WorkerPool;
use crate::probe::Prober;
use crate::resolver::Resolver;
use crate::retry::{RetryBuffer, RetrySweeper};
use crate::stats::{log_snapshot, spawn_console_reporter, Reporter, Stats};
use crate::trie::WildcardIndex;
use crate::wildcards::WildcardRefresher;

const CONSOLE_REPORT_SECS: u64 = 600;
const GAUGE_SAMPLE_SECS: u64 = 10;
const DEDUP_WARMUP_LIMIT: i64 = 100_000;

/// Wires every component together, owns the shutdown sequence.
/// Components receive only the capabilities they consume; nothing here
/// is process-global.
pub struct Runner {
    cfg: Config,
}

struct Wired {
    index: Arc<WildcardIndex>,
    refresher: Arc<WildcardRefresher>,
    stats: Arc<Stats>,
    dedup: Arc<Deduplicator>,
    notifier: Arc<Notifier>,
    retry_buffer: Arc<RetryBuffer>,
    ctx: Arc<PipelineContext>,
}

impl Runner {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    /// Returns the process exit code: 0 clean, 130 when a signal lands
    /// before the pipeline is up. Errors bubble to main and exit 1.
    pub async fn run(self) -> Result<i32> {
        let wired = {
            tokio::select! {
                res = self.startup() => res?,
                _ = wait_for_signal() => {
                    warn!("interrupted during startup");
                    return Ok(130);
                }
            }
        };
        self.serve(wired).await
    }

    async fn startup(&self) -> Result<Wired> {
        let cfg = &self.cfg;
        let db = Arc::new(Db::connect(&cfg.database.url, cfg.concurrency.max as u32).await?);

        let index = Arc::new(WildcardIndex::new());
        let refresher = Arc::new(WildcardRefresher::new(
            cfg.apis.clone(),
            index.clone(),
            db.clone(),
            cfg.wildcards_update_interval,
        )?);
        match refresher.refresh_once().await {
            Ok(count) => info!(patterns = count, "initial wildcard fetch done"),
            Err(e) => {
                warn!("initial wildcard fetch failed: {:#}", e);
                let count = refresher.load_from_db().await?;
                if count == 0 {
                    bail!("no wildcard source reachable and none persisted, refusing to start");
                }
                info!(patterns = count, "wildcards loaded from database");
            }
        }

        let stats = Stats::new();
        let dedup = Arc::new(Deduplicator::new(cfg.dedup.max));
        for domain in db.recent_domains(DEDUP_WARMUP_LIMIT).await? {
            dedup.admit(&domain);
        }
        info!(entries = dedup.len(), "deduplicator warmed from recent discoveries");

        let notifier = Arc::new(Notifier::new(&cfg.discord)?);
        let retry_buffer = Arc::new(RetryBuffer::new(db.clone()));
        let ctx = Arc::new(PipelineContext {
            index: index.clone(),
            dedup: dedup.clone(),
            resolver: Arc::new(Resolver::new(&cfg.dns)?),
            prober: Arc::new(Prober::new(&cfg.http)?),
            db: db.clone(),
            notifier: notifier.clone(),
            fingerprinter: Arc::new(Fingerprinter::new(&cfg.fingerprinter)?),
            retry: retry_buffer.clone(),
            stats: stats.clone(),
            exclusions: cfg.certstream.exclusions.clone(),
            drop_wildcard_names: cfg.certstream.drop_wildcard_names,
        });

        Ok(Wired { index, refresher, stats, dedup, notifier, retry_buffer, ctx })
    }

    async fn serve(&self, wired: Wired) -> Result<i32> {
        let cfg = &self.cfg;
        let Wired { index, refresher, stats, dedup, notifier, retry_buffer, ctx } = wired;

        let cancel = CancellationToken::new();
        let ingest_cancel = CancellationToken::new();
        let mut final_reporter = Reporter::new(stats.clone());

        let pool = WorkerPool::new(
            cfg.queue.max,
            cfg.queue.overflow,
            cfg.concurrency.min,
            cfg.concurrency.max,
            ctx.clone(),
            stats.clone(),
        );
        pool.start(cancel.clone());

        let ingest = IngestClient::new(cfg.certstream.url.clone(), pool.sender());
        let ingest_task = tokio::spawn(ingest.run(ingest_cancel.clone()));

        refresher.spawn_loop(cancel.clone());
        retry_buffer.clone().spawn_flusher(cancel.clone());
        let sweeper = Arc::new(RetrySweeper::new(
            ctx.clone(),
            cfg.database.retry_interval,
            cfg.database.max_retries,
        ));
        sweeper.spawn(cancel.clone());

        spawn_console_reporter(stats.clone(), CONSOLE_REPORT_SECS, cancel.clone());
        spawn_webhook_reporter(
            stats.clone(),
            notifier.clone(),
            cfg.discord.stats_interval,
            cancel.clone(),
        );
        spawn_gauge_sampler(stats.clone(), dedup, index, cancel.clone());

        if let Err(e) = notifier.log_event("rucert started", "certstream pipeline is up").await {
            warn!("startup notification failed: {:#}", e);
        }
        info!("pipeline running");

        wait_for_signal().await;
        info!("shutdown signal received, draining");

        // A second signal forces an immediate exit.
        tokio::spawn(async {
            wait_for_signal().await;
            error!("second signal, forcing exit");
            std::process::exit(1);
        });

        ingest_cancel.cancel();
        let deadline = Duration::from_secs(cfg.shutdown.timeout);
        if !pool.drain(deadline).await {
            warn!(timeout_secs = cfg.shutdown.timeout, "drain timed out, abandoning in-flight jobs");
        }
        retry_buffer.flush().await;

        let snap = final_reporter.snapshot();
        log_snapshot(&snap);
        if let Err(e) = notifier.send_stats(&snap).await {
            warn!("final stats webhook failed: {:#}", e);
        }

        cancel.cancel();
        let _ = ingest_task.await;
        info!("shutdown complete");
        Ok(0)
    }
}

fn spawn_webhook_reporter(
    stats: Arc<Stats>,
    notifier: Arc<Notifier>,
    interval_secs: u64,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut rep = Reporter::new(stats);
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs.max(60)));
        tick.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let snap = rep.snapshot();
                    if let Err(e) = notifier.send_stats(&snap).await {
                        warn!("stats webhook failed: {:#}", e);
                    }
                }
            }
        }
    });
}

fn spawn_gauge_sampler(
    stats: Arc<Stats>,
    dedup: Arc<Deduplicator>,
    index: Arc<WildcardIndex>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(GAUGE_SAMPLE_SECS));
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    stats.dedup_size.store(dedup.len() as u64, Ordering::Relaxed);
                    stats.wildcard_count.store(index.len() as u64, Ordering::Relaxed);
                }
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut int), Ok(mut term)) => {
            tokio::select! {
                _ = int.recv() => {}
                _ = term.recv() => {}
            }
        }
        _ => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
