use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error};

use crate::db::Db;
use crate::dedup::Deduplicator;
use crate::fingerprint::Fingerprinter;
use crate::notify::Notifier;
use crate::probe::Prober;
use crate::resolver::{Resolution, Resolver};
use crate::retry::RetryBuffer;
use crate::stats::Stats;
use crate::trie::WildcardIndex;

/// Everything one worker needs to take a raw CT name through the
/// validation stages. Built once by the orchestrator; components only
/// see the capabilities they consume.
pub struct PipelineContext {
    pub index: Arc<WildcardIndex>,
    pub dedup: Arc<Deduplicator>,
    pub resolver: Arc<Resolver>,
    pub prober: Arc<Prober>,
    pub db: Arc<Db>,
    pub notifier: Arc<Notifier>,
    pub fingerprinter: Arc<Fingerprinter>,
    pub retry: Arc<RetryBuffer>,
    pub stats: Arc<Stats>,
    pub exclusions: Vec<String>,
    pub drop_wildcard_names: bool,
}

impl PipelineContext {
    /// Run one name through the stages, short-circuiting on the first
    /// drop. Never returns an error: every failure is logged, counted
    /// and absorbed so the worker task survives.
    pub async fn process(&self, raw: &str) {
        self.stats.total_processed.fetch_add(1, Ordering::Relaxed);

        let was_wildcard = raw.trim_start().starts_with("*.");
        let Some(cleaned) = normalize(raw) else {
            return;
        };
        if is_excluded(&cleaned, &self.exclusions) {
            return;
        }
        if self.drop_wildcard_names && was_wildcard {
            return;
        }

        let snapshot = self.index.snapshot();
        let Some(pattern) = snapshot.matches(&cleaned) else {
            return;
        };
        self.stats.matched.fetch_add(1, Ordering::Relaxed);

        if !self.dedup.admit(&cleaned) {
            self.stats.dedup_hit.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Fail open on a read error: the unique constraint on write is
        // the real guard.
        match self.db.domain_known(&cleaned).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                self.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
                error!(domain = %cleaned, "discovered-domain lookup failed: {:#}", e);
            }
        }

        match self.resolver.resolve(&cleaned).await {
            Resolution::Public(ip) => {
                self.stats.dns_resolved.fetch_add(1, Ordering::Relaxed);
                self.finish(&cleaned, &ip.to_string(), &pattern.program).await;
            }
            Resolution::PrivateOnly => {
                self.stats.private_ip.fetch_add(1, Ordering::Relaxed);
                debug!(domain = %cleaned, "only private addresses, dropping");
            }
            Resolution::Failed(kind) => {
                self.stats.dns_failed.fetch_add(1, Ordering::Relaxed);
                if kind.is_retryable() {
                    self.stats.retry_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.retry.push(cleaned.clone(), pattern.suffix.clone()).await;
                } else {
                    debug!(domain = %cleaned, ?kind, "dns failure is terminal, dropping");
                }
            }
        }
    }

    /// Probe + notify + fingerprint + persist. Also the tail of the
    /// retry sweep once a queued name finally resolves. Each side effect
    /// has independent error handling; only persistence is mandatory,
    /// and even its failure must not take the worker down.
    pub async fn finish(&self, domain: &str, ip: &str, program: &str) {
        let urls = self.prober.probe(domain).await;
        if urls.is_empty() {
            self.stats.http_timeout.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.http_active.fetch_add(1, Ordering::Relaxed);
        }

        match self.db.insert_discovered(domain, ip, program).await {
            Ok(true) => {}
            Ok(false) => debug!(domain, "already persisted, keeping the notification"),
            Err(e) => {
                self.stats.persist_errors.fetch_add(1, Ordering::Relaxed);
                error!(domain, "failed to persist discovery: {:#}", e);
            }
        }

        match self.notifier.notify_discovery(domain, ip, program, &urls).await {
            Ok(()) => {
                self.stats.notifications_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.notifications_failed.fetch_add(1, Ordering::Relaxed);
                error!(domain, "notification failed: {:#}", e);
            }
        }

        // An IP with no live URL is still a discovery, but there is
        // nothing to fingerprint.
        if !urls.is_empty() && self.fingerprinter.enabled() {
            match self.fingerprinter.submit(&urls).await {
                Ok(()) => {
                    self.stats.fingerprinter_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.fingerprinter_failed.fetch_add(1, Ordering::Relaxed);
                    error!(domain, "fingerprinter submit failed: {:#}", e);
                }
            }
        }
    }
}

/// Lowercase, strip the trailing dot and any leading `*.` markers.
/// Idempotent; returns None when nothing remains.
pub fn normalize(raw: &str) -> Option<String> {
    let mut s = raw.trim().to_ascii_lowercase();
    while let Some(rest) = s.strip_prefix("*.") {
        s = rest.to_string();
    }
    let s = s.trim_end_matches('.').to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Literal suffix comparison against the configured exclusion list.
pub fn is_excluded(cleaned: &str, exclusions: &[String]) -> bool {
    exclusions.iter().any(|suffix| cleaned.ends_with(suffix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_cleans_ct_names() {
        assert_eq!(normalize("API.Example.COM."), Some("api.example.com".into()));
        assert_eq!(normalize("*.example.com"), Some("example.com".into()));
        assert_eq!(normalize("  www.example.com  "), Some("www.example.com".into()));
        assert_eq!(normalize("*."), None);
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("."), None);
    }

    #[test]
    fn normalize_is_idempotent() {
        for raw in ["API.Example.COM.", "*.*.example.com", "www.example.com", "*.x."] {
            let once = normalize(raw);
            let twice = once.as_deref().and_then(normalize);
            assert_eq!(once, twice, "normalize not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn exclusions_are_literal_suffix_matches() {
        let exclusions = vec![".nflxvideo.net".to_string(), ".cloudfront.net".to_string()];
        assert!(is_excluded("xyz.nflxvideo.net", &exclusions));
        assert!(is_excluded("a.b.cloudfront.net", &exclusions));
        assert!(!is_excluded("nflxvideo.net", &exclusions));
        assert!(!is_excluded("api.example.com", &exclusions));
        assert!(!is_excluded("anything", &[]));
    }
}
