use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ApiConfig;
use crate::db::Db;
use crate::trie::{WildcardIndex, WildcardPattern, WildcardTrie};

/// Periodically rebuilds the wildcard trie from the configured source
/// APIs and swaps it into the shared index. A failing source is skipped;
/// if every source fails the previous trie stays in place.
pub struct WildcardRefresher {
    client: reqwest::Client,
    sources: Vec<ApiConfig>,
    index: Arc<WildcardIndex>,
    db: Arc<Db>,
    interval: Duration,
}

impl WildcardRefresher {
    pub fn new(
        sources: Vec<ApiConfig>,
        index: Arc<WildcardIndex>,
        db: Arc<Db>,
        interval_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            sources,
            index,
            db,
            interval: Duration::from_secs(interval_secs.max(60)),
        })
    }

    /// One full refresh round. Returns the number of patterns swapped
    /// in, or an error when no source could be polled at all (the
    /// previous trie is kept in that case).
    pub async fn refresh_once(&self) -> Result<usize> {
        let mut collected: Vec<WildcardPattern> = Vec::new();
        let mut ok_sources = 0usize;

        for api in self.sources.iter().filter(|a| a.enabled) {
            match self.fetch_source(api).await {
                Ok(mut patterns) => {
                    debug!(source = %api.name, count = patterns.len(), "source fetched");
                    ok_sources += 1;
                    collected.append(&mut patterns);
                }
                Err(e) => {
                    warn!(source = %api.name, "wildcard source failed, skipping: {:#}", e);
                }
            }
        }

        if ok_sources == 0 {
            bail!("all wildcard sources failed, keeping previous trie");
        }

        let mut trie = WildcardTrie::new();
        for p in collected {
            trie.insert(p);
        }
        let count = trie.len();
        if count == 0 {
            warn!("wildcard refresh produced an empty trie, swapping anyway");
        }

        let persisted: Vec<(String, String)> = trie
            .patterns()
            .iter()
            .map(|p| (p.suffix.clone(), p.program.clone()))
            .collect();
        self.index.swap(trie);
        info!(patterns = count, sources = ok_sources, "wildcard trie swapped");

        if let Err(e) = self.db.upsert_wildcards(&persisted).await {
            error!("failed to persist wildcards: {:#}", e);
        }
        Ok(count)
    }

    /// Seed the index from the `wildcards` table; used when the first
    /// fetch round cannot reach any source.
    pub async fn load_from_db(&self) -> Result<usize> {
        let rows = self.db.load_wildcards().await?;
        let mut trie = WildcardTrie::new();
        for (suffix, program) in rows {
            trie.insert(WildcardPattern { suffix, source: "database".into(), program });
        }
        let count = trie.len();
        self.index.swap(trie);
        Ok(count)
    }

    async fn fetch_source(&self, api: &ApiConfig) -> Result<Vec<WildcardPattern>> {
        let mut req = self.client.get(&api.url);
        for (k, v) in &api.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        let resp = req.send().await.context("request failed")?;
        if !resp.status().is_success() {
            bail!("source returned {}", resp.status());
        }
        let body: Value = resp.json().await.context("response is not JSON")?;
        let mut found = Vec::new();
        walk(&body, &api.name, &mut found);
        Ok(found
            .into_iter()
            .map(|(suffix, program)| WildcardPattern {
                suffix,
                source: api.name.clone(),
                program,
            })
            .collect())
    }

    /// Refresh at startup is driven by the orchestrator; this loop only
    /// handles the periodic rounds. Errors are logged, never fatal.
    pub fn spawn_loop(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.tick().await; // skip the immediate tick; startup already fetched
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = self.refresh_once().await {
                            warn!("wildcard refresh round failed: {:#}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Walk the source's JSON tree collecting `*.suffix` string values.
/// The program label for a pattern is the nearest enclosing object's
/// `program` or `name` string, falling back to the source name.
fn walk(value: &Value, program: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => {
            if let Some(suffix) = canonicalize(s) {
                out.push((suffix, program.to_string()));
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, program, out);
            }
        }
        Value::Object(map) => {
            let label = map
                .get("program")
                .or_else(|| map.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or(program);
            for v in map.values() {
                walk(v, label, out);
            }
        }
        _ => {}
    }
}

/// `*.Example.COM.` → `example.com`; anything not starting with `*.` is
/// ignored.
fn canonicalize(raw: &str) -> Option<String> {
    let s = raw.trim();
    let suffix = s.strip_prefix("*.")?;
    let suffix = suffix.trim_end_matches('.').to_ascii_lowercase();
    if suffix.is_empty() {
        None
    } else {
        Some(suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form() {
        assert_eq!(canonicalize("*.Example.COM"), Some("example.com".into()));
        assert_eq!(canonicalize("*.example.com."), Some("example.com".into()));
        assert_eq!(canonicalize("example.com"), None);
        assert_eq!(canonicalize("*."), None);
        assert_eq!(canonicalize("www.example.com"), None);
    }

    #[test]
    fn walk_collects_only_wildcard_strings() {
        let body = serde_json::json!({
            "targets": ["*.example.com", "example.org", "*.example.net"],
            "count": 3,
            "nested": { "deep": { "scope": "*.deep.example.io" } }
        });
        let mut out = Vec::new();
        walk(&body, "src", &mut out);
        let mut suffixes: Vec<&str> = out.iter().map(|(s, _)| s.as_str()).collect();
        suffixes.sort();
        assert_eq!(suffixes, vec!["deep.example.io", "example.com", "example.net"]);
    }

    #[test]
    fn walk_inherits_program_labels() {
        let body = serde_json::json!({
            "programs": [
                { "name": "acme", "scopes": ["*.acme.com", "*.acme.io"] },
                { "program": "globex", "scope": "*.globex.com" },
                { "scope": "*.orphan.com" }
            ]
        });
        let mut out = Vec::new();
        walk(&body, "fallback", &mut out);
        let get = |suffix: &str| {
            out.iter().find(|(s, _)| s == suffix).map(|(_, p)| p.clone()).unwrap()
        };
        assert_eq!(get("acme.com"), "acme");
        assert_eq!(get("acme.io"), "acme");
        assert_eq!(get("globex.com"), "globex");
        assert_eq!(get("orphan.com"), "fallback");
    }

    #[test]
    fn walk_folds_case() {
        let body = serde_json::json!(["*.EXAMPLE.Com"]);
        let mut out = Vec::new();
        walk(&body, "src", &mut out);
        assert_eq!(out[0].0, "example.com");
    }
}
