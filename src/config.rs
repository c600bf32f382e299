use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use url::Url;

/// Top-level configuration, loaded from a YAML file.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub certstream: CertstreamConfig,
    /// Wildcard source APIs, polled in order on every refresh.
    #[serde(default)]
    pub apis: Vec<ApiConfig>,
    /// Seconds between wildcard refreshes.
    #[serde(default = "default_wildcards_update_interval")]
    pub wildcards_update_interval: u64,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub fingerprinter: FingerprinterConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CertstreamConfig {
    /// WebSocket endpoint of the upstream certstream server.
    #[serde(default = "default_certstream_url")]
    pub url: String,
    /// Name suffixes dropped before any expensive work (literal endswith).
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// Drop names that arrive as `*.suffix` themselves.
    #[serde(default = "default_true")]
    pub drop_wildcard_names: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DnsConfig {
    /// Per-query timeout in seconds.
    #[serde(default = "default_dns_timeout")]
    pub timeout: u64,
    /// Also ask for AAAA records.
    #[serde(default)]
    pub ipv6: bool,
    /// DNS cache capacity (entries).
    #[serde(default = "default_dns_cache")]
    pub cache_size: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    /// Ports probed for liveness, in config order.
    #[serde(default = "default_ports")]
    pub ports: Vec<PortConfig>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout: u64,
    /// Overall ceiling for one host's probe round, in seconds.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    /// Concurrent probes per host.
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    pub protocol: String,
    pub port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FingerprinterConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub callback_urls: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    #[serde(default)]
    pub messages_webhook: Option<String>,
    #[serde(default)]
    pub logs_webhook: Option<String>,
    /// Seconds between webhook stats reports.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    #[serde(default = "default_username")]
    pub username: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// error|warn|info|debug|trace
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub console_colors: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Seconds allowed for draining in-flight work.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_min_conc")]
    pub min: usize,
    #[serde(default = "default_max_conc")]
    pub max: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Ingest queue capacity.
    #[serde(default = "default_queue_max")]
    pub max: usize,
    /// Overflow policy: drop (newest) or block the reader.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    #[default]
    Drop,
    Block,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DedupConfig {
    /// Max names remembered by the in-memory deduplicator.
    #[serde(default = "default_dedup_max")]
    pub max: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Seconds between unresolvable-domain sweeps.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Retries before an unresolvable row is given up on.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
}

fn default_certstream_url() -> String { "wss://certstream.calidog.io".into() }
fn default_wildcards_update_interval() -> u64 { 86_400 }
fn default_dns_timeout() -> u64 { 2 }
fn default_dns_cache() -> usize { 10_000 }
fn default_http_timeout() -> u64 { 5 }
fn default_probe_timeout() -> u64 { 15 }
fn default_probe_concurrency() -> usize { 5 }
fn default_stats_interval() -> u64 { 10_800 }
fn default_username() -> String { "rucert".into() }
fn default_log_level() -> String { "info".into() }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_min_conc() -> usize { 10 }
fn default_max_conc() -> usize { 50 }
fn default_queue_max() -> usize { 50_000 }
fn default_dedup_max() -> usize { 100_000 }
fn default_database_url() -> String { "sqlite://rucert.db".into() }
fn default_retry_interval() -> u64 { 10_800 }
fn default_max_retries() -> i64 { 5 }
fn default_true() -> bool { true }

fn default_ports() -> Vec<PortConfig> {
    vec![
        PortConfig { protocol: "http".into(), port: 80 },
        PortConfig { protocol: "https".into(), port: 443 },
    ]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            certstream: CertstreamConfig::default(),
            apis: Vec::new(),
            wildcards_update_interval: default_wildcards_update_interval(),
            dns: DnsConfig::default(),
            http: HttpConfig::default(),
            fingerprinter: FingerprinterConfig::default(),
            discord: DiscordConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            queue: QueueConfig::default(),
            dedup: DedupConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for CertstreamConfig {
    fn default() -> Self {
        Self {
            url: default_certstream_url(),
            exclusions: Vec::new(),
            drop_wildcard_names: true,
        }
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self { timeout: default_dns_timeout(), ipv6: false, cache_size: default_dns_cache() }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            ports: default_ports(),
            timeout: default_http_timeout(),
            probe_timeout: default_probe_timeout(),
            probe_concurrency: default_probe_concurrency(),
        }
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            messages_webhook: None,
            logs_webhook: None,
            stats_interval: default_stats_interval(),
            username: default_username(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), console_colors: true }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout: default_shutdown_timeout() }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { min: default_min_conc(), max: default_max_conc() }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max: default_queue_max(), overflow: OverflowPolicy::Drop }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { max: default_dedup_max() }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.check()?;
        Ok(cfg)
    }

    /// Validate values the type system cannot. Called on every load.
    pub fn check(&mut self) -> Result<()> {
        let ws = Url::parse(&self.certstream.url).context("certstream.url is not a valid URL")?;
        ensure!(
            ws.scheme() == "ws" || ws.scheme() == "wss",
            "certstream.url must use ws:// or wss:// (got {})",
            ws.scheme()
        );
        ensure!(self.concurrency.min >= 1, "concurrency.min must be >= 1");
        ensure!(
            self.concurrency.min <= self.concurrency.max,
            "concurrency.min ({}) exceeds concurrency.max ({})",
            self.concurrency.min,
            self.concurrency.max
        );
        ensure!(self.queue.max >= 1, "queue.max must be >= 1");
        ensure!(self.dedup.max >= 1, "dedup.max must be >= 1");
        ensure!(self.database.max_retries >= 0, "database.max_retries must be >= 0");
        ensure!(!self.http.ports.is_empty(), "http.ports must not be empty");
        for p in &self.http.ports {
            ensure!(
                p.protocol == "http" || p.protocol == "https",
                "http.ports protocol must be http or https (got {})",
                p.protocol
            );
        }
        for api in &self.apis {
            Url::parse(&api.url)
                .with_context(|| format!("apis.{}: url is not valid", api.name))?;
        }
        // Exclusions are compared against normalized (lowercase) names.
        for e in self.certstream.exclusions.iter_mut() {
            *e = e.trim().to_ascii_lowercase();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.wildcards_update_interval, 86_400);
        assert_eq!(cfg.dns.timeout, 2);
        assert_eq!(cfg.http.timeout, 5);
        assert_eq!(cfg.http.probe_timeout, 15);
        assert_eq!(cfg.http.probe_concurrency, 5);
        assert_eq!(cfg.queue.max, 50_000);
        assert_eq!(cfg.queue.overflow, OverflowPolicy::Drop);
        assert_eq!(cfg.dedup.max, 100_000);
        assert_eq!(cfg.concurrency.min, 10);
        assert_eq!(cfg.concurrency.max, 50);
        assert_eq!(cfg.shutdown.timeout, 30);
        assert_eq!(cfg.database.retry_interval, 10_800);
        assert_eq!(cfg.database.max_retries, 5);
        assert_eq!(cfg.discord.stats_interval, 10_800);
        assert_eq!(cfg.discord.username, "rucert");
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
certstream:
  url: wss://certstream.example.net
  exclusions: [".Nflxvideo.NET", ".cloudfront.net"]
apis:
  - name: hackerone
    url: https://api.example.com/programs
    headers:
      Authorization: "Bearer token"
    enabled: true
wildcards_update_interval: 3600
http:
  ports:
    - protocol: http
      port: 8080
    - protocol: https
      port: 8443
  timeout: 3
fingerprinter:
  url: https://fp.example.com/scan
  api_key: secret
  callback_urls: ["https://cb.example.com"]
discord:
  messages_webhook: https://discord.com/api/webhooks/1/a
  logs_webhook: https://discord.com/api/webhooks/2/b
  stats_interval: 600
  username: watcher
logging:
  level: debug
  console_colors: false
shutdown:
  timeout: 10
concurrency:
  min: 2
  max: 8
queue:
  max: 100
  overflow: block
database:
  url: "sqlite::memory:"
  retry_interval: 60
  max_retries: 3
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.check().unwrap();
        assert_eq!(cfg.apis.len(), 1);
        assert!(cfg.apis[0].enabled);
        assert_eq!(cfg.http.ports.len(), 2);
        assert_eq!(cfg.queue.overflow, OverflowPolicy::Block);
        // exclusions folded to lowercase by check()
        assert_eq!(cfg.certstream.exclusions[0], ".nflxvideo.net");
        assert_eq!(cfg.discord.username, "watcher");
    }

    #[test]
    fn check_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.certstream.url = "https://not-a-websocket".into();
        assert!(cfg.check().is_err());

        let mut cfg = Config::default();
        cfg.concurrency.min = 20;
        cfg.concurrency.max = 10;
        assert!(cfg.check().is_err());

        let mut cfg = Config::default();
        cfg.http.ports[0].protocol = "gopher".into();
        assert!(cfg.check().is_err());
    }
}
