use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::sync::Mutex;
use std::time::Duration;
use tracing::trace;

use crate::config::HttpConfig;

/// HEAD-probes a host on the configured protocol/port pairs and reports
/// which URLs answered. Reachability only: certificate validation is off
/// for this client, and any HTTP status counts as alive.
pub struct Prober {
    client: reqwest::Client,
    ports: Vec<(String, u16)>,
    overall_timeout: Duration,
    concurrency: usize,
}

impl Prober {
    pub fn new(cfg: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(cfg.timeout))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            ports: cfg.ports.iter().map(|p| (p.protocol.clone(), p.port)).collect(),
            overall_timeout: Duration::from_secs(cfg.probe_timeout),
            concurrency: cfg.probe_concurrency.max(1),
        })
    }

    /// Returns the live URLs for `host`, de-duplicated, ascending port
    /// order. An empty result means nothing answered within the caps.
    pub async fn probe(&self, host: &str) -> Vec<String> {
        let targets: Vec<(u16, String)> = self
            .ports
            .iter()
            .map(|(proto, port)| (*port, build_url(proto, *port, host)))
            .collect();

        let alive: Mutex<Vec<(u16, String)>> = Mutex::new(Vec::new());
        let sweep = stream::iter(targets)
            .for_each_concurrent(self.concurrency, |(port, url)| {
                let alive = &alive;
                async move {
                    match self.client.head(&url).send().await {
                        Ok(resp) => {
                            trace!(url, status = %resp.status(), "probe answered");
                            alive.lock().unwrap().push((port, url));
                        }
                        Err(e) => {
                            trace!(url, "probe failed: {}", e);
                        }
                    }
                }
            });
        // Partial results survive the overall cap: whatever answered
        // before the deadline is kept.
        let _ = tokio::time::timeout(self.overall_timeout, sweep).await;

        finalize(alive.into_inner().unwrap())
    }
}

/// Default ports are omitted from the authority.
fn build_url(protocol: &str, port: u16, host: &str) -> String {
    let default = (protocol == "http" && port == 80) || (protocol == "https" && port == 443);
    if default {
        format!("{}://{}", protocol, host)
    } else {
        format!("{}://{}:{}", protocol, host, port)
    }
}

fn finalize(mut alive: Vec<(u16, String)>) -> Vec<String> {
    alive.sort();
    alive.dedup_by(|a, b| a.1 == b.1);
    alive.into_iter().map(|(_, url)| url).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_omitted() {
        assert_eq!(build_url("http", 80, "api.example.com"), "http://api.example.com");
        assert_eq!(build_url("https", 443, "api.example.com"), "https://api.example.com");
        assert_eq!(build_url("http", 8080, "api.example.com"), "http://api.example.com:8080");
        assert_eq!(build_url("https", 8443, "api.example.com"), "https://api.example.com:8443");
    }

    #[test]
    fn results_sorted_by_port_and_deduplicated() {
        let out = finalize(vec![
            (8443, "https://h:8443".into()),
            (80, "http://h".into()),
            (443, "https://h".into()),
            (443, "https://h".into()),
        ]);
        assert_eq!(out, vec!["http://h", "https://h", "https://h:8443"]);
    }

    #[test]
    fn prober_builds_from_config() {
        let cfg = HttpConfig::default();
        let p = Prober::new(&cfg).unwrap();
        assert_eq!(p.ports.len(), 2);
        assert_eq!(p.overall_timeout, Duration::from_secs(15));
    }
}
