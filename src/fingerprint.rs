use anyhow::{bail, Result};
use serde::Serialize;
use std::time::Duration;

use crate::config::FingerprinterConfig;

#[derive(Serialize, Debug)]
struct FingerprintJob<'a> {
    urls: &'a [String],
    callback_urls: &'a [String],
}

/// Submits live URLs to the external fingerprinting service. Disabled
/// entirely when no URL is configured.
pub struct Fingerprinter {
    client: reqwest::Client,
    url: Option<String>,
    api_key: Option<String>,
    callback_urls: Vec<String>,
}

impl Fingerprinter {
    pub fn new(cfg: &FingerprinterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: cfg.url.clone(),
            api_key: cfg.api_key.clone(),
            callback_urls: cfg.callback_urls.clone(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.url.is_some()
    }

    /// POST the job; any 2xx is success.
    pub async fn submit(&self, urls: &[String]) -> Result<()> {
        let Some(endpoint) = &self.url else {
            return Ok(());
        };
        if urls.is_empty() {
            return Ok(());
        }
        let job = FingerprintJob { urls, callback_urls: &self.callback_urls };
        let mut req = self.client.post(endpoint).json(&job);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            bail!("fingerprinter returned {}", resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_body_shape() {
        let urls = vec!["https://api.example.com".to_string()];
        let callbacks = vec!["https://cb.example.com".to_string()];
        let job = FingerprintJob { urls: &urls, callback_urls: &callbacks };
        let v: serde_json::Value = serde_json::to_value(&job).unwrap();
        assert_eq!(v["urls"][0], "https://api.example.com");
        assert_eq!(v["callback_urls"][0], "https://cb.example.com");
    }

    #[tokio::test]
    async fn disabled_without_url() {
        let f = Fingerprinter::new(&FingerprinterConfig::default()).unwrap();
        assert!(!f.enabled());
        f.submit(&["https://x".into()]).await.unwrap();
    }
}
