use anyhow::{bail, Result};
use serde::Serialize;
use std::time::Duration;

use crate::config::DiscordConfig;
use crate::stats::StatsSnapshot;

const COLOR_DISCOVERY: u32 = 0x2ecc71;
const COLOR_LOG: u32 = 0xe67e22;
const COLOR_STATS: u32 = 0x3498db;

#[derive(Serialize, Debug)]
struct WebhookBody {
    username: String,
    embeds: Vec<Embed>,
}

#[derive(Serialize, Debug)]
struct Embed {
    title: String,
    description: String,
    color: u32,
    fields: Vec<EmbedField>,
    footer: EmbedFooter,
}

#[derive(Serialize, Debug)]
struct EmbedField {
    name: String,
    value: String,
    inline: bool,
}

#[derive(Serialize, Debug)]
struct EmbedFooter {
    text: String,
}

/// Posts embeds to the configured Discord webhooks. Discoveries go to
/// the messages webhook, operational events and stats to the logs
/// webhook. Every send is best-effort; callers count failures and move
/// on.
pub struct Notifier {
    client: reqwest::Client,
    messages_webhook: Option<String>,
    logs_webhook: Option<String>,
    username: String,
}

impl Notifier {
    pub fn new(cfg: &DiscordConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            messages_webhook: cfg.messages_webhook.clone(),
            logs_webhook: cfg.logs_webhook.clone(),
            username: cfg.username.clone(),
        })
    }

    pub async fn notify_discovery(
        &self,
        domain: &str,
        ip: &str,
        program: &str,
        urls: &[String],
    ) -> Result<()> {
        let Some(url) = &self.messages_webhook else {
            return Ok(());
        };
        let mut fields = vec![
            EmbedField { name: "IP".into(), value: ip.to_string(), inline: true },
        ];
        if !program.is_empty() {
            fields.push(EmbedField { name: "Program".into(), value: program.to_string(), inline: true });
        }
        if !urls.is_empty() {
            fields.push(EmbedField { name: "URLs".into(), value: urls.join("\n"), inline: false });
        }
        let body = self.body(Embed {
            title: "New subdomain".into(),
            description: format!("`{}`", domain),
            color: COLOR_DISCOVERY,
            fields,
            footer: EmbedFooter { text: self.username.clone() },
        });
        self.post(url, &body).await
    }

    pub async fn log_event(&self, title: &str, description: &str) -> Result<()> {
        let Some(url) = &self.logs_webhook else {
            return Ok(());
        };
        let body = self.body(Embed {
            title: title.to_string(),
            description: description.to_string(),
            color: COLOR_LOG,
            fields: Vec::new(),
            footer: EmbedFooter { text: self.username.clone() },
        });
        self.post(url, &body).await
    }

    pub async fn send_stats(&self, snap: &StatsSnapshot) -> Result<()> {
        let Some(url) = &self.logs_webhook else {
            return Ok(());
        };
        let field = |name: &str, value: String| EmbedField { name: name.into(), value, inline: true };
        let body = self.body(Embed {
            title: "Pipeline stats".into(),
            description: format!(
                "uptime {}h{:02}m, {:.1} domains/s",
                snap.uptime_secs / 3600,
                (snap.uptime_secs % 3600) / 60,
                snap.domains_per_sec
            ),
            color: COLOR_STATS,
            fields: vec![
                field("Processed", snap.total_processed.to_string()),
                field("Matched", snap.matched.to_string()),
                field("Dedup hits", snap.dedup_hit.to_string()),
                field("Resolved", snap.dns_resolved.to_string()),
                field("DNS failed", snap.dns_failed.to_string()),
                field("Private IP", snap.private_ip.to_string()),
                field("HTTP active", snap.http_active.to_string()),
                field("Fingerprinted", snap.fingerprinter_sent.to_string()),
                field("Queue", snap.queue_size.to_string()),
                field("Workers", snap.worker_count.to_string()),
                field("Wildcards", snap.wildcard_count.to_string()),
                field("Match rate", format!("{:.4}", snap.match_rate)),
            ],
            footer: EmbedFooter { text: self.username.clone() },
        });
        self.post(url, &body).await
    }

    fn body(&self, embed: Embed) -> WebhookBody {
        WebhookBody { username: self.username.clone(), embeds: vec![embed] }
    }

    async fn post(&self, url: &str, body: &WebhookBody) -> Result<()> {
        let resp = self.client.post(url).json(body).send().await?;
        if !resp.status().is_success() {
            bail!("webhook returned {}", resp.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_body_shape() {
        let body = WebhookBody {
            username: "rucert".into(),
            embeds: vec![Embed {
                title: "New subdomain".into(),
                description: "`api.example.com`".into(),
                color: COLOR_DISCOVERY,
                fields: vec![EmbedField { name: "IP".into(), value: "93.184.216.34".into(), inline: true }],
                footer: EmbedFooter { text: "rucert".into() },
            }],
        };
        let v: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(v["username"], "rucert");
        let embed = &v["embeds"][0];
        assert_eq!(embed["title"], "New subdomain");
        assert!(embed["color"].is_u64());
        assert_eq!(embed["fields"][0]["name"], "IP");
        assert_eq!(embed["fields"][0]["inline"], true);
        assert_eq!(embed["footer"]["text"], "rucert");
    }

    #[tokio::test]
    async fn missing_webhook_is_a_quiet_noop() {
        let n = Notifier::new(&DiscordConfig::default()).unwrap();
        n.notify_discovery("api.example.com", "93.184.216.34", "", &[]).await.unwrap();
        n.log_event("t", "d").await.unwrap();
    }
}
