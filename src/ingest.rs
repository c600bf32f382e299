use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::JobSender;

/// Reconnect delays in seconds, clamped at the last entry. Reset on a
/// successful handshake.
const BACKOFF_SECS: [u64; 5] = [1, 2, 5, 10, 30];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("websocket transport error: {0}")]
    Transport(String),
}

/// The two frame shapes the upstream emits: a bare domain list, or the
/// full certificate update carrying the list under `leaf_cert`.
#[derive(Deserialize, Debug)]
struct Frame {
    data: FrameData,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum FrameData {
    Domains(Vec<String>),
    Full { leaf_cert: LeafCert },
}

#[derive(Deserialize, Debug)]
struct LeafCert {
    all_domains: Vec<String>,
}

fn parse_frame(text: &str) -> Result<Vec<String>, serde_json::Error> {
    let frame: Frame = serde_json::from_str(text)?;
    Ok(match frame.data {
        FrameData::Domains(domains) => domains,
        FrameData::Full { leaf_cert } => leaf_cert.all_domains,
    })
}

fn backoff_delay(attempt: usize) -> Duration {
    let idx = attempt.min(BACKOFF_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SECS[idx])
}

/// Certstream reader: connect, stream frames into the worker queue,
/// reconnect forever until cancelled. No acking and no replay; the
/// deduplicator and the unique constraint absorb upstream duplicates.
pub struct IngestClient {
    url: String,
    sender: JobSender,
}

impl IngestClient {
    pub fn new(url: String, sender: JobSender) -> Self {
        Self { url, sender }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut attempt: usize = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match connect_async(self.url.as_str()).await {
                Ok((ws, _resp)) => {
                    info!(url = %self.url, "certstream connected");
                    attempt = 0;
                    match self.read_loop(ws, &cancel).await {
                        Ok(()) => info!("certstream closed, reconnecting"),
                        Err(e) => warn!("certstream dropped: {}", e),
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, "certstream connect failed: {}", e);
                }
            }
            if cancel.is_cancelled() {
                break;
            }
            let delay = backoff_delay(attempt);
            attempt += 1;
            debug!(delay_secs = delay.as_secs(), attempt, "waiting before reconnect");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("certstream reader stopped");
    }

    async fn read_loop(
        &self,
        mut ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                frame = ws.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    // A malformed frame never tears the connection down.
                    match parse_frame(&text) {
                        Ok(domains) => {
                            for name in domains {
                                self.sender.submit(name).await;
                            }
                        }
                        Err(e) => {
                            debug!("unparseable certstream frame, skipping: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws.send(Message::Pong(payload))
                        .await
                        .map_err(|e| IngestError::Transport(e.to_string()))?;
                }
                Some(Ok(Message::Close(frame))) => {
                    if let Some(cf) = frame {
                        info!(code = %cf.code, reason = %cf.reason, "certstream close frame");
                    }
                    return Ok(());
                }
                Some(Ok(_)) => {
                    // Binary, Pong, raw frames: nothing to do.
                }
                Some(Err(e)) => return Err(IngestError::Transport(e.to_string())),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_domains_only_variant() {
        let text = r#"{"data": ["api.example.com", "www.example.com"]}"#;
        assert_eq!(parse_frame(text).unwrap(), vec!["api.example.com", "www.example.com"]);
    }

    #[test]
    fn parses_full_variant() {
        let text = r#"{
            "data": {
                "leaf_cert": {
                    "all_domains": ["*.example.com", "example.com"],
                    "fingerprint": "AA:BB"
                },
                "cert_index": 12345
            }
        }"#;
        assert_eq!(parse_frame(text).unwrap(), vec!["*.example.com", "example.com"]);
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(parse_frame("not json").is_err());
        assert!(parse_frame(r#"{"data": 42}"#).is_err());
        assert!(parse_frame(r#"{"data": {"leaf_cert": {}}}"#).is_err());
        assert!(parse_frame(r#"{"message": "heartbeat"}"#).is_err());
    }

    #[test]
    fn empty_domain_list_is_valid() {
        assert!(parse_frame(r#"{"data": []}"#).unwrap().is_empty());
    }

    #[test]
    fn backoff_follows_the_sequence_and_clamps() {
        let secs: Vec<u64> = (0..8).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 5, 10, 30, 30, 30, 30]);
    }
}
