// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Outbound webhook traffic: fire-and-forget pushes of new inbound updates,
//! and the bounded-time chat-responder round trip used for non-command text.
//!
//! Push failures are logged and swallowed; they never block message storage
//! or dispatch. Concurrency is capped by a semaphore so a slow target cannot
//! pile up unbounded in-flight requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use satchel_config::model::WebhookConfig;
use satchel_core::{Message, Update};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Reply used when the chat responder times out or errors.
const CHAT_FALLBACK: &str = "The chat responder is unavailable right now.";

/// Counters surfaced by the status endpoint.
#[derive(Debug, Default)]
pub struct WebhookCounters {
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

/// Pushes new inbound updates to the configured target.
///
/// The push target is swappable at runtime (the setWebhook surface), so it
/// sits behind a lock while the rest of the dispatcher stays shareable.
pub struct WebhookDispatcher {
    http: reqwest::Client,
    push_url: std::sync::RwLock<Option<String>>,
    push_timeout: Duration,
    permits: Arc<Semaphore>,
    counters: Arc<WebhookCounters>,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            push_url: std::sync::RwLock::new(
                config.push_url.clone().filter(|u| !u.is_empty()),
            ),
            push_timeout: Duration::from_secs(config.push_timeout_secs),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            counters: Arc::new(WebhookCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<WebhookCounters> {
        self.counters.clone()
    }

    pub fn configured(&self) -> bool {
        self.push_url().is_some()
    }

    /// Replace the push target at runtime (setWebhook/deleteWebhook surface).
    pub fn set_push_url(&self, url: Option<String>) {
        if let Ok(mut slot) = self.push_url.write() {
            *slot = url.filter(|u| !u.is_empty());
        }
    }

    pub fn push_url(&self) -> Option<String> {
        self.push_url.read().ok().and_then(|slot| slot.clone())
    }

    /// Fire-and-forget push of one update. Returns immediately; delivery
    /// happens on a background task bounded by the in-flight cap.
    pub fn push_update(&self, update: &Update) {
        let Some(url) = self.push_url() else {
            return;
        };
        let payload = push_payload(update);
        let http = self.http.clone();
        let timeout = self.push_timeout;
        let permits = self.permits.clone();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            let result = http
                .post(&url)
                .json(&payload)
                .timeout(timeout)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(status = resp.status().as_u16(), "webhook push delivered");
                }
                Ok(resp) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(status = resp.status().as_u16(), "webhook push rejected");
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "webhook push failed");
                }
            }
        });
    }
}

/// The push payload shape consumed by webhook targets.
fn push_payload(update: &Update) -> serde_json::Value {
    let msg = &update.message;
    serde_json::json!({
        "update_id": update.update_id,
        "message": {
            "message_id": msg.id,
            "date": msg.created_at,
            "text": satchel_security::redact(&msg.text),
            "type": msg.kind_str(),
            "document": msg.attachment.as_ref().map(|a| serde_json::json!({
                "file_name": a.file_name,
                "file_path": a.stored_path,
                "file_size": a.size,
            })),
        },
    })
}

/// Bounded-time round trip to the chat-responder target.
pub struct ChatResponder {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    server_label: String,
}

impl ChatResponder {
    /// Returns `None` when no chat target is configured.
    pub fn from_config(config: &WebhookConfig, server_label: &str) -> Option<Self> {
        let url = config.chat_url.clone()?;
        if url.is_empty() {
            return None;
        }
        Some(Self {
            http: reqwest::Client::new(),
            url,
            timeout: Duration::from_secs(config.chat_timeout_secs),
            server_label: server_label.to_string(),
        })
    }

    /// Ask the responder for a reply to `text`. Always returns something to
    /// say; timeouts and errors produce the fallback message, never silence.
    pub async fn reply(&self, text: &str, source: &Message) -> String {
        let payload = serde_json::json!({
            "message": text,
            "from": source.id,
            "timestamp": chrono::Utc::now().timestamp(),
            "server": self.server_label,
        });

        let result = self
            .http
            .post(&self.url)
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await;

        let resp = match result {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "chat responder rejected request");
                return CHAT_FALLBACK.to_string();
            }
            Err(e) => {
                warn!(error = %e, "chat responder unreachable");
                return CHAT_FALLBACK.to_string();
            }
        };

        match resp.json::<serde_json::Value>().await {
            Ok(body) => body
                .get("reply")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| CHAT_FALLBACK.to_string()),
            Err(e) => {
                warn!(error = %e, "chat responder returned non-JSON body");
                CHAT_FALLBACK.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_core::{Direction, Message};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message(id: i64, text: &str) -> Message {
        Message {
            id,
            remote_id: None,
            direction: Direction::Inbound,
            text: text.to_string(),
            attachment: None,
            reply_to_id: None,
            created_at: 1_700_000_000,
        }
    }

    fn config(push: Option<String>, chat: Option<String>) -> WebhookConfig {
        WebhookConfig {
            push_url: push,
            push_timeout_secs: 2,
            chat_url: chat,
            chat_timeout_secs: 1,
            chat_enabled: true,
            max_in_flight: 4,
        }
    }

    #[tokio::test]
    async fn push_delivers_expected_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({
                "update_id": 7,
                "message": {"message_id": 7, "text": "hello", "type": "text"},
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher =
            WebhookDispatcher::new(&config(Some(format!("{}/hook", server.uri())), None));
        let counters = dispatcher.counters();
        dispatcher.push_update(&Update::from(message(7, "hello")));

        // Delivery is async; wait for the counter.
        for _ in 0..50 {
            if counters.delivered.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(counters.delivered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn push_failure_is_counted_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher =
            WebhookDispatcher::new(&config(Some(format!("{}/hook", server.uri())), None));
        let counters = dispatcher.counters();
        dispatcher.push_update(&Update::from(message(1, "x")));

        for _ in 0..50 {
            if counters.failed.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(counters.failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unconfigured_push_is_a_no_op() {
        let dispatcher = WebhookDispatcher::new(&config(None, None));
        assert!(!dispatcher.configured());
        dispatcher.push_update(&Update::from(message(1, "x")));
    }

    #[tokio::test]
    async fn chat_reply_uses_reply_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "reply": "hi from the responder",
            })))
            .mount(&server)
            .await;

        let responder = ChatResponder::from_config(
            &config(None, Some(format!("{}/chat", server.uri()))),
            "test-server",
        )
        .unwrap();
        let reply = responder.reply("hello", &message(3, "hello")).await;
        assert_eq!(reply, "hi from the responder");
    }

    #[tokio::test]
    async fn chat_timeout_yields_fallback_not_silence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_json(serde_json::json!({"reply": "too late"})),
            )
            .mount(&server)
            .await;

        let responder = ChatResponder::from_config(
            &config(None, Some(format!("{}/chat", server.uri()))),
            "test-server",
        )
        .unwrap();
        let reply = responder.reply("hello", &message(3, "hello")).await;
        assert_eq!(reply, CHAT_FALLBACK);
    }

    #[tokio::test]
    async fn chat_error_status_yields_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let responder = ChatResponder::from_config(
            &config(None, Some(format!("{}/chat", server.uri()))),
            "test-server",
        )
        .unwrap();
        let reply = responder.reply("hello", &message(3, "hello")).await;
        assert_eq!(reply, CHAT_FALLBACK);
    }

    #[test]
    fn missing_chat_url_disables_responder() {
        assert!(ChatResponder::from_config(&config(None, None), "x").is_none());
    }
}
