//! Webhook dispatcher: signed, retried, logged lifecycle deliveries.
//!
//! One worker per webhook config keeps deliveries FIFO per endpoint
//! while different endpoints run in parallel. Retries: up to 3 attempts
//! on network errors and 5xx with 1 s / 5 s backoff between them; 4xx is
//! terminal. Every attempt is logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use vox_domain::call::LifecycleEvent;
use vox_domain::webhook::{WebhookConfig, WebhookDelivery};
use vox_store::WebhookStore;

type HmacSha256 = Hmac<Sha256>;

pub const MAX_ATTEMPTS: u32 = 3;
/// Backoff before the 2nd and 3rd attempts (the tail entry only applies
/// if the attempt cap is ever raised).
pub const RETRY_BACKOFF_SECS: [u64; 3] = [1, 5, 15];

const WORKER_QUEUE: usize = 256;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Signing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `sha256=<hex(HMAC-SHA256(secret, raw_body))>`
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification for consumers of our webhooks.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let expected = sign(secret, body);
    expected.as_bytes().ct_eq(header.as_bytes()).into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatcher
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct QueuedDelivery {
    config: WebhookConfig,
    event: String,
    body: Vec<u8>,
}

pub struct WebhookDispatcher {
    store: Arc<WebhookStore>,
    client: reqwest::Client,
    workers: Mutex<HashMap<Uuid, mpsc::Sender<QueuedDelivery>>>,
    backoff: Vec<Duration>,
    max_attempts: u32,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<WebhookStore>) -> Self {
        Self::with_policy(
            store,
            RETRY_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            MAX_ATTEMPTS,
        )
    }

    pub fn with_policy(
        store: Arc<WebhookStore>,
        backoff: Vec<Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            workers: Mutex::new(HashMap::new()),
            backoff,
            max_attempts,
        }
    }

    /// Consume the lifecycle bus and fan deliveries out to per-config
    /// workers. Spawned once at startup.
    pub fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<LifecycleEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => Self::fan_out(&self, &event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "webhook dispatcher lagged the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn fan_out(this: &Arc<Self>, event: &LifecycleEvent) {
        let name = event.name().to_string();
        let payload = serde_json::json!({
            "event": name.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "data": event,
        });
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "webhook payload serialization failed");
                return;
            }
        };

        for config in this.store.matching(&name) {
            Self::enqueue(this, config, name.clone(), body.clone()).await;
        }
    }

    async fn enqueue(this: &Arc<Self>, config: WebhookConfig, event: String, body: Vec<u8>) {
        let id = config.id;
        let sender = {
            let mut workers = this.workers.lock();
            workers
                .entry(id)
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(WORKER_QUEUE);
                    let dispatcher = this.clone();
                    tokio::spawn(dispatcher.worker(rx));
                    tx
                })
                .clone()
        };
        if sender
            .send(QueuedDelivery {
                config,
                event,
                body,
            })
            .await
            .is_err()
        {
            this.workers.lock().remove(&id);
        }
    }

    async fn worker(self: Arc<Self>, mut queue: mpsc::Receiver<QueuedDelivery>) {
        while let Some(delivery) = queue.recv().await {
            self.deliver(delivery).await;
        }
    }

    /// Attempt one delivery with the retry policy; logs every attempt.
    async fn deliver(&self, q: QueuedDelivery) {
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let delay = self
                    .backoff
                    .get((attempt - 2) as usize)
                    .copied()
                    .unwrap_or(Duration::from_secs(15));
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .post(&q.config.url)
                .header("Content-Type", "application/json")
                .header("X-Webhook-Event", &q.event)
                .body(q.body.clone());
            if let Some(secret) = &q.config.secret {
                req = req.header("X-Webhook-Signature", sign(secret, &q.body));
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    self.log(&q, attempt, Some(status), None);
                    if resp.status().is_success() {
                        return;
                    }
                    if status < 500 {
                        tracing::warn!(
                            webhook_id = %q.config.id,
                            status,
                            "webhook rejected, not retrying"
                        );
                        return;
                    }
                }
                Err(e) => {
                    self.log(&q, attempt, None, Some(e.to_string()));
                }
            }
        }
        tracing::warn!(
            webhook_id = %q.config.id,
            event = %q.event,
            attempts = self.max_attempts,
            "webhook delivery exhausted retries"
        );
    }

    fn log(&self, q: &QueuedDelivery, attempt: u32, status_code: Option<u16>, error: Option<String>) {
        self.store.log_delivery(WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: q.config.id,
            event: q.event.clone(),
            attempt,
            status_code,
            error,
            delivered_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vox_store::webhooks::WebhookInput;

    #[test]
    fn signature_matches_reference_vector() {
        let body = br#"{"event":"call.ended","data":{}}"#;
        let sig = sign("s3cret", body);
        assert!(sig.starts_with("sha256="));
        assert!(verify_signature("s3cret", body, &sig));
    }

    #[test]
    fn single_byte_change_fails_verification() {
        let body = b"payload-bytes";
        let sig = sign("s3cret", body);
        let mut tampered = body.to_vec();
        tampered[0] ^= 1;
        assert!(!verify_signature("s3cret", &tampered, &sig));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("s3cret", body, "sha256=deadbeef"));
    }

    #[test]
    fn default_retry_policy_matches_contract() {
        // 3 attempts at relative times {0, 1s, 6s}.
        assert_eq!(MAX_ATTEMPTS, 3);
        assert_eq!(RETRY_BACKOFF_SECS[0], 1);
        assert_eq!(RETRY_BACKOFF_SECS[1], 5);
    }

    async fn spawn_server(status: axum::http::StatusCode, hits: Arc<AtomicU32>) -> String {
        let app = axum::Router::new().route(
            "/hook",
            axum::routing::post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    fn queued(config: WebhookConfig) -> QueuedDelivery {
        QueuedDelivery {
            config,
            event: "call.ended".into(),
            body: br#"{"event":"call.ended"}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn permanently_failing_endpoint_gets_exactly_three_attempts() {
        let hits = Arc::new(AtomicU32::new(0));
        let url = spawn_server(axum::http::StatusCode::INTERNAL_SERVER_ERROR, hits.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WebhookStore::new(dir.path(), 100).unwrap());
        let config = store
            .create(WebhookInput {
                url,
                events: vec![],
                secret: None,
                active: true,
            })
            .unwrap();

        // Zero backoff keeps the test fast; the schedule itself is pinned
        // by `default_retry_policy_matches_contract`.
        let dispatcher =
            WebhookDispatcher::with_policy(store.clone(), vec![Duration::ZERO; 2], 3);
        dispatcher.deliver(queued(config.clone())).await;

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let log = store.deliveries(&config.id, 10);
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|d| d.status_code == Some(500)));
        // Ordinals 1..=3 present.
        let mut attempts: Vec<u32> = log.iter().map(|d| d.attempt).collect();
        attempts.sort_unstable();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn client_error_is_terminal() {
        let hits = Arc::new(AtomicU32::new(0));
        let url = spawn_server(axum::http::StatusCode::GONE, hits.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WebhookStore::new(dir.path(), 100).unwrap());
        let config = store
            .create(WebhookInput {
                url,
                events: vec![],
                secret: None,
                active: true,
            })
            .unwrap();

        let dispatcher =
            WebhookDispatcher::with_policy(store.clone(), vec![Duration::ZERO; 2], 3);
        dispatcher.deliver(queued(config.clone())).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(store.deliveries(&config.id, 10).len(), 1);
    }

    #[tokio::test]
    async fn success_stops_after_first_attempt() {
        let hits = Arc::new(AtomicU32::new(0));
        let url = spawn_server(axum::http::StatusCode::OK, hits.clone()).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(WebhookStore::new(dir.path(), 100).unwrap());
        let config = store
            .create(WebhookInput {
                url,
                events: vec![],
                secret: Some("s3cret".into()),
                active: true,
            })
            .unwrap();

        let dispatcher =
            WebhookDispatcher::with_policy(store.clone(), vec![Duration::ZERO; 2], 3);
        dispatcher.deliver(queued(config.clone())).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let log = store.deliveries(&config.id, 10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status_code, Some(200));
        assert_eq!(log[0].error, None);
    }
}
