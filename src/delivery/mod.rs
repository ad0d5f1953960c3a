//! Outbound event delivery.
//!
//! Fans a domain event out to every matching delivery target and
//! subscription, each on its own task so a slow receiver never stalls
//! the scheduler. Every send is backed by a persisted attempt row, so
//! deliveries interrupted by a crash are resumed on startup. Delivery is
//! at-least-once: a receiver may see the same event twice, never zero
//! times silently.

pub mod guard;

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use opentelemetry::KeyValue;
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::event::DomainEvent;
use crate::model::delivery::{DeliveryAttempt, DeliveryTarget, RetryPolicy, Subscription};
use crate::model::worker::WorkerId;
use crate::telemetry::metrics;
use guard::FloodGuard;

/// Signature header attached to signed deliveries.
pub const SIGNATURE_HEADER: &str = "X-Taskmill-Signature";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_SNIPPET_LEN: usize = 512;

/// A delivery destination, unified over targets and subscriptions.
#[derive(Debug, Clone)]
struct Destination {
    /// Exactly one of these is set, mirroring the attempt row.
    target_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    url: String,
    secret: Option<String>,
    allow_private: bool,
    retry: RetryPolicy,
}

impl Destination {
    fn from_target(t: &DeliveryTarget) -> Self {
        Self {
            target_id: Some(t.id),
            subscription_id: None,
            url: t.url.clone(),
            secret: t.secret.clone(),
            allow_private: t.allow_private,
            retry: t.retry.clone(),
        }
    }

    fn from_subscription(s: &Subscription) -> Self {
        Self {
            target_id: None,
            subscription_id: Some(s.id),
            url: s.url.clone(),
            secret: s.secret.clone(),
            allow_private: s.allow_private,
            retry: RetryPolicy::default(),
        }
    }

    fn flood_key(&self) -> Uuid {
        self.target_id
            .or(self.subscription_id)
            .unwrap_or(Uuid::nil())
    }
}

/// Event fan-out and webhook send machinery.
#[derive(Clone)]
pub struct DeliveryPipeline {
    db: Db,
    client: reqwest::Client,
    flood: Arc<FloodGuard>,
    clock: Arc<dyn Clock>,
}

impl DeliveryPipeline {
    pub fn new(db: Db, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Delivery(format!("failed to build http client: {e}")))?;
        Ok(Self {
            db,
            client,
            flood: Arc::new(FloodGuard::new()),
            clock,
        })
    }

    /// Fan an event out to all matching destinations. Returns once the
    /// fan-out is decided; each send runs on its own task.
    pub async fn emit(&self, event: &DomainEvent) -> Result<()> {
        let mut destinations = Vec::new();

        for target in self.db.targets_for_event(&event.name, event.scope_id).await? {
            if !target.filter.iter().all(|c| c.matches_payload(&event.payload)) {
                debug!(target = %target.id, event = %event.name, "payload filter rejected event");
                continue;
            }
            destinations.push(Destination::from_target(&target));
        }
        for sub in self.db.subscriptions_for_event(&event.name).await? {
            destinations.push(Destination::from_subscription(&sub));
        }

        for dest in destinations {
            if !self.flood.admit(dest.flood_key(), &event.name, self.clock.now()) {
                warn!(
                    destination = %dest.flood_key(),
                    event = %event.name,
                    "destination flooded, dropping event"
                );
                metrics::deliveries().add(1, &[KeyValue::new("result", "flooded")]);
                continue;
            }

            let attempt = self
                .db
                .insert_delivery_attempt(
                    dest.target_id,
                    dest.subscription_id,
                    &event.name,
                    &event.payload,
                )
                .await?;

            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline.run_delivery(dest, attempt).await;
            });
        }
        Ok(())
    }

    /// Resume sends for attempts that were pending or in flight when the
    /// process last stopped.
    pub async fn recover(&self) -> Result<usize> {
        let attempts = self.db.recoverable_delivery_attempts().await?;
        let count = attempts.len();
        for attempt in attempts {
            let dest = match self.destination_for(&attempt).await {
                Ok(dest) => dest,
                Err(e) => {
                    warn!(attempt = %attempt.id, "cannot recover delivery: {e}");
                    let _ = self
                        .db
                        .mark_delivery_failed(attempt.id, &format!("destination unavailable: {e}"))
                        .await;
                    continue;
                }
            };
            let pipeline = self.clone();
            tokio::spawn(async move {
                if let Some(at) = attempt.next_attempt_at {
                    let wait = (at - pipeline.clock.now()).num_seconds().max(0) as u64;
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                pipeline.run_delivery(dest, attempt).await;
            });
        }
        Ok(count)
    }

    /// Operator-initiated replay of a terminally failed attempt. The
    /// replayed payload carries the current worker name when the original
    /// payload names a worker that still exists, so receivers see
    /// up-to-date context rather than a byte-exact copy.
    pub async fn retry_attempt(&self, id: Uuid) -> Result<()> {
        let attempt = self.db.get_delivery_attempt(id).await?;
        let mut payload = attempt.payload.clone();
        if let Some(worker_id) = payload
            .get("worker_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Uuid>().ok())
            && let Ok(worker) = self.db.get_worker(WorkerId(worker_id)).await
            && let Some(map) = payload.as_object_mut()
        {
            map.insert("worker_name".into(), serde_json::Value::String(worker.name));
        }

        if !self.db.reopen_delivery_attempt(id, &payload).await? {
            return Err(Error::Delivery(format!(
                "attempt {id} is not in a failed state"
            )));
        }
        let mut attempt = self.db.get_delivery_attempt(id).await?;
        attempt.payload = payload;
        let dest = self.destination_for(&attempt).await?;
        // Replays run inline so the caller sees the terminal outcome.
        self.run_delivery(dest, attempt).await;
        Ok(())
    }

    async fn destination_for(&self, attempt: &DeliveryAttempt) -> Result<Destination> {
        if let Some(target_id) = attempt.target_id {
            let target = self.db.get_delivery_target(target_id).await?;
            Ok(Destination::from_target(&target))
        } else if let Some(sub_id) = attempt.subscription_id {
            let sub = self.db.get_subscription(sub_id).await?;
            Ok(Destination::from_subscription(&sub))
        } else {
            Err(Error::Delivery(format!(
                "attempt {} has no destination",
                attempt.id
            )))
        }
    }

    /// Drive one attempt to a terminal state: send, retry on failure up
    /// to the destination's budget, record the outcome.
    async fn run_delivery(&self, dest: Destination, attempt: DeliveryAttempt) {
        if !dest.allow_private {
            if let Err(e) = guard::screen_url(&dest.url).await {
                warn!(attempt = %attempt.id, url = %dest.url, "delivery blocked: {e}");
                metrics::deliveries().add(1, &[KeyValue::new("result", "blocked")]);
                if let Err(e) = self.db.mark_delivery_failed(attempt.id, &e.to_string()).await {
                    warn!(attempt = %attempt.id, "failed to record blocked delivery: {e}");
                }
                self.bump_counters(&dest, false).await;
                return;
            }
        }

        loop {
            let attempts = match self.db.begin_delivery_send(attempt.id).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(attempt = %attempt.id, "failed to mark attempt in flight: {e}");
                    return;
                }
            };

            match self.send_once(&dest, &attempt).await {
                Ok(response) => {
                    debug!(attempt = %attempt.id, url = %dest.url, attempts, "delivered");
                    metrics::deliveries().add(1, &[KeyValue::new("result", "delivered")]);
                    if let Err(e) = self.db.mark_delivery_delivered(attempt.id, &response).await {
                        warn!(attempt = %attempt.id, "failed to record delivery: {e}");
                    }
                    self.bump_counters(&dest, true).await;
                    return;
                }
                Err(e) => {
                    let attempts_used = attempts.max(0) as u32;
                    if attempts_used > dest.retry.max_retries {
                        warn!(
                            attempt = %attempt.id,
                            url = %dest.url,
                            attempts,
                            "delivery failed terminally: {e}"
                        );
                        metrics::deliveries().add(1, &[KeyValue::new("result", "failed")]);
                        if let Err(e) = self.db.mark_delivery_failed(attempt.id, &e.to_string()).await
                        {
                            warn!(attempt = %attempt.id, "failed to record delivery failure: {e}");
                        }
                        self.bump_counters(&dest, false).await;
                        return;
                    }

                    let delay = dest.retry.delay_secs(attempts_used);
                    debug!(
                        attempt = %attempt.id,
                        url = %dest.url,
                        attempts,
                        delay_secs = delay,
                        "delivery failed, will retry: {e}"
                    );
                    metrics::deliveries().add(1, &[KeyValue::new("result", "retry")]);
                    let next = self.clock.now() + chrono::Duration::seconds(delay as i64);
                    if let Err(e) = self
                        .db
                        .schedule_delivery_retry(attempt.id, &e.to_string(), next)
                        .await
                    {
                        warn!(attempt = %attempt.id, "failed to schedule retry: {e}");
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }

    async fn send_once(&self, dest: &Destination, attempt: &DeliveryAttempt) -> Result<String> {
        let body = serde_json::to_vec(&attempt.payload)?;
        let mut request = self
            .client
            .post(&dest.url)
            .header("Content-Type", "application/json")
            .header("X-Taskmill-Event", &attempt.event)
            .header("X-Taskmill-Delivery", attempt.id.to_string());
        if let Some(secret) = &dest.secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("request error: {e}")))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Delivery(format!(
                "receiver returned {status}: {}",
                truncate(&text, RESPONSE_SNIPPET_LEN)
            )));
        }
        Ok(truncate(&text, RESPONSE_SNIPPET_LEN))
    }

    async fn bump_counters(&self, dest: &Destination, success: bool) {
        if let Some(target_id) = dest.target_id
            && let Err(e) = self.db.bump_target_counters(target_id, success).await
        {
            warn!(target = %target_id, "failed to bump target counters: {e}");
        }
    }
}

/// HMAC-SHA256 signature over the raw request body, hex-encoded with a
/// scheme prefix so receivers can version-check.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256=");
    for byte in digest {
        let _ = std::fmt::Write::write_fmt(&mut out, format_args!("{byte:02x}"));
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_hex() {
        let sig = sign_payload("topsecret", b"{\"event\":\"work.assigned\"}");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), 7 + 64);
        assert_eq!(sig, sign_payload("topsecret", b"{\"event\":\"work.assigned\"}"));
        assert_ne!(sig, sign_payload("othersecret", b"{\"event\":\"work.assigned\"}"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // Multi-byte char straddling the cut.
        assert_eq!(truncate("héllo", 2), "h");
    }
}
