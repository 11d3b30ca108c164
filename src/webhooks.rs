//! Webhook Dispatcher (C7). Delivers a signed POST to an agent's configured
//! webhook URL whenever a message lands in its inbox, with exponential
//! backoff and a dead-letter list on exhaustion (spec §4.7).
//!
//! Unlike the teacher's fire-and-forget `tokio::spawn` per chat event, a
//! delivery here is queued into the `webhook_queue` storage collection
//! first (so `next_attempt_at` survives a dispatcher restart) and a polling
//! worker loop claims due jobs, in the same spirit as `retention.rs`'s
//! sweep loop. HMAC signing reuses the teacher's `hmac`/`sha2`/`hex` stack.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::error::HubResult;
use crate::hub::Hub;
use crate::inbox;
use crate::storage::WebhookJobRecord;

type HmacSha256 = Hmac<Sha256>;

const INITIAL_BACKOFF_SEC: i64 = 5;
const MAX_BACKOFF_SEC: i64 = 600;
const POLL_INTERVAL_MS: u64 = 1_000;

/// Appends a job to the durable queue for `message_id` addressed to
/// `recipient`. Called by the inbox engine right after a send/fanout when
/// the recipient has a webhook configured.
pub async fn enqueue(hub: &Hub, message_id: &str, recipient: &str) -> HubResult<()> {
    let job = WebhookJobRecord {
        job_id: uuid::Uuid::new_v4().to_string(),
        message_id: message_id.to_string(),
        agent_id: recipient.to_string(),
        attempt_count: 0,
        next_attempt_at: Utc::now(),
        last_status_code: None,
        last_error: None,
        terminal: false,
        dead_lettered: false,
        created_at: Utc::now(),
    };
    hub.storage.put_webhook_job(job).await?;
    Ok(())
}

/// Spawns the dispatcher's polling loop. Mirrors `retention::spawn_sweeper`:
/// an initial startup delay, then a fixed-interval poll for due jobs.
pub fn spawn_dispatcher(hub: Arc<Hub>) {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .expect("failed to build webhook http client");

        tokio::time::sleep(StdDuration::from_secs(2)).await;

        loop {
            match try_deliver_one(&hub, &client).await {
                Ok(true) => continue, // a job was due; look for another right away
                Ok(false) => tokio::time::sleep(StdDuration::from_millis(POLL_INTERVAL_MS)).await,
                Err(e) => {
                    eprintln!("⚠️ webhook dispatcher error: {e}");
                    tokio::time::sleep(StdDuration::from_millis(POLL_INTERVAL_MS)).await;
                }
            }
        }
    });
}

/// Claims and attempts one due job. Returns `Ok(true)` if a job was found
/// (delivered or rescheduled), `Ok(false)` if the queue is empty right now.
async fn try_deliver_one(hub: &Hub, client: &reqwest::Client) -> HubResult<bool> {
    let Some(job) = hub.storage.claim_webhook_job(Utc::now()).await? else {
        return Ok(false);
    };

    let outcome = deliver(hub, client, &job).await;
    let mut job = job;
    job.attempt_count += 1;

    match outcome {
        DeliveryOutcome::Success(status) => {
            job.last_status_code = Some(status);
            job.last_error = None;
            job.terminal = true;
            hub.storage.delete_webhook_job(&job.job_id).await?;
        }
        DeliveryOutcome::TerminalFailure(status, err) => {
            job.last_status_code = Some(status);
            job.last_error = Some(err);
            job.terminal = true;
            job.dead_lettered = true;
            hub.storage.put_webhook_job(job).await?;
        }
        DeliveryOutcome::Retriable(status, err) => {
            if job.attempt_count >= hub.config.webhook_max_attempts {
                job.terminal = true;
                job.dead_lettered = true;
                job.last_status_code = status;
                job.last_error = Some(err);
                hub.storage.put_webhook_job(job).await?;
            } else {
                job.last_status_code = status;
                job.last_error = Some(err);
                job.next_attempt_at = Utc::now() + chrono::Duration::seconds(backoff_sec(job.attempt_count));
                hub.storage.put_webhook_job(job).await?;
            }
        }
    }

    Ok(true)
}

enum DeliveryOutcome {
    Success(u16),
    /// 4xx other than 408/429: no retry, but not dead-lettered as exhausted —
    /// recorded as a terminal failure on the job itself.
    TerminalFailure(u16, String),
    Retriable(Option<u16>, String),
}

/// Exponential backoff starting at 5s, doubling to a 10-minute cap, with
/// full jitter (spec §4.7).
fn backoff_sec(attempt: u32) -> i64 {
    let exp = INITIAL_BACKOFF_SEC.saturating_mul(1i64 << attempt.min(20));
    let capped = exp.min(MAX_BACKOFF_SEC);
    let jitter = rand::random::<f64>() * capped as f64;
    jitter.max(1.0) as i64
}

async fn deliver(hub: &Hub, client: &reqwest::Client, job: &WebhookJobRecord) -> DeliveryOutcome {
    let Some(message) = (match hub.storage.get_message(&job.message_id).await {
        Ok(m) => m,
        Err(e) => return DeliveryOutcome::Retriable(None, e.to_string()),
    }) else {
        // Message was cleaned up already (e.g. acked and swept); nothing to deliver.
        return DeliveryOutcome::Success(0);
    };

    let agent = match hub.storage.get_agent(&job.agent_id).await {
        Ok(Some(a)) => a,
        Ok(None) => return DeliveryOutcome::TerminalFailure(0, "recipient deregistered".into()),
        Err(e) => return DeliveryOutcome::Retriable(None, e.to_string()),
    };
    let Some(url) = agent.webhook_url.clone() else {
        return DeliveryOutcome::TerminalFailure(0, "webhook removed".into());
    };
    let secret = agent.webhook_secret.clone().unwrap_or_default();

    let envelope = inbox::record_to_envelope(&message);
    let mut payload = serde_json::json!({
        "event": "message.delivered",
        "message_id": message.id,
        "delivered_at": Utc::now().to_rfc3339(),
        "envelope": envelope,
    });

    let canonical = serde_json::to_vec(&payload).unwrap_or_default();
    let signature = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(&canonical);
            hex::encode(mac.finalize().into_bytes())
        }
        Err(_) => String::new(),
    };
    payload["signature"] = serde_json::Value::String(signature.clone());

    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("X-Admp-Signature", format!("sha256={signature}"))
        .json(&payload)
        .send()
        .await;

    match resp {
        Ok(r) => {
            let status = r.status();
            if status.is_success() {
                DeliveryOutcome::Success(status.as_u16())
            } else if status.as_u16() == 408 || status.as_u16() == 429 {
                DeliveryOutcome::Retriable(Some(status.as_u16()), format!("http {status}"))
            } else if status.is_client_error() {
                DeliveryOutcome::TerminalFailure(status.as_u16(), format!("http {status}"))
            } else {
                DeliveryOutcome::Retriable(Some(status.as_u16()), format!("http {status}"))
            }
        }
        Err(e) => DeliveryOutcome::Retriable(None, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        // jitter is randomized, so just check the ceiling grows then caps
        for attempt in 0..10 {
            let b = backoff_sec(attempt);
            assert!(b >= 1 && b <= MAX_BACKOFF_SEC);
        }
    }
}
