//! Sweeper Loop (C8). A single periodic task that walks storage and
//! enforces lease, TTL, cleanup, ephemeral-purge, and heartbeat invariants
//! (spec §4.8), in that order. Structured the way the teacher's retention
//! sweep is: a `spawn_sweeper` function owning one `tokio::spawn` loop with
//! a startup delay, and a pure `run_sweep(&Hub) -> SweepReport` used both by
//! the loop and by the ops `POST /inbox/reclaim` endpoint and tests.

use std::sync::Arc;

use crate::hub::Hub;
use crate::storage::{AgentFilter, AgentStatusRecord, MessageFilter, MessageStatus};

/// Result of one sweep pass across all five phases. Mirrors the teacher's
/// `RetentionResult` shape.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub reclaimed: i64,
    pub dead_lettered_leases: i64,
    pub expired: i64,
    pub cleaned_up: i64,
    pub ephemeral_purged: i64,
    pub agents_marked_offline: i64,
}

/// Spawns the sweeper's polling loop at `cleanup_interval_ms` (default
/// 60s, spec §6 `CLEANUP_INTERVAL_MS`). Failures in a phase are logged and
/// the loop continues with the next phase/tick; the sweeper never aborts
/// (spec §7).
pub fn spawn_sweeper(hub: Arc<Hub>) {
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        loop {
            let report = run_sweep(&hub).await;
            if report.reclaimed > 0
                || report.expired > 0
                || report.cleaned_up > 0
                || report.ephemeral_purged > 0
                || report.agents_marked_offline > 0
            {
                eprintln!(
                    "🧹 sweep: reclaimed={} dead_leases={} expired={} cleaned={} purged={} offline={}",
                    report.reclaimed,
                    report.dead_lettered_leases,
                    report.expired,
                    report.cleaned_up,
                    report.ephemeral_purged,
                    report.agents_marked_offline
                );
            }
            tokio::time::sleep(std::time::Duration::from_millis(hub.config.cleanup_interval_ms)).await;
        }
    });
}

/// Runs one full sweep pass (all five phases, in spec order). Each phase
/// pages at `storage::MAX_PAGE_SIZE` and only processes what's returned
/// this tick — if a phase's `ListPage` comes back with a `next_cursor`, the
/// remainder is picked up on the next tick (spec §9 Open Question: no
/// same-tick retry loop).
pub async fn run_sweep(hub: &Hub) -> SweepReport {
    let mut report = SweepReport::default();
    let now = chrono::Utc::now();

    reclaim_leases(hub, now, &mut report).await;
    expire_messages(hub, now, &mut report).await;
    cleanup_terminal(hub, now, &mut report).await;
    purge_ephemeral_bodies(hub, now, &mut report).await;
    mark_heartbeat_timeouts(hub, now, &mut report).await;

    report
}

/// Phase 1: lease reclamation. Any `leased` message whose `leased_until`
/// has passed reverts to `queued`, retaining its original `inserted_at` so
/// it doesn't jump ahead of newer arrivals (spec §4.4 fairness policy).
/// Past `max_delivery_attempts` reclaims, the message is marked `dead`
/// instead and excluded from future pulls.
async fn reclaim_leases(hub: &Hub, now: chrono::DateTime<chrono::Utc>, report: &mut SweepReport) {
    let page = match hub
        .storage
        .list_messages(
            MessageFilter {
                status_in: Some(vec![MessageStatus::Leased]),
                leased_before: Some(now),
                ..Default::default()
            },
            crate::storage::MAX_PAGE_SIZE,
            None,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("⚠️ sweeper: lease reclamation scan failed: {e}");
            return;
        }
    };

    for mut record in page.items {
        if record.delivery_attempts >= hub.config.max_delivery_attempts {
            record.status = MessageStatus::Dead;
            record.leased_until = None;
            record.terminal_at = Some(now);
            report.dead_lettered_leases += 1;
        } else {
            record.status = MessageStatus::Queued;
            record.leased_until = None;
            report.reclaimed += 1;
        }
        if let Err(e) = hub.storage.put_message(record).await {
            eprintln!("⚠️ sweeper: failed to persist reclaimed message: {e}");
        }
    }
}

/// Phase 2: expiration. Any non-terminal message past `expires_at`
/// transitions to `expired`.
async fn expire_messages(hub: &Hub, now: chrono::DateTime<chrono::Utc>, report: &mut SweepReport) {
    let page = match hub
        .storage
        .list_messages(
            MessageFilter {
                status_in: Some(vec![
                    MessageStatus::Queued,
                    MessageStatus::Delivered,
                    MessageStatus::Leased,
                    MessageStatus::Nacked,
                ]),
                expires_before: Some(now),
                ..Default::default()
            },
            crate::storage::MAX_PAGE_SIZE,
            None,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("⚠️ sweeper: expiration scan failed: {e}");
            return;
        }
    };

    for mut record in page.items {
        record.status = MessageStatus::Expired;
        record.leased_until = None;
        record.terminal_at = Some(now);
        if let Err(e) = hub.storage.put_message(record).await {
            eprintln!("⚠️ sweeper: failed to persist expired message: {e}");
        } else {
            report.expired += 1;
        }
    }
}

/// Phase 3: cleanup. Hard-deletes messages whose terminal-state transition
/// is older than the 1-hour retention floor (spec §4.8).
async fn cleanup_terminal(hub: &Hub, now: chrono::DateTime<chrono::Utc>, report: &mut SweepReport) {
    let floor = now - chrono::Duration::hours(1);
    let page = match hub
        .storage
        .list_messages(
            MessageFilter {
                status_in: Some(vec![MessageStatus::Acked, MessageStatus::Expired, MessageStatus::Dead]),
                terminal_before: Some(floor),
                ..Default::default()
            },
            crate::storage::MAX_PAGE_SIZE,
            None,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("⚠️ sweeper: cleanup scan failed: {e}");
            return;
        }
    };

    for record in page.items {
        if let Err(e) = hub.storage.delete_message(&record.id).await {
            eprintln!("⚠️ sweeper: failed to delete terminal message {}: {e}", record.id);
        } else {
            report.cleaned_up += 1;
        }
    }
}

/// Phase 4: ephemeral purge. Clears `body` for any message whose
/// `options.ttl` has elapsed but whose body hasn't been purged yet.
/// Purging never un-acks a message (spec §4.6 invariant) — only `body` is
/// touched.
async fn purge_ephemeral_bodies(hub: &Hub, now: chrono::DateTime<chrono::Utc>, report: &mut SweepReport) {
    let page = match hub
        .storage
        .list_messages(
            MessageFilter {
                ephemeral_due_before: Some(now),
                ..Default::default()
            },
            crate::storage::MAX_PAGE_SIZE,
            None,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("⚠️ sweeper: ephemeral purge scan failed: {e}");
            return;
        }
    };

    for mut record in page.items {
        record.body = None;
        record.body_purged_at = Some(now);
        if let Err(e) = hub.storage.put_message(record).await {
            eprintln!("⚠️ sweeper: failed to persist purged body: {e}");
        } else {
            report.ephemeral_purged += 1;
        }
    }
}

/// Phase 5: heartbeat check. Agents whose `last_heartbeat` is older than
/// `heartbeat_timeout_sec` flip to `offline`.
async fn mark_heartbeat_timeouts(hub: &Hub, now: chrono::DateTime<chrono::Utc>, report: &mut SweepReport) {
    let cutoff = now - chrono::Duration::seconds(hub.config.heartbeat_timeout_sec);
    let page = match hub
        .storage
        .list_agents(
            AgentFilter {
                status: Some(AgentStatusRecord::Online),
                heartbeat_before: Some(cutoff),
                exclude_tombstoned: true,
                ..Default::default()
            },
            crate::storage::MAX_PAGE_SIZE,
            None,
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            eprintln!("⚠️ sweeper: heartbeat scan failed: {e}");
            return;
        }
    };

    for mut record in page.items {
        record.status = AgentStatusRecord::Offline;
        if let Err(e) = hub.storage.put_agent(record).await {
            eprintln!("⚠️ sweeper: failed to persist offline agent: {e}");
        } else {
            report.agents_marked_offline += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox;
    use crate::models::{AckRequest, RegisterAgent, SendMessageRequest};
    use crate::registry;

    async fn register(hub: &Hub, name: &str) -> String {
        registry::register(
            hub,
            RegisterAgent {
                name: name.to_string(),
                agent_id: None,
                capabilities: vec![],
                public_key: None,
                webhook_url: None,
                webhook_secret: None,
            },
        )
        .await
        .unwrap()
        .agent_id
    }

    #[tokio::test]
    async fn reclaims_expired_lease_and_keeps_fifo_order() {
        let hub = Hub::new_for_test();
        let a = register(&hub, "sweep-alice").await;
        let b = register(&hub, "sweep-bob").await;

        let req = |n: i64| SendMessageRequest {
            version: "1.0".into(),
            msg_type: "task.request".into(),
            from: a.clone(),
            subject: None,
            correlation_id: None,
            idempotency_key: None,
            body: serde_json::json!({"n": n}),
            ttl_sec: 3600,
            options: None,
            signature: None,
        };
        inbox::send(&hub, &b, req(1)).await.unwrap();
        inbox::send(&hub, &b, req(2)).await.unwrap();

        let pulled = inbox::pull(&hub, &b, Some(1)).await.unwrap().unwrap();
        assert_eq!(pulled.envelope.body["n"], 1);

        // Force the lease into the past without waiting out the real clock.
        let mut record = hub.storage.get_message(&pulled.envelope.id).await.unwrap().unwrap();
        record.leased_until = Some(chrono::Utc::now() - chrono::Duration::seconds(5));
        hub.storage.put_message(record).await.unwrap();

        let report = run_sweep(&hub).await;
        assert_eq!(report.reclaimed, 1);

        let repulled = inbox::pull(&hub, &b, None).await.unwrap().unwrap();
        assert_eq!(repulled.envelope.body["n"], 1);
        assert_eq!(repulled.delivery_attempts, 2);

        inbox::ack(&hub, &b, &repulled.envelope.id, AckRequest { result: None })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn purges_ephemeral_body_past_ttl() {
        let hub = Hub::new_for_test();
        let a = register(&hub, "sweep-eph-a").await;
        let b = register(&hub, "sweep-eph-b").await;

        let req = SendMessageRequest {
            version: "1.0".into(),
            msg_type: "event".into(),
            from: a,
            subject: None,
            correlation_id: None,
            idempotency_key: None,
            body: serde_json::json!({"secret": true}),
            ttl_sec: 3600,
            options: Some(crate::models::EnvelopeOptions { ttl: Some(1) }),
            signature: None,
        };
        let sent = inbox::send(&hub, &b, req).await.unwrap();

        let mut record = hub.storage.get_message(&sent.id).await.unwrap().unwrap();
        record.inserted_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        hub.storage.put_message(record).await.unwrap();

        let report = run_sweep(&hub).await;
        assert_eq!(report.ephemeral_purged, 1);

        let pulled = inbox::pull(&hub, &b, None).await.unwrap().unwrap();
        assert!(pulled.body_purged);
        assert!(pulled.envelope.body.is_null());
    }

    #[tokio::test]
    async fn marks_stale_heartbeat_offline() {
        let hub = Hub::new_for_test();
        let a = register(&hub, "sweep-hb").await;
        registry::heartbeat(&hub, &a).await.unwrap();

        let mut record = hub.storage.get_agent(&a).await.unwrap().unwrap();
        record.last_heartbeat = Some(chrono::Utc::now() - chrono::Duration::seconds(10_000));
        hub.storage.put_agent(record).await.unwrap();

        let report = run_sweep(&hub).await;
        assert_eq!(report.agents_marked_offline, 1);

        let agent = registry::get(&hub, &a).await.unwrap();
        assert_eq!(agent.status, crate::models::AgentStatus::Offline);
    }
}
