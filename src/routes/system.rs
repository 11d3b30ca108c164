use rocket::serde::json::Json;
use rocket::{Request, State, catch, get};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::HubError;
use crate::hub::Hub;
use crate::models::{HealthResponse, StatsResponse};
use crate::storage::{AgentFilter, AgentStatusRecord, GroupFilter, MessageFilter};

#[get("/health")]
pub async fn health(hub: &State<Arc<Hub>>) -> Json<HealthResponse> {
    let storage_reachable = hub.storage.ping().await.is_ok();
    Json(HealthResponse {
        status: if storage_reachable { "ok" } else { "degraded" },
        storage_reachable,
    })
}

/// Walks each collection a page at a time rather than adding dedicated
/// count queries to `Storage` — the same scan shape `C8`'s sweeper phases
/// use, just read-only and without a cursor carried between calls.
#[get("/api/stats")]
pub async fn stats(hub: &State<Arc<Hub>>) -> Result<Json<StatsResponse>, HubError> {
    let mut agents_total = 0i64;
    let mut agents_online = 0i64;
    let mut cursor = None;
    loop {
        let page = hub
            .storage
            .list_agents(AgentFilter::default(), crate::storage::MAX_PAGE_SIZE, cursor)
            .await?;
        agents_total += page.items.len() as i64;
        agents_online += page
            .items
            .iter()
            .filter(|a| a.status == AgentStatusRecord::Online)
            .count() as i64;
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    let mut groups_total = 0i64;
    let mut cursor = None;
    loop {
        let page = hub
            .storage
            .list_groups(GroupFilter::default(), crate::storage::MAX_PAGE_SIZE, cursor)
            .await?;
        groups_total += page.items.len() as i64;
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    let mut messages_by_status: HashMap<String, i64> = HashMap::new();
    let mut cursor = None;
    loop {
        let page = hub
            .storage
            .list_messages(MessageFilter::default(), crate::storage::MAX_PAGE_SIZE, cursor)
            .await?;
        for m in &page.items {
            *messages_by_status.entry(m.status.as_str().to_string()).or_insert(0) += 1;
        }
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }

    Ok(Json(StatsResponse {
        agents_online,
        agents_total,
        messages_by_status,
        groups_total,
    }))
}

#[catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": { "code": "NOT_FOUND", "message": "resource not found" }
    }))
}

#[catch(429)]
pub fn too_many_requests(req: &Request) -> Json<serde_json::Value> {
    let retry_after = req
        .headers()
        .get_one("Retry-After")
        .and_then(|v| v.parse::<u64>().ok());
    Json(serde_json::json!({
        "error": { "code": "RATE_LIMITED", "message": "too many requests", "retry_after": retry_after }
    }))
}
