use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::{GroupAccessType, GroupRole, GroupSettings};

/// Internal persisted record for an agent. Distinct from `models::Agent`
/// (the wire view) because this carries the secret-adjacent fields
/// (`public_key_bytes`, `previous_public_key`) that never leave the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub capabilities: Vec<String>,
    pub public_key: Vec<u8>,
    pub key_version: u32,
    pub previous_public_key: Option<(Vec<u8>, DateTime<Utc>)>,
    pub api_key: String,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub status: AgentStatusRecord,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub tombstoned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatusRecord {
    Online,
    Offline,
    Deregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Delivered,
    Leased,
    Acked,
    Nacked,
    Expired,
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Leased => "leased",
            MessageStatus::Acked => "acked",
            MessageStatus::Nacked => "nacked",
            MessageStatus::Expired => "expired",
            MessageStatus::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "delivered" => MessageStatus::Delivered,
            "leased" => MessageStatus::Leased,
            "acked" => MessageStatus::Acked,
            "nacked" => MessageStatus::Nacked,
            "expired" => MessageStatus::Expired,
            "dead" => MessageStatus::Dead,
            _ => MessageStatus::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Acked | MessageStatus::Expired | MessageStatus::Dead
        )
    }
}

/// Internal per-recipient row (spec §3 "Message State") plus a copy of the
/// wire envelope fields needed to reconstruct it on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub version: String,
    pub msg_type: String,
    pub from: String,
    pub to: Option<String>,
    pub group: Option<String>,
    pub subject: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub idempotency_key: Option<String>,
    pub body: Option<serde_json::Value>,
    pub ttl_sec: i64,
    pub timestamp: DateTime<Utc>,
    pub members_snapshot: Option<Vec<String>>,
    pub ephemeral_ttl_sec: Option<i64>,

    pub status: MessageStatus,
    pub leased_until: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
    pub last_error: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub body_purged_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub ack_result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub name: String,
    pub access_type: GroupAccessType,
    pub join_key_hash: Option<String>,
    pub settings: GroupSettings,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberRecord {
    pub group_id: String,
    pub agent_id: String,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJobRecord {
    pub job_id: String,
    pub message_id: String,
    pub agent_id: String,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub terminal: bool,
    pub dead_lettered: bool,
    pub created_at: DateTime<Utc>,
}

/// What to match on when scanning a collection. Individual fields are
/// combined with AND; `None` means "don't filter on this".
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub to: Option<String>,
    pub group: Option<String>,
    pub status_in: Option<Vec<MessageStatus>>,
    pub not_body_purged: bool,
    pub leased_before: Option<DateTime<Utc>>,
    pub expires_before: Option<DateTime<Utc>>,
    pub terminal_before: Option<DateTime<Utc>>,
    pub ephemeral_due_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub capability: Option<String>,
    pub heartbeat_before: Option<DateTime<Utc>>,
    pub status: Option<AgentStatusRecord>,
    pub exclude_tombstoned: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub creator: Option<String>,
}

/// Page of results plus an opaque cursor for continuing the scan. `None`
/// means the scan reached the end of the collection.
#[derive(Debug, Clone, Serialize)]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> ListPage<T> {
    pub fn empty() -> Self {
        ListPage {
            items: Vec::new(),
            next_cursor: None,
        }
    }
}

/// Counts keyed by status string, used by C9 stats.
pub type StatusCounts = HashMap<String, i64>;
