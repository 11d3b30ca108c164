use serde::{Deserialize, Serialize};

// --- Agents (wire) ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub public_key: String, // hex-encoded
    pub key_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub status: AgentStatus,
    pub last_heartbeat: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Deregistered,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAgent {
    pub name: String,
    /// Desired `agent_id` (e.g. `agent://alice`). If omitted, derived from
    /// `name`. Collisions with a live or tombstoned id return
    /// `AGENT_ALREADY_EXISTS`.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Hex-encoded Ed25519 public key. If omitted, the registry generates a
    /// keypair server-side and returns the secret key once.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub agent_id: String,
    pub public_key: String,
    /// Present only when the registry generated the keypair. Never stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub api_key: String,
}

#[derive(Debug, Serialize)]
pub struct RotateKeyResponse {
    pub agent_id: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    pub key_version: u32,
    pub grace_period_sec: i64,
}

#[derive(Debug, Deserialize)]
pub struct SetWebhook {
    pub url: String,
    pub secret: String,
}

// --- Message envelope (wire) ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub body: serde_json::Value,
    pub ttl_sec: i64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<EnvelopeSignature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<EnvelopeOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members_snapshot: Option<Vec<String>>,
}

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EnvelopeSignature {
    pub alg: String,
    pub kid: String,
    pub sig: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct EnvelopeOptions {
    /// Ephemeral body-purge seconds, independent of `ttl_sec`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

/// Inbound request body for direct send. A subset of `MessageEnvelope`: the
/// server assigns `id` and `timestamp` is validated, not trusted blindly.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub from: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub body: serde_json::Value,
    #[serde(default = "default_ttl")]
    pub ttl_sec: i64,
    #[serde(default)]
    pub options: Option<EnvelopeOptions>,
    #[serde(default)]
    pub signature: Option<EnvelopeSignature>,
}

fn default_ttl() -> i64 {
    86_400
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub id: String,
}

/// On the wire, an empty inbox pull is a `204` with no body (see spec §4.4);
/// this type backs the `410 Gone` purged-body case and the happy path alike.
#[derive(Debug, Serialize)]
pub struct PullResponse {
    #[serde(flatten)]
    pub envelope: MessageEnvelope,
    pub status: String,
    pub delivery_attempts: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub body_purged: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct AckRequest {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct NackRequest {
    #[serde(default)]
    pub requeue: bool,
    #[serde(default)]
    pub extend_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReplyRequest {
    pub body: serde_json::Value,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default = "default_ttl")]
    pub ttl_sec: i64,
}

#[derive(Debug, Serialize)]
pub struct InboxStats {
    pub agent_id: String,
    pub counts: std::collections::HashMap<String, i64>,
}

// --- Groups (wire) ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GroupAccessType {
    Open,
    InviteOnly,
    KeyProtected,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Member,
    Admin,
    Owner,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GroupSettings {
    #[serde(default)]
    pub history_visible: bool,
    #[serde(default)]
    pub max_members: Option<u32>,
    #[serde(default)]
    pub message_ttl_sec: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub access_type: GroupAccessType,
    pub settings: GroupSettings,
    pub members: std::collections::HashMap<String, GroupRole>,
    pub creator: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroup {
    pub name: String,
    pub creator: String,
    #[serde(default = "default_access_type")]
    pub access_type: GroupAccessType,
    #[serde(default)]
    pub join_key: Option<String>,
    #[serde(default)]
    pub settings: GroupSettings,
}

fn default_access_type() -> GroupAccessType {
    GroupAccessType::Open
}

#[derive(Debug, Deserialize)]
pub struct JoinGroup {
    pub agent_id: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InviteMember {
    pub actor: String,
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct GroupPostRequest {
    pub from: String,
    #[serde(rename = "type", default = "default_group_message_type")]
    pub msg_type: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub body: serde_json::Value,
    #[serde(default = "default_ttl")]
    pub ttl_sec: i64,
    #[serde(default)]
    pub options: Option<EnvelopeOptions>,
}

fn default_group_message_type() -> String {
    "group.message".to_string()
}

#[derive(Debug, Serialize)]
pub struct GroupPostResponse {
    pub posted: bool,
    pub recipients: usize,
    pub accepted_async: bool,
}

// --- Stats & health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage_reachable: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub agents_online: i64,
    pub agents_total: i64,
    pub messages_by_status: std::collections::HashMap<String, i64>,
    pub groups_total: i64,
}
