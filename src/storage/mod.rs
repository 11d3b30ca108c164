pub mod external;
pub mod memory;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use types::{
    AgentFilter, AgentRecord, AgentStatusRecord, GroupFilter, GroupMemberRecord, GroupRecord,
    ListPage, MessageFilter, MessageRecord, MessageStatus, StatusCounts, WebhookJobRecord,
};

pub const MAX_PAGE_SIZE: usize = 1000;

/// Errors raised by a storage backend. Transient I/O maps to
/// `HubError::StorageUnavailable`; uniqueness violations map to `Conflict`
/// (see spec §4.1).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found")]
    NotFound,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Uniform capability interface over the hub's five collections (spec
/// §4.1): `agents`, `messages`, `groups`, `group_members`, `webhook_queue`.
/// Two backends implement it: `memory::MemoryStore` (rusqlite, wiped on
/// restart) and `external::ExternalStore` (JSON-over-HTTP document store).
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>>;
    async fn put_agent(&self, record: AgentRecord) -> StorageResult<()>;
    async fn delete_agent_cascade(&self, agent_id: &str) -> StorageResult<()>;
    async fn list_agents(
        &self,
        filter: AgentFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<AgentRecord>>;

    async fn get_message(&self, id: &str) -> StorageResult<Option<MessageRecord>>;
    async fn put_message(&self, record: MessageRecord) -> StorageResult<()>;
    async fn delete_message(&self, id: &str) -> StorageResult<()>;
    async fn list_messages(
        &self,
        filter: MessageFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<MessageRecord>>;

    /// Atomic `queued|delivered -> leased` transition for the oldest
    /// eligible message addressed to `recipient` (FIFO by `inserted_at`,
    /// ties broken by `id`). Returns `None` when the inbox has nothing
    /// claimable.
    async fn claim_message(
        &self,
        recipient: &str,
        lease_sec: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<MessageRecord>>;

    async fn find_by_idempotency(
        &self,
        from: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<MessageRecord>>;

    async fn message_status_counts(&self, recipient: &str) -> StorageResult<StatusCounts>;

    async fn get_group(&self, group_id: &str) -> StorageResult<Option<GroupRecord>>;
    async fn put_group(&self, record: GroupRecord) -> StorageResult<()>;
    async fn delete_group(&self, group_id: &str) -> StorageResult<()>;
    async fn list_groups(
        &self,
        filter: GroupFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<GroupRecord>>;

    async fn get_member(
        &self,
        group_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<GroupMemberRecord>>;
    async fn put_member(&self, record: GroupMemberRecord) -> StorageResult<()>;
    async fn delete_member(&self, group_id: &str, agent_id: &str) -> StorageResult<()>;
    async fn list_members(&self, group_id: &str) -> StorageResult<Vec<GroupMemberRecord>>;

    async fn put_webhook_job(&self, record: WebhookJobRecord) -> StorageResult<()>;
    async fn delete_webhook_job(&self, job_id: &str) -> StorageResult<()>;
    /// Claims (and returns) the earliest due, non-terminal job, if any, and
    /// bumps nothing yet — the dispatcher re-`put_webhook_job`s after its
    /// own attempt to record the outcome.
    async fn claim_webhook_job(&self, now: DateTime<Utc>) -> StorageResult<Option<WebhookJobRecord>>;
    async fn list_dead_letters(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<WebhookJobRecord>>;

    /// Best-effort liveness check used by C9 health.
    async fn ping(&self) -> StorageResult<()>;
}
