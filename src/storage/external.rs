use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;

use super::types::{
    AgentFilter, AgentRecord, GroupFilter, GroupMemberRecord, GroupRecord, ListPage,
    MessageFilter, MessageRecord, StatusCounts, WebhookJobRecord,
};
use super::{Storage, StorageError, StorageResult};

/// Storage backend that proxies every operation to an external persistent
/// document store over HTTP, the way the teacher's webhook dispatcher
/// already uses `reqwest` for outbound JSON calls. Each collection from
/// spec §4.1 maps to a path segment; `claim` maps to a dedicated endpoint
/// because the external store, not this crate, implements the
/// compare-and-swap.
pub struct ExternalStore {
    client: Client,
    base_url: String,
    app_id: Option<String>,
    api_key: Option<String>,
}

impl ExternalStore {
    pub fn new(base_url: String, app_id: Option<String>, api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build external store http client");
        ExternalStore {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id,
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        if let Some(app_id) = &self.app_id {
            builder = builder.header("X-App-Id", app_id);
        }
        builder
    }

    async fn get_doc<T: DeserializeOwned>(&self, path: &str) -> StorageResult<Option<T>> {
        let resp = self
            .authed(self.client.get(self.url(path)))
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "external store returned {}",
                resp.status()
            )));
        }
        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn put_doc<T: Serialize + Sync>(&self, path: &str, body: &T) -> StorageResult<()> {
        let resp = self
            .authed(self.client.put(self.url(path)))
            .json(body)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(StorageError::Conflict(path.to_string()));
        }
        if !resp.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "external store returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn delete_doc(&self, path: &str) -> StorageResult<()> {
        let resp = self
            .authed(self.client.delete(self.url(path)))
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(StorageError::Unavailable(format!(
                "external store returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn list_docs<T: DeserializeOwned>(
        &self,
        collection: &str,
        limit: usize,
        cursor: Option<String>,
        extra_query: &[(&str, String)],
    ) -> StorageResult<ListPage<T>> {
        let mut req = self
            .authed(self.client.get(self.url(&format!("/{}", collection))))
            .query(&[("limit", limit.min(super::MAX_PAGE_SIZE).to_string())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        for (k, v) in extra_query {
            req = req.query(&[(*k, v.clone())]);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "external store returned {}",
                resp.status()
            )));
        }
        #[derive(serde::Deserialize)]
        struct Page<U> {
            items: Vec<U>,
            next_cursor: Option<String>,
        }
        let page: Page<T> = resp
            .json()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(ListPage {
            items: page.items,
            next_cursor: page.next_cursor,
        })
    }
}

#[async_trait]
impl Storage for ExternalStore {
    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        self.get_doc(&format!("/agents/{}", agent_id)).await
    }

    async fn put_agent(&self, record: AgentRecord) -> StorageResult<()> {
        self.put_doc(&format!("/agents/{}", record.agent_id), &record)
            .await
    }

    async fn delete_agent_cascade(&self, agent_id: &str) -> StorageResult<()> {
        self.delete_doc(&format!("/agents/{}/cascade", agent_id))
            .await
    }

    async fn list_agents(
        &self,
        filter: AgentFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<AgentRecord>> {
        let mut q = Vec::new();
        if let Some(c) = filter.capability {
            q.push(("capability", c));
        }
        if filter.exclude_tombstoned {
            q.push(("exclude_tombstoned", "true".to_string()));
        }
        self.list_docs("agents", limit, cursor, &q).await
    }

    async fn get_message(&self, id: &str) -> StorageResult<Option<MessageRecord>> {
        self.get_doc(&format!("/messages/{}", id)).await
    }

    async fn put_message(&self, record: MessageRecord) -> StorageResult<()> {
        self.put_doc(&format!("/messages/{}", record.id), &record)
            .await
    }

    async fn delete_message(&self, id: &str) -> StorageResult<()> {
        self.delete_doc(&format!("/messages/{}", id)).await
    }

    async fn list_messages(
        &self,
        filter: MessageFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<MessageRecord>> {
        let mut q = Vec::new();
        if let Some(to) = filter.to {
            q.push(("to", to));
        }
        if let Some(group) = filter.group {
            q.push(("group", group));
        }
        self.list_docs("messages", limit, cursor, &q).await
    }

    async fn claim_message(
        &self,
        recipient: &str,
        lease_sec: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<MessageRecord>> {
        #[derive(Serialize)]
        struct ClaimReq<'a> {
            recipient: &'a str,
            lease_sec: i64,
            now: DateTime<Utc>,
        }
        let resp = self
            .authed(self.client.post(self.url("/messages/claim")))
            .json(&ClaimReq {
                recipient,
                lease_sec,
                now,
            })
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "external store returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map(Some)
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn find_by_idempotency(
        &self,
        from: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<MessageRecord>> {
        self.get_doc(&format!(
            "/idempotency/{}/{}",
            urlencoding_escape(from),
            urlencoding_escape(idempotency_key)
        ))
        .await
    }

    async fn message_status_counts(&self, recipient: &str) -> StorageResult<StatusCounts> {
        self.get_doc(&format!("/messages/{}/status-counts", recipient))
            .await
            .map(|opt| opt.unwrap_or_default())
    }

    async fn get_group(&self, group_id: &str) -> StorageResult<Option<GroupRecord>> {
        self.get_doc(&format!("/groups/{}", group_id)).await
    }

    async fn put_group(&self, record: GroupRecord) -> StorageResult<()> {
        self.put_doc(&format!("/groups/{}", record.id), &record)
            .await
    }

    async fn delete_group(&self, group_id: &str) -> StorageResult<()> {
        self.delete_doc(&format!("/groups/{}", group_id)).await
    }

    async fn list_groups(
        &self,
        filter: GroupFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<GroupRecord>> {
        let mut q = Vec::new();
        if let Some(creator) = filter.creator {
            q.push(("creator", creator));
        }
        self.list_docs("groups", limit, cursor, &q).await
    }

    async fn get_member(
        &self,
        group_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<GroupMemberRecord>> {
        self.get_doc(&format!("/groups/{}/members/{}", group_id, agent_id))
            .await
    }

    async fn put_member(&self, record: GroupMemberRecord) -> StorageResult<()> {
        self.put_doc(
            &format!("/groups/{}/members/{}", record.group_id, record.agent_id),
            &record,
        )
        .await
    }

    async fn delete_member(&self, group_id: &str, agent_id: &str) -> StorageResult<()> {
        self.delete_doc(&format!("/groups/{}/members/{}", group_id, agent_id))
            .await
    }

    async fn list_members(&self, group_id: &str) -> StorageResult<Vec<GroupMemberRecord>> {
        let page: ListPage<GroupMemberRecord> = self
            .list_docs(&format!("groups/{}/members", group_id), super::MAX_PAGE_SIZE, None, &[])
            .await?;
        Ok(page.items)
    }

    async fn put_webhook_job(&self, record: WebhookJobRecord) -> StorageResult<()> {
        self.put_doc(&format!("/webhook_queue/{}", record.job_id), &record)
            .await
    }

    async fn delete_webhook_job(&self, job_id: &str) -> StorageResult<()> {
        self.delete_doc(&format!("/webhook_queue/{}", job_id)).await
    }

    async fn claim_webhook_job(&self, now: DateTime<Utc>) -> StorageResult<Option<WebhookJobRecord>> {
        #[derive(Serialize)]
        struct ClaimReq {
            now: DateTime<Utc>,
        }
        let resp = self
            .authed(self.client.post(self.url("/webhook_queue/claim")))
            .json(&ClaimReq { now })
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StorageError::Unavailable(format!(
                "external store returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map(Some)
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<WebhookJobRecord>> {
        self.list_docs(
            "webhook_queue/dead-letters",
            limit,
            cursor,
            &[],
        )
        .await
    }

    async fn ping(&self) -> StorageResult<()> {
        let resp = self
            .authed(self.client.get(self.url("/health")))
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "external store returned {}",
                resp.status()
            )))
        }
    }
}

fn urlencoding_escape(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}
