use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::sync::Mutex;

use super::types::{
    AgentFilter, AgentRecord, AgentStatusRecord, GroupFilter, GroupMemberRecord, GroupRecord,
    ListPage, MessageFilter, MessageRecord, MessageStatus, StatusCounts, WebhookJobRecord,
};
use super::{Storage, StorageError, StorageResult};
use crate::models::{GroupAccessType, GroupRole, GroupSettings};

/// In-memory (or single-file) storage backend. Mirrors the teacher's `Db`:
/// one `rusqlite::Connection` behind a `Mutex`, migrated with idempotent
/// `CREATE TABLE IF NOT EXISTS` statements run once at startup.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

fn opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

impl MemoryStore {
    /// `path` is `:memory:` for the default ephemeral backend or a file path
    /// when a durable single-node deployment is wanted.
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("failed to open sqlite database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .ok();
        let store = MemoryStore {
            conn: Mutex::new(conn),
        };
        store.migrate();
        store
    }

    fn migrate(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS agents (
                agent_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                capabilities TEXT NOT NULL DEFAULT '[]',
                public_key BLOB NOT NULL,
                key_version INTEGER NOT NULL DEFAULT 1,
                previous_public_key BLOB,
                previous_public_key_expires_at TEXT,
                api_key TEXT NOT NULL,
                webhook_url TEXT,
                webhook_secret TEXT,
                status TEXT NOT NULL DEFAULT 'offline',
                last_heartbeat TEXT,
                created_at TEXT NOT NULL,
                tombstoned INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                version TEXT NOT NULL DEFAULT '1.0',
                msg_type TEXT NOT NULL,
                from_agent TEXT NOT NULL,
                to_agent TEXT,
                group_id TEXT,
                subject TEXT,
                correlation_id TEXT,
                reply_to TEXT,
                idempotency_key TEXT,
                body TEXT,
                ttl_sec INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                members_snapshot TEXT,
                ephemeral_ttl_sec INTEGER,
                status TEXT NOT NULL DEFAULT 'queued',
                leased_until TEXT,
                delivery_attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                inserted_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                body_purged_at TEXT,
                terminal_at TEXT,
                ack_result TEXT,
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_agent, status, inserted_at, id);
            CREATE INDEX IF NOT EXISTS idx_messages_seq ON messages(seq);

            CREATE TABLE IF NOT EXISTS idempotency_index (
                from_agent TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                message_id TEXT NOT NULL,
                PRIMARY KEY (from_agent, idempotency_key)
            );

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                access_type TEXT NOT NULL,
                join_key_hash TEXT,
                settings TEXT NOT NULL DEFAULT '{}',
                creator TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                agent_id TEXT NOT NULL,
                role TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (group_id, agent_id)
            );
            CREATE INDEX IF NOT EXISTS idx_group_members_agent ON group_members(agent_id);

            CREATE TABLE IF NOT EXISTS webhook_queue (
                job_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT NOT NULL,
                last_status_code INTEGER,
                last_error TEXT,
                terminal INTEGER NOT NULL DEFAULT 0,
                dead_lettered INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_webhook_queue_due ON webhook_queue(terminal, next_attempt_at);
            ",
        )
        .expect("failed to run storage migrations");
    }

    fn next_seq(conn: &Connection) -> i64 {
        conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM messages", [], |r| {
            r.get(0)
        })
        .unwrap_or(1)
    }
}

fn row_to_agent(row: &Row) -> rusqlite::Result<AgentRecord> {
    let capabilities_json: String = row.get("capabilities")?;
    let prev_key: Option<Vec<u8>> = row.get("previous_public_key")?;
    let prev_key_exp: Option<String> = row.get("previous_public_key_expires_at")?;
    let status: String = row.get("status")?;
    let last_heartbeat: Option<String> = row.get("last_heartbeat")?;
    let created_at: String = row.get("created_at")?;
    let tombstoned: i64 = row.get("tombstoned")?;

    Ok(AgentRecord {
        agent_id: row.get("agent_id")?,
        name: row.get("name")?,
        capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
        public_key: row.get("public_key")?,
        key_version: row.get("key_version")?,
        previous_public_key: match (prev_key, prev_key_exp) {
            (Some(k), Some(exp)) => Some((k, parse_ts(&exp))),
            _ => None,
        },
        api_key: row.get("api_key")?,
        webhook_url: row.get("webhook_url")?,
        webhook_secret: row.get("webhook_secret")?,
        status: match status.as_str() {
            "online" => AgentStatusRecord::Online,
            "deregistered" => AgentStatusRecord::Deregistered,
            _ => AgentStatusRecord::Offline,
        },
        last_heartbeat: opt_ts(last_heartbeat),
        created_at: parse_ts(&created_at),
        tombstoned: tombstoned != 0,
    })
}

fn agent_status_str(s: AgentStatusRecord) -> &'static str {
    match s {
        AgentStatusRecord::Online => "online",
        AgentStatusRecord::Offline => "offline",
        AgentStatusRecord::Deregistered => "deregistered",
    }
}

fn row_to_message(row: &Row) -> rusqlite::Result<MessageRecord> {
    let body_json: Option<String> = row.get("body")?;
    let members_json: Option<String> = row.get("members_snapshot")?;
    let ack_result_json: Option<String> = row.get("ack_result")?;
    let status: String = row.get("status")?;
    let leased_until: Option<String> = row.get("leased_until")?;
    let timestamp: String = row.get("timestamp")?;
    let inserted_at: String = row.get("inserted_at")?;
    let expires_at: String = row.get("expires_at")?;
    let body_purged_at: Option<String> = row.get("body_purged_at")?;
    let terminal_at: Option<String> = row.get("terminal_at")?;

    Ok(MessageRecord {
        id: row.get("id")?,
        version: row.get("version")?,
        msg_type: row.get("msg_type")?,
        from: row.get("from_agent")?,
        to: row.get("to_agent")?,
        group: row.get("group_id")?,
        subject: row.get("subject")?,
        correlation_id: row.get("correlation_id")?,
        reply_to: row.get("reply_to")?,
        idempotency_key: row.get("idempotency_key")?,
        body: body_json.and_then(|s| serde_json::from_str(&s).ok()),
        ttl_sec: row.get("ttl_sec")?,
        timestamp: parse_ts(&timestamp),
        members_snapshot: members_json.and_then(|s| serde_json::from_str(&s).ok()),
        ephemeral_ttl_sec: row.get("ephemeral_ttl_sec")?,
        status: MessageStatus::from_str(&status),
        leased_until: opt_ts(leased_until),
        delivery_attempts: row.get("delivery_attempts")?,
        last_error: row.get("last_error")?,
        inserted_at: parse_ts(&inserted_at),
        expires_at: parse_ts(&expires_at),
        body_purged_at: opt_ts(body_purged_at),
        terminal_at: opt_ts(terminal_at),
        ack_result: ack_result_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn row_to_group(row: &Row) -> rusqlite::Result<GroupRecord> {
    let access_type: String = row.get("access_type")?;
    let settings_json: String = row.get("settings")?;
    let created_at: String = row.get("created_at")?;
    Ok(GroupRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        access_type: match access_type.as_str() {
            "invite-only" => GroupAccessType::InviteOnly,
            "key-protected" => GroupAccessType::KeyProtected,
            _ => GroupAccessType::Open,
        },
        join_key_hash: row.get("join_key_hash")?,
        settings: serde_json::from_str(&settings_json).unwrap_or(GroupSettings {
            history_visible: false,
            max_members: None,
            message_ttl_sec: None,
        }),
        creator: row.get("creator")?,
        created_at: parse_ts(&created_at),
    })
}

fn access_type_str(a: GroupAccessType) -> &'static str {
    match a {
        GroupAccessType::Open => "open",
        GroupAccessType::InviteOnly => "invite-only",
        GroupAccessType::KeyProtected => "key-protected",
    }
}

fn row_to_member(row: &Row) -> rusqlite::Result<GroupMemberRecord> {
    let role: String = row.get("role")?;
    let joined_at: String = row.get("joined_at")?;
    Ok(GroupMemberRecord {
        group_id: row.get("group_id")?,
        agent_id: row.get("agent_id")?,
        role: match role.as_str() {
            "owner" => GroupRole::Owner,
            "admin" => GroupRole::Admin,
            _ => GroupRole::Member,
        },
        joined_at: parse_ts(&joined_at),
    })
}

fn role_str(r: GroupRole) -> &'static str {
    match r {
        GroupRole::Owner => "owner",
        GroupRole::Admin => "admin",
        GroupRole::Member => "member",
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<WebhookJobRecord> {
    let next_attempt_at: String = row.get("next_attempt_at")?;
    let terminal: i64 = row.get("terminal")?;
    let dead_lettered: i64 = row.get("dead_lettered")?;
    let created_at: String = row.get("created_at")?;
    let last_status_code: Option<i64> = row.get("last_status_code")?;
    Ok(WebhookJobRecord {
        job_id: row.get("job_id")?,
        message_id: row.get("message_id")?,
        agent_id: row.get("agent_id")?,
        attempt_count: row.get("attempt_count")?,
        next_attempt_at: parse_ts(&next_attempt_at),
        last_status_code: last_status_code.map(|n| n as u16),
        last_error: row.get("last_error")?,
        terminal: terminal != 0,
        dead_lettered: dead_lettered != 0,
        created_at: parse_ts(&created_at),
    })
}

fn unavailable(e: rusqlite::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_agent(&self, agent_id: &str) -> StorageResult<Option<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM agents WHERE agent_id = ?1",
            params![agent_id],
            row_to_agent,
        )
        .optional()
        .map_err(unavailable)
    }

    async fn put_agent(&self, r: AgentRecord) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let capabilities_json = serde_json::to_string(&r.capabilities).unwrap();
        let (prev_key, prev_exp) = match &r.previous_public_key {
            Some((k, exp)) => (Some(k.clone()), Some(ts(*exp))),
            None => (None, None),
        };
        conn.execute(
            "INSERT INTO agents (agent_id, name, capabilities, public_key, key_version,
                previous_public_key, previous_public_key_expires_at, api_key, webhook_url,
                webhook_secret, status, last_heartbeat, created_at, tombstoned)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
             ON CONFLICT(agent_id) DO UPDATE SET
                name=excluded.name, capabilities=excluded.capabilities,
                public_key=excluded.public_key, key_version=excluded.key_version,
                previous_public_key=excluded.previous_public_key,
                previous_public_key_expires_at=excluded.previous_public_key_expires_at,
                api_key=excluded.api_key, webhook_url=excluded.webhook_url,
                webhook_secret=excluded.webhook_secret, status=excluded.status,
                last_heartbeat=excluded.last_heartbeat, tombstoned=excluded.tombstoned",
            params![
                r.agent_id,
                r.name,
                capabilities_json,
                r.public_key,
                r.key_version,
                prev_key,
                prev_exp,
                r.api_key,
                r.webhook_url,
                r.webhook_secret,
                agent_status_str(r.status),
                r.last_heartbeat.map(ts),
                ts(r.created_at),
                r.tombstoned as i64,
            ],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_agent_cascade(&self, agent_id: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM messages WHERE to_agent = ?1",
            params![agent_id],
        )
        .map_err(unavailable)?;
        conn.execute(
            "DELETE FROM group_members WHERE agent_id = ?1",
            params![agent_id],
        )
        .map_err(unavailable)?;
        conn.execute(
            "UPDATE agents SET status = 'deregistered', tombstoned = 1, webhook_url = NULL,
                webhook_secret = NULL WHERE agent_id = ?1",
            params![agent_id],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list_agents(
        &self,
        filter: AgentFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        let after: String = cursor.unwrap_or_default();
        let limit = limit.min(super::MAX_PAGE_SIZE) as i64;

        let mut sql = String::from("SELECT * FROM agents WHERE agent_id > ?1");
        if filter.exclude_tombstoned {
            sql.push_str(" AND tombstoned = 0");
        }
        if let Some(st) = filter.status {
            sql.push_str(&format!(" AND status = '{}'", agent_status_str(st)));
        }
        if let Some(hb) = filter.heartbeat_before {
            sql.push_str(&format!(
                " AND (last_heartbeat IS NOT NULL AND last_heartbeat < '{}')",
                ts(hb)
            ));
        }
        sql.push_str(" ORDER BY agent_id ASC LIMIT ?2");

        let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
        let mut items: Vec<AgentRecord> = stmt
            .query_map(params![after, limit + 1], row_to_agent)
            .map_err(unavailable)?
            .filter_map(|r| r.ok())
            .filter(|a| match &filter.capability {
                Some(c) => a.capabilities.iter().any(|cap| cap == c),
                None => true,
            })
            .collect();

        let next_cursor = if items.len() as i64 > limit {
            items.truncate(limit as usize);
            items.last().map(|a| a.agent_id.clone())
        } else {
            None
        };
        Ok(ListPage { items, next_cursor })
    }

    async fn get_message(&self, id: &str) -> StorageResult<Option<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM messages WHERE id = ?1",
            params![id],
            row_to_message,
        )
        .optional()
        .map_err(unavailable)
    }

    async fn put_message(&self, r: MessageRecord) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![r.id],
                |_| Ok(true),
            )
            .optional()
            .map_err(unavailable)?
            .unwrap_or(false);
        let seq = if exists {
            conn.query_row(
                "SELECT seq FROM messages WHERE id = ?1",
                params![r.id],
                |row| row.get::<_, i64>(0),
            )
            .map_err(unavailable)?
        } else {
            MemoryStore::next_seq(&conn)
        };

        conn.execute(
            "INSERT INTO messages (id, version, msg_type, from_agent, to_agent, group_id,
                subject, correlation_id, reply_to, idempotency_key, body, ttl_sec, timestamp,
                members_snapshot, ephemeral_ttl_sec, status, leased_until, delivery_attempts,
                last_error, inserted_at, expires_at, body_purged_at, terminal_at, ack_result, seq)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)
             ON CONFLICT(id) DO UPDATE SET
                status=excluded.status, leased_until=excluded.leased_until,
                delivery_attempts=excluded.delivery_attempts, last_error=excluded.last_error,
                body=excluded.body, body_purged_at=excluded.body_purged_at,
                terminal_at=excluded.terminal_at, ack_result=excluded.ack_result,
                expires_at=excluded.expires_at",
            params![
                r.id,
                r.version,
                r.msg_type,
                r.from,
                r.to,
                r.group,
                r.subject,
                r.correlation_id,
                r.reply_to,
                r.idempotency_key,
                r.body.as_ref().map(|b| b.to_string()),
                r.ttl_sec,
                ts(r.timestamp),
                r.members_snapshot
                    .as_ref()
                    .map(|m| serde_json::to_string(m).unwrap()),
                r.ephemeral_ttl_sec,
                r.status.as_str(),
                r.leased_until.map(ts),
                r.delivery_attempts,
                r.last_error,
                ts(r.inserted_at),
                ts(r.expires_at),
                r.body_purged_at.map(ts),
                r.terminal_at.map(ts),
                r.ack_result.as_ref().map(|v| v.to_string()),
                seq,
            ],
        )
        .map_err(unavailable)?;

        if let Some(key) = &r.idempotency_key {
            conn.execute(
                "INSERT OR IGNORE INTO idempotency_index (from_agent, idempotency_key, message_id)
                 VALUES (?1, ?2, ?3)",
                params![r.from, key, r.id],
            )
            .map_err(unavailable)?;
        }
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_messages(
        &self,
        filter: MessageFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let after_seq: i64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let limit = limit.min(super::MAX_PAGE_SIZE) as i64;

        let mut sql = String::from("SELECT * FROM messages WHERE seq > ?1");
        if let Some(to) = &filter.to {
            sql.push_str(&format!(" AND to_agent = '{}'", to.replace('\'', "''")));
        }
        if let Some(g) = &filter.group {
            sql.push_str(&format!(" AND group_id = '{}'", g.replace('\'', "''")));
        }
        if let Some(statuses) = &filter.status_in {
            let list = statuses
                .iter()
                .map(|s| format!("'{}'", s.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" AND status IN ({})", list));
        }
        if filter.not_body_purged {
            sql.push_str(" AND body_purged_at IS NULL");
        }
        if let Some(before) = filter.leased_before {
            sql.push_str(&format!(
                " AND leased_until IS NOT NULL AND leased_until < '{}'",
                ts(before)
            ));
        }
        if let Some(before) = filter.expires_before {
            sql.push_str(&format!(" AND expires_at < '{}'", ts(before)));
        }
        if let Some(before) = filter.terminal_before {
            sql.push_str(&format!(
                " AND terminal_at IS NOT NULL AND terminal_at < '{}'",
                ts(before)
            ));
        }
        if let Some(before) = filter.ephemeral_due_before {
            sql.push_str(&format!(
                " AND ephemeral_ttl_sec IS NOT NULL AND body_purged_at IS NULL
                   AND datetime(inserted_at, '+' || ephemeral_ttl_sec || ' seconds') < '{}'",
                ts(before)
            ));
        }
        sql.push_str(" ORDER BY seq ASC LIMIT ?2");

        let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
        let mut items: Vec<MessageRecord> = stmt
            .query_map(params![after_seq, limit + 1], row_to_message)
            .map_err(unavailable)?
            .filter_map(|r| r.ok())
            .collect();

        let next_cursor = if items.len() as i64 > limit {
            items.truncate(limit as usize);
            conn.query_row(
                "SELECT seq FROM messages WHERE id = ?1",
                params![items.last().unwrap().id],
                |row| row.get::<_, i64>(0),
            )
            .ok()
            .map(|s| s.to_string())
        } else {
            None
        };
        Ok(ListPage { items, next_cursor })
    }

    async fn claim_message(
        &self,
        recipient: &str,
        lease_sec: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let candidate: Option<String> = conn
            .query_row(
                "SELECT id FROM messages
                 WHERE to_agent = ?1 AND status IN ('queued','delivered')
                 ORDER BY inserted_at ASC, id ASC LIMIT 1",
                params![recipient],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let leased_until = ts(now + chrono::Duration::seconds(lease_sec));
        conn.execute(
            "UPDATE messages SET status = 'leased', leased_until = ?1,
                delivery_attempts = delivery_attempts + 1
             WHERE id = ?2 AND status IN ('queued','delivered')",
            params![leased_until, id],
        )
        .map_err(unavailable)?;

        conn.query_row(
            "SELECT * FROM messages WHERE id = ?1",
            params![id],
            row_to_message,
        )
        .optional()
        .map_err(unavailable)
    }

    async fn find_by_idempotency(
        &self,
        from: &str,
        idempotency_key: &str,
    ) -> StorageResult<Option<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        let message_id: Option<String> = conn
            .query_row(
                "SELECT message_id FROM idempotency_index WHERE from_agent = ?1 AND idempotency_key = ?2",
                params![from, idempotency_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        let Some(id) = message_id else {
            return Ok(None);
        };
        conn.query_row(
            "SELECT * FROM messages WHERE id = ?1",
            params![id],
            row_to_message,
        )
        .optional()
        .map_err(unavailable)
    }

    async fn message_status_counts(&self, recipient: &str) -> StorageResult<StatusCounts> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM messages WHERE to_agent = ?1 GROUP BY status")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![recipient], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(unavailable)?;
        let mut counts = StatusCounts::new();
        for row in rows.filter_map(|r| r.ok()) {
            counts.insert(row.0, row.1);
        }
        Ok(counts)
    }

    async fn get_group(&self, group_id: &str) -> StorageResult<Option<GroupRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM groups WHERE id = ?1",
            params![group_id],
            row_to_group,
        )
        .optional()
        .map_err(unavailable)
    }

    async fn put_group(&self, r: GroupRecord) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO groups (id, name, access_type, join_key_hash, settings, creator, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, access_type=excluded.access_type,
                join_key_hash=excluded.join_key_hash, settings=excluded.settings",
            params![
                r.id,
                r.name,
                access_type_str(r.access_type),
                r.join_key_hash,
                serde_json::to_string(&r.settings).unwrap(),
                r.creator,
                ts(r.created_at),
            ],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1",
            params![group_id],
        )
        .map_err(unavailable)?;
        conn.execute("DELETE FROM groups WHERE id = ?1", params![group_id])
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list_groups(
        &self,
        filter: GroupFilter,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<GroupRecord>> {
        let conn = self.conn.lock().unwrap();
        let after: String = cursor.unwrap_or_default();
        let limit = limit.min(super::MAX_PAGE_SIZE) as i64;

        let mut sql = String::from("SELECT * FROM groups WHERE id > ?1");
        if let Some(creator) = &filter.creator {
            sql.push_str(&format!(" AND creator = '{}'", creator.replace('\'', "''")));
        }
        sql.push_str(" ORDER BY id ASC LIMIT ?2");

        let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
        let mut items: Vec<GroupRecord> = stmt
            .query_map(params![after, limit + 1], row_to_group)
            .map_err(unavailable)?
            .filter_map(|r| r.ok())
            .collect();

        let next_cursor = if items.len() as i64 > limit {
            items.truncate(limit as usize);
            items.last().map(|g| g.id.clone())
        } else {
            None
        };
        Ok(ListPage { items, next_cursor })
    }

    async fn get_member(
        &self,
        group_id: &str,
        agent_id: &str,
    ) -> StorageResult<Option<GroupMemberRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM group_members WHERE group_id = ?1 AND agent_id = ?2",
            params![group_id, agent_id],
            row_to_member,
        )
        .optional()
        .map_err(unavailable)
    }

    async fn put_member(&self, r: GroupMemberRecord) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO group_members (group_id, agent_id, role, joined_at)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(group_id, agent_id) DO UPDATE SET role=excluded.role",
            params![r.group_id, r.agent_id, role_str(r.role), ts(r.joined_at)],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_member(&self, group_id: &str, agent_id: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND agent_id = ?2",
            params![group_id, agent_id],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn list_members(&self, group_id: &str) -> StorageResult<Vec<GroupMemberRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM group_members WHERE group_id = ?1 ORDER BY joined_at ASC")
            .map_err(unavailable)?;
        let members = stmt
            .query_map(params![group_id], row_to_member)
            .map_err(unavailable)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(members)
    }

    async fn put_webhook_job(&self, r: WebhookJobRecord) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO webhook_queue (job_id, message_id, agent_id, attempt_count,
                next_attempt_at, last_status_code, last_error, terminal, dead_lettered, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
             ON CONFLICT(job_id) DO UPDATE SET
                attempt_count=excluded.attempt_count, next_attempt_at=excluded.next_attempt_at,
                last_status_code=excluded.last_status_code, last_error=excluded.last_error,
                terminal=excluded.terminal, dead_lettered=excluded.dead_lettered",
            params![
                r.job_id,
                r.message_id,
                r.agent_id,
                r.attempt_count,
                ts(r.next_attempt_at),
                r.last_status_code.map(|n| n as i64),
                r.last_error,
                r.terminal as i64,
                r.dead_lettered as i64,
                ts(r.created_at),
            ],
        )
        .map_err(unavailable)?;
        Ok(())
    }

    async fn delete_webhook_job(&self, job_id: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM webhook_queue WHERE job_id = ?1", params![job_id])
            .map_err(unavailable)?;
        Ok(())
    }

    async fn claim_webhook_job(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<WebhookJobRecord>> {
        let conn = self.conn.lock().unwrap();
        let job_id: Option<String> = conn
            .query_row(
                "SELECT job_id FROM webhook_queue
                 WHERE terminal = 0 AND next_attempt_at <= ?1
                 ORDER BY next_attempt_at ASC LIMIT 1",
                params![ts(now)],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        let Some(job_id) = job_id else {
            return Ok(None);
        };
        // Push the attempt far out so a concurrent dispatcher tick doesn't
        // grab the same job while this one is in flight; the dispatcher
        // re-`put_webhook_job`s with the real schedule once it knows the
        // outcome.
        conn.execute(
            "UPDATE webhook_queue SET next_attempt_at = ?1 WHERE job_id = ?2",
            params![ts(now + chrono::Duration::minutes(10)), job_id],
        )
        .map_err(unavailable)?;
        conn.query_row(
            "SELECT * FROM webhook_queue WHERE job_id = ?1",
            params![job_id],
            row_to_job,
        )
        .optional()
        .map_err(unavailable)
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> StorageResult<ListPage<WebhookJobRecord>> {
        let conn = self.conn.lock().unwrap();
        let after: String = cursor.unwrap_or_default();
        let limit = limit.min(super::MAX_PAGE_SIZE) as i64;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM webhook_queue WHERE dead_lettered = 1 AND job_id > ?1
                 ORDER BY job_id ASC LIMIT ?2",
            )
            .map_err(unavailable)?;
        let mut items: Vec<WebhookJobRecord> = stmt
            .query_map(params![after, limit + 1], row_to_job)
            .map_err(unavailable)?
            .filter_map(|r| r.ok())
            .collect();
        let next_cursor = if items.len() as i64 > limit {
            items.truncate(limit as usize);
            items.last().map(|j| j.job_id.clone())
        } else {
            None
        };
        Ok(ListPage { items, next_cursor })
    }

    async fn ping(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(unavailable)
    }
}
