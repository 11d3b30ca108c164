use chrono::Utc;
use std::sync::Arc;

use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::inbox;
use crate::models::{
    CreateGroup, Group, GroupAccessType, GroupPostRequest, GroupPostResponse, GroupRole,
    JoinGroup, SendMessageRequest,
};
use crate::storage::{GroupFilter, GroupMemberRecord, GroupRecord};

fn record_to_wire(record: &GroupRecord, members: &[GroupMemberRecord]) -> Group {
    Group {
        id: record.id.clone(),
        name: record.name.clone(),
        access_type: record.access_type,
        settings: record.settings.clone(),
        members: members
            .iter()
            .map(|m| (m.agent_id.clone(), m.role))
            .collect(),
        creator: record.creator.clone(),
        created_at: record.created_at.to_rfc3339(),
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

pub async fn create(hub: &Hub, req: CreateGroup) -> HubResult<Group> {
    let group_id = format!("group://{}-{:08x}", slugify(&req.name), rand::random::<u32>());

    let join_key_hash = match (req.access_type, &req.join_key) {
        (GroupAccessType::KeyProtected, Some(key)) => {
            Some(bcrypt::hash(key, bcrypt::DEFAULT_COST).map_err(|e| {
                HubError::Internal(format!("failed to hash join key: {e}"))
            })?)
        }
        (GroupAccessType::KeyProtected, None) => {
            return Err(HubError::InvalidEnvelope(
                "key-protected groups require join_key".into(),
            ));
        }
        _ => None,
    };

    let now = Utc::now();
    let record = GroupRecord {
        id: group_id.clone(),
        name: req.name,
        access_type: req.access_type,
        join_key_hash,
        settings: req.settings,
        creator: req.creator.clone(),
        created_at: now,
    };
    hub.storage.put_group(record.clone()).await?;
    hub.storage
        .put_member(GroupMemberRecord {
            group_id: group_id.clone(),
            agent_id: req.creator,
            role: GroupRole::Owner,
            joined_at: now,
        })
        .await?;

    let members = hub.storage.list_members(&group_id).await?;
    Ok(record_to_wire(&record, &members))
}

pub async fn get(hub: &Hub, group_id: &str) -> HubResult<Group> {
    let record = get_record(hub, group_id).await?;
    let members = hub.storage.list_members(group_id).await?;
    Ok(record_to_wire(&record, &members))
}

async fn get_record(hub: &Hub, group_id: &str) -> HubResult<GroupRecord> {
    hub.storage
        .get_group(group_id)
        .await?
        .ok_or_else(|| HubError::GroupNotFound(group_id.to_string()))
}

pub async fn list(hub: &Hub, limit: usize, cursor: Option<String>) -> HubResult<Vec<Group>> {
    let page = hub
        .storage
        .list_groups(GroupFilter::default(), limit, cursor)
        .await?;
    let mut groups = Vec::with_capacity(page.items.len());
    for record in &page.items {
        let members = hub.storage.list_members(&record.id).await?;
        groups.push(record_to_wire(record, &members));
    }
    Ok(groups)
}

pub async fn join(hub: &Hub, group_id: &str, req: JoinGroup) -> HubResult<()> {
    let record = get_record(hub, group_id).await?;

    if hub
        .storage
        .get_member(group_id, &req.agent_id)
        .await?
        .is_some()
    {
        return Ok(());
    }

    match record.access_type {
        GroupAccessType::Open => {}
        GroupAccessType::KeyProtected => {
            let hash = record
                .join_key_hash
                .as_deref()
                .ok_or_else(|| HubError::Internal("key-protected group missing hash".into()))?;
            let supplied = req
                .key
                .ok_or_else(|| HubError::NotAMember)?;
            let ok = bcrypt::verify(&supplied, hash)
                .map_err(|e| HubError::Internal(format!("bcrypt verify failed: {e}")))?;
            if !ok {
                return Err(HubError::NotAMember);
            }
        }
        GroupAccessType::InviteOnly => {
            return Err(HubError::NotAMember);
        }
    }

    if let Some(max) = record.settings.max_members {
        let current = hub.storage.list_members(group_id).await?.len() as u32;
        if current >= max {
            return Err(HubError::Conflict("group is at max_members".into()));
        }
    }

    hub.storage
        .put_member(GroupMemberRecord {
            group_id: group_id.to_string(),
            agent_id: req.agent_id,
            role: GroupRole::Member,
            joined_at: Utc::now(),
        })
        .await?;
    Ok(())
}

/// Invite-only admission by an admin/owner, distinct from self-service
/// `join` on open groups.
pub async fn invite(hub: &Hub, group_id: &str, actor: &str, agent_id: &str) -> HubResult<()> {
    require_role(hub, group_id, actor, GroupRole::Admin).await?;
    hub.storage
        .put_member(GroupMemberRecord {
            group_id: group_id.to_string(),
            agent_id: agent_id.to_string(),
            role: GroupRole::Member,
            joined_at: Utc::now(),
        })
        .await?;
    Ok(())
}

async fn require_role(
    hub: &Hub,
    group_id: &str,
    actor: &str,
    minimum: GroupRole,
) -> HubResult<GroupRole> {
    let member = hub
        .storage
        .get_member(group_id, actor)
        .await?
        .ok_or(HubError::NotAMember)?;
    if member.role < minimum {
        return Err(HubError::NotAMember);
    }
    Ok(member.role)
}

pub async fn leave(hub: &Hub, group_id: &str, agent_id: &str) -> HubResult<()> {
    let member = hub
        .storage
        .get_member(group_id, agent_id)
        .await?
        .ok_or(HubError::NotAMember)?;

    if member.role == GroupRole::Owner {
        let members = hub.storage.list_members(group_id).await?;
        let other_owners = members
            .iter()
            .any(|m| m.agent_id != agent_id && m.role == GroupRole::Owner);
        if !other_owners {
            return Err(HubError::Conflict(
                "the last owner must transfer ownership or delete the group before leaving".into(),
            ));
        }
    }

    hub.storage.delete_member(group_id, agent_id).await?;
    Ok(())
}

pub async fn remove_member(
    hub: &Hub,
    group_id: &str,
    actor: &str,
    target: &str,
) -> HubResult<()> {
    require_role(hub, group_id, actor, GroupRole::Admin).await?;
    leave(hub, group_id, target).await
}

pub async fn delete(hub: &Hub, group_id: &str, actor: &str) -> HubResult<()> {
    require_role(hub, group_id, actor, GroupRole::Owner).await?;
    hub.storage.delete_group(group_id).await?;
    Ok(())
}

/// Fans a post out to every current member (spec §4.5): captures a
/// `members_snapshot`, synthesizes one per-recipient envelope per member,
/// and routes each through the inbox engine's send path so group messages
/// obey the same leases, TTLs, and webhooks as direct messages. Above
/// `group_fanout_threshold` members, fanout continues after returning
/// `accepted_async = true`.
pub async fn post(
    hub: Arc<Hub>,
    group_id: &str,
    req: GroupPostRequest,
) -> HubResult<GroupPostResponse> {
    let record = get_record(&hub, group_id).await?;
    hub.storage
        .get_member(group_id, &req.from)
        .await?
        .ok_or(HubError::NotAMember)?;

    let members = hub.storage.list_members(group_id).await?;
    let members_snapshot: Vec<String> = members.iter().map(|m| m.agent_id.clone()).collect();
    let recipients = members_snapshot.len();
    let accepted_async = recipients > hub.config.group_fanout_threshold;
    let ttl_sec = record.settings.message_ttl_sec.unwrap_or(req.ttl_sec);

    let job = fanout_job(
        hub.clone(),
        group_id.to_string(),
        members_snapshot,
        req,
        ttl_sec,
    );

    if accepted_async {
        tokio::spawn(job);
    } else {
        job.await;
    }

    Ok(GroupPostResponse {
        posted: true,
        recipients,
        accepted_async,
    })
}

async fn fanout_job(
    hub: Arc<Hub>,
    group_id: String,
    members_snapshot: Vec<String>,
    req: GroupPostRequest,
    ttl_sec: i64,
) {
    for member in &members_snapshot {
        let send_req = SendMessageRequest {
            version: "1.0".to_string(),
            msg_type: req.msg_type.clone(),
            from: req.from.clone(),
            subject: req.subject.clone(),
            correlation_id: None,
            idempotency_key: None,
            body: req.body.clone(),
            ttl_sec,
            options: None,
            signature: None,
        };
        let _ = inbox::send_group_copy(&hub, member, &group_id, members_snapshot.clone(), send_req)
            .await;
    }
}

/// Reverse-chronological group history (when `history_visible`), reading
/// the member-synthesized copies back out by `group`. Cursor pagination
/// mirrors the other list endpoints; history is a query over messages, not
/// a separate store (spec §3: "the group does not reference its messages").
pub async fn history(
    hub: &Hub,
    group_id: &str,
    limit: usize,
    cursor: Option<String>,
) -> HubResult<crate::storage::ListPage<crate::models::MessageEnvelope>> {
    let record = get_record(hub, group_id).await?;
    if !record.settings.history_visible {
        return Err(HubError::NotAMember);
    }

    let page = hub
        .storage
        .list_messages(
            crate::storage::MessageFilter {
                group: Some(group_id.to_string()),
                ..Default::default()
            },
            limit,
            cursor,
        )
        .await?;

    let mut items: Vec<_> = page.items.iter().map(inbox::record_to_envelope).collect();
    items.reverse();

    Ok(crate::storage::ListPage {
        items,
        next_cursor: page.next_cursor,
    })
}
