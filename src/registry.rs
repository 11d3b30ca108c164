use base64::Engine;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::models::{
    Agent, AgentStatus, RegisterAgent, RegisterAgentResponse, RotateKeyResponse, SetWebhook,
};
use crate::storage::{AgentFilter, AgentRecord, AgentStatusRecord, ListPage};

fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    slug.trim_matches('-').to_string()
}

fn derive_agent_id(name: &str) -> String {
    format!("agent://{}", slugify(name))
}

fn generate_api_key() -> String {
    format!("admp_{:032x}", uuid::Uuid::new_v4().as_u128())
}

fn record_to_wire(r: &AgentRecord) -> Agent {
    Agent {
        agent_id: r.agent_id.clone(),
        name: r.name.clone(),
        capabilities: r.capabilities.clone(),
        public_key: hex::encode(&r.public_key),
        key_version: r.key_version,
        webhook_url: r.webhook_url.clone(),
        status: match r.status {
            AgentStatusRecord::Online => AgentStatus::Online,
            AgentStatusRecord::Offline => AgentStatus::Offline,
            AgentStatusRecord::Deregistered => AgentStatus::Deregistered,
        },
        last_heartbeat: r.last_heartbeat.map(|t| t.to_rfc3339()),
        created_at: r.created_at.to_rfc3339(),
    }
}

fn decode_public_key(input: &str) -> HubResult<Vec<u8>> {
    if let Ok(bytes) = hex::decode(input) {
        if bytes.len() == 32 {
            return Ok(bytes);
        }
    }
    if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(input) {
        if bytes.len() == 32 {
            return Ok(bytes);
        }
    }
    Err(HubError::InvalidEnvelope(
        "public_key must be 32 bytes, hex or base64 encoded".into(),
    ))
}

pub async fn register(hub: &Hub, req: RegisterAgent) -> HubResult<RegisterAgentResponse> {
    let agent_id = req.agent_id.unwrap_or_else(|| derive_agent_id(&req.name));

    if hub.storage.get_agent(&agent_id).await?.is_some() {
        return Err(HubError::AgentAlreadyExists(agent_id));
    }

    let (public_key, secret_key_b64) = match req.public_key {
        Some(supplied) => (decode_public_key(&supplied)?, None),
        None => {
            let signing_key = SigningKey::generate(&mut OsRng);
            let secret_b64 =
                base64::engine::general_purpose::STANDARD.encode(signing_key.to_bytes());
            (
                signing_key.verifying_key().to_bytes().to_vec(),
                Some(secret_b64),
            )
        }
    };

    let api_key = generate_api_key();
    let now = Utc::now();
    let record = AgentRecord {
        agent_id: agent_id.clone(),
        name: req.name,
        capabilities: req.capabilities,
        public_key: public_key.clone(),
        key_version: 1,
        previous_public_key: None,
        api_key: api_key.clone(),
        webhook_url: req.webhook_url,
        webhook_secret: req.webhook_secret,
        status: AgentStatusRecord::Offline,
        last_heartbeat: None,
        created_at: now,
        tombstoned: false,
    };
    hub.storage.put_agent(record).await?;

    Ok(RegisterAgentResponse {
        agent_id,
        public_key: hex::encode(&public_key),
        secret_key: secret_key_b64,
        api_key,
    })
}

pub async fn get(hub: &Hub, agent_id: &str) -> HubResult<Agent> {
    Ok(record_to_wire(&get_record(hub, agent_id).await?))
}

pub async fn get_record(hub: &Hub, agent_id: &str) -> HubResult<AgentRecord> {
    hub.storage
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| HubError::AgentNotFound(agent_id.to_string()))
}

pub async fn list(hub: &Hub, limit: usize, cursor: Option<String>) -> HubResult<ListPage<Agent>> {
    let page = hub
        .storage
        .list_agents(
            AgentFilter {
                exclude_tombstoned: true,
                ..Default::default()
            },
            limit,
            cursor,
        )
        .await?;
    Ok(ListPage {
        items: page.items.iter().map(record_to_wire).collect(),
        next_cursor: page.next_cursor,
    })
}

pub async fn rotate_key(hub: &Hub, agent_id: &str) -> HubResult<RotateKeyResponse> {
    let mut record = get_record(hub, agent_id).await?;

    let signing_key = SigningKey::generate(&mut OsRng);
    let secret_b64 = base64::engine::general_purpose::STANDARD.encode(signing_key.to_bytes());
    let new_public_key = signing_key.verifying_key().to_bytes().to_vec();

    let grace = hub.config.key_rotation_grace_sec;
    record.previous_public_key = Some((
        record.public_key.clone(),
        Utc::now() + chrono::Duration::seconds(grace),
    ));
    record.public_key = new_public_key.clone();
    record.key_version += 1;

    let key_version = record.key_version;
    hub.storage.put_agent(record).await?;

    Ok(RotateKeyResponse {
        agent_id: agent_id.to_string(),
        public_key: hex::encode(&new_public_key),
        secret_key: Some(secret_b64),
        key_version,
        grace_period_sec: grace,
    })
}

pub async fn heartbeat(hub: &Hub, agent_id: &str) -> HubResult<Agent> {
    let mut record = get_record(hub, agent_id).await?;
    record.last_heartbeat = Some(Utc::now());
    record.status = AgentStatusRecord::Online;
    hub.storage.put_agent(record.clone()).await?;
    Ok(record_to_wire(&record))
}

pub async fn set_webhook(hub: &Hub, agent_id: &str, req: SetWebhook) -> HubResult<()> {
    if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
        return Err(HubError::InvalidWebhookUrl(req.url));
    }
    let mut record = get_record(hub, agent_id).await?;
    record.webhook_url = Some(req.url);
    record.webhook_secret = Some(req.secret);
    hub.storage.put_agent(record).await?;
    Ok(())
}

pub async fn get_webhook(hub: &Hub, agent_id: &str) -> HubResult<Option<String>> {
    Ok(get_record(hub, agent_id).await?.webhook_url)
}

pub async fn delete_webhook(hub: &Hub, agent_id: &str) -> HubResult<()> {
    let mut record = get_record(hub, agent_id).await?;
    record.webhook_url = None;
    record.webhook_secret = None;
    hub.storage.put_agent(record).await?;
    Ok(())
}

pub async fn deregister(hub: &Hub, agent_id: &str) -> HubResult<()> {
    get_record(hub, agent_id).await?;
    hub.storage.delete_agent_cascade(agent_id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_generates_keypair_when_none_supplied() {
        let hub = Hub::new_for_test();
        let resp = register(
            &hub,
            RegisterAgent {
                name: "Alice".into(),
                agent_id: None,
                capabilities: vec![],
                public_key: None,
                webhook_url: None,
                webhook_secret: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.agent_id, "agent://alice");
        assert!(resp.secret_key.is_some());
        assert_eq!(hex::decode(&resp.public_key).unwrap().len(), 32);
    }

    #[tokio::test]
    async fn register_twice_with_same_id_conflicts() {
        let hub = Hub::new_for_test();
        let req = || RegisterAgent {
            name: "Bob".into(),
            agent_id: None,
            capabilities: vec![],
            public_key: None,
            webhook_url: None,
            webhook_secret: None,
        };
        register(&hub, req()).await.unwrap();
        let err = register(&hub, req()).await.unwrap_err();
        assert!(matches!(err, HubError::AgentAlreadyExists(_)));
    }

    #[tokio::test]
    async fn deregister_tombstones_and_blocks_reuse() {
        let hub = Hub::new_for_test();
        let resp = register(
            &hub,
            RegisterAgent {
                name: "Carol".into(),
                agent_id: None,
                capabilities: vec![],
                public_key: None,
                webhook_url: None,
                webhook_secret: None,
            },
        )
        .await
        .unwrap();
        deregister(&hub, &resp.agent_id).await.unwrap();

        let err = register(
            &hub,
            RegisterAgent {
                name: "Carol".into(),
                agent_id: None,
                capabilities: vec![],
                public_key: None,
                webhook_url: None,
                webhook_secret: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HubError::AgentAlreadyExists(_)));
    }
}
