use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use rocket::local::blocking::Client;

use admp_hub::config::HubConfig;
use admp_hub::hub::Hub;
use admp_hub::rate_limit::RateLimitConfig;
use admp_hub::signature;

pub fn test_client() -> Client {
    let hub = Hub::new(HubConfig::default());
    let rocket = admp_hub::rocket_with_hub_and_config(hub, RateLimitConfig::default());
    Client::tracked(rocket).expect("valid rocket instance")
}

pub fn test_client_with_rate_limits(rate_config: RateLimitConfig) -> Client {
    let hub = Hub::new(HubConfig::default());
    let rocket = admp_hub::rocket_with_hub_and_config(hub, rate_config);
    Client::tracked(rocket).expect("valid rocket instance")
}

pub fn test_client_with_admin_key(key: &str) -> Client {
    let mut config = HubConfig::default();
    config.admin_key = Some(key.to_string());
    let hub = Hub::new(config);
    let rocket = admp_hub::rocket_with_hub_and_config(hub, RateLimitConfig::default());
    Client::tracked(rocket).expect("valid rocket instance")
}

/// URL-encodes an id like `agent://alice` so it survives as a single
/// dynamic path segment (spec ids embed `://`, which Rocket's `&str`
/// segment guard would otherwise split on).
pub fn encode_id(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

/// Registers an agent over HTTP and returns `(agent_id, secret_key_b64)`.
/// The secret key is only ever returned once, at registration, so callers
/// that need to sign later requests must capture it here.
pub fn register_agent(client: &Client, name: &str) -> (String, String) {
    use rocket::http::{ContentType, Status};
    let res = client
        .post("/api/agents")
        .header(ContentType::JSON)
        .body(format!(r#"{{"name":"{name}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    (
        body["agent_id"].as_str().unwrap().to_string(),
        body["secret_key"].as_str().unwrap().to_string(),
    )
}

/// Builds the `(Date, Signature)` header pair `signature::authenticate`
/// expects, signed with the agent's secret key over `method`/`path`/`host`.
pub fn sign(secret_b64: &str, method: &str, path: &str, host: &str) -> (String, String) {
    let secret_bytes = base64::engine::general_purpose::STANDARD
        .decode(secret_b64)
        .expect("secret_key must be base64");
    let secret_bytes: [u8; 32] = secret_bytes.try_into().expect("secret key must be 32 bytes");
    let signing_key = SigningKey::from_bytes(&secret_bytes);

    let date = Utc::now().to_rfc2822();
    let signing_string = signature::canonical_signing_string(method, path, host, &date);
    let sig = signing_key.sign(signing_string.as_bytes());
    let sig_b64 = base64::engine::general_purpose::STANDARD.encode(sig.to_bytes());

    let header = format!(
        r#"keyId="test-key",algorithm="ed25519",headers="(request-target) host date",signature="{sig_b64}""#
    );
    (date, header)
}
