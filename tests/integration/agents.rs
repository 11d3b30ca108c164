use rocket::http::{ContentType, Status};

use crate::common::{encode_id, register_agent, test_client};

#[test]
fn register_returns_generated_keypair_and_api_key() {
    let client = test_client();
    let res = client
        .post("/api/agents")
        .header(ContentType::JSON)
        .body(r#"{"name": "Alice"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agent_id"], "agent://alice");
    assert!(body["secret_key"].as_str().unwrap().len() > 0);
    assert!(body["api_key"].as_str().unwrap().starts_with("admp_"));
}

#[test]
fn register_duplicate_id_conflicts() {
    let client = test_client();
    client
        .post("/api/agents")
        .header(ContentType::JSON)
        .body(r#"{"name": "Dup"}"#)
        .dispatch();
    let res = client
        .post("/api/agents")
        .header(ContentType::JSON)
        .body(r#"{"name": "Dup"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn get_and_list_agents() {
    let client = test_client();
    let (agent_id, _) = register_agent(&client, "Lister");

    let res = client.get(format!("/api/agents/{}", encode_id(&agent_id))).dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agent_id"], agent_id);
    assert_eq!(body["status"], "offline");

    let res = client.get("/api/agents").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let page: serde_json::Value = res.into_json().unwrap();
    assert!(page["items"].as_array().unwrap().iter().any(|a| a["agent_id"] == agent_id));
}

#[test]
fn get_unknown_agent_is_404() {
    let client = test_client();
    let res = client.get(format!("/api/agents/{}", encode_id("agent://nobody"))).dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn heartbeat_marks_online() {
    let client = test_client();
    let (agent_id, _) = register_agent(&client, "Heartbeat");

    let res = client
        .post(format!("/api/agents/{}/heartbeat", encode_id(&agent_id)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "online");
    assert!(body["last_heartbeat"].is_string());
}

#[test]
fn deregister_then_reregister_same_name_conflicts() {
    let client = test_client();
    let (agent_id, _) = register_agent(&client, "Gone");

    let res = client.delete(format!("/api/agents/{}", encode_id(&agent_id))).dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get(format!("/api/agents/{}", encode_id(&agent_id))).dispatch();
    assert_eq!(res.status(), Status::NotFound);

    let res = client
        .post("/api/agents")
        .header(ContentType::JSON)
        .body(r#"{"name": "Gone"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

#[test]
fn rotate_key_keeps_previous_key_valid_during_grace_window() {
    let client = test_client();
    let (agent_id, _) = register_agent(&client, "Rotator");

    let res = client
        .post(format!("/api/agents/{}/rotate_key", encode_id(&agent_id)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["key_version"], 2);
    assert!(body["secret_key"].is_string());
    assert!(body["grace_period_sec"].as_i64().unwrap() > 0);
}

#[test]
fn set_webhook_rejects_non_http_url() {
    let client = test_client();
    let (agent_id, _) = register_agent(&client, "Webhooked");

    let res = client
        .post(format!("/api/agents/{}/webhook", encode_id(&agent_id)))
        .header(ContentType::JSON)
        .body(r#"{"url": "ftp://example.com", "secret": "s3cr3t"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);

    let res = client
        .post(format!("/api/agents/{}/webhook", encode_id(&agent_id)))
        .header(ContentType::JSON)
        .body(r#"{"url": "https://example.com/hook", "secret": "s3cr3t"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn delete_webhook_clears_it() {
    let client = test_client();
    let (agent_id, _) = register_agent(&client, "Unhooked");

    client
        .post(format!("/api/agents/{}/webhook", encode_id(&agent_id)))
        .header(ContentType::JSON)
        .body(r#"{"url": "https://example.com/hook", "secret": "s3cr3t"}"#)
        .dispatch();

    let res = client
        .delete(format!("/api/agents/{}/webhook", encode_id(&agent_id)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}
