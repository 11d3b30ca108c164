use rocket::http::{ContentType, Header, Status};

use crate::common::{encode_id, register_agent, test_client, test_client_with_admin_key};

#[test]
fn health_reports_storage_reachable() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage_reachable"], true);
}

#[test]
fn stats_counts_agents_and_groups() {
    let client = test_client();
    register_agent(&client, "StatAgentOne");
    let (creator, _) = register_agent(&client, "StatAgentTwo");

    client
        .post("/api/groups")
        .header(ContentType::JSON)
        .body(format!(r#"{{"name":"stat-group","creator":"{creator}"}}"#))
        .dispatch();

    let res = client.get("/api/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agents_total"], 2);
    assert_eq!(body["groups_total"], 1);
}

#[test]
fn unknown_route_returns_structured_404() {
    let client = test_client();
    let res = client.get("/api/does-not-exist").dispatch();
    assert_eq!(res.status(), Status::NotFound);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body.get("error").is_some());
}

#[test]
fn force_reclaim_requires_admin_key() {
    let client = test_client_with_admin_key("s3cr3t-admin-key");
    let (agent_id, _) = register_agent(&client, "ReclaimTarget");

    let res = client
        .post(format!("/api/agents/{}/inbox/reclaim", encode_id(&agent_id)))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post(format!("/api/agents/{}/inbox/reclaim", encode_id(&agent_id)))
        .header(Header::new("X-Admin-Key", "wrong-key"))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post(format!("/api/agents/{}/inbox/reclaim", encode_id(&agent_id)))
        .header(Header::new("X-Admin-Key", "s3cr3t-admin-key"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let report: serde_json::Value = res.into_json().unwrap();
    assert!(report.get("reclaimed").is_some());
}

#[test]
fn force_reclaim_disabled_when_no_admin_key_configured() {
    let client = test_client();
    let (agent_id, _) = register_agent(&client, "ReclaimTarget2");

    let res = client
        .post(format!("/api/agents/{}/inbox/reclaim", encode_id(&agent_id)))
        .header(Header::new("X-Admin-Key", "any-value"))
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}
