use rocket::http::{ContentType, Header, Status};

use crate::common::{encode_id, register_agent, sign, test_client};

const HOST: &str = "localhost:8000";

fn signed_post(client: &rocket::local::blocking::Client, secret: &str, path: &str, body: String) -> rocket::local::blocking::LocalResponse<'_> {
    let (date, sig) = sign(secret, "post", path, HOST);
    client
        .post(path)
        .header(ContentType::JSON)
        .header(Header::new("Host", HOST))
        .header(Header::new("Date", date))
        .header(Header::new("Signature", sig))
        .body(body)
        .dispatch()
}

#[test]
fn send_then_pull_then_ack_roundtrip() {
    let client = test_client();
    let (from, from_secret) = register_agent(&client, "Sender");
    let (to, _) = register_agent(&client, "Receiver");

    let path = format!("/api/agents/{}/inbox", encode_id(&to));
    let body = format!(
        r#"{{"type":"task.request","from":"{from}","body":{{"x":1}},"ttl_sec":3600}}"#
    );
    let res = signed_post(&client, &from_secret, &path, body);
    assert_eq!(res.status(), Status::Ok);
    let sent: serde_json::Value = res.into_json().unwrap();
    let mid = sent["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/agents/{}/inbox/pull", encode_id(&to)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let pulled: serde_json::Value = res.into_json().unwrap();
    assert_eq!(pulled["id"], mid);
    assert_eq!(pulled["from"], from);
    assert_eq!(pulled["delivery_attempts"], 1);

    let res = client
        .post(format!("/api/agents/{}/inbox/{}/ack", encode_id(&to), encode_id(&mid)))
        .header(ContentType::JSON)
        .body(r#"{}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post(format!("/api/agents/{}/inbox/pull", encode_id(&to)))
        .dispatch();
    assert_eq!(res.status(), Status::NoContent);
}

#[test]
fn send_from_unregistered_sender_is_rejected() {
    let client = test_client();
    let (to, _) = register_agent(&client, "Receiver2");

    let path = format!("/api/agents/{}/inbox", encode_id(&to));
    let res = client
        .post(&path)
        .header(ContentType::JSON)
        .body(r#"{"type":"task.request","from":"agent://ghost","body":{},"ttl_sec":60}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);
}

#[test]
fn nack_with_requeue_redelivers() {
    let client = test_client();
    let (from, from_secret) = register_agent(&client, "Sender3");
    let (to, _) = register_agent(&client, "Receiver3");

    let path = format!("/api/agents/{}/inbox", encode_id(&to));
    let body = format!(r#"{{"type":"task.request","from":"{from}","body":{{}},"ttl_sec":3600}}"#);
    let res = signed_post(&client, &from_secret, &path, body);
    assert_eq!(res.status(), Status::Ok);
    let sent: serde_json::Value = res.into_json().unwrap();
    let mid = sent["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/agents/{}/inbox/pull", encode_id(&to)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post(format!("/api/agents/{}/inbox/{}/nack", encode_id(&to), encode_id(&mid)))
        .header(ContentType::JSON)
        .body(r#"{"requeue": true}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post(format!("/api/agents/{}/inbox/pull", encode_id(&to)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let redelivered: serde_json::Value = res.into_json().unwrap();
    assert_eq!(redelivered["id"], mid);
    assert_eq!(redelivered["delivery_attempts"], 2);
}

#[test]
fn reply_targets_original_sender() {
    let client = test_client();
    let (from, from_secret) = register_agent(&client, "Sender4");
    let (to, _) = register_agent(&client, "Receiver4");

    let path = format!("/api/agents/{}/inbox", encode_id(&to));
    let body = format!(r#"{{"type":"task.request","from":"{from}","body":{{}},"ttl_sec":3600}}"#);
    signed_post(&client, &from_secret, &path, body);

    let res = client
        .post(format!("/api/agents/{}/inbox/pull", encode_id(&to)))
        .dispatch();
    let pulled: serde_json::Value = res.into_json().unwrap();
    let mid = pulled["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/agents/{}/inbox/{}/reply", encode_id(&to), encode_id(&mid)))
        .header(ContentType::JSON)
        .body(r#"{"body": {"ok": true}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post(format!("/api/agents/{}/inbox/pull", encode_id(&from)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let reply: serde_json::Value = res.into_json().unwrap();
    assert_eq!(reply["from"], to);
}

#[test]
fn inbox_stats_reports_counts() {
    let client = test_client();
    let (_, _) = register_agent(&client, "Stats");
    let (to, _) = register_agent(&client, "StatsReceiver");

    let res = client
        .get(format!("/api/agents/{}/inbox/stats", encode_id(&to)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["agent_id"], to);
}
