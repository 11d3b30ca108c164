use rocket::http::{ContentType, Status};

use crate::common::{encode_id, register_agent, test_client};

fn create_group(client: &rocket::local::blocking::Client, body: &str) -> serde_json::Value {
    let res = client
        .post("/api/groups")
        .header(ContentType::JSON)
        .body(body.to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    res.into_json().unwrap()
}

#[test]
fn create_open_group_makes_creator_owner() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "Owner");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"standup","creator":"{creator}"}}"#),
    );
    assert_eq!(group["members"][&creator], "owner");
    assert_eq!(group["access_type"], "open");
}

#[test]
fn join_open_group_then_leave() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "Owner2");
    let (joiner, _) = register_agent(&client, "Joiner");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"open-room","creator":"{creator}"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/groups/{}/join", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id":"{joiner}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get(format!("/api/groups/{}", encode_id(&group_id))).dispatch();
    let group: serde_json::Value = res.into_json().unwrap();
    assert_eq!(group["members"][&joiner], "member");

    let res = client
        .post(format!(
            "/api/groups/{}/leave?agent_id={}",
            encode_id(&group_id),
            encode_id(&joiner)
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get(format!("/api/groups/{}", encode_id(&group_id))).dispatch();
    let group: serde_json::Value = res.into_json().unwrap();
    assert!(group["members"].get(&joiner).is_none());
}

#[test]
fn key_protected_group_rejects_wrong_key() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "Owner3");
    let (joiner, _) = register_agent(&client, "Joiner2");

    let group = create_group(
        &client,
        &format!(
            r#"{{"name":"locked","creator":"{creator}","access_type":"key-protected","join_key":"sesame"}}"#
        ),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/groups/{}/join", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id":"{joiner}","key":"wrong"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/api/groups/{}/join", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id":"{joiner}","key":"sesame"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn post_fans_out_to_all_members() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "Poster");
    let (member_a, _) = register_agent(&client, "MemberA");
    let (member_b, _) = register_agent(&client, "MemberB");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"fanout","creator":"{creator}"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    for member in [&member_a, &member_b] {
        let res = client
            .post(format!("/api/groups/{}/join", encode_id(&group_id)))
            .header(ContentType::JSON)
            .body(format!(r#"{{"agent_id":"{member}"}}"#))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }

    let res = client
        .post(format!("/api/groups/{}/post", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"from":"{creator}","body":{{"msg":"hi"}}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let posted: serde_json::Value = res.into_json().unwrap();
    assert_eq!(posted["recipients"], 3);
    assert_eq!(posted["accepted_async"], false);

    for recipient in [&creator, &member_a, &member_b] {
        let res = client
            .post(format!("/api/agents/{}/inbox/pull", encode_id(recipient)))
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
        let envelope: serde_json::Value = res.into_json().unwrap();
        assert_eq!(envelope["group"], group_id);
        assert_eq!(envelope["body"]["msg"], "hi");
    }
}

#[test]
fn post_from_non_member_is_rejected() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "Owner4");
    let (outsider, _) = register_agent(&client, "Outsider");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"private","creator":"{creator}"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/groups/{}/post", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"from":"{outsider}","body":{{}}}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn history_requires_history_visible_setting() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "Historian");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"quiet","creator":"{creator}"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    let res = client
        .get(format!("/api/groups/{}/history", encode_id(&group_id)))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let group = create_group(
        &client,
        &format!(
            r#"{{"name":"loud","creator":"{creator}","settings":{{"history_visible":true}}}}"#
        ),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    client
        .post(format!("/api/groups/{}/post", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"from":"{creator}","body":{{"n":1}}}}"#))
        .dispatch();

    let res = client
        .get(format!("/api/groups/{}/history", encode_id(&group_id)))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let page: serde_json::Value = res.into_json().unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
}

#[test]
fn invite_only_group_admits_via_invite_not_join() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "InviteOwner");
    let (invitee, _) = register_agent(&client, "Invitee");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"closed","creator":"{creator}","access_type":"invite-only"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    let res = client
        .post(format!("/api/groups/{}/join", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id":"{invitee}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    let res = client
        .post(format!("/api/groups/{}/invite", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"actor":"{creator}","agent_id":"{invitee}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get(format!("/api/groups/{}", encode_id(&group_id))).dispatch();
    let group: serde_json::Value = res.into_json().unwrap();
    assert_eq!(group["members"][&invitee], "member");
}

#[test]
fn invite_by_non_admin_is_rejected() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "InviteOwner2");
    let (member, _) = register_agent(&client, "PlainMember");
    let (invitee, _) = register_agent(&client, "Invitee2");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"closed2","creator":"{creator}","access_type":"invite-only"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    client
        .post(format!("/api/groups/{}/invite", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"actor":"{creator}","agent_id":"{member}"}}"#))
        .dispatch();

    let res = client
        .post(format!("/api/groups/{}/invite", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"actor":"{member}","agent_id":"{invitee}"}}"#))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn admin_removes_member() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "RemoveOwner");
    let (target, _) = register_agent(&client, "RemoveTarget");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"kickable","creator":"{creator}"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    client
        .post(format!("/api/groups/{}/join", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id":"{target}"}}"#))
        .dispatch();

    let res = client
        .delete(format!(
            "/api/groups/{}/members/{}?actor={}",
            encode_id(&group_id),
            encode_id(&target),
            encode_id(&creator)
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get(format!("/api/groups/{}", encode_id(&group_id))).dispatch();
    let group: serde_json::Value = res.into_json().unwrap();
    assert!(group["members"].get(&target).is_none());
}

#[test]
fn owner_deletes_group() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "DeleteOwner");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"ephemeral-room","creator":"{creator}"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    let res = client
        .delete(format!(
            "/api/groups/{}?actor={}",
            encode_id(&group_id),
            encode_id(&creator)
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client.get(format!("/api/groups/{}", encode_id(&group_id))).dispatch();
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn non_owner_cannot_delete_group() {
    let client = test_client();
    let (creator, _) = register_agent(&client, "DeleteOwner2");
    let (member, _) = register_agent(&client, "NotOwner");

    let group = create_group(
        &client,
        &format!(r#"{{"name":"protected-room","creator":"{creator}"}}"#),
    );
    let group_id = group["id"].as_str().unwrap().to_string();

    client
        .post(format!("/api/groups/{}/join", encode_id(&group_id)))
        .header(ContentType::JSON)
        .body(format!(r#"{{"agent_id":"{member}"}}"#))
        .dispatch();

    let res = client
        .delete(format!(
            "/api/groups/{}?actor={}",
            encode_id(&group_id),
            encode_id(&member)
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}
