use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use std::sync::Arc;

use crate::error::HubResult;
use crate::groups;
use crate::hub::Hub;
use crate::models::{
    CreateGroup, Group, GroupPostRequest, GroupPostResponse, InviteMember, JoinGroup,
    MessageEnvelope,
};
use crate::rate_limit::{RateLimitConfig, RateLimitedError, RateLimiter};
use crate::storage::ListPage;

use super::{ClientIp, Created};

#[post("/api/groups", format = "json", data = "<body>")]
pub async fn create_group(
    hub: &State<Arc<Hub>>,
    body: Json<CreateGroup>,
) -> HubResult<Created<Group>> {
    Ok(Created(groups::create(hub, body.into_inner()).await?))
}

#[get("/api/groups?<limit>&<cursor>")]
pub async fn list_groups(
    hub: &State<Arc<Hub>>,
    limit: Option<usize>,
    cursor: Option<String>,
) -> HubResult<Json<Vec<Group>>> {
    let limit = limit.unwrap_or(100).min(1000);
    Ok(Json(groups::list(hub, limit, cursor).await?))
}

#[get("/api/groups/<id>")]
pub async fn get_group(hub: &State<Arc<Hub>>, id: &str) -> HubResult<Json<Group>> {
    Ok(Json(groups::get(hub, id).await?))
}

#[post("/api/groups/<id>/join", format = "json", data = "<body>")]
pub async fn join_group(hub: &State<Arc<Hub>>, id: &str, body: Json<JoinGroup>) -> HubResult<()> {
    groups::join(hub, id, body.into_inner()).await
}

#[post("/api/groups/<id>/leave?<agent_id>")]
pub async fn leave_group(hub: &State<Arc<Hub>>, id: &str, agent_id: &str) -> HubResult<()> {
    groups::leave(hub, id, agent_id).await
}

/// Admin/owner-only admission to an invite-only group (spec §4.5 "invite-only
/// groups require an admin role"), distinct from self-service `join`.
#[post("/api/groups/<id>/invite", format = "json", data = "<body>")]
pub async fn invite_member(
    hub: &State<Arc<Hub>>,
    id: &str,
    body: Json<InviteMember>,
) -> HubResult<()> {
    let req = body.into_inner();
    groups::invite(hub, id, &req.actor, &req.agent_id).await
}

#[delete("/api/groups/<id>/members/<target>?<actor>")]
pub async fn remove_member(
    hub: &State<Arc<Hub>>,
    id: &str,
    target: &str,
    actor: &str,
) -> HubResult<()> {
    groups::remove_member(hub, id, actor, target).await
}

/// Owner-only group teardown (spec §3/§4.5 "destroyed by owner").
#[delete("/api/groups/<id>?<actor>")]
pub async fn delete_group(hub: &State<Arc<Hub>>, id: &str, actor: &str) -> HubResult<()> {
    groups::delete(hub, id, actor).await
}

/// `202 Accepted` when fanout continues asynchronously past the group's
/// member threshold, `200 OK` otherwise (spec §4.5); `429` when the poster
/// is over `group_post_max` — mirrors `inbox::PullReply`'s split between a
/// status-bearing success body and the rate-limit responder.
pub enum PostReply {
    Posted(GroupPostResponse),
    RateLimited(RateLimitedError),
}

impl<'r> rocket::response::Responder<'r, 'static> for PostReply {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        match self {
            PostReply::Posted(resp) => {
                let status = if resp.accepted_async { Status::Accepted } else { Status::Ok };
                rocket::response::Response::build_from(Json(resp).respond_to(req)?)
                    .status(status)
                    .ok()
            }
            PostReply::RateLimited(e) => e.respond_to(req),
        }
    }
}

#[post("/api/groups/<id>/post", format = "json", data = "<body>")]
pub async fn post_to_group(
    hub: &State<Arc<Hub>>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    id: &str,
    body: Json<GroupPostRequest>,
) -> HubResult<PostReply> {
    let info = rate_limiter.check_with_info(
        &format!("group_post:{}", ip.0),
        rate_config.group_post_max,
        rate_config.group_post_window_secs,
    );
    if !info.allowed {
        return Ok(PostReply::RateLimited(RateLimitedError {
            info,
            message: "Rate limited: too many group posts".to_string(),
        }));
    }
    let resp = groups::post(hub.inner().clone(), id, body.into_inner()).await?;
    Ok(PostReply::Posted(resp))
}

#[get("/api/groups/<id>/history?<limit>&<cursor>")]
pub async fn group_history(
    hub: &State<Arc<Hub>>,
    id: &str,
    limit: Option<usize>,
    cursor: Option<String>,
) -> HubResult<Json<ListPage<MessageEnvelope>>> {
    let limit = limit.unwrap_or(50).min(1000);
    Ok(Json(groups::history(hub, id, limit, cursor).await?))
}
