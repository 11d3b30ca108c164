use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use std::sync::Arc;

use crate::error::HubResult;
use crate::hub::Hub;
use crate::models::{
    Agent, RegisterAgent, RegisterAgentResponse, RotateKeyResponse, SetWebhook,
};
use crate::rate_limit::{RateLimitConfig, RateLimited, RateLimitedError, RateLimiter};
use crate::registry;
use crate::storage::ListPage;

use super::ClientIp;

/// Either the registration response (with rate-limit headers) or a 429
/// when the caller is over `register_max` — same split as `PullReply`.
pub enum RegisterReply {
    Registered(RateLimited<RegisterAgentResponse>),
    RateLimited(RateLimitedError),
}

impl<'r> rocket::response::Responder<'r, 'static> for RegisterReply {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        match self {
            RegisterReply::Registered(r) => r.respond_to(req),
            RegisterReply::RateLimited(e) => e.respond_to(req),
        }
    }
}

#[post("/api/agents", format = "json", data = "<body>")]
pub async fn register_agent(
    hub: &State<Arc<Hub>>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    body: Json<RegisterAgent>,
) -> HubResult<RegisterReply> {
    let info = rate_limiter.check_with_info(
        &format!("register:{}", ip.0),
        rate_config.register_max,
        rate_config.register_window_secs,
    );
    if !info.allowed {
        return Ok(RegisterReply::RateLimited(RateLimitedError {
            info,
            message: "Rate limited: too many agent registrations".to_string(),
        }));
    }
    let resp = registry::register(hub, body.into_inner()).await?;
    Ok(RegisterReply::Registered(RateLimited::with_status(
        Json(resp),
        info,
        rocket::http::Status::Created,
    )))
}

#[get("/api/agents?<limit>&<cursor>")]
pub async fn list_agents(
    hub: &State<Arc<Hub>>,
    limit: Option<usize>,
    cursor: Option<String>,
) -> HubResult<Json<ListPage<Agent>>> {
    let limit = limit.unwrap_or(100).min(1000);
    let page = registry::list(hub, limit, cursor).await?;
    Ok(Json(page))
}

#[get("/api/agents/<id>")]
pub async fn get_agent(hub: &State<Arc<Hub>>, id: &str) -> HubResult<Json<Agent>> {
    Ok(Json(registry::get(hub, id).await?))
}

#[delete("/api/agents/<id>")]
pub async fn deregister_agent(hub: &State<Arc<Hub>>, id: &str) -> HubResult<()> {
    registry::deregister(hub, id).await
}

#[post("/api/agents/<id>/heartbeat")]
pub async fn heartbeat(hub: &State<Arc<Hub>>, id: &str) -> HubResult<Json<Agent>> {
    Ok(Json(registry::heartbeat(hub, id).await?))
}

#[post("/api/agents/<id>/rotate_key")]
pub async fn rotate_key(hub: &State<Arc<Hub>>, id: &str) -> HubResult<Json<RotateKeyResponse>> {
    Ok(Json(registry::rotate_key(hub, id).await?))
}

#[post("/api/agents/<id>/webhook", format = "json", data = "<body>")]
pub async fn set_webhook(
    hub: &State<Arc<Hub>>,
    id: &str,
    body: Json<SetWebhook>,
) -> HubResult<()> {
    registry::set_webhook(hub, id, body.into_inner()).await
}

#[delete("/api/agents/<id>/webhook")]
pub async fn delete_webhook(hub: &State<Arc<Hub>>, id: &str) -> HubResult<()> {
    registry::delete_webhook(hub, id).await
}
