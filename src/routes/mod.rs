// Route module decomposition — each domain area in its own file, the way
// the teacher organizes `src/routes/<domain>.rs`. Shared request guards
// live here; route functions in submodules, re-exported for `lib.rs`'s
// single `rocket::routes![...]` mount list.

mod agents;
mod groups;
mod inbox;
mod system;

pub use agents::{
    delete_webhook, deregister_agent, get_agent, heartbeat, list_agents, register_agent,
    rotate_key, set_webhook,
};
pub use groups::{
    create_group, delete_group, get_group, group_history, invite_member, join_group, leave_group,
    list_groups, post_to_group, remove_member,
};
pub use inbox::{ack_message, deliver_message, force_reclaim, inbox_stats, nack_message, pull_message, reply_message};
pub use system::{health, not_found, stats, too_many_requests};

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

use crate::signature::RequestSigningContext;

/// Wraps a JSON body with `201 Created` (spec §6 "201 on creation") — used
/// by the two endpoints that create a new resource (`register_agent`,
/// `create_group`); everything else returning `Json<T>` keeps Rocket's
/// default `200 OK`.
pub struct Created<T>(pub T);

impl<'r, T: serde::Serialize> rocket::response::Responder<'r, 'static> for Created<T> {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'static> {
        rocket::response::Response::build_from(
            rocket::serde::json::Json(self.0).respond_to(req)?,
        )
        .status(Status::Created)
        .ok()
    }
}

/// Client IP extraction, used as the rate-limit bucket key.
pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}

/// Optional `Authorization: Bearer <api_key>` — coarse access control
/// alongside the primary HTTP Signature authentication (spec §6).
pub struct BearerAuth(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerAuth {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let key = req
            .headers()
            .get_one("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string);
        Outcome::Success(BearerAuth(key))
    }
}

/// Captures the method/path/host/date/signature bits needed for HTTP
/// Signature verification (spec §4.2) without deciding anything itself —
/// always succeeds so handlers can apply `signature::authenticate` with
/// the sender id known only once the body is parsed.
#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestSigningContext {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(RequestSigningContext {
            method: req.method().as_str().to_string(),
            path: req.uri().path().to_string(),
            host: req.headers().get_one("Host").map(str::to_string),
            date: req.headers().get_one("Date").map(str::to_string),
            signature: req.headers().get_one("Signature").map(str::to_string),
        })
    }
}

/// Shared admin guard for operational endpoints (e.g. forced reclaim) —
/// same `Bearer`/`X-Admin-Key` shape the teacher uses for room admin ops.
/// Only succeeds when the presented key matches `HubConfig::admin_key`; if
/// no admin key is configured, the guard always forwards (the endpoint is
/// effectively disabled rather than open to anyone with a bearer token).
pub struct AdminKey(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminKey {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(hub) = req.rocket().state::<std::sync::Arc<crate::hub::Hub>>() else {
            return Outcome::Forward(Status::Unauthorized);
        };
        let Some(expected) = &hub.config.admin_key else {
            return Outcome::Forward(Status::Unauthorized);
        };

        let presented = req
            .headers()
            .get_one("Authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .or_else(|| req.headers().get_one("X-Admin-Key"));

        match presented {
            Some(key) if key == expected => Outcome::Success(AdminKey(key.to_string())),
            _ => Outcome::Forward(Status::Unauthorized),
        }
    }
}
