use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{State, get, post};
use std::sync::Arc;

use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::inbox;
use crate::models::{
    AckRequest, InboxStats, NackRequest, PullResponse, ReplyRequest, SendMessageRequest,
    SendMessageResponse,
};
use crate::rate_limit::{RateLimitConfig, RateLimited, RateLimitedError, RateLimiter};
use crate::retention::{self, SweepReport};
use crate::signature::{self, RequestSigningContext};

use super::{AdminKey, ClientIp};

/// Either the delivered-message response (with rate-limit headers) or a 429
/// when the caller is over `send_max` — same split as `PullReply`.
pub enum DeliverReply {
    Sent(RateLimited<SendMessageResponse>),
    RateLimited(RateLimitedError),
}

impl<'r> rocket::response::Responder<'r, 'static> for DeliverReply {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        match self {
            DeliverReply::Sent(r) => r.respond_to(req),
            DeliverReply::RateLimited(e) => e.respond_to(req),
        }
    }
}

#[post("/api/agents/<to>/inbox", format = "json", data = "<body>")]
pub async fn deliver_message(
    hub: &State<Arc<Hub>>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    ctx: RequestSigningContext,
    to: &str,
    body: Json<SendMessageRequest>,
) -> HubResult<DeliverReply> {
    let info = rate_limiter.check_with_info(
        &format!("send:{}", ip.0),
        rate_config.send_max,
        rate_config.send_window_secs,
    );
    if !info.allowed {
        return Ok(DeliverReply::RateLimited(RateLimitedError {
            info,
            message: "Rate limited: too many inbox deliveries".to_string(),
        }));
    }

    let req = body.into_inner();
    signature::authenticate(hub, &ctx, &req.from).await?;

    let resp = inbox::send(hub, to, req).await?;
    Ok(DeliverReply::Sent(RateLimited::new(Json(resp), info)))
}

/// A 204-equivalent "inbox empty" response is modeled as `Option::None`
/// mapped to `Status::NoContent` by the custom `Responder` below (spec §4.4
/// pull, §6 status code table).
pub struct PullOutcome(pub Option<PullResponse>);

impl<'r> rocket::response::Responder<'r, 'static> for PullOutcome {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        match self.0 {
            Some(resp) if resp.body_purged => {
                rocket::response::Response::build_from(Json(resp).respond_to(req)?)
                    .status(Status::Gone)
                    .ok()
            }
            Some(resp) => Json(resp).respond_to(req),
            None => rocket::response::Response::build().status(Status::NoContent).ok(),
        }
    }
}

/// Either the pull outcome (200/204/410, via `PullOutcome`) or a 429 when
/// the caller is rate limited — `pull` needs raw status control that the
/// generic `RateLimited<T>` JSON wrapper doesn't offer, so this enum picks
/// between the two `Responder` impls directly.
pub enum PullReply {
    Outcome(PullOutcome),
    RateLimited(crate::rate_limit::RateLimitedError),
}

impl<'r> rocket::response::Responder<'r, 'static> for PullReply {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        match self {
            PullReply::Outcome(o) => o.respond_to(req),
            PullReply::RateLimited(e) => e.respond_to(req),
        }
    }
}

#[post("/api/agents/<id>/inbox/pull?<lease_seconds>")]
pub async fn pull_message(
    hub: &State<Arc<Hub>>,
    rate_limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    id: &str,
    lease_seconds: Option<i64>,
) -> HubResult<PullReply> {
    let info = rate_limiter.check_with_info(
        &format!("pull:{}", ip.0),
        rate_config.pull_max,
        rate_config.pull_window_secs,
    );
    if !info.allowed {
        return Ok(PullReply::RateLimited(crate::rate_limit::RateLimitedError {
            info,
            message: "Rate limited: too many inbox pulls".to_string(),
        }));
    }
    let outcome = inbox::pull(hub, id, lease_seconds).await?;
    Ok(PullReply::Outcome(PullOutcome(outcome)))
}

#[post("/api/agents/<id>/inbox/<mid>/ack", format = "json", data = "<body>")]
pub async fn ack_message(
    hub: &State<Arc<Hub>>,
    id: &str,
    mid: &str,
    body: Option<Json<AckRequest>>,
) -> HubResult<()> {
    inbox::ack(hub, id, mid, body.map(|b| b.into_inner()).unwrap_or_default()).await
}

#[post("/api/agents/<id>/inbox/<mid>/nack", format = "json", data = "<body>")]
pub async fn nack_message(
    hub: &State<Arc<Hub>>,
    id: &str,
    mid: &str,
    body: Json<NackRequest>,
) -> HubResult<()> {
    inbox::nack(hub, id, mid, body.into_inner()).await
}

#[post("/api/agents/<id>/inbox/<mid>/reply", format = "json", data = "<body>")]
pub async fn reply_message(
    hub: &State<Arc<Hub>>,
    id: &str,
    mid: &str,
    body: Json<ReplyRequest>,
) -> HubResult<Json<SendMessageResponse>> {
    Ok(Json(inbox::reply(hub, id, mid, body.into_inner()).await?))
}

#[get("/api/agents/<id>/inbox/stats")]
pub async fn inbox_stats(hub: &State<Arc<Hub>>, id: &str) -> HubResult<Json<InboxStats>> {
    Ok(Json(inbox::stats(hub, id).await?))
}

/// Operational escape hatch (spec §6 `POST /api/agents/{id}/inbox/reclaim`):
/// runs one sweep pass immediately instead of waiting for the next tick.
/// Requires the admin key since it's a blunt, hub-wide operation, not
/// scoped to `id`.
#[post("/api/agents/<_id>/inbox/reclaim")]
pub async fn force_reclaim(
    hub: &State<Arc<Hub>>,
    admin: Option<AdminKey>,
    _id: &str,
) -> HubResult<Json<SweepReportView>> {
    if admin.is_none() {
        return Err(HubError::SignatureVerification(
            "a valid admin key is required for forced reclaim".into(),
        ));
    }
    let report = retention::run_sweep(hub).await;
    Ok(Json(SweepReportView::from(report)))
}

#[derive(serde::Serialize)]
pub struct SweepReportView {
    pub reclaimed: i64,
    pub dead_lettered_leases: i64,
    pub expired: i64,
    pub cleaned_up: i64,
    pub ephemeral_purged: i64,
    pub agents_marked_offline: i64,
}

impl From<SweepReport> for SweepReportView {
    fn from(r: SweepReport) -> Self {
        SweepReportView {
            reclaimed: r.reclaimed,
            dead_lettered_leases: r.dead_lettered_leases,
            expired: r.expired,
            cleaned_up: r.cleaned_up,
            ephemeral_purged: r.ephemeral_purged,
            agents_marked_offline: r.agents_marked_offline,
        }
    }
}
