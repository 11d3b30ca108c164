use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use thiserror::Error;

/// Every error kind the hub can return, each pinned to the HTTP status it
/// maps to at the edge (see spec §7).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("agent already exists: {0}")]
    AgentAlreadyExists(String),
    #[error("signature verification failed: {0}")]
    SignatureVerification(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("lease expired")]
    LeaseExpired,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("gone: body purged")]
    Gone,
    #[error("ttl out of range: {0}")]
    TtlOutOfRange(String),
    #[error("group not found: {0}")]
    GroupNotFound(String),
    #[error("not a member of group")]
    NotAMember,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("invalid webhook url: {0}")]
    InvalidWebhookUrl(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl HubError {
    pub fn code(&self) -> &'static str {
        match self {
            HubError::InvalidEnvelope(_) => "INVALID_ENVELOPE",
            HubError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            HubError::AgentAlreadyExists(_) => "AGENT_ALREADY_EXISTS",
            HubError::SignatureVerification(_) => "SIGNATURE_VERIFICATION_FAILED",
            HubError::MessageNotFound(_) => "MESSAGE_NOT_FOUND",
            HubError::LeaseExpired => "LEASE_EXPIRED",
            HubError::Conflict(_) => "CONFLICT",
            HubError::Gone => "GONE",
            HubError::TtlOutOfRange(_) => "TTL_OUT_OF_RANGE",
            HubError::GroupNotFound(_) => "GROUP_NOT_FOUND",
            HubError::NotAMember => "NOT_A_MEMBER",
            HubError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            HubError::InvalidWebhookUrl(_) => "INVALID_WEBHOOK_URL",
            HubError::Internal(_) => "INTERNAL",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            HubError::InvalidEnvelope(_) | HubError::TtlOutOfRange(_) => Status::BadRequest,
            HubError::SignatureVerification(_) => Status::Unauthorized,
            HubError::AgentNotFound(_) | HubError::MessageNotFound(_) | HubError::GroupNotFound(_) => {
                Status::NotFound
            }
            HubError::AgentAlreadyExists(_) | HubError::Conflict(_) | HubError::LeaseExpired => {
                Status::Conflict
            }
            HubError::Gone => Status::Gone,
            HubError::NotAMember => Status::Forbidden,
            HubError::InvalidWebhookUrl(_) => Status::BadRequest,
            HubError::StorageUnavailable(_) => Status::ServiceUnavailable,
            HubError::Internal(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for HubError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));
        Response::build_from(body.respond_to(req)?)
            .status(status)
            .ok()
    }
}

pub type HubResult<T> = Result<T, HubError>;

impl From<crate::storage::StorageError> for HubError {
    fn from(e: crate::storage::StorageError) -> Self {
        match e {
            crate::storage::StorageError::Conflict(msg) => HubError::Conflict(msg),
            crate::storage::StorageError::Unavailable(msg) => HubError::StorageUnavailable(msg),
            crate::storage::StorageError::NotFound => {
                HubError::Internal("storage returned not-found from a fallible op".into())
            }
        }
    }
}
