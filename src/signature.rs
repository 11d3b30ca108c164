use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::storage::AgentRecord;

/// Raw signing-relevant request bits captured by the `SignatureHeaders`
/// Rocket request guard (`routes::mod`). Never `Err`s on its own — missing
/// headers just leave the corresponding field `None`, and `authenticate`
/// below decides what that means.
#[derive(Debug, Clone)]
pub struct RequestSigningContext {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub date: Option<String>,
    pub signature: Option<String>,
}

/// Authenticates `from` against `ctx` per spec §4.2: a registered agent
/// must present a valid `Signature` header over the canonical string; an
/// unregistered sender is allowed through silently only when
/// `allow_unregistered_senders` is set (spec §9 Open Question, resolved in
/// DESIGN.md).
pub async fn authenticate(hub: &Hub, ctx: &RequestSigningContext, from: &str) -> HubResult<()> {
    let agent = hub.storage.get_agent(from).await?;

    let Some(agent) = agent else {
        return if hub.config.allow_unregistered_senders {
            Ok(())
        } else {
            Err(HubError::SignatureVerification(format!(
                "sender {from} is not a registered agent"
            )))
        };
    };

    let date = ctx
        .date
        .as_deref()
        .ok_or_else(|| HubError::SignatureVerification("missing Date header".into()))?;
    let raw_sig = ctx
        .signature
        .as_deref()
        .ok_or_else(|| HubError::SignatureVerification("missing Signature header".into()))?;

    check_date_skew(date)?;
    let header = parse_signature_header(raw_sig)?;
    let host = ctx.host.as_deref().unwrap_or("");
    let signing_string = canonical_signing_string(&ctx.method, &ctx.path, host, date);
    verify(&header, &signing_string, &agent)
}

const MAX_CLOCK_SKEW_SEC: i64 = 300;

/// Parsed `Signature` header per spec §4.2: `keyId="…",algorithm="ed25519",
/// headers="(request-target) host date",signature="<base64>"`.
#[derive(Debug, Clone)]
pub struct ParsedSignatureHeader {
    pub key_id: String,
    pub algorithm: String,
    pub headers: Vec<String>,
    pub signature_b64: String,
}

pub fn parse_signature_header(raw: &str) -> HubResult<ParsedSignatureHeader> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature_b64 = None;

    for part in split_signature_params(raw) {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        let v = v.trim().trim_matches('"');
        match k.trim() {
            "keyId" => key_id = Some(v.to_string()),
            "algorithm" => algorithm = Some(v.to_string()),
            "headers" => headers = Some(v.split(' ').map(str::to_string).collect()),
            "signature" => signature_b64 = Some(v.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignatureHeader {
        key_id: key_id.ok_or_else(|| HubError::SignatureVerification("missing keyId".into()))?,
        algorithm: algorithm
            .ok_or_else(|| HubError::SignatureVerification("missing algorithm".into()))?,
        headers: headers
            .ok_or_else(|| HubError::SignatureVerification("missing headers".into()))?,
        signature_b64: signature_b64
            .ok_or_else(|| HubError::SignatureVerification("missing signature".into()))?,
    })
}

/// Splits `a="b",c="d, e"` on top-level commas, respecting quoted sections
/// (the `headers` param is itself a space-joined list, never comma-joined,
/// so this is simpler than full HTTP Signature grammar).
fn split_signature_params(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in raw.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Builds the canonical signing string: `(request-target): <method> <path>`,
/// `host: <host>`, `date: <RFC1123 date>`, newline-joined, in that exact
/// order (spec §4.2 — order is part of the contract, not just presence).
pub fn canonical_signing_string(method: &str, path: &str, host: &str, date: &str) -> String {
    format!(
        "(request-target): {} {}\nhost: {}\ndate: {}",
        method.to_lowercase(),
        path,
        host,
        date
    )
}

pub fn check_date_skew(date_header: &str) -> HubResult<()> {
    let parsed = DateTime::parse_from_rfc2822(date_header)
        .map_err(|_| HubError::SignatureVerification("unparseable date header".into()))?;
    let now = Utc::now();
    let skew = (now - parsed.with_timezone(&Utc)).num_seconds().abs();
    if skew > MAX_CLOCK_SKEW_SEC {
        return Err(HubError::SignatureVerification(format!(
            "date skew {}s exceeds {}s",
            skew, MAX_CLOCK_SKEW_SEC
        )));
    }
    Ok(())
}

/// Verifies a parsed `Signature` header against `agent`'s current key, or
/// its previous key within the post-rotation grace window (§4.3).
pub fn verify(
    header: &ParsedSignatureHeader,
    signing_string: &str,
    agent: &AgentRecord,
) -> HubResult<()> {
    if header.algorithm != "ed25519" {
        return Err(HubError::SignatureVerification(format!(
            "unsupported algorithm: {}",
            header.algorithm
        )));
    }

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&header.signature_b64)
        .map_err(|_| HubError::SignatureVerification("signature is not valid base64".into()))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| HubError::SignatureVerification("signature must be 64 bytes".into()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    if verify_with_key(&agent.public_key, signing_string.as_bytes(), &signature).is_ok() {
        return Ok(());
    }

    if let Some((prev_key, expires_at)) = &agent.previous_public_key
        && Utc::now() < *expires_at
        && verify_with_key(prev_key, signing_string.as_bytes(), &signature).is_ok()
    {
        return Ok(());
    }

    Err(HubError::SignatureVerification(
        "signature does not match any known key".into(),
    ))
}

fn verify_with_key(key_bytes: &[u8], message: &[u8], signature: &Signature) -> Result<(), ()> {
    let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| ())?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| ())?;
    key.verify(message, signature).map_err(|_| ())
}
