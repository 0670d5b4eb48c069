//! ActivityPub endpoints
//!
//! - Actor documents
//! - Per-actor inbox
//! - Shared inbox
//!
//! Inboxes return `202 Accepted` for any recognized-or-unrecognized
//! activity type, `400` on a malformed envelope, `401` on signature
//! failure, `403` when the sender is blocked, `404` when the target
//! user does not exist.

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::{Path, State},
    response::Json,
    routing::{get, post},
};
use http::HeaderMap;

use crate::AppState;
use crate::error::AppError;
use crate::metrics::{FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL};

const ACCEPTED_CONTENT_TYPES: [&str; 3] = [
    "application/json",
    "application/activity+json",
    "application/ld+json",
];

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - POST /users/:username/inbox - Per-actor inbox
/// - POST /inbox - Shared inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
}

fn check_content_type(headers: &HeaderMap) -> Result<(), AppError> {
    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    let base = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if ACCEPTED_CONTENT_TYPES.contains(&base.as_str()) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Unsupported Content-Type: {}",
            content_type
        )))
    }
}

/// GET /users/:username
///
/// Returns the ActivityPub actor document for a local account.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let actor = state
        .services
        .db
        .get_local_actor(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let base_url = state.config.server.base_url();

    Ok(Json(serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor.ap_id,
        "preferredUsername": actor.username,
        "name": actor.display_name.clone().unwrap_or_else(|| actor.username.clone()),
        "summary": actor.summary.clone().unwrap_or_default(),
        "inbox": actor.inbox_url,
        "outbox": actor.outbox_url,
        "followers": format!("{}/followers", actor.ap_id),
        "following": format!("{}/following", actor.ap_id),
        "url": actor.ap_id,
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.ap_id,
            "publicKeyPem": actor.public_key_pem
        }
    })))
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities addressed to one local actor.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    check_content_type(&headers)?;

    let target = state
        .services
        .db
        .get_local_actor(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    // Reject unsigned requests before reading the envelope.
    if headers.get("signature").is_none() {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Signature("Missing Signature header".to_string()));
    }

    let path = format!("/users/{}/inbox", username);
    let result = state
        .dispatcher
        .process(&path, &headers, &body, Some(target))
        .await;

    match result {
        Ok(()) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "success"])
                .inc();
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            let status = match &e {
                AppError::Blocked => "forbidden",
                AppError::Signature(_) => "unauthorized",
                _ => "error",
            };
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", status])
                .inc();
            Err(e)
        }
    }
}

/// POST /inbox
///
/// Shared inbox: one delivery for all local recipients. Performs
/// relay-vs-regular classification before dispatch; recipients are
/// inferred from envelope addressing by the type handlers.
async fn shared_inbox(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    check_content_type(&headers)?;

    if headers.get("signature").is_none() {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Signature("Missing Signature header".to_string()));
    }

    let result = state.dispatcher.process("/inbox", &headers, &body, None).await;

    match result {
        Ok(()) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "success"])
                .inc();
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            let status = match &e {
                AppError::Blocked => "forbidden",
                AppError::Signature(_) => "unauthorized",
                _ => "error",
            };
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", status])
                .inc();
            Err(e)
        }
    }
}
