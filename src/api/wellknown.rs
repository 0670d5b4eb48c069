//! Well-known discovery endpoints
//!
//! WebFinger is how peers map `user@domain` handles to actor URIs; it
//! has to be served for the Follow handshake to reach us at all.

use axum::{
    Router,
    extract::{Query, State},
    response::Json,
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::generate_webfinger_response;

pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let resource = query.resource.trim();
    let acct = resource
        .strip_prefix("acct:")
        .unwrap_or(resource)
        .trim_start_matches('@');

    let (username, domain) = acct
        .split_once('@')
        .ok_or_else(|| AppError::Validation(format!("Invalid resource: {}", resource)))?;

    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let actor = state
        .services
        .db
        .get_local_actor(username)
        .await?
        .ok_or(AppError::NotFound)?;

    let response = generate_webfinger_response(
        &actor.username,
        &state.config.server.domain,
        &state.config.server.base_url(),
    );

    Ok(Json(serde_json::to_value(response).map_err(|e| {
        AppError::Internal(anyhow::anyhow!("serialize webfinger: {e}"))
    })?))
}
