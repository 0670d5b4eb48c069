//! WebFinger protocol implementation
//!
//! Used to discover ActivityPub actor URIs from `user@domain` handles,
//! and to answer discovery queries for local accounts.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const ACTIVITY_JSON: &str = "application/activity+json";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Resolve a `user@domain` handle to an ActivityPub actor URI.
///
/// Queries `https://<domain>/.well-known/webfinger?resource=acct:<handle>`
/// and extracts the `rel=self` link of type `application/activity+json`.
pub async fn resolve_handle(
    handle: &str,
    http_client: &reqwest::Client,
) -> Result<String, AppError> {
    let handle = handle.trim_start_matches('@');
    let (_, domain) = handle
        .split_once('@')
        .ok_or_else(|| AppError::Validation(format!("Not a handle: {}", handle)))?;

    let url = format!(
        "https://{}/.well-known/webfinger?resource=acct:{}",
        domain,
        urlencoding::encode(handle)
    );

    let response = http_client
        .get(&url)
        .header("Accept", "application/jrd+json, application/json")
        .send()
        .await
        .map_err(|e| AppError::ActorFetch(format!("WebFinger request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::ActorFetch(format!(
            "WebFinger lookup for {} returned HTTP {}",
            handle,
            response.status()
        )));
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::ActorFetch(format!("Invalid WebFinger response: {}", e)))?;

    jrd.links
        .iter()
        .find(|link| {
            link.rel == "self" && link.link_type.as_deref() == Some(ACTIVITY_JSON)
        })
        .and_then(|link| link.href.clone())
        .ok_or_else(|| {
            AppError::ActorFetch(format!("No ActivityPub self link for {}", handle))
        })
}

/// Generate the WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `base_url` - Instance base URL (includes protocol)
pub fn generate_response(username: &str, domain: &str, base_url: &str) -> WebFingerResponse {
    let subject = format!("acct:{}@{}", username, domain);
    let actor_url = format!("{}/users/{}", base_url.trim_end_matches('/'), username);

    WebFingerResponse {
        subject,
        aliases: Some(vec![actor_url.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_JSON.to_string()),
                href: Some(actor_url.clone()),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url),
            },
        ],
    }
}
