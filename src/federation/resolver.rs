//! Remote actor resolution
//!
//! Fetch-or-create remote identity records via direct ActivityPub GET or
//! WebFinger discovery. The persisted actor row is the only cache;
//! staleness is handled opportunistically when signature verification
//! fails (see the inbox pipeline).

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::data::{Actor, Database, EntityId};
use crate::error::AppError;
use crate::federation::queue::{Job, JobQueue};
use crate::federation::webfinger;

const ACCEPT_ACTIVITY_JSON: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

const ACTOR_TYPES: [&str; 4] = ["Person", "Service", "Organization", "Group"];

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

/// Extract and validate the remote domain from an actor URL or key ID URL.
///
/// Rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = actor_or_key_id.split('#').next().unwrap_or(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Blocked);
    }

    Ok(host)
}

/// Required fields extracted from a remote actor document.
#[derive(Debug, Clone)]
pub struct ParsedActorDocument {
    pub ap_id: String,
    pub actor_type: String,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox_url: String,
    pub outbox_url: Option<String>,
    pub shared_inbox_url: Option<String>,
    pub public_key_pem: String,
    pub profile_fields: Option<String>,
    pub emoji_tags: Option<String>,
    pub featured_url: Option<String>,
}

/// Validate a remote actor document, naming the first missing field.
pub fn parse_actor_document(document: &Value) -> Result<ParsedActorDocument, AppError> {
    let missing = |field: &str| AppError::ActorFetch(format!("Actor document missing {}", field));

    let actor_type = document
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("type"))?;

    if !ACTOR_TYPES.contains(&actor_type) {
        return Err(AppError::ActorFetch(format!(
            "Unsupported actor type: {}",
            actor_type
        )));
    }

    let ap_id = document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("id"))?
        .to_string();

    let inbox_url = document
        .get("inbox")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("inbox"))?
        .to_string();

    let outbox_url = document
        .get("outbox")
        .and_then(Value::as_str)
        .map(str::to_string);
    if outbox_url.is_none() {
        return Err(missing("outbox"));
    }

    let public_key_pem = document
        .get("publicKey")
        .and_then(|key| key.get("publicKeyPem"))
        .and_then(Value::as_str)
        .ok_or_else(|| missing("publicKey.publicKeyPem"))?
        .to_string();

    let username = document
        .get("preferredUsername")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            // Fall back to the last path segment of the id.
            url::Url::parse(&ap_id).ok().and_then(|u| {
                u.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_string))
            })
        })
        .ok_or_else(|| missing("preferredUsername"))?;

    let shared_inbox_url = document
        .get("endpoints")
        .and_then(|e| e.get("sharedInbox"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let profile_fields = document
        .get("attachment")
        .filter(|v| v.is_array())
        .map(|v| v.to_string());

    let emoji_tags = document.get("tag").and_then(Value::as_array).map(|tags| {
        let emoji: Vec<&Value> = tags
            .iter()
            .filter(|tag| tag.get("type").and_then(Value::as_str) == Some("Emoji"))
            .collect();
        serde_json::to_string(&emoji).unwrap_or_else(|_| "[]".to_string())
    });

    Ok(ParsedActorDocument {
        ap_id,
        actor_type: actor_type.to_string(),
        username,
        display_name: document
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
        summary: document
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string),
        inbox_url,
        outbox_url,
        shared_inbox_url,
        public_key_pem,
        profile_fields,
        emoji_tags,
        featured_url: document
            .get("featured")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Resolves remote identities to persisted [`Actor`] rows.
pub struct ActorResolver {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    queue: Arc<dyn JobQueue>,
}

impl ActorResolver {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            db,
            http_client,
            queue,
        }
    }

    /// Resolve an AP URI or a `user@domain` handle to an actor record.
    ///
    /// Resolution is idempotent: an already-persisted actor is returned
    /// as-is, never overwritten.
    pub async fn resolve(&self, uri_or_handle: &str) -> Result<Actor, AppError> {
        if uri_or_handle.starts_with("http://") || uri_or_handle.starts_with("https://") {
            self.resolve_uri(uri_or_handle).await
        } else {
            let uri = webfinger::resolve_handle(uri_or_handle, &self.http_client).await?;
            self.resolve_uri(&uri).await
        }
    }

    /// Resolve the actor owning a signature keyId.
    pub async fn resolve_key_owner(&self, key_id: &str) -> Result<Actor, AppError> {
        let actor_uri = key_id.split('#').next().unwrap_or(key_id);
        self.resolve_uri(actor_uri).await
    }

    async fn resolve_uri(&self, uri: &str) -> Result<Actor, AppError> {
        if let Some(actor) = self.db.get_actor_by_ap_id(uri).await? {
            return Ok(actor);
        }

        let document = self.fetch_document(uri).await?;
        let parsed = parse_actor_document(&document)?;
        let domain = actor_domain(&parsed.ap_id)?;

        let now = Utc::now();
        let actor = Actor {
            id: EntityId::new().0,
            ap_id: parsed.ap_id.clone(),
            username: parsed.username,
            domain,
            display_name: parsed.display_name,
            summary: parsed.summary,
            inbox_url: parsed.inbox_url,
            outbox_url: parsed.outbox_url,
            shared_inbox_url: parsed.shared_inbox_url,
            public_key_pem: parsed.public_key_pem,
            private_key_pem: None,
            local: false,
            followers_count: 0,
            following_count: 0,
            posts_count: 0,
            profile_fields: parsed.profile_fields,
            emoji_tags: parsed.emoji_tags,
            created_at: now,
            refreshed_at: now,
        };

        let actor = self.db.insert_actor(&actor).await?;

        if let Some(featured_url) = parsed.featured_url {
            self.queue.enqueue(Job::FetchFeatured {
                actor_ap_id: actor.ap_id.clone(),
                featured_url,
            });
        }

        tracing::info!(actor = %actor.ap_id, "Resolved remote actor");
        Ok(actor)
    }

    /// Force-refetch a remote actor document and update the stored row.
    ///
    /// Used when signature verification fails against a stale cached key.
    pub async fn refresh(&self, ap_id: &str) -> Result<Actor, AppError> {
        let document = self.fetch_document(ap_id).await?;
        let parsed = parse_actor_document(&document)?;

        if parsed.ap_id != ap_id {
            return Err(AppError::ActorFetch(format!(
                "Actor document id {} does not match requested {}",
                parsed.ap_id, ap_id
            )));
        }

        let existing = self
            .db
            .get_actor_by_ap_id(ap_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let refreshed = Actor {
            display_name: parsed.display_name,
            summary: parsed.summary,
            inbox_url: parsed.inbox_url,
            outbox_url: parsed.outbox_url,
            shared_inbox_url: parsed.shared_inbox_url,
            public_key_pem: parsed.public_key_pem,
            profile_fields: parsed.profile_fields,
            emoji_tags: parsed.emoji_tags,
            refreshed_at: Utc::now(),
            ..existing
        };

        self.db.refresh_actor(&refreshed).await?;
        tracing::info!(actor = %ap_id, "Refreshed remote actor");
        Ok(refreshed)
    }

    /// Fetch an ActivityPub document with the federation accept header.
    pub async fn fetch_document(&self, uri: &str) -> Result<Value, AppError> {
        actor_domain(uri)?;

        let response = self
            .http_client
            .get(uri)
            .header("Accept", ACCEPT_ACTIVITY_JSON)
            .send()
            .await
            .map_err(|e| AppError::ActorFetch(format!("Failed to fetch {}: {}", uri, e)))?;

        if !response.status().is_success() {
            return Err(AppError::ActorFetch(format!(
                "Fetch of {} returned HTTP {}",
                uri,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::ActorFetch(format!("Invalid document at {}: {}", uri, e)))
    }

    /// Fetch an actor's featured (pinned) collection and persist its items.
    pub async fn fetch_featured(
        &self,
        actor_ap_id: &str,
        featured_url: &str,
    ) -> Result<(), AppError> {
        let collection = self.fetch_document(featured_url).await?;

        let items = collection
            .get("orderedItems")
            .or_else(|| collection.get("items"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for item in items {
            let result = match &item {
                Value::String(uri) => self.fetch_object(uri).await.map(|_| ()),
                Value::Object(_) => crate::federation::content::persist_remote_object(
                    &self.db, &item, actor_ap_id,
                )
                .await
                .map(|_| ()),
                _ => Ok(()),
            };

            if let Err(e) = result {
                tracing::warn!(actor = %actor_ap_id, error = %e, "Failed to persist featured item");
            }
        }

        Ok(())
    }

    /// Fetch a remote object by URI and persist it.
    pub async fn fetch_object(&self, object_ap_id: &str) -> Result<(), AppError> {
        if self.db.get_object_by_ap_id(object_ap_id).await?.is_some() {
            return Ok(());
        }

        let document = self.fetch_document(object_ap_id).await?;
        let attributed_to = document
            .get("attributedTo")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::ActorFetch("Object missing attributedTo".to_string()))?
            .to_string();

        crate::federation::content::persist_remote_object(&self.db, &document, &attributed_to)
            .await?;
        Ok(())
    }
}
