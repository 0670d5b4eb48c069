//! Relay peering
//!
//! A relay rebroadcasts public activities between subscribing servers.
//! Peering is a Follow/Accept handshake tracked as its own state machine:
//! idle → pending (Follow sent) → accepted | rejected, back to idle on
//! manual disable or repeated delivery failure.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{Activity, Actor, Database, EntityId, Relay, RelayState};
use crate::error::AppError;
use crate::federation::delivery::builder;
use crate::federation::queue::{Job, JobQueue};
use crate::metrics::RELAYS_ACCEPTED;

pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Normalize a relay inbox URL to end in `/inbox`.
pub fn normalize_inbox_url(raw: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| AppError::Validation(format!("Invalid relay URL: {}", e)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Unsupported relay URL scheme: {}",
            parsed.scheme()
        )));
    }

    let mut normalized = parsed.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    if !normalized.ends_with("/inbox") {
        normalized.push_str("/inbox");
    }
    Ok(normalized)
}

fn key_id_prefix_matches(key_id: &str, relay_actor: &str) -> bool {
    let key_actor = key_id.split('#').next().unwrap_or(key_id);
    let (Ok(key_url), Ok(relay_url)) = (url::Url::parse(key_actor), url::Url::parse(relay_actor))
    else {
        return false;
    };

    key_url.host_str() == relay_url.host_str()
        && key_url.path().starts_with(relay_url.path().trim_end_matches('/'))
}

/// Relay peering service.
pub struct RelayService {
    db: Arc<Database>,
    queue: Arc<dyn JobQueue>,
    failure_threshold: i64,
}

impl RelayService {
    pub fn new(db: Arc<Database>, queue: Arc<dyn JobQueue>, failure_threshold: i64) -> Self {
        Self {
            db,
            queue,
            failure_threshold,
        }
    }

    /// Subscribe to a relay: create (or reuse) the row, send a Follow of
    /// the Public collection, and move idle → pending.
    pub async fn subscribe(&self, inbox_url: &str, local_actor: &Actor) -> Result<Relay, AppError> {
        let inbox_url = normalize_inbox_url(inbox_url)?;
        let now = Utc::now();

        let mut relay = self
            .db
            .insert_relay(&Relay {
                id: EntityId::new().0,
                inbox_url: inbox_url.clone(),
                actor_ap_id: None,
                state: RelayState::Idle.as_str().to_string(),
                follow_activity_ap_id: None,
                delivery_attempts: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        match RelayState::parse(&relay.state) {
            Some(RelayState::Pending) | Some(RelayState::Accepted) => {
                // Handshake already in flight or complete.
                return Ok(relay);
            }
            _ => {}
        }

        let follow_ap_id = format!("{}/activities/{}", local_actor.ap_id, EntityId::new().0);
        let follow = builder::follow(&follow_ap_id, &local_actor.ap_id, PUBLIC_COLLECTION);

        self.db
            .insert_activity(&Activity {
                id: EntityId::new().0,
                ap_id: follow_ap_id.clone(),
                activity_type: "Follow".to_string(),
                actor_ap_id: local_actor.ap_id.clone(),
                object_ap_id: Some(PUBLIC_COLLECTION.to_string()),
                local: true,
                processed: true,
                processed_at: Some(now),
                created_at: now,
            })
            .await?;

        relay.state = RelayState::Pending.as_str().to_string();
        relay.follow_activity_ap_id = Some(follow_ap_id.clone());
        relay.delivery_attempts = 0;
        relay.last_error = None;
        self.db.update_relay(&relay).await?;

        self.queue.enqueue(Job::Deliver {
            activity_ap_id: follow_ap_id,
            payload: follow,
            sign_as: local_actor.ap_id.clone(),
            inbox_url: relay.inbox_url.clone(),
            attempt: 0,
            relay: true,
        });

        tracing::info!(relay = %relay.inbox_url, "Relay subscription pending");
        Ok(relay)
    }

    /// Manually disable a relay: send Undo-Follow and return to idle.
    pub async fn disable(&self, inbox_url: &str, local_actor: &Actor) -> Result<Relay, AppError> {
        let inbox_url = normalize_inbox_url(inbox_url)?;
        let mut relay = self
            .db
            .get_relay_by_inbox(&inbox_url)
            .await?
            .ok_or(AppError::NotFound)?;

        let was_accepted = RelayState::parse(&relay.state) == Some(RelayState::Accepted);

        if let Some(follow_ap_id) = relay.follow_activity_ap_id.clone() {
            let undo_ap_id = format!("{}/activities/{}", local_actor.ap_id, EntityId::new().0);
            let undo = builder::undo(
                &undo_ap_id,
                &local_actor.ap_id,
                builder::follow(&follow_ap_id, &local_actor.ap_id, PUBLIC_COLLECTION),
            );

            self.queue.enqueue(Job::Deliver {
                activity_ap_id: undo_ap_id,
                payload: undo,
                sign_as: local_actor.ap_id.clone(),
                inbox_url: relay.inbox_url.clone(),
                attempt: 0,
                relay: true,
            });
        }

        relay.state = RelayState::Idle.as_str().to_string();
        relay.follow_activity_ap_id = None;
        relay.delivery_attempts = 0;
        relay.last_error = None;
        self.db.update_relay(&relay).await?;

        if was_accepted {
            RELAYS_ACCEPTED.dec();
        }
        tracing::info!(relay = %relay.inbox_url, "Relay disabled");
        Ok(relay)
    }

    /// Handle an Accept referencing one of our relay Follow activities.
    ///
    /// Returns true when a relay transitioned to accepted.
    pub async fn handle_accept(
        &self,
        follow_activity_ap_id: &str,
        accepting_actor: &str,
    ) -> Result<bool, AppError> {
        let Some(mut relay) = self
            .db
            .get_relay_by_follow_activity(follow_activity_ap_id)
            .await?
        else {
            return Ok(false);
        };

        if RelayState::parse(&relay.state) != Some(RelayState::Pending) {
            return Ok(false);
        }

        relay.state = RelayState::Accepted.as_str().to_string();
        relay.actor_ap_id = Some(accepting_actor.to_string());
        relay.delivery_attempts = 0;
        relay.last_error = None;
        self.db.update_relay(&relay).await?;

        RELAYS_ACCEPTED.inc();
        tracing::info!(relay = %relay.inbox_url, "Relay accepted peering");
        Ok(true)
    }

    /// Handle a Reject referencing one of our relay Follow activities.
    pub async fn handle_reject(
        &self,
        follow_activity_ap_id: &str,
        rejecting_actor: &str,
    ) -> Result<bool, AppError> {
        let Some(mut relay) = self
            .db
            .get_relay_by_follow_activity(follow_activity_ap_id)
            .await?
        else {
            return Ok(false);
        };

        if RelayState::parse(&relay.state) != Some(RelayState::Pending) {
            return Ok(false);
        }

        relay.state = RelayState::Rejected.as_str().to_string();
        relay.actor_ap_id = Some(rejecting_actor.to_string());
        self.db.update_relay(&relay).await?;

        tracing::warn!(relay = %relay.inbox_url, "Relay rejected peering");
        Ok(true)
    }

    /// Classify an inbound activity as relay-sourced.
    ///
    /// The envelope actor is matched against known relay actor URIs; when
    /// the literal actor does not match, the signature keyId host and path
    /// prefix are compared instead (tolerates proxy/bridge relays).
    pub async fn classify(
        &self,
        envelope_actor: &str,
        key_id: &str,
    ) -> Result<Option<Relay>, AppError> {
        for relay in self.db.list_relays().await? {
            let Some(relay_actor) = relay.actor_ap_id.as_deref() else {
                continue;
            };
            if envelope_actor == relay_actor || key_id_prefix_matches(key_id, relay_actor) {
                return Ok(Some(relay));
            }
        }
        Ok(None)
    }

    /// An inbound Announce from a relay confirms peering even when the
    /// relay never sent an explicit Accept.
    pub async fn note_announce(&self, relay: &Relay) -> Result<(), AppError> {
        if RelayState::parse(&relay.state) != Some(RelayState::Pending) {
            return Ok(());
        }

        let mut relay = relay.clone();
        relay.state = RelayState::Accepted.as_str().to_string();
        relay.delivery_attempts = 0;
        relay.last_error = None;
        self.db.update_relay(&relay).await?;

        RELAYS_ACCEPTED.inc();
        tracing::info!(relay = %relay.inbox_url, "Relay implicitly accepted via Announce");
        Ok(())
    }

    /// Record a delivery failure; the Nth consecutive failure disables the
    /// relay (state → idle, attempts reset) instead of retrying forever.
    pub async fn record_delivery_failure(
        &self,
        inbox_url: &str,
        error: &str,
    ) -> Result<(), AppError> {
        let Some(mut relay) = self.db.get_relay_by_inbox(inbox_url).await? else {
            return Ok(());
        };

        let was_accepted = RelayState::parse(&relay.state) == Some(RelayState::Accepted);
        relay.delivery_attempts += 1;
        relay.last_error = Some(error.to_string());

        if relay.delivery_attempts >= self.failure_threshold {
            relay.state = RelayState::Idle.as_str().to_string();
            relay.delivery_attempts = 0;
            if was_accepted {
                RELAYS_ACCEPTED.dec();
            }
            tracing::warn!(
                relay = %relay.inbox_url,
                error = %error,
                "Relay auto-disabled after repeated delivery failures"
            );
        }

        self.db.update_relay(&relay).await
    }

    /// Reset the failure counter after a successful delivery.
    pub async fn record_delivery_success(&self, inbox_url: &str) -> Result<(), AppError> {
        let Some(mut relay) = self.db.get_relay_by_inbox(inbox_url).await? else {
            return Ok(());
        };

        if relay.delivery_attempts != 0 || relay.last_error.is_some() {
            relay.delivery_attempts = 0;
            relay.last_error = None;
            self.db.update_relay(&relay).await?;
        }
        Ok(())
    }

    /// Relay inboxes eligible for public fan-out.
    pub async fn accepted_inboxes(&self) -> Result<Vec<String>, AppError> {
        let relays = self.db.list_relays_in_state(RelayState::Accepted).await?;
        Ok(relays
            .into_iter()
            .filter(|relay| relay.delivery_attempts < self.failure_threshold)
            .map(|relay| relay.inbox_url)
            .collect())
    }
}
