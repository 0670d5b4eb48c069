//! Inbox dispatch
//!
//! The inbound pipeline applied by both ingress points, in order:
//! envelope validation → signature verification → sender resolution →
//! blocking short-circuit → idempotency check → type dispatch.
//!
//! Dispatch goes through a lookup table keyed on the activity type
//! string, one trait-object handler per type. Unknown types are skipped
//! and still acknowledged: a server must never reject an activity type
//! it does not understand.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::AppConfig;
use crate::data::{Activity, ActivityType, Actor, Database, EntityId, Relay};
use crate::error::AppError;
use crate::federation::delivery::DeliveryService;
use crate::federation::envelope::{self, Envelope};
use crate::federation::handlers::{self, ActivityHandler};
use crate::federation::queue::JobQueue;
use crate::federation::relay::RelayService;
use crate::federation::resolver::{self, ActorResolver};
use crate::federation::signature;
use crate::metrics::ACTIVITIES_RECEIVED_TOTAL;

/// Shared services handlers operate on.
pub struct Services {
    pub db: Arc<Database>,
    pub config: Arc<AppConfig>,
    pub resolver: Arc<ActorResolver>,
    pub relays: Arc<RelayService>,
    pub delivery: Arc<DeliveryService>,
    pub queue: Arc<dyn JobQueue>,
}

/// How an inbound activity reached us.
#[derive(Debug, Clone)]
pub enum InboxSource {
    /// Signed directly by the envelope actor
    Direct,
    /// Signed by a peered relay on behalf of the envelope actor
    Relay(Relay),
}

/// A verified inbound activity, ready for its type handler.
pub struct InboxRequest<'a> {
    pub envelope: &'a Envelope,
    /// Resolved, signature-verified (directly or via relay) sender
    pub sender: &'a Actor,
    pub source: &'a InboxSource,
    /// Target of a per-actor inbox delivery; None for the shared inbox
    pub target: Option<&'a Actor>,
}

/// Routes verified activities to one handler per type.
pub struct InboxDispatcher {
    services: Arc<Services>,
    handlers: HashMap<&'static str, Arc<dyn ActivityHandler>>,
}

impl InboxDispatcher {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            handlers: handlers::handler_table(),
        }
    }

    /// Process one inbound delivery.
    ///
    /// `path` is the request path the signature covers; `target` is the
    /// local actor owning a per-actor inbox, or None for the shared inbox.
    pub async fn process(
        &self,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
        target: Option<Actor>,
    ) -> Result<(), AppError> {
        // 1. Parse and validate the envelope shape.
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Invalid JSON: {}", e)))?;
        let envelope = envelope::validate(value)?;

        // 2. Reject blocked domains before any outbound key fetch.
        let key_id = signature::extract_signature_key_id(headers)?;
        for uri in [envelope.actor.as_str(), key_id.as_str()] {
            let domain = resolver::actor_domain(uri)?;
            if self.services.db.is_domain_blocked(&domain).await? {
                tracing::info!(domain = %domain, "Dropped activity from blocked domain");
                return Err(AppError::Blocked);
            }
        }

        // 3. Verify the signature against the keyId owner's cached key,
        // refetching a stale actor document once on failure.
        let sig_actor = self.verify_signature(path, headers, body, &key_id).await?;

        // 4. Determine the sender and classify the source.
        let (sender, source) = if signature::key_id_matches_actor(&key_id, &envelope.actor) {
            (sig_actor, InboxSource::Direct)
        } else if let Some(relay) = self
            .services
            .relays
            .classify(&envelope.actor, &key_id)
            .await?
        {
            // Relay-sourced: the relay signed, the envelope actor authored.
            match self.services.resolver.resolve(&envelope.actor).await {
                Ok(sender) => (sender, InboxSource::Relay(relay)),
                Err(e) => {
                    tracing::warn!(
                        actor = %envelope.actor,
                        error = %e,
                        "Cannot resolve relayed activity author, dropping"
                    );
                    return Ok(());
                }
            }
        } else {
            return Err(AppError::Signature(
                "Signature keyId does not match activity actor".to_string(),
            ));
        };

        // 5. Per-actor blocking short-circuit: nothing below mutates state
        // for a blocked sender.
        if let Some(ref target) = target {
            if self
                .services
                .db
                .is_blocked(&target.ap_id, &sender.ap_id)
                .await?
            {
                tracing::info!(
                    sender = %sender.ap_id,
                    target = %target.ap_id,
                    "Dropped activity from blocked actor"
                );
                return Err(AppError::Blocked);
            }
        }

        ACTIVITIES_RECEIVED_TOTAL
            .with_label_values(&[envelope.kind.as_str()])
            .inc();

        // 6. Idempotency: a replayed activity id is acknowledged, not
        // reapplied.
        if self.services.db.activity_exists(&envelope.ap_id).await? {
            tracing::debug!(activity = %envelope.ap_id, "Duplicate activity, skipping");
            return Ok(());
        }

        // An inbound relay Announce confirms peering even without an
        // explicit Accept.
        if let InboxSource::Relay(ref relay) = source {
            if envelope.kind == "Announce" {
                self.services.relays.note_announce(relay).await?;
            }
        }

        // 7. Dispatch by type string.
        let Some(handler) = self.handlers.get(envelope.kind.as_str()) else {
            match ActivityType::parse(&envelope.kind) {
                Some(_) => {
                    tracing::debug!(kind = %envelope.kind, "No handler for activity type, skipping")
                }
                None => {
                    tracing::warn!(kind = %envelope.kind, "Unsupported activity type, skipping")
                }
            }
            return Ok(());
        };

        let inserted = self
            .services
            .db
            .insert_activity(&Activity {
                id: EntityId::new().0,
                ap_id: envelope.ap_id.clone(),
                activity_type: envelope.kind.clone(),
                actor_ap_id: sender.ap_id.clone(),
                object_ap_id: envelope.object_ap_id().map(str::to_string),
                local: false,
                processed: false,
                processed_at: None,
                created_at: Utc::now(),
            })
            .await?;
        if !inserted {
            // Lost a double-delivery race to the unique index.
            return Ok(());
        }

        let request = InboxRequest {
            envelope: &envelope,
            sender: &sender,
            source: &source,
            target: target.as_ref(),
        };

        handler.handle(&self.services, &request).await?;

        self.services
            .db
            .mark_activity_processed(&envelope.ap_id)
            .await?;

        Ok(())
    }

    /// Resolve the keyId owner and run the verification ladder, with one
    /// forced refetch when the cached actor row has gone stale.
    async fn verify_signature(
        &self,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
        key_id: &str,
    ) -> Result<Actor, AppError> {
        let sig_actor = self
            .services
            .resolver
            .resolve_key_owner(key_id)
            .await
            .map_err(|e| AppError::Signature(format!("Cannot resolve signing key: {}", e)))?;

        let clock_skew = self.services.config.federation.signature_clock_skew_seconds;

        let first_attempt = signature::verify_request(
            "POST",
            path,
            headers,
            Some(body),
            &sig_actor.public_key_pem,
            clock_skew,
        );

        let Err(first_error) = first_attempt else {
            return Ok(sig_actor);
        };

        // The cached key may have rotated; refetch once past the
        // staleness window and retry the ladder.
        let staleness = self.services.config.federation.actor_staleness_seconds;
        let age = Utc::now()
            .signed_duration_since(sig_actor.refreshed_at)
            .num_seconds();
        if sig_actor.local || age < staleness {
            return Err(first_error);
        }

        let refreshed = self
            .services
            .resolver
            .refresh(&sig_actor.ap_id)
            .await
            .map_err(|e| AppError::Signature(format!("Cannot refresh signing key: {}", e)))?;

        signature::verify_request(
            "POST",
            path,
            headers,
            Some(body),
            &refreshed.public_key_pem,
            clock_skew,
        )?;

        Ok(refreshed)
    }
}
