//! Activity type handlers
//!
//! One handler per activity type, selected from the dispatcher's lookup
//! table. Each handler performs its state mutation and then explicitly
//! emits the follow-on effects (counters, notifications, delivery jobs)
//! as a visible sequence. Every handler is idempotent: the dispatcher
//! already filtered duplicate activity ids, and the unique indexes catch
//! whatever races through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::data::{
    Activity, Actor, Block, EntityId, Favourite, Follow, Notification, NotificationType, Reblog,
};
use crate::error::AppError;
use crate::federation::content;
use crate::federation::delivery::builder;
use crate::federation::inbox::{InboxRequest, InboxSource, Services};
use crate::federation::queue::Job;

/// A type-specific activity handler.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(&self, services: &Services, request: &InboxRequest<'_>)
    -> Result<(), AppError>;
}

/// The dispatch table, keyed on the wire type string.
pub fn handler_table() -> HashMap<&'static str, Arc<dyn ActivityHandler>> {
    let mut handlers: HashMap<&'static str, Arc<dyn ActivityHandler>> = HashMap::new();
    handlers.insert("Follow", Arc::new(FollowHandler));
    handlers.insert("Accept", Arc::new(AcceptHandler));
    handlers.insert("Reject", Arc::new(RejectHandler));
    handlers.insert("Undo", Arc::new(UndoHandler));
    handlers.insert("Create", Arc::new(CreateHandler));
    handlers.insert("Update", Arc::new(UpdateHandler));
    handlers.insert("Delete", Arc::new(DeleteHandler));
    handlers.insert("Like", Arc::new(LikeHandler));
    handlers.insert("Announce", Arc::new(AnnounceHandler));
    handlers.insert("Block", Arc::new(BlockHandler));
    handlers
}

fn notification(
    kind: NotificationType,
    target: &str,
    origin: &str,
    object: Option<&str>,
) -> Notification {
    Notification {
        id: EntityId::new().0,
        notification_type: kind.as_str().to_string(),
        target_actor_ap_id: target.to_string(),
        origin_actor_ap_id: origin.to_string(),
        object_ap_id: object.map(str::to_string),
        read: false,
        created_at: Utc::now(),
    }
}

/// Mark a follow accepted, maintain both actors' counters, notify the
/// target, and queue the Accept activity back to the follower.
async fn accept_follow(
    services: &Services,
    follow: &Follow,
    follower: &Actor,
    target: &Actor,
) -> Result<(), AppError> {
    services.db.set_follow_accepted(&follow.id, true).await?;
    services.db.adjust_follower_count(&target.ap_id, 1).await?;
    services
        .db
        .adjust_following_count(&follower.ap_id, 1)
        .await?;

    if let Err(e) = services
        .db
        .insert_notification(&notification(
            NotificationType::Follow,
            &target.ap_id,
            &follower.ap_id,
            None,
        ))
        .await
    {
        tracing::warn!(error = %e, "Failed to record follow notification");
    }

    // Local-to-local follows need no wire traffic.
    if follower.local {
        return Ok(());
    }

    let accept_ap_id = format!("{}/activities/{}", target.ap_id, EntityId::new().0);
    let payload = builder::accept(
        &accept_ap_id,
        &target.ap_id,
        serde_json::json!({
            "type": "Follow",
            "id": follow.follow_activity_ap_id,
            "actor": follower.ap_id,
            "object": target.ap_id
        }),
    );

    services
        .db
        .insert_activity(&Activity {
            id: EntityId::new().0,
            ap_id: accept_ap_id.clone(),
            activity_type: "Accept".to_string(),
            actor_ap_id: target.ap_id.clone(),
            object_ap_id: Some(follow.follow_activity_ap_id.clone()),
            local: true,
            processed: true,
            processed_at: Some(Utc::now()),
            created_at: Utc::now(),
        })
        .await?;

    services
        .delivery
        .enqueue_to_inbox(&accept_ap_id, payload, &target.ap_id, &follower.inbox_url);

    Ok(())
}

/// Remove a follow row and roll its counters back.
async fn remove_follow(services: &Services, follow: &Follow) -> Result<(), AppError> {
    let was_accepted = follow.accepted;
    if services.db.delete_follow(&follow.id).await? && was_accepted {
        services
            .db
            .adjust_follower_count(&follow.target_ap_id, -1)
            .await?;
        services
            .db
            .adjust_following_count(&follow.actor_ap_id, -1)
            .await?;
    }
    Ok(())
}

// =============================================================================
// Follow
// =============================================================================

struct FollowHandler;

#[async_trait]
impl ActivityHandler for FollowHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let sender = request.sender;
        let target_uri = request
            .envelope
            .object_ap_id()
            .ok_or_else(|| AppError::Validation("Missing object in Follow".to_string()))?;

        let target = services
            .db
            .get_actor_by_ap_id(target_uri)
            .await?
            .filter(|actor| actor.local)
            .ok_or_else(|| {
                AppError::Validation("Follow target is not a local actor".to_string())
            })?;

        if sender.ap_id == target.ap_id {
            return Err(AppError::Validation("Self-follow is forbidden".to_string()));
        }

        // Shared-inbox deliveries bypass the per-actor block filter; the
        // resolved target gets the same protection here.
        if services.db.is_blocked(&target.ap_id, &sender.ap_id).await? {
            return Err(AppError::Blocked);
        }

        if let Some(existing) = services.db.get_follow(&sender.ap_id, &target.ap_id).await? {
            if existing.accepted {
                tracing::debug!(
                    follower = %sender.ap_id,
                    target = %target.ap_id,
                    "Duplicate Follow for accepted relationship"
                );
                return Ok(());
            }
            // Re-delivered Follow for a pending relationship: re-accept
            // under auto-accept, otherwise leave pending.
            if services.config.federation.auto_accept_follows {
                return accept_follow(services, &existing, sender, &target).await;
            }
            return Ok(());
        }

        let follow = services
            .db
            .insert_follow(&Follow {
                id: EntityId::new().0,
                actor_ap_id: sender.ap_id.clone(),
                target_ap_id: target.ap_id.clone(),
                follow_activity_ap_id: request.envelope.ap_id.clone(),
                accepted: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await?;

        if sender.local || services.config.federation.auto_accept_follows {
            accept_follow(services, &follow, sender, &target).await
        } else {
            // Manual approval: leave pending, surface a follow request.
            services
                .db
                .insert_notification(&notification(
                    NotificationType::FollowRequest,
                    &target.ap_id,
                    &sender.ap_id,
                    None,
                ))
                .await?;
            Ok(())
        }
    }
}

// =============================================================================
// Accept / Reject
// =============================================================================

struct AcceptHandler;

#[async_trait]
impl ActivityHandler for AcceptHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let Some(follow_ap_id) = request.envelope.object_ap_id() else {
            tracing::warn!("Accept without a referenced Follow, ignoring");
            return Ok(());
        };

        // Relay handshakes are tracked separately from actor follows.
        if services
            .relays
            .handle_accept(follow_ap_id, &request.sender.ap_id)
            .await?
        {
            return Ok(());
        }

        let Some(follow) = services.db.get_follow_by_activity(follow_ap_id).await? else {
            tracing::warn!(
                follow = %follow_ap_id,
                "Accept for unknown Follow (already processed or out of order)"
            );
            return Ok(());
        };

        // Only the follow target may accept it.
        if follow.target_ap_id != request.sender.ap_id {
            tracing::warn!(
                follow = %follow_ap_id,
                sender = %request.sender.ap_id,
                "Accept from actor that is not the follow target, ignoring"
            );
            return Ok(());
        }

        if follow.accepted {
            return Ok(());
        }

        services.db.set_follow_accepted(&follow.id, true).await?;
        services
            .db
            .adjust_following_count(&follow.actor_ap_id, 1)
            .await?;
        services
            .db
            .adjust_follower_count(&follow.target_ap_id, 1)
            .await?;

        tracing::info!(
            follower = %follow.actor_ap_id,
            target = %follow.target_ap_id,
            "Follow accepted"
        );
        Ok(())
    }
}

struct RejectHandler;

#[async_trait]
impl ActivityHandler for RejectHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let Some(follow_ap_id) = request.envelope.object_ap_id() else {
            tracing::warn!("Reject without a referenced Follow, ignoring");
            return Ok(());
        };

        if services
            .relays
            .handle_reject(follow_ap_id, &request.sender.ap_id)
            .await?
        {
            return Ok(());
        }

        let Some(follow) = services.db.get_follow_by_activity(follow_ap_id).await? else {
            tracing::warn!(follow = %follow_ap_id, "Reject for unknown Follow, ignoring");
            return Ok(());
        };

        if follow.target_ap_id != request.sender.ap_id {
            tracing::warn!(
                follow = %follow_ap_id,
                sender = %request.sender.ap_id,
                "Reject from actor that is not the follow target, ignoring"
            );
            return Ok(());
        }

        remove_follow(services, &follow).await?;
        tracing::info!(
            follower = %follow.actor_ap_id,
            target = %follow.target_ap_id,
            "Follow rejected"
        );
        Ok(())
    }
}

// =============================================================================
// Undo
// =============================================================================

struct UndoHandler;

impl UndoHandler {
    /// Undo a Follow: exact activity-id match first, falling back to any
    /// follow between the pair, since peers are inconsistent about id
    /// reuse.
    async fn undo_follow(
        &self,
        services: &Services,
        sender: &Actor,
        inner: &Value,
    ) -> Result<(), AppError> {
        if let Some(follow_ap_id) = inner.get("id").and_then(Value::as_str) {
            if let Some(follow) = services.db.get_follow_by_activity(follow_ap_id).await? {
                if follow.actor_ap_id == sender.ap_id {
                    remove_follow(services, &follow).await?;
                    tracing::info!(follower = %sender.ap_id, "Follow undone by activity id");
                    return Ok(());
                }
                tracing::warn!(
                    follow = %follow_ap_id,
                    sender = %sender.ap_id,
                    "Undo Follow from actor that did not create it, ignoring"
                );
                return Ok(());
            }
        }

        let target_uri = inner
            .get("object")
            .and_then(|object| {
                object
                    .as_str()
                    .or_else(|| object.get("id").and_then(Value::as_str))
            })
            .map(str::to_string);

        let Some(target_uri) = target_uri else {
            tracing::debug!("Undo Follow without id or target, ignoring");
            return Ok(());
        };

        if let Some(follow) = services.db.get_follow(&sender.ap_id, &target_uri).await? {
            remove_follow(services, &follow).await?;
            tracing::info!(follower = %sender.ap_id, "Follow undone via pair fallback");
        }
        Ok(())
    }

    /// Undo a Like: delete the Like activity record and the derived
    /// favourite, rolling the counter back.
    async fn undo_like(
        &self,
        services: &Services,
        sender: &Actor,
        object_uri: &str,
    ) -> Result<(), AppError> {
        if let Some(activity_ap_id) = services
            .db
            .delete_favourite(&sender.ap_id, object_uri)
            .await?
        {
            services.db.delete_activity(&activity_ap_id).await?;
            tracing::info!(actor = %sender.ap_id, object = %object_uri, "Like undone");
        }
        Ok(())
    }

    /// Undo an Announce: delete the Announce activity and derived reblog.
    async fn undo_announce(
        &self,
        services: &Services,
        sender: &Actor,
        object_uri: &str,
    ) -> Result<(), AppError> {
        if let Some(activity_ap_id) =
            services.db.delete_reblog(&sender.ap_id, object_uri).await?
        {
            services.db.delete_activity(&activity_ap_id).await?;
            tracing::info!(actor = %sender.ap_id, object = %object_uri, "Announce undone");
        }
        Ok(())
    }
}

#[async_trait]
impl ActivityHandler for UndoHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let sender = request.sender;
        let Some(inner) = request.envelope.object() else {
            tracing::debug!("Undo without object, ignoring");
            return Ok(());
        };

        // Compact form: the object is just the undone activity's URI.
        if let Some(activity_uri) = inner.as_str() {
            let Some(activity) = services.db.get_activity_by_ap_id(activity_uri).await? else {
                tracing::debug!(activity = %activity_uri, "Undo of unknown activity, ignoring");
                return Ok(());
            };

            if activity.actor_ap_id != sender.ap_id {
                tracing::warn!(
                    activity = %activity_uri,
                    sender = %sender.ap_id,
                    "Undo from actor that did not create the activity, ignoring"
                );
                return Ok(());
            }

            return match activity.activity_type.as_str() {
                "Follow" => {
                    self.undo_follow(services, sender, &serde_json::json!({ "id": activity_uri }))
                        .await
                }
                "Like" => match activity.object_ap_id.as_deref() {
                    Some(object_uri) => self.undo_like(services, sender, object_uri).await,
                    None => Ok(()),
                },
                "Announce" => match activity.object_ap_id.as_deref() {
                    Some(object_uri) => self.undo_announce(services, sender, object_uri).await,
                    None => Ok(()),
                },
                _ => Ok(()),
            };
        }

        match inner.get("type").and_then(Value::as_str) {
            Some("Follow") => self.undo_follow(services, sender, inner).await,
            Some("Like") => {
                let object_uri = inner.get("object").and_then(|object| {
                    object
                        .as_str()
                        .or_else(|| object.get("id").and_then(Value::as_str))
                });
                match object_uri {
                    Some(object_uri) => self.undo_like(services, sender, object_uri).await,
                    None => Ok(()),
                }
            }
            Some("Announce") => {
                let object_uri = inner.get("object").and_then(|object| {
                    object
                        .as_str()
                        .or_else(|| object.get("id").and_then(Value::as_str))
                });
                match object_uri {
                    Some(object_uri) => self.undo_announce(services, sender, object_uri).await,
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Create / Update / Delete
// =============================================================================

struct CreateHandler;

impl CreateHandler {
    /// Mention and reply notifications for local actors. Best effort:
    /// a failed notification never blocks the persisted Note.
    async fn emit_notifications(
        &self,
        services: &Services,
        sender: &Actor,
        object: &Value,
        object_ap_id: &str,
    ) {
        let mut notified = Vec::new();

        if let Some(tags) = object.get("tag").and_then(Value::as_array) {
            for tag in tags {
                if tag.get("type").and_then(Value::as_str) != Some("Mention") {
                    continue;
                }
                let Some(href) = tag.get("href").and_then(Value::as_str) else {
                    continue;
                };

                match services.db.get_actor_by_ap_id(href).await {
                    Ok(Some(actor)) if actor.local => {
                        if let Err(e) = services
                            .db
                            .insert_notification(&notification(
                                NotificationType::Mention,
                                &actor.ap_id,
                                &sender.ap_id,
                                Some(object_ap_id),
                            ))
                            .await
                        {
                            tracing::warn!(error = %e, "Failed to record mention notification");
                        }
                        notified.push(actor.ap_id);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Mention lookup failed");
                    }
                }
            }
        }

        // A reply to a local post is also a notification, unless the
        // author was already mentioned.
        let Some(parent_uri) = object.get("inReplyTo").and_then(Value::as_str) else {
            return;
        };
        let parent_owner = match services.db.get_object_by_ap_id(parent_uri).await {
            Ok(Some(parent)) => parent.attributed_to,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Reply parent lookup failed");
                return;
            }
        };
        if notified.contains(&parent_owner) {
            return;
        }
        match services.db.get_actor_by_ap_id(&parent_owner).await {
            Ok(Some(owner)) if owner.local => {
                if let Err(e) = services
                    .db
                    .insert_notification(&notification(
                        NotificationType::Mention,
                        &owner.ap_id,
                        &sender.ap_id,
                        Some(object_ap_id),
                    ))
                    .await
                {
                    tracing::warn!(error = %e, "Failed to record reply notification");
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Reply owner lookup failed");
            }
        }
    }
}

#[async_trait]
impl ActivityHandler for CreateHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let sender = request.sender;
        let object = request
            .envelope
            .object()
            .filter(|object| object.is_object())
            .ok_or_else(|| {
                AppError::Validation("Create requires an embedded object".to_string())
            })?;

        // The wrapped object must belong to the verified sender.
        if let Some(attributed_to) = object.get("attributedTo").and_then(Value::as_str) {
            if attributed_to != sender.ap_id {
                return Err(AppError::Validation(
                    "Create object not attributed to sender".to_string(),
                ));
            }
        }

        let inserted = content::persist_remote_object(&services.db, object, &sender.ap_id).await?;
        if !inserted {
            tracing::debug!(
                object = ?request.envelope.object_ap_id(),
                "Object already persisted, skipping"
            );
            return Ok(());
        }

        services.db.adjust_posts_count(&sender.ap_id, 1).await?;

        if let Some(object_ap_id) = request.envelope.object_ap_id() {
            self.emit_notifications(services, sender, object, object_ap_id)
                .await;
        }

        Ok(())
    }
}

struct UpdateHandler;

const ACTOR_TYPES: [&str; 4] = ["Person", "Service", "Organization", "Group"];

#[async_trait]
impl ActivityHandler for UpdateHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let sender = request.sender;
        let object = request
            .envelope
            .object()
            .filter(|object| object.is_object())
            .ok_or_else(|| {
                AppError::Validation("Update requires an embedded object".to_string())
            })?;

        let object_type = object.get("type").and_then(Value::as_str).unwrap_or("");

        // Profile update: the wrapped object is the sender's own document.
        if ACTOR_TYPES.contains(&object_type) {
            let object_id = object.get("id").and_then(Value::as_str).unwrap_or("");
            if object_id != sender.ap_id {
                return Err(AppError::Validation(
                    "Update actor does not match sender".to_string(),
                ));
            }

            let mut updated = sender.clone();
            if let Some(name) = object.get("name").and_then(Value::as_str) {
                updated.display_name = Some(name.to_string());
            }
            if let Some(summary) = object.get("summary").and_then(Value::as_str) {
                updated.summary = Some(summary.to_string());
            }
            if let Some(pem) = object
                .get("publicKey")
                .and_then(|key| key.get("publicKeyPem"))
                .and_then(Value::as_str)
            {
                updated.public_key_pem = pem.to_string();
            }
            if let Some(inbox) = object.get("inbox").and_then(Value::as_str) {
                updated.inbox_url = inbox.to_string();
            }
            if let Some(shared) = object
                .get("endpoints")
                .and_then(|e| e.get("sharedInbox"))
                .and_then(Value::as_str)
            {
                updated.shared_inbox_url = Some(shared.to_string());
            }
            if let Some(fields) = object.get("attachment").filter(|v| v.is_array()) {
                updated.profile_fields = Some(fields.to_string());
            }

            services.db.refresh_actor(&updated).await?;
            tracing::info!(actor = %sender.ap_id, "Profile updated");
            return Ok(());
        }

        // Content update: only the owner may edit.
        let Some(object_ap_id) = object.get("id").and_then(Value::as_str) else {
            return Err(AppError::Validation("Update object missing id".to_string()));
        };

        let Some(record) = services.db.get_object_by_ap_id(object_ap_id).await? else {
            tracing::debug!(object = %object_ap_id, "Update for unknown object, ignoring");
            return Ok(());
        };

        if record.attributed_to != sender.ap_id {
            tracing::warn!(
                object = %object_ap_id,
                sender = %sender.ap_id,
                "Update from non-owner, ignoring"
            );
            return Ok(());
        }

        let raw_content = object.get("content").and_then(Value::as_str).unwrap_or("");
        let edited_at = object
            .get("updated")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|timestamp| timestamp.with_timezone(&Utc));

        services
            .db
            .update_object_content(
                object_ap_id,
                &content::sanitize_html(raw_content),
                &content::derive_plain_text(raw_content),
                object.get("summary").and_then(Value::as_str),
                object
                    .get("sensitive")
                    .and_then(Value::as_bool)
                    .unwrap_or(record.sensitive),
                edited_at,
            )
            .await?;

        if let Err(e) = content::replace_attachments(&services.db, object_ap_id, object).await {
            tracing::warn!(object = %object_ap_id, error = %e, "Failed to replace attachments");
        }

        tracing::info!(object = %object_ap_id, "Object updated");
        Ok(())
    }
}

struct DeleteHandler;

/// Resolve the URI a Delete targets, unwrapping Tombstones.
fn delete_target_uri(object: &Value) -> Option<String> {
    if let Some(uri) = object.as_str() {
        return Some(uri.to_string());
    }

    let is_tombstone = object
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|value| value.eq_ignore_ascii_case("Tombstone"));

    if is_tombstone {
        return object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    object.get("id").and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl ActivityHandler for DeleteHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let sender = request.sender;
        let Some(target_uri) = request.envelope.object().and_then(delete_target_uri) else {
            tracing::debug!("Delete without target, ignoring");
            return Ok(());
        };

        // Actor self-deletion removes the remote account and its edges.
        if target_uri == sender.ap_id {
            if sender.local {
                return Err(AppError::Validation(
                    "Refusing remote deletion of a local actor".to_string(),
                ));
            }
            services.db.delete_actor(&sender.ap_id).await?;
            tracing::info!(actor = %sender.ap_id, "Remote actor deleted");
            return Ok(());
        }

        let Some(record) = services.db.get_object_by_ap_id(&target_uri).await? else {
            tracing::debug!(object = %target_uri, "Delete for unknown object, ignoring");
            return Ok(());
        };

        // Ownership check: only the author's Delete is honored.
        if record.attributed_to != sender.ap_id {
            tracing::debug!(
                object = %target_uri,
                sender = %sender.ap_id,
                "Delete from non-owner, ignoring"
            );
            return Ok(());
        }

        services.db.delete_object(&target_uri).await?;
        services.db.adjust_posts_count(&sender.ap_id, -1).await?;
        if let Some(parent) = record.in_reply_to {
            if services.db.get_object_by_ap_id(&parent).await?.is_some() {
                services.db.adjust_replies_count(&parent, -1).await?;
            }
        }

        tracing::info!(object = %target_uri, "Object deleted");
        Ok(())
    }
}

// =============================================================================
// Like / Announce / Block
// =============================================================================

struct LikeHandler;

#[async_trait]
impl ActivityHandler for LikeHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let sender = request.sender;
        let object_uri = request
            .envelope
            .object_ap_id()
            .ok_or_else(|| AppError::Validation("Missing object in Like".to_string()))?;

        let Some(record) = services.db.get_object_by_ap_id(object_uri).await? else {
            tracing::debug!(object = %object_uri, "Like of unknown object, ignoring");
            return Ok(());
        };

        let created = services
            .db
            .create_favourite(&Favourite {
                id: EntityId::new().0,
                actor_ap_id: sender.ap_id.clone(),
                object_ap_id: object_uri.to_string(),
                activity_ap_id: request.envelope.ap_id.clone(),
                created_at: Utc::now(),
            })
            .await?;
        if !created {
            tracing::debug!(
                actor = %sender.ap_id,
                object = %object_uri,
                "Duplicate Like, skipping"
            );
            return Ok(());
        }

        if record.local {
            if let Err(e) = services
                .db
                .insert_notification(&notification(
                    NotificationType::Favourite,
                    &record.attributed_to,
                    &sender.ap_id,
                    Some(object_uri),
                ))
                .await
            {
                tracing::warn!(error = %e, "Failed to record favourite notification");
            }
        }

        Ok(())
    }
}

struct AnnounceHandler;

#[async_trait]
impl ActivityHandler for AnnounceHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let sender = request.sender;
        let object_uri = request
            .envelope
            .object_ap_id()
            .ok_or_else(|| AppError::Validation("Missing object in Announce".to_string()))?;

        let Some(record) = services.db.get_object_by_ap_id(object_uri).await? else {
            // A relay rebroadcasts third-party content we may not hold yet.
            if matches!(request.source, InboxSource::Relay(_)) {
                services.queue.enqueue(Job::FetchObject {
                    object_ap_id: object_uri.to_string(),
                });
            } else {
                tracing::debug!(object = %object_uri, "Announce of unknown object, ignoring");
            }
            return Ok(());
        };

        let created = services
            .db
            .create_reblog(&Reblog {
                id: EntityId::new().0,
                actor_ap_id: sender.ap_id.clone(),
                object_ap_id: object_uri.to_string(),
                activity_ap_id: request.envelope.ap_id.clone(),
                created_at: Utc::now(),
            })
            .await?;
        if !created {
            tracing::debug!(
                actor = %sender.ap_id,
                object = %object_uri,
                "Duplicate Announce, skipping"
            );
            return Ok(());
        }

        if record.local {
            if let Err(e) = services
                .db
                .insert_notification(&notification(
                    NotificationType::Reblog,
                    &record.attributed_to,
                    &sender.ap_id,
                    Some(object_uri),
                ))
                .await
            {
                tracing::warn!(error = %e, "Failed to record reblog notification");
            }
        }

        Ok(())
    }
}

struct BlockHandler;

#[async_trait]
impl ActivityHandler for BlockHandler {
    async fn handle(
        &self,
        services: &Services,
        request: &InboxRequest<'_>,
    ) -> Result<(), AppError> {
        let Some(target_uri) = request.envelope.object_ap_id() else {
            tracing::debug!("Block without target, ignoring");
            return Ok(());
        };

        services
            .db
            .insert_block(&Block {
                id: EntityId::new().0,
                blocker_ap_id: request.sender.ap_id.clone(),
                target_ap_id: target_uri.to_string(),
                created_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            blocker = %request.sender.ap_id,
            target = %target_uri,
            "Remote block recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AppConfig, DatabaseConfig, FederationConfig, LoggingConfig, ServerConfig,
    };
    use crate::data::Database;
    use crate::federation::delivery::DeliveryService;
    use crate::federation::envelope;
    use crate::federation::queue::{Job, RecordingQueue};
    use crate::federation::relay::RelayService;
    use crate::federation::resolver::ActorResolver;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(auto_accept: bool) -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: "local.example".to_string(),
                protocol: "https".to_string(),
            },
            database: DatabaseConfig {
                path: "unused.db".into(),
            },
            federation: FederationConfig {
                auto_accept_follows: auto_accept,
                signature_clock_skew_seconds: 3600,
                actor_staleness_seconds: 86400,
                fetch_timeout_seconds: 15,
                deliver_timeout_seconds: 10,
                delivery_max_attempts: 3,
                delivery_backoff_seconds: 30,
                relay_failure_threshold: 3,
            },
            accounts: vec![],
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    async fn test_services(auto_accept: bool) -> (Arc<Services>, Arc<RecordingQueue>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let queue = Arc::new(RecordingQueue::new());
        let http_client = Arc::new(reqwest::Client::new());
        let queue_dyn: Arc<dyn crate::federation::queue::JobQueue> = queue.clone();

        let services = Arc::new(Services {
            resolver: Arc::new(ActorResolver::new(
                db.clone(),
                http_client.clone(),
                queue_dyn.clone(),
            )),
            relays: Arc::new(RelayService::new(db.clone(), queue_dyn.clone(), 3)),
            delivery: Arc::new(DeliveryService::new(
                db.clone(),
                http_client,
                queue_dyn.clone(),
                std::time::Duration::from_secs(10),
            )),
            queue: queue_dyn,
            config: Arc::new(test_config(auto_accept)),
            db,
        });

        (services, queue, temp_dir)
    }

    fn actor(ap_id: &str, username: &str, domain: &str, local: bool) -> Actor {
        Actor {
            id: EntityId::new().0,
            ap_id: ap_id.to_string(),
            username: username.to_string(),
            domain: domain.to_string(),
            display_name: None,
            summary: None,
            inbox_url: format!("{}/inbox", ap_id),
            outbox_url: None,
            shared_inbox_url: None,
            public_key_pem: "pem".to_string(),
            private_key_pem: local.then(|| "priv".to_string()),
            local,
            followers_count: 0,
            following_count: 0,
            posts_count: 0,
            profile_fields: None,
            emoji_tags: None,
            created_at: Utc::now(),
            refreshed_at: Utc::now(),
        }
    }

    async fn dispatch(
        services: &Services,
        sender: &Actor,
        activity: serde_json::Value,
    ) -> Result<(), AppError> {
        let envelope = envelope::validate(activity).unwrap();
        let source = InboxSource::Direct;
        let request = InboxRequest {
            envelope: &envelope,
            sender,
            source: &source,
            target: None,
        };
        handler_table()
            .get(envelope.kind.as_str())
            .expect("handler registered")
            .handle(services, &request)
            .await
    }

    #[tokio::test]
    async fn follow_auto_accepts_and_queues_accept_delivery() {
        let (services, queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/follows/1",
                "type": "Follow",
                "actor": bob.ap_id,
                "object": alice.ap_id
            }),
        )
        .await
        .unwrap();

        let follow = services
            .db
            .get_follow(&bob.ap_id, &alice.ap_id)
            .await
            .unwrap()
            .expect("follow row");
        assert!(follow.accepted);

        let stored_alice = services
            .db
            .get_actor_by_ap_id(&alice.ap_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_alice.followers_count, 1);

        let accepts: Vec<_> = queue
            .jobs()
            .into_iter()
            .filter(|job| matches!(job, Job::Deliver { payload, .. } if payload["type"] == "Accept"))
            .collect();
        assert_eq!(accepts.len(), 1);
        match &accepts[0] {
            Job::Deliver { inbox_url, .. } => {
                assert_eq!(inbox_url, &bob.inbox_url);
            }
            other => panic!("expected Deliver, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn follow_without_auto_accept_stays_pending() {
        let (services, queue, _tmp) = test_services(false).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/follows/1",
                "type": "Follow",
                "actor": bob.ap_id,
                "object": alice.ap_id
            }),
        )
        .await
        .unwrap();

        let follow = services
            .db
            .get_follow(&bob.ap_id, &alice.ap_id)
            .await
            .unwrap()
            .expect("follow row");
        assert!(!follow.accepted);
        assert!(queue.jobs().is_empty());

        let notifications = services.db.list_notifications(&alice.ap_id).await.unwrap();
        assert_eq!(notifications[0].notification_type, "follow_request");
    }

    #[tokio::test]
    async fn follow_rejects_self_follow() {
        let (services, _queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        services.db.insert_actor(&alice).await.unwrap();

        let result = dispatch(
            &services,
            &alice,
            json!({
                "id": "https://local.example/follows/self",
                "type": "Follow",
                "actor": alice.ap_id,
                "object": alice.ap_id
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn local_to_local_follow_accepts_without_delivery() {
        let (services, queue, _tmp) = test_services(false).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let mallory =
            actor("https://local.example/users/mallory", "mallory", "local.example", true);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&mallory).await.unwrap();

        dispatch(
            &services,
            &mallory,
            json!({
                "id": "https://local.example/follows/1",
                "type": "Follow",
                "actor": mallory.ap_id,
                "object": alice.ap_id
            }),
        )
        .await
        .unwrap();

        let follow = services
            .db
            .get_follow(&mallory.ap_id, &alice.ap_id)
            .await
            .unwrap()
            .expect("follow row");
        assert!(follow.accepted, "local-to-local follow must auto-accept");
        assert!(queue.jobs().is_empty(), "no wire delivery between locals");
    }

    #[tokio::test]
    async fn reject_removes_pending_follow() {
        let (services, _queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();

        // Outbound follow from alice to bob, awaiting bob's answer.
        services
            .db
            .insert_follow(&Follow {
                id: EntityId::new().0,
                actor_ap_id: alice.ap_id.clone(),
                target_ap_id: bob.ap_id.clone(),
                follow_activity_ap_id: "https://local.example/activities/f1".to_string(),
                accepted: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/r1",
                "type": "Reject",
                "actor": bob.ap_id,
                "object": "https://local.example/activities/f1"
            }),
        )
        .await
        .unwrap();

        assert!(
            services
                .db
                .get_follow(&alice.ap_id, &bob.ap_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn accept_marks_outbound_follow_accepted() {
        let (services, _queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();

        services
            .db
            .insert_follow(&Follow {
                id: EntityId::new().0,
                actor_ap_id: alice.ap_id.clone(),
                target_ap_id: bob.ap_id.clone(),
                follow_activity_ap_id: "https://local.example/activities/f2".to_string(),
                accepted: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/a1",
                "type": "Accept",
                "actor": bob.ap_id,
                "object": { "type": "Follow", "id": "https://local.example/activities/f2" }
            }),
        )
        .await
        .unwrap();

        let follow = services
            .db
            .get_follow(&alice.ap_id, &bob.ap_id)
            .await
            .unwrap()
            .unwrap();
        assert!(follow.accepted);
    }

    #[tokio::test]
    async fn accept_from_wrong_actor_is_ignored() {
        let (services, _queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        let carol =
            actor("https://elsewhere.example/users/carol", "carol", "elsewhere.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();
        services.db.insert_actor(&carol).await.unwrap();

        services
            .db
            .insert_follow(&Follow {
                id: EntityId::new().0,
                actor_ap_id: alice.ap_id.clone(),
                target_ap_id: bob.ap_id.clone(),
                follow_activity_ap_id: "https://local.example/activities/f3".to_string(),
                accepted: false,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        dispatch(
            &services,
            &carol,
            json!({
                "id": "https://elsewhere.example/activities/a2",
                "type": "Accept",
                "actor": carol.ap_id,
                "object": "https://local.example/activities/f3"
            }),
        )
        .await
        .unwrap();

        let follow = services
            .db
            .get_follow(&alice.ap_id, &bob.ap_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!follow.accepted, "only the follow target may accept");
    }

    #[tokio::test]
    async fn undo_follow_matches_exact_activity_id() {
        let (services, _queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/follows/u1",
                "type": "Follow",
                "actor": bob.ap_id,
                "object": alice.ap_id
            }),
        )
        .await
        .unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/undo1",
                "type": "Undo",
                "actor": bob.ap_id,
                "object": {
                    "type": "Follow",
                    "id": "https://remote.example/follows/u1",
                    "object": alice.ap_id
                }
            }),
        )
        .await
        .unwrap();

        assert!(
            services
                .db
                .get_follow(&bob.ap_id, &alice.ap_id)
                .await
                .unwrap()
                .is_none()
        );
        let stored_alice = services
            .db
            .get_actor_by_ap_id(&alice.ap_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_alice.followers_count, 0);
    }

    #[tokio::test]
    async fn undo_follow_falls_back_to_pair_match() {
        let (services, _queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/follows/u2",
                "type": "Follow",
                "actor": bob.ap_id,
                "object": alice.ap_id
            }),
        )
        .await
        .unwrap();

        // The peer reuses a different id for the wrapped Follow; the pair
        // fallback still removes the relationship. Racy but authentic.
        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/undo2",
                "type": "Undo",
                "actor": bob.ap_id,
                "object": {
                    "type": "Follow",
                    "id": "https://remote.example/follows/regenerated",
                    "object": alice.ap_id
                }
            }),
        )
        .await
        .unwrap();

        assert!(
            services
                .db
                .get_follow(&bob.ap_id, &alice.ap_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn like_then_undo_preserves_counter_invariant() {
        let (services, _queue, _tmp) = test_services(true).await;
        let alice = actor("https://local.example/users/alice", "alice", "local.example", true);
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&alice).await.unwrap();
        services.db.insert_actor(&bob).await.unwrap();

        let note = json!({
            "id": "https://local.example/notes/1",
            "type": "Note",
            "content": "<p>hello</p>",
            "to": [content::PUBLIC_AUDIENCE]
        });
        content::persist_remote_object(&services.db, &note, &alice.ap_id)
            .await
            .unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/likes/1",
                "type": "Like",
                "actor": bob.ap_id,
                "object": "https://local.example/notes/1"
            }),
        )
        .await
        .unwrap();

        let object = services
            .db
            .get_object_by_ap_id("https://local.example/notes/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            object.favourites_count,
            services
                .db
                .count_favourites("https://local.example/notes/1")
                .await
                .unwrap()
        );
        assert_eq!(object.favourites_count, 1);

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/undo3",
                "type": "Undo",
                "actor": bob.ap_id,
                "object": {
                    "type": "Like",
                    "id": "https://remote.example/likes/1",
                    "object": "https://local.example/notes/1"
                }
            }),
        )
        .await
        .unwrap();

        let object = services
            .db
            .get_object_by_ap_id("https://local.example/notes/1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            object.favourites_count,
            services
                .db
                .count_favourites("https://local.example/notes/1")
                .await
                .unwrap()
        );
        assert_eq!(object.favourites_count, 0);
    }

    #[tokio::test]
    async fn create_persists_object_and_bumps_posts_count() {
        let (services, _queue, _tmp) = test_services(true).await;
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&bob).await.unwrap();

        let create = json!({
            "id": "https://remote.example/activities/c1",
            "type": "Create",
            "actor": bob.ap_id,
            "object": {
                "id": "https://remote.example/notes/1",
                "type": "Note",
                "attributedTo": bob.ap_id,
                "content": "<p>hi</p>",
                "to": [content::PUBLIC_AUDIENCE]
            }
        });

        dispatch(&services, &bob, create.clone()).await.unwrap();
        // Re-delivery with the same object id is a no-op.
        dispatch(&services, &bob, create).await.unwrap();

        assert!(
            services
                .db
                .get_object_by_ap_id("https://remote.example/notes/1")
                .await
                .unwrap()
                .is_some()
        );
        let stored_bob = services
            .db
            .get_actor_by_ap_id(&bob.ap_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_bob.posts_count, 1);
    }

    #[tokio::test]
    async fn create_rejects_object_attributed_to_someone_else() {
        let (services, _queue, _tmp) = test_services(true).await;
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&bob).await.unwrap();

        let result = dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/c2",
                "type": "Create",
                "actor": bob.ap_id,
                "object": {
                    "id": "https://remote.example/notes/forged",
                    "type": "Note",
                    "attributedTo": "https://elsewhere.example/users/carol",
                    "content": "<p>forged</p>"
                }
            }),
        )
        .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn delete_honors_ownership_check() {
        let (services, _queue, _tmp) = test_services(true).await;
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        let carol =
            actor("https://elsewhere.example/users/carol", "carol", "elsewhere.example", false);
        services.db.insert_actor(&bob).await.unwrap();
        services.db.insert_actor(&carol).await.unwrap();

        let note = json!({
            "id": "https://remote.example/notes/d1",
            "type": "Note",
            "content": "<p>mine</p>",
            "to": [content::PUBLIC_AUDIENCE]
        });
        content::persist_remote_object(&services.db, &note, &bob.ap_id)
            .await
            .unwrap();

        // Carol's Delete of bob's note is silently ignored.
        dispatch(
            &services,
            &carol,
            json!({
                "id": "https://elsewhere.example/activities/d1",
                "type": "Delete",
                "actor": carol.ap_id,
                "object": { "type": "Tombstone", "id": "https://remote.example/notes/d1" }
            }),
        )
        .await
        .unwrap();
        assert!(
            services
                .db
                .get_object_by_ap_id("https://remote.example/notes/d1")
                .await
                .unwrap()
                .is_some()
        );

        // Bob's own Delete is honored.
        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/d2",
                "type": "Delete",
                "actor": bob.ap_id,
                "object": { "type": "Tombstone", "id": "https://remote.example/notes/d1" }
            }),
        )
        .await
        .unwrap();
        assert!(
            services
                .db
                .get_object_by_ap_id("https://remote.example/notes/d1")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn update_person_refreshes_sender_profile() {
        let (services, _queue, _tmp) = test_services(true).await;
        let bob = actor("https://remote.example/users/bob", "bob", "remote.example", false);
        services.db.insert_actor(&bob).await.unwrap();

        dispatch(
            &services,
            &bob,
            json!({
                "id": "https://remote.example/activities/p1",
                "type": "Update",
                "actor": bob.ap_id,
                "object": {
                    "id": bob.ap_id,
                    "type": "Person",
                    "name": "Bob Updated",
                    "summary": "new bio",
                    "publicKey": { "publicKeyPem": "new-pem" }
                }
            }),
        )
        .await
        .unwrap();

        let stored = services
            .db
            .get_actor_by_ap_id(&bob.ap_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.display_name.as_deref(), Some("Bob Updated"));
        assert_eq!(stored.summary.as_deref(), Some("new bio"));
        assert_eq!(stored.public_key_pem, "new-pem");
    }

    #[tokio::test]
    async fn announce_from_relay_of_unknown_object_queues_fetch() {
        let (services, queue, _tmp) = test_services(true).await;
        let carol =
            actor("https://elsewhere.example/users/carol", "carol", "elsewhere.example", false);
        services.db.insert_actor(&carol).await.unwrap();

        let envelope = envelope::validate(json!({
            "id": "https://relay.example/activities/an1",
            "type": "Announce",
            "actor": carol.ap_id,
            "object": "https://elsewhere.example/notes/unseen"
        }))
        .unwrap();

        let relay = crate::data::Relay {
            id: EntityId::new().0,
            inbox_url: "https://relay.example/inbox".to_string(),
            actor_ap_id: Some("https://relay.example/actor".to_string()),
            state: "accepted".to_string(),
            follow_activity_ap_id: None,
            delivery_attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let source = InboxSource::Relay(relay);
        let request = InboxRequest {
            envelope: &envelope,
            sender: &carol,
            source: &source,
            target: None,
        };

        handler_table()
            .get("Announce")
            .unwrap()
            .handle(&services, &request)
            .await
            .unwrap();

        assert!(queue.jobs().iter().any(|job| matches!(
            job,
            Job::FetchObject { object_ap_id } if object_ap_id == "https://elsewhere.example/notes/unseen"
        )));
    }
}
