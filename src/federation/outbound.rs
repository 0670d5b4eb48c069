//! Local activity production
//!
//! The domain events that feed the delivery queue: follow/unfollow a
//! remote actor, publish a Note, like/unlike, boost. Each operation
//! persists its rows first, then explicitly queues signed delivery;
//! nothing happens implicitly on save.

use std::sync::Arc;

use chrono::Utc;

use crate::data::{Activity, Actor, EntityId, Favourite, Follow, ObjectRecord, Reblog};
use crate::error::AppError;
use crate::federation::content;
use crate::federation::delivery::builder;
use crate::federation::inbox::Services;
use crate::federation::relay::PUBLIC_COLLECTION;

/// to/cc audience pair for a visibility label.
fn audience(actor_ap_id: &str, visibility: &str) -> (Vec<String>, Vec<String>) {
    let followers = format!("{}/followers", actor_ap_id);

    match visibility {
        "public" => (vec![PUBLIC_COLLECTION.to_string()], vec![followers]),
        "unlisted" => (vec![followers], vec![PUBLIC_COLLECTION.to_string()]),
        "private" => (vec![followers], Vec::new()),
        "direct" => (Vec::new(), Vec::new()),
        _ => (vec![PUBLIC_COLLECTION.to_string()], vec![followers]),
    }
}

/// Produces locally authored activities and queues their delivery.
pub struct Publisher {
    services: Arc<Services>,
}

impl Publisher {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn activity_ap_id(&self, actor: &Actor) -> String {
        format!("{}/activities/{}", actor.ap_id, EntityId::new().0)
    }

    async fn record_local_activity(
        &self,
        ap_id: &str,
        activity_type: &str,
        actor: &Actor,
        object_ap_id: Option<&str>,
    ) -> Result<(), AppError> {
        self.services
            .db
            .insert_activity(&Activity {
                id: EntityId::new().0,
                ap_id: ap_id.to_string(),
                activity_type: activity_type.to_string(),
                actor_ap_id: actor.ap_id.clone(),
                object_ap_id: object_ap_id.map(str::to_string),
                local: true,
                processed: true,
                processed_at: Some(Utc::now()),
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Follow a remote actor (or handle). Local targets auto-accept with
    /// no wire traffic.
    pub async fn follow(&self, actor: &Actor, target: &str) -> Result<Follow, AppError> {
        let target_actor = self.services.resolver.resolve(target).await?;

        if target_actor.ap_id == actor.ap_id {
            return Err(AppError::Validation("Self-follow is forbidden".to_string()));
        }

        if let Some(existing) = self
            .services
            .db
            .get_follow(&actor.ap_id, &target_actor.ap_id)
            .await?
        {
            return Ok(existing);
        }

        let follow_ap_id = self.activity_ap_id(actor);
        let local_pair = target_actor.local;

        let follow = self
            .services
            .db
            .insert_follow(&Follow {
                id: EntityId::new().0,
                actor_ap_id: actor.ap_id.clone(),
                target_ap_id: target_actor.ap_id.clone(),
                follow_activity_ap_id: follow_ap_id.clone(),
                accepted: local_pair,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await?;

        self.record_local_activity(&follow_ap_id, "Follow", actor, Some(&target_actor.ap_id))
            .await?;

        if local_pair {
            self.services
                .db
                .adjust_following_count(&actor.ap_id, 1)
                .await?;
            self.services
                .db
                .adjust_follower_count(&target_actor.ap_id, 1)
                .await?;
            return Ok(follow);
        }

        let payload = builder::follow(&follow_ap_id, &actor.ap_id, &target_actor.ap_id);
        self.services.delivery.enqueue_to_inbox(
            &follow_ap_id,
            payload,
            &actor.ap_id,
            &target_actor.inbox_url,
        );

        tracing::info!(actor = %actor.ap_id, target = %target_actor.ap_id, "Follow sent");
        Ok(follow)
    }

    /// Undo a follow: remove the row, roll counters back, send Undo.
    pub async fn unfollow(&self, actor: &Actor, target_ap_id: &str) -> Result<(), AppError> {
        let Some(follow) = self.services.db.get_follow(&actor.ap_id, target_ap_id).await? else {
            return Err(AppError::NotFound);
        };

        let was_accepted = follow.accepted;
        self.services.db.delete_follow(&follow.id).await?;
        if was_accepted {
            self.services
                .db
                .adjust_following_count(&actor.ap_id, -1)
                .await?;
            self.services
                .db
                .adjust_follower_count(target_ap_id, -1)
                .await?;
        }

        let target_actor = self.services.db.get_actor_by_ap_id(target_ap_id).await?;
        let Some(target_actor) = target_actor.filter(|t| !t.local) else {
            return Ok(());
        };

        let undo_ap_id = self.activity_ap_id(actor);
        let payload = builder::undo(
            &undo_ap_id,
            &actor.ap_id,
            builder::follow(&follow.follow_activity_ap_id, &actor.ap_id, target_ap_id),
        );
        self.record_local_activity(&undo_ap_id, "Undo", actor, Some(&follow.follow_activity_ap_id))
            .await?;
        self.services.delivery.enqueue_to_inbox(
            &undo_ap_id,
            payload,
            &actor.ap_id,
            &target_actor.inbox_url,
        );

        tracing::info!(actor = %actor.ap_id, target = %target_ap_id, "Unfollow sent");
        Ok(())
    }

    /// Publish a Note and fan the Create out to followers (and relays,
    /// when public).
    pub async fn publish_note(
        &self,
        author: &Actor,
        content_html: &str,
        visibility: &str,
        in_reply_to: Option<&str>,
    ) -> Result<ObjectRecord, AppError> {
        let object_ap_id = format!("{}/objects/{}", author.ap_id, EntityId::new().0);
        let sanitized = content::sanitize_html(content_html);
        let now = Utc::now();

        let record = ObjectRecord {
            id: EntityId::new().0,
            ap_id: object_ap_id.clone(),
            object_type: "Note".to_string(),
            attributed_to: author.ap_id.clone(),
            plain_content: content::derive_plain_text(content_html),
            content: sanitized.clone(),
            summary: None,
            sensitive: false,
            in_reply_to: in_reply_to.map(str::to_string),
            conversation: None,
            visibility: visibility.to_string(),
            local: true,
            favourites_count: 0,
            reblogs_count: 0,
            replies_count: 0,
            created_at: now,
            edited_at: None,
        };
        self.services.db.insert_object(&record).await?;
        self.services.db.adjust_posts_count(&author.ap_id, 1).await?;
        if let Some(parent) = in_reply_to {
            if self.services.db.get_object_by_ap_id(parent).await?.is_some() {
                self.services.db.adjust_replies_count(parent, 1).await?;
            }
        }

        let (to, cc) = audience(&author.ap_id, visibility);
        let to_refs: Vec<&str> = to.iter().map(String::as_str).collect();
        let cc_refs: Vec<&str> = cc.iter().map(String::as_str).collect();
        let published = now.to_rfc3339();

        let note = builder::note(
            &object_ap_id,
            &author.ap_id,
            &sanitized,
            &published,
            in_reply_to,
            to_refs.clone(),
            cc_refs.clone(),
        );

        let create_ap_id = self.activity_ap_id(author);
        let payload = builder::create(&create_ap_id, &author.ap_id, note, to_refs, cc_refs, &published);
        self.record_local_activity(&create_ap_id, "Create", author, Some(&object_ap_id))
            .await?;

        // Direct messages address explicit recipients, not the follower
        // collection; mention-based delivery happens at a higher layer.
        if visibility == "direct" {
            return Ok(record);
        }

        self.services
            .delivery
            .fan_out(
                &create_ap_id,
                payload,
                author,
                visibility == "public",
                &self.services.relays,
            )
            .await?;

        Ok(record)
    }

    /// Like an object and deliver the Like to its author.
    pub async fn like(&self, actor: &Actor, object_ap_id: &str) -> Result<(), AppError> {
        let record = self
            .services
            .db
            .get_object_by_ap_id(object_ap_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let like_ap_id = self.activity_ap_id(actor);
        let created = self
            .services
            .db
            .create_favourite(&Favourite {
                id: EntityId::new().0,
                actor_ap_id: actor.ap_id.clone(),
                object_ap_id: object_ap_id.to_string(),
                activity_ap_id: like_ap_id.clone(),
                created_at: Utc::now(),
            })
            .await?;
        if !created {
            return Ok(());
        }

        self.record_local_activity(&like_ap_id, "Like", actor, Some(object_ap_id))
            .await?;

        if let Some(owner) = self
            .services
            .db
            .get_actor_by_ap_id(&record.attributed_to)
            .await?
            .filter(|owner| !owner.local)
        {
            let payload = builder::like(&like_ap_id, &actor.ap_id, object_ap_id);
            self.services.delivery.enqueue_to_inbox(
                &like_ap_id,
                payload,
                &actor.ap_id,
                &owner.inbox_url,
            );
        }

        Ok(())
    }

    /// Undo a like, rolling the counter back and notifying the author.
    pub async fn undo_like(&self, actor: &Actor, object_ap_id: &str) -> Result<(), AppError> {
        let Some(like_ap_id) = self
            .services
            .db
            .delete_favourite(&actor.ap_id, object_ap_id)
            .await?
        else {
            return Ok(());
        };
        self.services.db.delete_activity(&like_ap_id).await?;

        let record = self.services.db.get_object_by_ap_id(object_ap_id).await?;
        let owner = match record {
            Some(record) => {
                self.services
                    .db
                    .get_actor_by_ap_id(&record.attributed_to)
                    .await?
            }
            None => None,
        };

        if let Some(owner) = owner.filter(|owner| !owner.local) {
            let undo_ap_id = self.activity_ap_id(actor);
            let payload = builder::undo(
                &undo_ap_id,
                &actor.ap_id,
                builder::like(&like_ap_id, &actor.ap_id, object_ap_id),
            );
            self.record_local_activity(&undo_ap_id, "Undo", actor, Some(&like_ap_id))
                .await?;
            self.services.delivery.enqueue_to_inbox(
                &undo_ap_id,
                payload,
                &actor.ap_id,
                &owner.inbox_url,
            );
        }

        Ok(())
    }

    /// Boost an object, fanning the Announce out to followers and relays.
    pub async fn announce(
        &self,
        actor: &Actor,
        object_ap_id: &str,
        visibility: &str,
    ) -> Result<(), AppError> {
        self.services
            .db
            .get_object_by_ap_id(object_ap_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let announce_ap_id = self.activity_ap_id(actor);
        let created = self
            .services
            .db
            .create_reblog(&Reblog {
                id: EntityId::new().0,
                actor_ap_id: actor.ap_id.clone(),
                object_ap_id: object_ap_id.to_string(),
                activity_ap_id: announce_ap_id.clone(),
                created_at: Utc::now(),
            })
            .await?;
        if !created {
            return Ok(());
        }

        self.record_local_activity(&announce_ap_id, "Announce", actor, Some(object_ap_id))
            .await?;

        let (to, cc) = audience(&actor.ap_id, visibility);
        let payload = builder::announce(
            &announce_ap_id,
            &actor.ap_id,
            object_ap_id,
            to.iter().map(String::as_str).collect(),
            cc.iter().map(String::as_str).collect(),
            &Utc::now().to_rfc3339(),
        );

        self.services
            .delivery
            .fan_out(
                &announce_ap_id,
                payload,
                actor,
                visibility == "public",
                &self.services.relays,
            )
            .await?;

        Ok(())
    }
}
