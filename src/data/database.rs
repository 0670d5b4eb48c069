//! SQLite database operations
//!
//! All database access goes through this module.
//! Uniqueness guarantees (activity `ap_id`, (actor, target) follow pairs,
//! (actor, object) interaction pairs) live in the schema; double delivery
//! surfaces here as a caught unique violation, not duplicated state.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl Database {
    /// Open (creating if missing) and migrate the database at `path`.
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("migration failed: {e}")))?;

        tracing::info!("Database connected and migrated");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors
    // =========================================================================

    /// Insert an actor if no row with the same `ap_id` exists.
    ///
    /// Resolution is idempotent: an existing row is returned unchanged.
    pub async fn insert_actor(&self, actor: &Actor) -> Result<Actor, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO actors (
                id, ap_id, username, domain, display_name, summary,
                inbox_url, outbox_url, shared_inbox_url,
                public_key_pem, private_key_pem, local,
                followers_count, following_count, posts_count,
                profile_fields, emoji_tags, created_at, refreshed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.ap_id)
        .bind(&actor.username)
        .bind(&actor.domain)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.local)
        .bind(actor.followers_count)
        .bind(actor.following_count)
        .bind(actor.posts_count)
        .bind(&actor.profile_fields)
        .bind(&actor.emoji_tags)
        .bind(actor.created_at)
        .bind(actor.refreshed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(actor.clone()),
            Err(e) if is_unique_violation(&e) => self
                .get_actor_by_ap_id(&actor.ap_id)
                .await?
                .ok_or(AppError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_actor_by_ap_id(&self, ap_id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE ap_id = ?")
            .bind(ap_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(actor)
    }

    pub async fn get_local_actor(&self, username: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE username = ? AND local = 1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(actor)
    }

    pub async fn list_local_actors(&self) -> Result<Vec<Actor>, AppError> {
        let actors =
            sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE local = 1 ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        Ok(actors)
    }

    /// Replace a remote actor's key material and profile after a refetch.
    pub async fn refresh_actor(&self, actor: &Actor) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE actors SET
                display_name = ?, summary = ?,
                inbox_url = ?, outbox_url = ?, shared_inbox_url = ?,
                public_key_pem = ?, profile_fields = ?, emoji_tags = ?,
                refreshed_at = ?
            WHERE ap_id = ?
            "#,
        )
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.inbox_url)
        .bind(&actor.outbox_url)
        .bind(&actor.shared_inbox_url)
        .bind(&actor.public_key_pem)
        .bind(&actor.profile_fields)
        .bind(&actor.emoji_tags)
        .bind(Utc::now())
        .bind(&actor.ap_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_actor(&self, ap_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM actors WHERE ap_id = ?")
            .bind(ap_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM follows WHERE actor_ap_id = ? OR target_ap_id = ?")
            .bind(ap_id)
            .bind(ap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn adjust_follower_count(&self, ap_id: &str, delta: i64) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE actors SET followers_count = MAX(0, followers_count + ?) WHERE ap_id = ?",
        )
        .bind(delta)
        .bind(ap_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn adjust_following_count(&self, ap_id: &str, delta: i64) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE actors SET following_count = MAX(0, following_count + ?) WHERE ap_id = ?",
        )
        .bind(delta)
        .bind(ap_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn adjust_posts_count(&self, ap_id: &str, delta: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE actors SET posts_count = MAX(0, posts_count + ?) WHERE ap_id = ?")
            .bind(delta)
            .bind(ap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Insert an activity row. Returns false when the `ap_id` was already
    /// recorded (duplicate delivery), which callers treat as a no-op.
    pub async fn insert_activity(&self, activity: &Activity) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO activities (
                id, ap_id, activity_type, actor_ap_id, object_ap_id,
                local, processed, processed_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&activity.id)
        .bind(&activity.ap_id)
        .bind(&activity.activity_type)
        .bind(&activity.actor_ap_id)
        .bind(&activity.object_ap_id)
        .bind(activity.local)
        .bind(activity.processed)
        .bind(activity.processed_at)
        .bind(activity.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn activity_exists(&self, ap_id: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM activities WHERE ap_id = ?",
        )
        .bind(ap_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn get_activity_by_ap_id(&self, ap_id: &str) -> Result<Option<Activity>, AppError> {
        let activity =
            sqlx::query_as::<_, Activity>("SELECT * FROM activities WHERE ap_id = ?")
                .bind(ap_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(activity)
    }

    pub async fn mark_activity_processed(&self, ap_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE activities SET processed = 1, processed_at = ? WHERE ap_id = ?")
            .bind(Utc::now())
            .bind(ap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_activity(&self, ap_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM activities WHERE ap_id = ?")
            .bind(ap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Follows
    // =========================================================================

    /// Insert a follow row. Returns the existing row when the
    /// (actor, target) pair is already present.
    pub async fn insert_follow(&self, follow: &Follow) -> Result<Follow, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO follows (
                id, actor_ap_id, target_ap_id, follow_activity_ap_id,
                accepted, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&follow.id)
        .bind(&follow.actor_ap_id)
        .bind(&follow.target_ap_id)
        .bind(&follow.follow_activity_ap_id)
        .bind(follow.accepted)
        .bind(follow.created_at)
        .bind(follow.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(follow.clone()),
            Err(e) if is_unique_violation(&e) => self
                .get_follow(&follow.actor_ap_id, &follow.target_ap_id)
                .await?
                .ok_or(AppError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_follow(
        &self,
        actor_ap_id: &str,
        target_ap_id: &str,
    ) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE actor_ap_id = ? AND target_ap_id = ?",
        )
        .bind(actor_ap_id)
        .bind(target_ap_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follow)
    }

    pub async fn get_follow_by_activity(
        &self,
        follow_activity_ap_id: &str,
    ) -> Result<Option<Follow>, AppError> {
        let follow = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE follow_activity_ap_id = ?",
        )
        .bind(follow_activity_ap_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(follow)
    }

    pub async fn set_follow_accepted(&self, id: &str, accepted: bool) -> Result<(), AppError> {
        sqlx::query("UPDATE follows SET accepted = ?, updated_at = ? WHERE id = ?")
            .bind(accepted)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a follow row by id. Returns true when a row was removed.
    pub async fn delete_follow(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM follows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Accepted followers of a local actor, joined to their actor rows
    /// for inbox fan-out.
    pub async fn list_follower_actors(&self, target_ap_id: &str) -> Result<Vec<Actor>, AppError> {
        let actors = sqlx::query_as::<_, Actor>(
            r#"
            SELECT a.* FROM actors a
            JOIN follows f ON f.actor_ap_id = a.ap_id
            WHERE f.target_ap_id = ? AND f.accepted = 1
            "#,
        )
        .bind(target_ap_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(actors)
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Insert an object row. Returns false when the `ap_id` already exists.
    pub async fn insert_object(&self, object: &ObjectRecord) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO objects (
                id, ap_id, object_type, attributed_to, content, plain_content,
                summary, sensitive, in_reply_to, conversation, visibility,
                local, favourites_count, reblogs_count, replies_count,
                created_at, edited_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&object.id)
        .bind(&object.ap_id)
        .bind(&object.object_type)
        .bind(&object.attributed_to)
        .bind(&object.content)
        .bind(&object.plain_content)
        .bind(&object.summary)
        .bind(object.sensitive)
        .bind(&object.in_reply_to)
        .bind(&object.conversation)
        .bind(&object.visibility)
        .bind(object.local)
        .bind(object.favourites_count)
        .bind(object.reblogs_count)
        .bind(object.replies_count)
        .bind(object.created_at)
        .bind(object.edited_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_object_by_ap_id(&self, ap_id: &str) -> Result<Option<ObjectRecord>, AppError> {
        let object = sqlx::query_as::<_, ObjectRecord>("SELECT * FROM objects WHERE ap_id = ?")
            .bind(ap_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(object)
    }

    pub async fn update_object_content(
        &self,
        ap_id: &str,
        content: &str,
        plain_content: &str,
        summary: Option<&str>,
        sensitive: bool,
        edited_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE objects SET
                content = ?, plain_content = ?, summary = ?, sensitive = ?, edited_at = ?
            WHERE ap_id = ?
            "#,
        )
        .bind(content)
        .bind(plain_content)
        .bind(summary)
        .bind(sensitive)
        .bind(edited_at)
        .bind(ap_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_object(&self, ap_id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM objects WHERE ap_id = ?")
            .bind(ap_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM media_attachments WHERE object_ap_id = ?")
            .bind(ap_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mentions WHERE object_ap_id = ?")
            .bind(ap_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM polls WHERE object_ap_id = ?")
            .bind(ap_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn adjust_replies_count(&self, ap_id: &str, delta: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE objects SET replies_count = MAX(0, replies_count + ?) WHERE ap_id = ?")
            .bind(delta)
            .bind(ap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Object sub-records
    // =========================================================================

    pub async fn insert_media_attachment(
        &self,
        attachment: &MediaAttachment,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO media_attachments (id, object_ap_id, url, media_type, description, blurhash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attachment.id)
        .bind(&attachment.object_ap_id)
        .bind(&attachment.url)
        .bind(&attachment.media_type)
        .bind(&attachment.description)
        .bind(&attachment.blurhash)
        .bind(attachment.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_media_attachments(&self, object_ap_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM media_attachments WHERE object_ap_id = ?")
            .bind(object_ap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_media_attachments(
        &self,
        object_ap_id: &str,
    ) -> Result<Vec<MediaAttachment>, AppError> {
        let attachments = sqlx::query_as::<_, MediaAttachment>(
            "SELECT * FROM media_attachments WHERE object_ap_id = ? ORDER BY created_at",
        )
        .bind(object_ap_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attachments)
    }

    pub async fn insert_mention(&self, mention: &Mention) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO mentions (id, object_ap_id, href, acct, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&mention.id)
        .bind(&mention.object_ap_id)
        .bind(&mention.href)
        .bind(&mention.acct)
        .bind(mention.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn insert_poll(&self, poll: &Poll) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO polls (id, object_ap_id, options, multiple, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.object_ap_id)
        .bind(&poll.options)
        .bind(poll.multiple)
        .bind(poll.expires_at)
        .bind(poll.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Favourites / Reblogs
    // =========================================================================

    /// Create a favourite and bump the object's counter in one transaction.
    /// Returns false when the (actor, object) pair already exists.
    pub async fn create_favourite(&self, favourite: &Favourite) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO favourites (id, actor_ap_id, object_ap_id, activity_ap_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&favourite.id)
        .bind(&favourite.actor_ap_id)
        .bind(&favourite.object_ap_id)
        .bind(&favourite.activity_ap_id)
        .bind(favourite.created_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query("UPDATE objects SET favourites_count = favourites_count + 1 WHERE ap_id = ?")
            .bind(&favourite.object_ap_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Remove a favourite and decrement the counter. Returns the removed
    /// row's creating activity URI when one existed.
    pub async fn delete_favourite(
        &self,
        actor_ap_id: &str,
        object_ap_id: &str,
    ) -> Result<Option<String>, AppError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, Favourite>(
            "SELECT * FROM favourites WHERE actor_ap_id = ? AND object_ap_id = ?",
        )
        .bind(actor_ap_id)
        .bind(object_ap_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(favourite) = existing else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("DELETE FROM favourites WHERE id = ?")
            .bind(&favourite.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE objects SET favourites_count = MAX(0, favourites_count - 1) WHERE ap_id = ?",
        )
        .bind(object_ap_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(favourite.activity_ap_id))
    }

    pub async fn count_favourites(&self, object_ap_id: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM favourites WHERE object_ap_id = ?")
                .bind(object_ap_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Create a reblog and bump the object's counter in one transaction.
    pub async fn create_reblog(&self, reblog: &Reblog) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO reblogs (id, actor_ap_id, object_ap_id, activity_ap_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reblog.id)
        .bind(&reblog.actor_ap_id)
        .bind(&reblog.object_ap_id)
        .bind(&reblog.activity_ap_id)
        .bind(reblog.created_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                tx.rollback().await?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query("UPDATE objects SET reblogs_count = reblogs_count + 1 WHERE ap_id = ?")
            .bind(&reblog.object_ap_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Remove a reblog and decrement the counter.
    pub async fn delete_reblog(
        &self,
        actor_ap_id: &str,
        object_ap_id: &str,
    ) -> Result<Option<String>, AppError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, Reblog>(
            "SELECT * FROM reblogs WHERE actor_ap_id = ? AND object_ap_id = ?",
        )
        .bind(actor_ap_id)
        .bind(object_ap_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(reblog) = existing else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query("DELETE FROM reblogs WHERE id = ?")
            .bind(&reblog.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE objects SET reblogs_count = MAX(0, reblogs_count - 1) WHERE ap_id = ?")
            .bind(object_ap_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(reblog.activity_ap_id))
    }

    // =========================================================================
    // Relays
    // =========================================================================

    pub async fn insert_relay(&self, relay: &Relay) -> Result<Relay, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO relays (
                id, inbox_url, actor_ap_id, state, follow_activity_ap_id,
                delivery_attempts, last_error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&relay.id)
        .bind(&relay.inbox_url)
        .bind(&relay.actor_ap_id)
        .bind(&relay.state)
        .bind(&relay.follow_activity_ap_id)
        .bind(relay.delivery_attempts)
        .bind(&relay.last_error)
        .bind(relay.created_at)
        .bind(relay.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(relay.clone()),
            Err(e) if is_unique_violation(&e) => self
                .get_relay_by_inbox(&relay.inbox_url)
                .await?
                .ok_or(AppError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_relay_by_inbox(&self, inbox_url: &str) -> Result<Option<Relay>, AppError> {
        let relay = sqlx::query_as::<_, Relay>("SELECT * FROM relays WHERE inbox_url = ?")
            .bind(inbox_url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(relay)
    }

    pub async fn get_relay_by_follow_activity(
        &self,
        follow_activity_ap_id: &str,
    ) -> Result<Option<Relay>, AppError> {
        let relay =
            sqlx::query_as::<_, Relay>("SELECT * FROM relays WHERE follow_activity_ap_id = ?")
                .bind(follow_activity_ap_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(relay)
    }

    pub async fn list_relays(&self) -> Result<Vec<Relay>, AppError> {
        let relays = sqlx::query_as::<_, Relay>("SELECT * FROM relays ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(relays)
    }

    pub async fn list_relays_in_state(&self, state: RelayState) -> Result<Vec<Relay>, AppError> {
        let relays = sqlx::query_as::<_, Relay>("SELECT * FROM relays WHERE state = ?")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(relays)
    }

    pub async fn update_relay(&self, relay: &Relay) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE relays SET
                actor_ap_id = ?, state = ?, follow_activity_ap_id = ?,
                delivery_attempts = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&relay.actor_ap_id)
        .bind(&relay.state)
        .bind(&relay.follow_activity_ap_id)
        .bind(relay.delivery_attempts)
        .bind(&relay.last_error)
        .bind(Utc::now())
        .bind(&relay.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // =========================================================================
    // Blocking
    // =========================================================================

    pub async fn insert_block(&self, block: &Block) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO blocks (id, blocker_ap_id, target_ap_id, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&block.id)
        .bind(&block.blocker_ap_id)
        .bind(&block.target_ap_id)
        .bind(block.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_blocked(
        &self,
        blocker_ap_id: &str,
        target_ap_id: &str,
    ) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM blocks WHERE blocker_ap_id = ? AND target_ap_id = ?",
        )
        .bind(blocker_ap_id)
        .bind(target_ap_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn block_domain(&self, domain: &str) -> Result<(), AppError> {
        let block = DomainBlock {
            id: EntityId::new().0,
            domain: domain.to_ascii_lowercase(),
            created_at: Utc::now(),
        };
        let result = sqlx::query(
            "INSERT INTO domain_blocks (id, domain, created_at) VALUES (?, ?, ?)",
        )
        .bind(&block.id)
        .bind(&block.domain)
        .bind(block.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn is_domain_blocked(&self, domain: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM domain_blocks WHERE domain = ?",
        )
        .bind(domain.to_ascii_lowercase())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub async fn insert_notification(&self, notification: &Notification) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO notifications (
                id, notification_type, target_actor_ap_id, origin_actor_ap_id,
                object_ap_id, read, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&notification.id)
        .bind(&notification.notification_type)
        .bind(&notification.target_actor_ap_id)
        .bind(&notification.origin_actor_ap_id)
        .bind(&notification.object_ap_id)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_notifications(
        &self,
        target_actor_ap_id: &str,
    ) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE target_actor_ap_id = ? ORDER BY created_at DESC",
        )
        .bind(target_actor_ap_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }
}
