//! Remote content handling
//!
//! Sanitizes remote HTML, derives plain text, and persists objects with
//! their media/mention/poll sub-records. A failed sub-record never
//! prevents the core object from being persisted.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::data::{Database, EntityId, MediaAttachment, Mention, ObjectRecord, Poll};
use crate::error::AppError;

pub const PUBLIC_AUDIENCE: &str = "https://www.w3.org/ns/activitystreams#Public";

const OBJECT_TYPES: [&str; 3] = ["Note", "Article", "Question"];

/// Sanitize remote HTML with the default ammonia ruleset.
pub fn sanitize_html(content: &str) -> String {
    ammonia::clean(content)
}

/// Strip all markup and decode entities, for the stored plain text.
pub fn derive_plain_text(content: &str) -> String {
    let stripped = ammonia::Builder::empty().clean(content).to_string();
    html_escape::decode_html_entities(&stripped).trim().to_string()
}

fn audience_contains(audience: Option<&Value>, needle: &str) -> bool {
    let Some(audience) = audience else {
        return false;
    };
    if let Some(value) = audience.as_str() {
        return value == needle;
    }
    audience
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .any(|value| value == needle)
        })
        .unwrap_or(false)
}

fn audience_contains_followers(audience: Option<&Value>) -> bool {
    let Some(audience) = audience else {
        return false;
    };
    let is_followers = |value: &str| value.ends_with("/followers");
    if let Some(value) = audience.as_str() {
        return is_followers(value);
    }
    audience
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .any(is_followers)
        })
        .unwrap_or(false)
}

/// Map `to`/`cc` addressing onto a visibility label.
///
/// Direct-only addressing (no public audience, no followers collection)
/// classifies as "direct" and associates a DM conversation.
pub fn extract_visibility(object: &Value) -> &'static str {
    let to = object.get("to");
    let cc = object.get("cc");

    if audience_contains(to, PUBLIC_AUDIENCE) {
        "public"
    } else if audience_contains(cc, PUBLIC_AUDIENCE) {
        "unlisted"
    } else if audience_contains_followers(to) || audience_contains_followers(cc) {
        "private"
    } else {
        "direct"
    }
}

fn parse_published(object: &Value) -> DateTime<Utc> {
    object
        .get("published")
        .and_then(Value::as_str)
        .and_then(|published| DateTime::parse_from_rfc3339(published).ok())
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Attach media records parsed from the object's attachment list.
async fn attach_media(db: &Database, object_ap_id: &str, object: &Value) -> Result<(), AppError> {
    let Some(values) = object.get("attachment").and_then(Value::as_array) else {
        return Ok(());
    };

    for value in values {
        let (url, media_type, description, blurhash) = if let Some(url) = value.as_str() {
            (url.to_string(), "application/octet-stream".to_string(), None, None)
        } else {
            let Some(url) = value.get("url").and_then(Value::as_str) else {
                continue;
            };
            (
                url.to_string(),
                value
                    .get("mediaType")
                    .and_then(Value::as_str)
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                value
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                value
                    .get("blurhash")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            )
        };

        db.insert_media_attachment(&MediaAttachment {
            id: EntityId::new().0,
            object_ap_id: object_ap_id.to_string(),
            url,
            media_type,
            description,
            blurhash,
            created_at: Utc::now(),
        })
        .await?;
    }

    Ok(())
}

/// Attach mention records parsed from the object's tag list.
async fn attach_mentions(
    db: &Database,
    object_ap_id: &str,
    object: &Value,
) -> Result<(), AppError> {
    let Some(tags) = object.get("tag").and_then(Value::as_array) else {
        return Ok(());
    };

    for tag in tags {
        if tag.get("type").and_then(Value::as_str) != Some("Mention") {
            continue;
        }
        let Some(href) = tag.get("href").and_then(Value::as_str) else {
            continue;
        };

        db.insert_mention(&Mention {
            id: EntityId::new().0,
            object_ap_id: object_ap_id.to_string(),
            href: href.to_string(),
            acct: tag
                .get("name")
                .and_then(Value::as_str)
                .map(|name| name.trim_start_matches('@').to_string()),
            created_at: Utc::now(),
        })
        .await?;
    }

    Ok(())
}

/// Attach a poll record for Question objects.
async fn attach_poll(db: &Database, object_ap_id: &str, object: &Value) -> Result<(), AppError> {
    let (options, multiple) = match (object.get("oneOf"), object.get("anyOf")) {
        (Some(options), _) => (options, false),
        (None, Some(options)) => (options, true),
        (None, None) => return Ok(()),
    };

    let expires_at = object
        .get("endTime")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|timestamp| timestamp.with_timezone(&Utc));

    db.insert_poll(&Poll {
        id: EntityId::new().0,
        object_ap_id: object_ap_id.to_string(),
        options: options.to_string(),
        multiple,
        expires_at,
        created_at: Utc::now(),
    })
    .await?;

    Ok(())
}

/// Replace an object's media attachments with those in the given JSON.
pub async fn replace_attachments(
    db: &Database,
    object_ap_id: &str,
    object: &Value,
) -> Result<(), AppError> {
    db.delete_media_attachments(object_ap_id).await?;
    attach_media(db, object_ap_id, object).await
}

/// Persist a remote object with its sub-records.
///
/// Returns false when an object with the same `ap_id` already exists
/// (idempotent re-delivery). Sub-record failures are logged and skipped;
/// the core object always lands.
pub async fn persist_remote_object(
    db: &Database,
    object: &Value,
    attributed_to: &str,
) -> Result<bool, AppError> {
    let ap_id = object
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Object missing id".to_string()))?;

    let object_type = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("Note");
    if !OBJECT_TYPES.contains(&object_type) {
        return Err(AppError::Validation(format!(
            "Unsupported object type: {}",
            object_type
        )));
    }

    let raw_content = object.get("content").and_then(Value::as_str).unwrap_or("");
    let content = sanitize_html(raw_content);
    let plain_content = derive_plain_text(raw_content);
    let visibility = extract_visibility(object);
    let in_reply_to = object
        .get("inReplyTo")
        .and_then(Value::as_str)
        .map(str::to_string);

    // Direct-only addressing joins a DM conversation, given or derived.
    let conversation = object
        .get("conversation")
        .or_else(|| object.get("context"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| (visibility == "direct").then(|| format!("{}#conversation", ap_id)));

    let record = ObjectRecord {
        id: EntityId::new().0,
        ap_id: ap_id.to_string(),
        object_type: object_type.to_string(),
        attributed_to: attributed_to.to_string(),
        content,
        plain_content,
        summary: object
            .get("summary")
            .and_then(Value::as_str)
            .map(str::to_string),
        sensitive: object
            .get("sensitive")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        in_reply_to: in_reply_to.clone(),
        conversation,
        visibility: visibility.to_string(),
        local: false,
        favourites_count: 0,
        reblogs_count: 0,
        replies_count: 0,
        created_at: parse_published(object),
        edited_at: None,
    };

    if !db.insert_object(&record).await? {
        return Ok(false);
    }

    // Sub-records are best effort.
    if let Err(e) = attach_media(db, ap_id, object).await {
        tracing::warn!(object = %ap_id, error = %e, "Failed to attach media");
    }
    if let Err(e) = attach_mentions(db, ap_id, object).await {
        tracing::warn!(object = %ap_id, error = %e, "Failed to attach mentions");
    }
    if let Err(e) = attach_poll(db, ap_id, object).await {
        tracing::warn!(object = %ap_id, error = %e, "Failed to attach poll");
    }

    // Reply bookkeeping on the parent, when we know it.
    if let Some(parent) = in_reply_to {
        if db.get_object_by_ap_id(&parent).await?.is_some() {
            db.adjust_replies_count(&parent, 1).await?;
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::connect(&temp_dir.path().join("test.db"))
            .await
            .unwrap();
        (db, temp_dir)
    }

    #[test]
    fn sanitize_html_strips_scripts() {
        let cleaned = sanitize_html("<p>hi</p><script>alert(1)</script>");
        assert!(cleaned.contains("<p>hi</p>"));
        assert!(!cleaned.contains("script"));
    }

    #[test]
    fn derive_plain_text_strips_markup_and_decodes_entities() {
        assert_eq!(
            derive_plain_text("<p>hello &amp; <b>world</b></p>"),
            "hello & world"
        );
    }

    #[test]
    fn extract_visibility_classifies_addressing() {
        let public = json!({ "to": [PUBLIC_AUDIENCE] });
        let unlisted = json!({
            "to": ["https://remote.example/users/bob/followers"],
            "cc": [PUBLIC_AUDIENCE]
        });
        let private = json!({ "to": ["https://remote.example/users/bob/followers"] });
        let direct = json!({ "to": ["https://local.example/users/alice"] });

        assert_eq!(extract_visibility(&public), "public");
        assert_eq!(extract_visibility(&unlisted), "unlisted");
        assert_eq!(extract_visibility(&private), "private");
        assert_eq!(extract_visibility(&direct), "direct");
    }

    #[tokio::test]
    async fn persist_remote_object_is_idempotent() {
        let (db, _tmp) = test_db().await;
        let object = json!({
            "id": "https://remote.example/notes/1",
            "type": "Note",
            "content": "<p>hello</p>",
            "to": [PUBLIC_AUDIENCE]
        });

        assert!(
            persist_remote_object(&db, &object, "https://remote.example/users/bob")
                .await
                .unwrap()
        );
        assert!(
            !persist_remote_object(&db, &object, "https://remote.example/users/bob")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn persist_remote_object_attaches_sub_records() {
        let (db, _tmp) = test_db().await;
        let object = json!({
            "id": "https://remote.example/notes/2",
            "type": "Note",
            "content": "<p>hey @alice</p>",
            "to": [PUBLIC_AUDIENCE],
            "attachment": [{
                "type": "Document",
                "url": "https://remote.example/media/1.webp",
                "mediaType": "image/webp",
                "name": "a picture"
            }],
            "tag": [{
                "type": "Mention",
                "href": "https://local.example/users/alice",
                "name": "@alice@local.example"
            }]
        });

        persist_remote_object(&db, &object, "https://remote.example/users/bob")
            .await
            .unwrap();

        let media = db
            .list_media_attachments("https://remote.example/notes/2")
            .await
            .unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].media_type, "image/webp");
    }

    #[tokio::test]
    async fn persist_remote_object_bumps_parent_reply_counter() {
        let (db, _tmp) = test_db().await;
        let parent = json!({
            "id": "https://local.example/notes/parent",
            "type": "Note",
            "content": "<p>root</p>",
            "to": [PUBLIC_AUDIENCE]
        });
        persist_remote_object(&db, &parent, "https://local.example/users/alice")
            .await
            .unwrap();

        let reply = json!({
            "id": "https://remote.example/notes/reply",
            "type": "Note",
            "content": "<p>reply</p>",
            "inReplyTo": "https://local.example/notes/parent",
            "to": [PUBLIC_AUDIENCE]
        });
        persist_remote_object(&db, &reply, "https://remote.example/users/bob")
            .await
            .unwrap();

        let stored = db
            .get_object_by_ap_id("https://local.example/notes/parent")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.replies_count, 1);
    }

    #[tokio::test]
    async fn persist_remote_object_marks_direct_messages_with_conversation() {
        let (db, _tmp) = test_db().await;
        let dm = json!({
            "id": "https://remote.example/notes/dm",
            "type": "Note",
            "content": "<p>psst</p>",
            "to": ["https://local.example/users/alice"]
        });
        persist_remote_object(&db, &dm, "https://remote.example/users/bob")
            .await
            .unwrap();

        let stored = db
            .get_object_by_ap_id("https://remote.example/notes/dm")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.visibility, "direct");
        assert!(stored.conversation.is_some());
    }
}
