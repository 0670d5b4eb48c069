//! Activity envelope validation
//!
//! JSON-LD shape checks applied before any signature or state work.

use serde_json::Value;

use crate::error::AppError;

const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// A validated activity envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Activity URI
    pub ap_id: String,
    /// Activity type string as received (may be a type we don't handle)
    pub kind: String,
    /// Actor URI
    pub actor: String,
    /// Raw JSON for handler-specific fields
    pub raw: Value,
}

impl Envelope {
    /// The wrapped object, if any.
    pub fn object(&self) -> Option<&Value> {
        self.raw.get("object")
    }

    /// The wrapped object as a URI: either a bare string or its `id`.
    pub fn object_ap_id(&self) -> Option<&str> {
        let object = self.object()?;
        object
            .as_str()
            .or_else(|| object.get("id").and_then(Value::as_str))
    }
}

fn context_mentions_activitystreams(context: &Value) -> bool {
    match context {
        Value::String(s) => s == ACTIVITYSTREAMS_CONTEXT,
        Value::Array(entries) => entries.iter().any(|entry| {
            entry
                .as_str()
                .is_some_and(|s| s == ACTIVITYSTREAMS_CONTEXT)
        }),
        // An embedded context object is a term map; accept it.
        Value::Object(_) => true,
        _ => false,
    }
}

/// Validate an activity envelope's JSON-LD shape.
///
/// Requires a string `id`, a string `type`, and a string-or-object
/// `actor`. When `@context` is present it must mention the
/// ActivityStreams namespace.
pub fn validate(value: Value) -> Result<Envelope, AppError> {
    if !value.is_object() {
        return Err(AppError::Validation(
            "Activity must be a JSON object".to_string(),
        ));
    }

    if let Some(context) = value.get("@context") {
        if !context_mentions_activitystreams(context) {
            return Err(AppError::Validation(
                "@context does not include ActivityStreams".to_string(),
            ));
        }
    }

    let ap_id = value
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?
        .to_string();

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
        .to_string();

    let actor = value
        .get("actor")
        .and_then(|actor| {
            actor
                .as_str()
                .or_else(|| actor.get("id").and_then(Value::as_str))
        })
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?
        .to_string();

    Ok(Envelope {
        ap_id,
        kind,
        actor,
        raw: value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_accepts_minimal_activity() {
        let envelope = validate(json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": "https://remote.example/activities/1",
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "https://local.example/users/alice"
        }))
        .expect("valid envelope");

        assert_eq!(envelope.kind, "Follow");
        assert_eq!(envelope.actor, "https://remote.example/users/bob");
        assert_eq!(
            envelope.object_ap_id(),
            Some("https://local.example/users/alice")
        );
    }

    #[test]
    fn validate_accepts_array_context_and_object_actor() {
        let envelope = validate(json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "id": "https://remote.example/activities/2",
            "type": "Create",
            "actor": { "id": "https://remote.example/users/bob" },
            "object": { "id": "https://remote.example/notes/1", "type": "Note" }
        }))
        .expect("valid envelope");

        assert_eq!(envelope.actor, "https://remote.example/users/bob");
        assert_eq!(envelope.object_ap_id(), Some("https://remote.example/notes/1"));
    }

    #[test]
    fn validate_rejects_missing_fields() {
        for broken in [
            json!({ "type": "Follow", "actor": "https://remote.example/users/bob" }),
            json!({ "id": "https://remote.example/activities/3", "actor": "x" }),
            json!({ "id": "https://remote.example/activities/4", "type": "Follow" }),
        ] {
            assert!(matches!(validate(broken), Err(AppError::Validation(_))));
        }
    }

    #[test]
    fn validate_rejects_foreign_context() {
        let result = validate(json!({
            "@context": "https://schema.org",
            "id": "https://remote.example/activities/5",
            "type": "Follow",
            "actor": "https://remote.example/users/bob"
        }));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
