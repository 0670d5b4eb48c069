//! Data models
//!
//! Rust structs representing database entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Create from existing string
    pub fn from_string(s: String) -> Self {
        Self(s)
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// An identity, local or remote.
///
/// Local actors always carry both key halves; remote actors never carry
/// a private key. Remote actors are created lazily on first signature
/// verification or follow resolution.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    /// ActivityPub identifier (globally unique URI)
    pub ap_id: String,
    pub username: String,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub inbox_url: String,
    pub outbox_url: Option<String>,
    /// Shared inbox, preferred for fan-out when present
    pub shared_inbox_url: Option<String>,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key (PEM format), local actors only
    pub private_key_pem: Option<String>,
    pub local: bool,
    pub followers_count: i64,
    pub following_count: i64,
    pub posts_count: i64,
    /// Property-value profile fields, serialized JSON
    pub profile_fields: Option<String>,
    /// Custom emoji tags from the actor document, serialized JSON
    pub emoji_tags: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Last successful fetch of the remote document (or provisioning time)
    pub refreshed_at: DateTime<Utc>,
}

impl Actor {
    /// The key id advertised for this actor's public key.
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.ap_id)
    }

    /// Inbox to deliver to when fanning out, preferring the shared inbox.
    pub fn preferred_inbox(&self) -> &str {
        self.shared_inbox_url.as_deref().unwrap_or(&self.inbox_url)
    }
}

// =============================================================================
// Activity
// =============================================================================

/// ActivityPub activity types understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Undo,
    Like,
    Announce,
    Block,
    Add,
    Remove,
    Flag,
}

impl ActivityType {
    /// Parse activity type from its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Reject" => Some(Self::Reject),
            "Undo" => Some(Self::Undo),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            "Block" => Some(Self::Block),
            "Add" => Some(Self::Add),
            "Remove" => Some(Self::Remove),
            "Flag" => Some(Self::Flag),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Undo => "Undo",
            Self::Like => "Like",
            Self::Announce => "Announce",
            Self::Block => "Block",
            Self::Add => "Add",
            Self::Remove => "Remove",
            Self::Flag => "Flag",
        }
    }
}

/// A persisted activity envelope.
///
/// The unique `ap_id` makes reprocessing a duplicate delivery a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Activity {
    pub id: String,
    /// ActivityPub activity URI (globally unique)
    pub ap_id: String,
    pub activity_type: String,
    pub actor_ap_id: String,
    pub object_ap_id: Option<String>,
    pub local: bool,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Follow
// =============================================================================

/// A follow relationship (actor → target), unique per ordered pair.
///
/// pending (accepted = false) → accepted via Accept, or removed via
/// Reject/Undo. Local-to-local follows auto-accept.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub id: String,
    pub actor_ap_id: String,
    pub target_ap_id: String,
    /// URI of the Follow activity that created this row
    pub follow_activity_ap_id: String,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Objects and interactions
// =============================================================================

/// A persisted object (Note, Article, Question).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObjectRecord {
    pub id: String,
    /// ActivityPub object URI (globally unique)
    pub ap_id: String,
    pub object_type: String,
    /// Author's actor URI
    pub attributed_to: String,
    /// Sanitized HTML content
    pub content: String,
    /// Plain text derived from content
    pub plain_content: String,
    /// Content warning / summary
    pub summary: Option<String>,
    pub sensitive: bool,
    pub in_reply_to: Option<String>,
    /// Conversation URI for direct-message threading
    pub conversation: Option<String>,
    /// Visibility: public, unlisted, private, direct
    pub visibility: String,
    pub local: bool,
    pub favourites_count: i64,
    pub reblogs_count: i64,
    pub replies_count: i64,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// Favourite (like) record, one per (actor, object) pair.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Favourite {
    pub id: String,
    pub actor_ap_id: String,
    pub object_ap_id: String,
    /// URI of the Like activity that created this row
    pub activity_ap_id: String,
    pub created_at: DateTime<Utc>,
}

/// Reblog (boost) record, one per (actor, object) pair.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Reblog {
    pub id: String,
    pub actor_ap_id: String,
    pub object_ap_id: String,
    /// URI of the Announce activity that created this row
    pub activity_ap_id: String,
    pub created_at: DateTime<Utc>,
}

/// Media file attached to an object.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MediaAttachment {
    pub id: String,
    pub object_ap_id: String,
    pub url: String,
    /// MIME type (e.g., "image/webp")
    pub media_type: String,
    /// Alt text description
    pub description: Option<String>,
    /// Blurhash for placeholder
    pub blurhash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Mention extracted from an object's tag list.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Mention {
    pub id: String,
    pub object_ap_id: String,
    /// Mentioned actor URI
    pub href: String,
    /// Mentioned handle (user@domain), if supplied
    pub acct: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Poll attached to a Question object. Options and counts are stored as JSON.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Poll {
    pub id: String,
    pub object_ap_id: String,
    pub options: String,
    pub multiple: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Relay
// =============================================================================

/// Relay peering states.
///
/// idle → pending (Follow sent) → accepted | rejected;
/// accepted/pending → idle on manual disable or repeated delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Pending,
    Accepted,
    Rejected,
}

impl RelayState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

/// One row per relay peering relationship.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Relay {
    pub id: String,
    /// Relay inbox URL, normalized to end in `/inbox`
    pub inbox_url: String,
    /// Relay actor URI, learned from its actor document or first activity
    pub actor_ap_id: Option<String>,
    pub state: String,
    /// URI of the Follow activity sent during subscription
    pub follow_activity_ap_id: Option<String>,
    pub delivery_attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Blocking
// =============================================================================

/// A local actor blocking a remote actor.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Block {
    pub id: String,
    pub blocker_ap_id: String,
    pub target_ap_id: String,
    pub created_at: DateTime<Utc>,
}

/// Instance-wide blocked domain.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DomainBlock {
    pub id: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notifications
// =============================================================================

/// Notification for user interactions, emitted explicitly by handlers.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: String,
    /// Type: mention, favourite, reblog, follow, follow_request
    pub notification_type: String,
    /// Local actor being notified
    pub target_actor_ap_id: String,
    /// Who triggered this notification
    pub origin_actor_ap_id: String,
    /// Related object URI (if applicable)
    pub object_ap_id: Option<String>,
    /// Whether user has seen this
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Notification types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationType {
    Mention,
    Favourite,
    Reblog,
    Follow,
    FollowRequest,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mention => "mention",
            Self::Favourite => "favourite",
            Self::Reblog => "reblog",
            Self::Follow => "follow",
            Self::FollowRequest => "follow_request",
        }
    }
}
