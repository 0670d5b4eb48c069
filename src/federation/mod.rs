//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (verification ladder + signing)
//! - Remote actor resolution (direct GET + WebFinger)
//! - Envelope validation and inbox dispatch
//! - Relay peering
//! - Outbound delivery queue
//! - Local activity production

pub mod content;
mod delivery;
mod envelope;
mod handlers;
mod inbox;
mod outbound;
pub mod queue;
mod relay;
mod resolver;
mod signature;
mod webfinger;

pub use delivery::{DeliveryService, builder, spawn_worker};
pub use envelope::{Envelope, validate as validate_envelope};
pub use handlers::{ActivityHandler, handler_table};
pub use inbox::{InboxDispatcher, InboxRequest, InboxSource, Services};
pub use outbound::Publisher;
pub use queue::{ChannelQueue, Job, JobQueue, RecordingQueue, RetryPolicy};
pub use relay::{PUBLIC_COLLECTION, RelayService, normalize_inbox_url};
pub use resolver::{ActorResolver, actor_domain, parse_actor_document};
pub use signature::{
    extract_signature_key_id, generate_digest, key_id_matches_actor, parse_signature_header,
    sign_request, verify_request, verify_with_fallback,
};
pub use webfinger::{
    WebFingerLink, WebFingerResponse, generate_response as generate_webfinger_response,
    resolve_handle,
};
