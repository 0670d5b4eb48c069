//! Activity delivery
//!
//! Signs and ships locally produced activities to follower inboxes and
//! relays. Every (activity, inbox) pair is an independent unit of work:
//! one failing target never blocks the others, and failures feed the
//! retry policy instead of surfacing to request handlers.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};

use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::federation::queue::{Job, JobQueue, RetryPolicy};
use crate::federation::relay::RelayService;
use crate::federation::resolver::ActorResolver;
use crate::federation::signature::sign_request;
use crate::metrics::{ACTIVITIES_SENT_TOTAL, DELIVERY_ATTEMPTS_TOTAL, DELIVERY_QUEUE_DEPTH};

const MAX_CONCURRENT_DELIVERIES: usize = 10;

/// Deduplicate identical inbox URLs while keeping distinct personal
/// inboxes on the same domain.
fn unique_inbox_targets(inbox_urls: Vec<String>) -> Vec<String> {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for inbox_url in inbox_urls {
        if seen.insert(inbox_url.clone()) {
            targets.push(inbox_url);
        }
    }

    targets
}

/// Outbound delivery service.
pub struct DeliveryService {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    queue: Arc<dyn JobQueue>,
    timeout: std::time::Duration,
}

impl DeliveryService {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        queue: Arc<dyn JobQueue>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            db,
            http_client,
            queue,
            timeout,
        }
    }

    /// Sign and POST a serialized activity to a single inbox.
    pub async fn deliver_to_inbox(
        &self,
        inbox_url: &str,
        payload: &Value,
        sign_as: &str,
    ) -> Result<(), AppError> {
        let signer = self
            .db
            .get_actor_by_ap_id(sign_as)
            .await?
            .ok_or_else(|| AppError::Delivery(format!("Unknown signing actor: {}", sign_as)))?;

        let private_key_pem = signer.private_key_pem.as_deref().ok_or_else(|| {
            AppError::Delivery(format!("Signing actor {} has no private key", sign_as))
        })?;

        let body = serde_json::to_vec(payload)
            .map_err(|e| AppError::Delivery(format!("Failed to serialize activity: {}", e)))?;

        let sig_headers =
            sign_request("POST", inbox_url, Some(&body), private_key_pem, &signer.key_id())?;

        let mut request = self
            .http_client
            .post(inbox_url)
            .timeout(self.timeout)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig_headers.date)
            .header("Signature", sig_headers.signature);

        if let Some(digest) = sig_headers.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body).send().await.map_err(|e| {
            AppError::Delivery(format!("Failed to deliver to {}: {}", inbox_url, e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::Delivery(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_url,
                response.status()
            )));
        }

        if let Some(activity_type) = payload.get("type").and_then(Value::as_str) {
            ACTIVITIES_SENT_TOTAL
                .with_label_values(&[activity_type])
                .inc();
        }
        tracing::info!(inbox = %inbox_url, "Delivered activity");
        Ok(())
    }

    /// Queue delivery of one activity to a single inbox.
    pub fn enqueue_to_inbox(
        &self,
        activity_ap_id: &str,
        payload: Value,
        sign_as: &str,
        inbox_url: &str,
    ) {
        self.queue.enqueue(Job::Deliver {
            activity_ap_id: activity_ap_id.to_string(),
            payload,
            sign_as: sign_as.to_string(),
            inbox_url: inbox_url.to_string(),
            attempt: 0,
            relay: false,
        });
    }

    /// Queue delivery of one activity to an author's followers, preferring
    /// shared inboxes. Public activities additionally fan out to relays in
    /// the accepted state.
    pub async fn fan_out(
        &self,
        activity_ap_id: &str,
        payload: Value,
        author: &Actor,
        public: bool,
        relays: &RelayService,
    ) -> Result<usize, AppError> {
        let followers = self.db.list_follower_actors(&author.ap_id).await?;
        let total = followers.len();

        // Prefer a peer's shared inbox over per-actor inboxes, then drop
        // exact duplicates so each remote server receives one copy.
        let follower_inboxes = unique_inbox_targets(
            followers
                .iter()
                .filter(|follower| !follower.local)
                .map(|follower| follower.preferred_inbox().to_string())
                .collect(),
        );

        tracing::info!(
            activity = %activity_ap_id,
            inboxes = follower_inboxes.len(),
            followers = total,
            "Fanning out activity"
        );

        let mut targets: Vec<(String, bool)> = follower_inboxes
            .into_iter()
            .map(|inbox| (inbox, false))
            .collect();

        if public {
            for inbox in relays.accepted_inboxes().await? {
                if !targets.iter().any(|(url, _)| url == &inbox) {
                    targets.push((inbox, true));
                }
            }
        }

        let queued = targets.len();
        for (inbox_url, is_relay) in targets {
            self.queue.enqueue(Job::Deliver {
                activity_ap_id: activity_ap_id.to_string(),
                payload: payload.clone(),
                sign_as: author.ap_id.clone(),
                inbox_url,
                attempt: 0,
                relay: is_relay,
            });
        }

        Ok(queued)
    }
}

/// Spawn the background worker that drains the job queue.
///
/// Each delivery runs as its own task under a concurrency cap; a failed
/// delivery is re-enqueued with exponential backoff until the retry
/// policy is exhausted. Relay deliveries report outcomes to the relay
/// service so its failure policy can disable dead peers.
pub fn spawn_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    delivery: Arc<DeliveryService>,
    resolver: Arc<ActorResolver>,
    relays: Arc<RelayService>,
    queue: Arc<dyn JobQueue>,
    retry: RetryPolicy,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES));

        while let Some(job) = rx.recv().await {
            DELIVERY_QUEUE_DEPTH.dec();

            match job {
                Job::Deliver {
                    activity_ap_id,
                    payload,
                    sign_as,
                    inbox_url,
                    attempt,
                    relay,
                } => {
                    let semaphore = semaphore.clone();
                    let delivery = delivery.clone();
                    let relays = relays.clone();
                    let queue = queue.clone();

                    tokio::spawn(async move {
                        let _permit = semaphore.acquire().await.expect("semaphore open");

                        let result = delivery
                            .deliver_to_inbox(&inbox_url, &payload, &sign_as)
                            .await;

                        match result {
                            Ok(()) => {
                                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                                if relay {
                                    if let Err(e) =
                                        relays.record_delivery_success(&inbox_url).await
                                    {
                                        tracing::error!(error = %e, "Failed to reset relay counter");
                                    }
                                }
                            }
                            Err(e) => {
                                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
                                tracing::warn!(
                                    activity = %activity_ap_id,
                                    inbox = %inbox_url,
                                    attempt,
                                    error = %e,
                                    "Delivery failed"
                                );

                                if relay {
                                    if let Err(e) = relays
                                        .record_delivery_failure(&inbox_url, &e.to_string())
                                        .await
                                    {
                                        tracing::error!(error = %e, "Failed to record relay failure");
                                    }
                                }

                                let next_attempt = attempt + 1;
                                if retry.attempts_remaining(next_attempt) {
                                    let delay = retry.delay_for(next_attempt);
                                    tokio::spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        queue.enqueue(Job::Deliver {
                                            activity_ap_id,
                                            payload,
                                            sign_as,
                                            inbox_url,
                                            attempt: next_attempt,
                                            relay,
                                        });
                                    });
                                } else {
                                    tracing::warn!(
                                        activity = %activity_ap_id,
                                        inbox = %inbox_url,
                                        "Delivery abandoned after {} attempts",
                                        next_attempt
                                    );
                                }
                            }
                        }
                    });
                }
                Job::FetchFeatured {
                    actor_ap_id,
                    featured_url,
                } => {
                    if let Err(e) = resolver.fetch_featured(&actor_ap_id, &featured_url).await {
                        tracing::warn!(
                            actor = %actor_ap_id,
                            error = %e,
                            "Featured collection fetch failed"
                        );
                    }
                }
                Job::FetchObject { object_ap_id } => {
                    if let Err(e) = resolver.fetch_object(&object_ap_id).await {
                        tracing::warn!(
                            object = %object_ap_id,
                            error = %e,
                            "Object fetch failed"
                        );
                    }
                }
            }
        }
    })
}

/// Build ActivityPub activity JSON
pub mod builder {
    use serde_json::Value;

    /// Build a Follow activity
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity wrapping the original (usually a Follow).
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Reject activity.
    pub fn reject(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Reject",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Create activity wrapping an object.
    pub fn create(
        id: &str,
        actor: &str,
        object: Value,
        to: Vec<&str>,
        cc: Vec<&str>,
        published: &str,
    ) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": published
        })
    }

    /// Build a Delete activity carrying a Tombstone.
    pub fn delete(id: &str, actor: &str, object: &str, to: Vec<&str>, cc: Vec<&str>) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object
            },
            "to": to,
            "cc": cc
        })
    }

    /// Build a Like activity
    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Announce activity (boost)
    pub fn announce(
        id: &str,
        actor: &str,
        object: &str,
        to: Vec<&str>,
        cc: Vec<&str>,
        published: &str,
    ) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Announce",
            "id": id,
            "actor": actor,
            "object": object,
            "to": to,
            "cc": cc,
            "published": published
        })
    }

    /// Build an Undo activity wrapping the original.
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Note object.
    pub fn note(
        id: &str,
        attributed_to: &str,
        content: &str,
        published: &str,
        in_reply_to: Option<&str>,
        to: Vec<&str>,
        cc: Vec<&str>,
    ) -> Value {
        serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "inReplyTo": in_reply_to,
            "to": to,
            "cc": cc,
            "sensitive": false
        })
    }
}
