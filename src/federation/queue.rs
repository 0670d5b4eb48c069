//! Background job queue
//!
//! Outbound delivery and remote prefetch never run in the request path.
//! `JobQueue` is the abstraction handlers enqueue into; the Tokio channel
//! implementation feeds the worker loop in `delivery`. Retry/backoff is
//! an explicit policy parameter, not a framework default.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::metrics::DELIVERY_QUEUE_DEPTH;

/// A unit of background work. Each job is independently retryable.
#[derive(Debug, Clone)]
pub enum Job {
    /// Sign and POST a serialized activity to one inbox.
    Deliver {
        /// Activity URI, for logging and relay bookkeeping
        activity_ap_id: String,
        /// Serialized activity JSON
        payload: serde_json::Value,
        /// Local actor whose key signs the request
        sign_as: String,
        /// Target inbox URL
        inbox_url: String,
        /// Zero-based attempt counter
        attempt: u32,
        /// Whether the target is a peered relay
        relay: bool,
    },
    /// Fetch an actor's featured (pinned) collection.
    FetchFeatured {
        actor_ap_id: String,
        featured_url: String,
    },
    /// Fetch and persist a remote object by URI.
    FetchObject { object_ap_id: String },
}

/// Retry/backoff policy for delivery jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff delay before the given (zero-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    pub fn attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Queue abstraction the request path enqueues into.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: Job);
}

/// Tokio mpsc-backed queue feeding the worker loop.
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl ChannelQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobQueue for ChannelQueue {
    fn enqueue(&self, job: Job) {
        DELIVERY_QUEUE_DEPTH.inc();
        if self.tx.send(job).is_err() {
            DELIVERY_QUEUE_DEPTH.dec();
            tracing::error!("Job queue receiver dropped, job discarded");
        }
    }
}

/// In-memory recording queue for tests.
pub struct RecordingQueue {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Default for RecordingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, job: Job) {
        self.jobs.lock().unwrap().push(job);
    }
}
