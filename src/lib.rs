//! Driftway - a small federated ActivityPub server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                       │
//! │  - ActivityPub inboxes and actor documents                  │
//! │  - WebFinger discovery                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                         │
//! │  - Signature verification, actor resolution                 │
//! │  - Inbox dispatch, relay peering                            │
//! │  - Outbound delivery queue                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                             │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for the federation surface
//! - `federation`: ActivityPub federation core
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use federation::{
    ActorResolver, ChannelQueue, DeliveryService, InboxDispatcher, Job, JobQueue, Publisher,
    RelayService, Services,
};
use tokio::sync::mpsc;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains shared resources
/// like the database pool, HTTP client, and federation services.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Federation services (db, resolver, relays, delivery, queue)
    pub services: Arc<Services>,

    /// Inbox dispatcher
    pub dispatcher: Arc<InboxDispatcher>,

    /// Local activity production
    pub publisher: Arc<Publisher>,
}

impl AppState {
    /// Initialize application state.
    ///
    /// Returns the state plus the job receiver for the delivery worker;
    /// the caller decides where that worker runs (the binary spawns it,
    /// tests may drain it synchronously).
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the HTTP client used for all outbound federation
    /// 3. Wire up queue, resolver, relay and delivery services
    /// 4. Provision configured local accounts (at most two)
    pub async fn new(
        config: config::AppConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Job>), error::AppError> {
        tracing::info!("Initializing application state...");

        let db = Arc::new(data::Database::connect(&config.database.path).await?);

        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(format!("Driftway/{}", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(
                    config.federation.fetch_timeout_seconds,
                ))
                .redirect(reqwest::redirect::Policy::limited(1))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        let (queue, job_rx) = ChannelQueue::new();
        let queue: Arc<dyn JobQueue> = Arc::new(queue);

        let resolver = Arc::new(ActorResolver::new(
            db.clone(),
            http_client.clone(),
            queue.clone(),
        ));
        let relays = Arc::new(RelayService::new(
            db.clone(),
            queue.clone(),
            config.federation.relay_failure_threshold,
        ));
        let delivery = Arc::new(DeliveryService::new(
            db.clone(),
            http_client.clone(),
            queue.clone(),
            std::time::Duration::from_secs(config.federation.deliver_timeout_seconds),
        ));

        let config = Arc::new(config);
        let services = Arc::new(Services {
            db: db.clone(),
            config: config.clone(),
            resolver,
            relays,
            delivery,
            queue,
        });

        Self::ensure_local_actors(&db, &config).await?;

        let dispatcher = Arc::new(InboxDispatcher::new(services.clone()));
        let publisher = Arc::new(Publisher::new(services.clone()));

        tracing::info!("Application state initialized");

        Ok((
            Self {
                config,
                services,
                dispatcher,
                publisher,
            },
            job_rx,
        ))
    }

    /// Spawn the delivery worker for this state.
    pub fn spawn_worker(
        &self,
        job_rx: mpsc::UnboundedReceiver<Job>,
    ) -> tokio::task::JoinHandle<()> {
        federation::spawn_worker(
            job_rx,
            self.services.delivery.clone(),
            self.services.resolver.clone(),
            self.services.relays.clone(),
            self.services.queue.clone(),
            federation::RetryPolicy {
                max_attempts: self.config.federation.delivery_max_attempts,
                base_delay: std::time::Duration::from_secs(
                    self.config.federation.delivery_backoff_seconds,
                ),
            },
        )
    }

    /// Provision configured local accounts with fresh RSA keypairs.
    ///
    /// Local actors always carry both key halves. The two-account cap is
    /// enforced at configuration load.
    async fn ensure_local_actors(
        db: &data::Database,
        config: &config::AppConfig,
    ) -> Result<(), error::AppError> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let base_url = config.server.base_url();

        for account in &config.accounts {
            if db.get_local_actor(&account.username).await?.is_some() {
                tracing::info!(username = %account.username, "Local account exists");
                continue;
            }

            tracing::info!(username = %account.username, "Provisioning local account...");

            let mut rng = rand::thread_rng();
            let private_key = RsaPrivateKey::new(&mut rng, 2048)
                .map_err(|e| error::AppError::Internal(e.into()))?;
            let public_key = RsaPublicKey::from(&private_key);

            let private_key_pem = private_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| error::AppError::Internal(e.into()))?
                .to_string();
            let public_key_pem = public_key
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| error::AppError::Internal(e.into()))?;

            let ap_id = format!("{}/users/{}", base_url, account.username);
            let now = chrono::Utc::now();

            db.insert_actor(&data::Actor {
                id: data::EntityId::new().0,
                ap_id: ap_id.clone(),
                username: account.username.clone(),
                domain: config.server.domain.clone(),
                display_name: account.display_name.clone(),
                summary: account.summary.clone(),
                inbox_url: format!("{}/inbox", ap_id),
                outbox_url: Some(format!("{}/outbox", ap_id)),
                shared_inbox_url: Some(format!("{}/inbox", base_url)),
                public_key_pem,
                private_key_pem: Some(private_key_pem),
                local: true,
                followers_count: 0,
                following_count: 0,
                posts_count: 0,
                profile_fields: None,
                emoji_tags: None,
                created_at: now,
                refreshed_at: now,
            })
            .await?;

            tracing::info!(username = %account.username, actor = %ap_id, "Local account created");
        }

        Ok(())
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests to keep route composition
/// consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
