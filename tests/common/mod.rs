//! Common test utilities for E2E tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Router, routing::post};
use chrono::Utc;
use driftway::data::{Actor, EntityId};
use driftway::{AppState, config};
use http::StatusCode;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const TEST_DOMAIN: &str = "test.example.com";

/// Test server instance
pub struct TestServer {
    /// Base URL of the running server (http://127.0.0.1:port)
    pub addr: String,
    pub state: AppState,
    pub client: reqwest::Client,
    pub _temp_dir: TempDir,
}

impl TestServer {
    /// Boot a server with two local accounts (alice, mallory), a live
    /// delivery worker, and a temp database.
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                domain: TEST_DOMAIN.to_string(),
                protocol: "https".to_string(),
            },
            database: config::DatabaseConfig {
                path: db_path.clone(),
            },
            federation: config::FederationConfig {
                auto_accept_follows: true,
                signature_clock_skew_seconds: 3600,
                actor_staleness_seconds: 86400,
                fetch_timeout_seconds: 15,
                deliver_timeout_seconds: 10,
                delivery_max_attempts: 3,
                delivery_backoff_seconds: 1,
                relay_failure_threshold: 3,
            },
            accounts: vec![
                config::LocalAccountConfig {
                    username: "alice".to_string(),
                    display_name: Some("Alice".to_string()),
                    summary: None,
                },
                config::LocalAccountConfig {
                    username: "mallory".to_string(),
                    display_name: Some("Mallory".to_string()),
                    summary: None,
                },
            ],
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let (state, job_rx) = AppState::new(config).await.unwrap();
        state.spawn_worker(job_rx);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = driftway::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            client,
            _temp_dir: temp_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// The provisioned local actor with the given username.
    pub async fn local_actor(&self, username: &str) -> Actor {
        self.state
            .services
            .db
            .get_local_actor(username)
            .await
            .unwrap()
            .expect("local actor provisioned")
    }

    /// Persist a remote actor whose inbox points at `inbox_url`.
    ///
    /// The row lands in the database directly, so signature verification
    /// uses the cached key with no network fetch. Returns the actor and
    /// its private key PEM for signing test requests.
    pub async fn create_remote_actor(
        &self,
        username: &str,
        domain: &str,
        inbox_url: &str,
    ) -> (Actor, String) {
        let (private_pem, public_pem) = generate_keypair();
        let ap_id = format!("https://{}/users/{}", domain, username);
        let now = Utc::now();

        let actor = Actor {
            id: EntityId::new().0,
            ap_id: ap_id.clone(),
            username: username.to_string(),
            domain: domain.to_string(),
            display_name: None,
            summary: None,
            inbox_url: inbox_url.to_string(),
            outbox_url: Some(format!("{}/outbox", ap_id)),
            shared_inbox_url: None,
            public_key_pem: public_pem,
            private_key_pem: None,
            local: false,
            followers_count: 0,
            following_count: 0,
            posts_count: 0,
            profile_fields: None,
            emoji_tags: None,
            created_at: now,
            refreshed_at: now,
        };

        self.state.services.db.insert_actor(&actor).await.unwrap();
        (actor, private_pem)
    }

    /// POST a signed activity to the given path.
    pub async fn signed_post(
        &self,
        path: &str,
        activity: &serde_json::Value,
        key_id: &str,
        private_key_pem: &str,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let url = self.url(path);

        let sig = driftway::federation::sign_request(
            "POST",
            &url,
            Some(&body),
            private_key_pem,
            key_id,
        )
        .unwrap();

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/activity+json")
            .header("Date", sig.date)
            .header("Signature", sig.signature);
        if let Some(digest) = sig.digest {
            request = request.header("Digest", digest);
        }

        request.body(body).send().await.unwrap()
    }
}

pub fn generate_keypair() -> (String, String) {
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("keygen");
    let public_key = RsaPublicKey::from(&private_key);
    (
        private_key
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private pem")
            .to_string(),
        public_key
            .to_public_key_pem(LineEnding::LF)
            .expect("public pem"),
    )
}

/// A stub remote inbox that counts deliveries.
pub struct RemoteInbox {
    pub url: String,
    pub deliveries: Arc<AtomicUsize>,
}

impl RemoteInbox {
    /// Spin up an HTTP listener accepting POSTs at `path`.
    pub async fn start(path: &'static str) -> Self {
        let deliveries = Arc::new(AtomicUsize::new(0));
        let counter = deliveries.clone();

        let app = Router::new().route(
            path,
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::ACCEPTED
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}{}", addr, path),
            deliveries,
        }
    }

    pub fn count(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }

    /// Wait until at least `expected` deliveries arrive or time out.
    pub async fn wait_for(&self, expected: usize) -> bool {
        for _ in 0..100 {
            if self.count() >= expected {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        false
    }
}
