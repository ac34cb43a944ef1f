#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # jobportal
//!
//! Interactive access to running cluster jobs from a browser.
//!
//! jobportal binds opaque session tokens to one replica ("rank") of one job
//! and exposes three access modes over HTTP and WebSocket: a terminal shell
//! relayed through the cluster exec API, a VNC relay over a tunnel into the
//! pod, and forward-auth for job-hosted web interfaces behind a reverse proxy.
//!
//! ## API surface
//!
//! | Method | Path                              | Auth    | Description                        |
//! |--------|-----------------------------------|---------|------------------------------------|
//! | GET    | `/api/health`                     | No      | Liveness probe                     |
//! | PUT    | `/api/jobs/{job_id}`              | Bearer  | Register or replace a job          |
//! | DELETE | `/api/jobs/{job_id}`              | Bearer  | Forget a job                       |
//! | POST   | `/api/jobs/{job_id}/sessions`     | Bearer  | Open an interactive session        |
//! | GET    | `/api/tunnels`                    | Bearer  | List open tunnels                  |
//! | GET    | `/authorize-app/{session_id}`     | Session | Set web cookie, redirect to job    |
//! | ANY    | `/app-authorization[/...]`        | Cookie  | Forward-auth check for the proxy   |
//! | GET    | `/vnc/{session_id}`               | Session | VNC WebSocket relay                |
//! | GET    | `/shell`                          | Session | Shell WebSocket relay              |
//!
//! ## Architecture
//!
//! ```text
//! main.rs            entry point, clap subcommands, background tasks, graceful shutdown
//! lib.rs             AppState, router
//! auth.rs            Bearer token middleware, constant-time comparison
//! config.rs          TOML + env-var configuration
//! error.rs           error taxonomy and JSON error responses
//! jobs.rs            job descriptors and the in-memory job registry
//! cluster/
//!   mod.rs           ClusterApi trait, pod lookup by rank, placement probe
//!   kube.rs          Kubernetes REST + exec WebSocket client
//! sessions/
//!   mod.rs           Session model, SessionStore trait, in-memory store
//!   registry.rs      append-only JSONL session registry
//!   cache.rs         TTL cache in front of the store
//! tunnel/
//!   mod.rs           Tunnel (direct / forwarded)
//!   forward.rs       port-forward subprocess
//!   manager.rs       TunnelManager (create-or-reuse, sweep, shutdown)
//! routes/
//!   health.rs        GET /api/health
//!   jobs.rs          internal job/session API
//!   web.rs           authorize-app redirect and forward-auth
//!   vnc.rs           VNC relay
//! ws/
//!   mod.rs           shell relay protocol
//! ```

pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod jobs;
pub mod routes;
pub mod sessions;
pub mod tunnel;
pub mod util;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{any, get, post, put},
    Extension, Router,
};
use tokio::sync::OnceCell;
use tower_http::trace::TraceLayer;

use auth::ApiKey;
use cluster::ClusterApi;
use config::Config;
use jobs::JobRegistry;
use sessions::cache::SessionCache;
use sessions::SessionStore;
use tunnel::manager::TunnelManager;

/// Shared application state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Session resolution for every relay; creation goes through its store.
    pub sessions: SessionCache,
    /// Jobs registered by the job-management collaborator.
    pub jobs: Arc<JobRegistry>,
    pub cluster: Arc<dyn ClusterApi>,
    pub tunnels: TunnelManager,
    /// This machine's address for local-dev redirects, resolved once.
    pub local_ip: Arc<OnceCell<String>>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn SessionStore>, cluster: Arc<dyn ClusterApi>) -> Self {
        let jobs = Arc::new(JobRegistry::new());
        let sessions = SessionCache::with_capacity(
            store,
            Duration::from_secs(config.sessions.cache_ttl_secs),
            config.sessions.cache_max_entries,
        );
        let tunnels = TunnelManager::new(
            Arc::clone(&cluster),
            jobs.clone(),
            config.cluster.clone(),
            config.tunnel.clone(),
        );
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            sessions,
            jobs,
            cluster,
            tunnels,
            local_ip: Arc::new(OnceCell::new()),
        }
    }
}

/// Build the full router: public, session-authenticated and internal routes.
pub fn build_router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(routes::health::health))
        .route(
            "/authorize-app/{session_id}",
            get(routes::web::authorize_app),
        )
        .route("/app-authorization", any(routes::web::app_authorization))
        .route(
            "/app-authorization/{*rest}",
            any(routes::web::app_authorization),
        )
        .route("/vnc/{session_id}", get(routes::vnc::vnc_upgrade))
        .route("/shell", get(ws::shell_upgrade));

    let authed_routes = Router::new()
        .route(
            "/api/jobs/{job_id}",
            put(routes::jobs::put_job).delete(routes::jobs::delete_job),
        )
        .route(
            "/api/jobs/{job_id}/sessions",
            post(routes::jobs::create_session),
        )
        .route("/api/tunnels", get(routes::jobs::list_tunnels))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for router-level tests.

    use super::*;
    use crate::cluster::testing::FakeCluster;
    use crate::jobs::{JobDescriptor, JobResources};
    use crate::sessions::MemoryStore;

    pub const API_KEY: &str = "test-key";

    pub fn config() -> Config {
        let mut config = Config::default();
        config.auth.api_key = API_KEY.to_string();
        config.server.public_url = "https://portal.example.com".to_string();
        config.web.domain = "example.com".to_string();
        config.cluster.in_cluster = Some(true);
        config.vnc.remote_path = String::new();
        config
    }

    pub fn job(id: &str) -> JobDescriptor {
        JobDescriptor {
            id: id.to_string(),
            workload: id.to_string(),
            namespace: None,
            replicas: 2,
            resources: JobResources::default(),
        }
    }

    /// State over a fake cluster with `job-42` registered.
    pub async fn state_with(config: Config) -> (AppState, Arc<FakeCluster>) {
        let cluster = Arc::new(FakeCluster::default());
        let state = AppState::new(config, Arc::new(MemoryStore::new()), cluster.clone());
        state.jobs.upsert(job("job-42")).await;
        (state, cluster)
    }

    pub async fn state() -> (AppState, Arc<FakeCluster>) {
        state_with(config()).await
    }

    /// Serve the full router on an ephemeral loopback port.
    pub async fn serve(state: AppState) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }
}
