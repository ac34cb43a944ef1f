#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! `jobportal` binary: configuration, tracing, background tasks and the
//! HTTP/WS server. See the library crate docs for the API surface.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use jobportal::cluster::kube::KubeClient;
use jobportal::cluster::{ClusterApi, Placement};
use jobportal::config::Config;
use jobportal::sessions::registry::FileStore;
use jobportal::sessions::{MemoryStore, SessionStore};
use jobportal::util::expand_tilde;
use jobportal::AppState;

/// Interactive session access for cluster jobs.
#[derive(Parser)]
#[command(name = "jobportal", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("jobportal v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Public URL: {}", config.server.public_url);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set JOBPORTAL_API_KEY or update config");
    }

    let placement = Placement::detect(&config.cluster);
    let cluster: Arc<dyn ClusterApi> = match KubeClient::from_config(&config.cluster, placement) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("Failed to configure cluster client: {e}");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn SessionStore> = if config.server.persist_sessions {
        let data_dir = expand_tilde(&config.server.data_dir).into_owned();
        match FileStore::open(Path::new(&data_dir)).await {
            Ok(store) => {
                info!(
                    "Session registry: {data_dir}/sessions.jsonl ({} sessions)",
                    store.len().await
                );
                Arc::new(store)
            }
            Err(e) => {
                eprintln!("Failed to open session registry in {data_dir}: {e}");
                std::process::exit(1);
            }
        }
    } else {
        warn!("Session persistence disabled, sessions are lost on restart");
        Arc::new(MemoryStore::new())
    };

    let state = AppState::new(config, store, cluster);
    let app = jobportal::build_router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    state.tunnels.start_sweeper();

    // Session cache purge runs on the tunnel sweep cadence
    let cache = state.sessions.clone();
    let purge_every = Duration::from_secs(state.config.tunnel.sweep_interval_secs.max(1));
    let purge_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            let purged = cache.purge_expired().await;
            if purged > 0 {
                info!("Purged {purged} expired session cache entries");
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    purge_task.abort();
    state.tunnels.shutdown().await;
    info!("Goodbye");
}
