//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `JOBPORTAL_API_KEY`, `JOBPORTAL_LISTEN`,
//!    `JOBPORTAL_PUBLIC_URL`, `JOBPORTAL_DOMAIN`, `JOBPORTAL_DATA_DIR`
//! 2. **Config file**: path via `--config <path>`, or `jobportal.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8889"
//! public_url = "https://cloud.example.com"
//! data_dir = "/var/lib/jobportal"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [web]
//! prefix = "app-"
//! domain = "cloud.example.com"
//! cookie_name = "jobportal-session"
//!
//! [cluster]
//! namespace = "app-kubernetes"
//! workload_label = "volcano.sh/job-name"
//!
//! [tunnel]
//! sweep_interval_secs = 30
//! port_range_start = 30000
//! port_range_end = 64000
//!
//! [vnc]
//! default_port = 5900
//! remote_path = "/websockify"   # "" relays raw TCP
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub vnc: VncConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8889`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Externally reachable base URL of this service, used to build the
    /// authorize and VNC links handed out on session creation.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Directory for persistent data (session registry). Default `/var/lib/jobportal`.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Persist sessions to `{data_dir}/sessions.jsonl` (default true).
    #[serde(default = "default_true")]
    pub persist_sessions: bool,
}

/// Internal API authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer token expected from the job-management collaborator.
    /// Override with `JOBPORTAL_API_KEY`.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Web forward-auth settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    /// Every per-job virtual host starts with this prefix (default `app-`).
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Platform base domain; cookies are scoped to it.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Name of the session cookie set by `/authorize-app`.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Platform refresh-token cookie, stripped before forwarding to jobs.
    #[serde(default = "default_refresh_cookie_name")]
    pub refresh_cookie_name: String,
    #[serde(default = "default_cookie_max_age_days")]
    pub cookie_max_age_days: u64,
    /// Redirect to a node-local endpoint instead of the job subdomain.
    #[serde(default)]
    pub local_dev: bool,
    /// URL answering with this machine's IP as plain text (local dev only).
    pub local_ip_probe_url: Option<String>,
    /// Fixed local IP, skips the probe entirely (local dev only).
    pub local_ip: Option<String>,
}

/// Cluster API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Namespace jobs run in unless the job descriptor overrides it.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// API server base URL. Defaults to the in-cluster service address, or
    /// `http://127.0.0.1:8001` (`kubectl proxy`) when running outside.
    pub api_url: Option<String>,
    #[serde(default = "default_token_path")]
    pub token_path: String,
    #[serde(default = "default_ca_path")]
    pub ca_path: String,
    /// Label carrying the job's workload name on every replica pod.
    #[serde(default = "default_workload_label")]
    pub workload_label: String,
    /// Container to exec into. `None` lets the API server pick the default.
    pub container: Option<String>,
    /// Force the placement probe result instead of detecting it.
    pub in_cluster: Option<bool>,
}

/// Tunnel manager settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Candidate ports tried before giving up with `PORTS_EXHAUSTED`.
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u32,
    /// Seconds to wait for the forward subprocess to print its first line.
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
    /// Close alive tunnels unused for this long. 0 = never (default).
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Program spawned for forwarded tunnels (default `kubectl`).
    #[serde(default = "default_forward_program")]
    pub forward_program: String,
    /// Arguments with `{namespace}`, `{pod}`, `{local}` and `{remote}` placeholders.
    #[serde(default = "default_forward_args")]
    pub forward_args: Vec<String>,
}

/// VNC relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VncConfig {
    /// Port used when the job does not declare one (default 5900).
    #[serde(default = "default_vnc_port")]
    pub default_port: u16,
    /// Path of the websockify endpoint inside the job (default `/websockify`).
    /// Frames then reach the job as WebSocket messages. Empty relays each
    /// frame's bytes unmodified over raw TCP to the VNC port.
    #[serde(default = "default_vnc_remote_path")]
    pub remote_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Lifetime of a session cache entry in seconds (default 900).
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Upper bound on cached lookups (default 10000). The entry closest to
    /// expiry is evicted first.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8889".to_string()
}
fn default_public_url() -> String {
    "http://localhost:8889".to_string()
}
fn default_data_dir() -> String {
    "/var/lib/jobportal".to_string()
}
fn default_true() -> bool {
    true
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_prefix() -> String {
    "app-".to_string()
}
fn default_domain() -> String {
    "localhost".to_string()
}
fn default_cookie_name() -> String {
    "jobportal-session".to_string()
}
fn default_refresh_cookie_name() -> String {
    "refreshToken".to_string()
}
fn default_cookie_max_age_days() -> u64 {
    30
}
fn default_namespace() -> String {
    "app-kubernetes".to_string()
}
fn default_token_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}
fn default_ca_path() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}
fn default_workload_label() -> String {
    "volcano.sh/job-name".to_string()
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_port_range_start() -> u16 {
    30000
}
fn default_port_range_end() -> u16 {
    64000
}
fn default_max_port_attempts() -> u32 {
    512
}
fn default_ready_timeout() -> u64 {
    30
}
fn default_forward_program() -> String {
    "kubectl".to_string()
}
fn default_forward_args() -> Vec<String> {
    ["port-forward", "-n", "{namespace}", "pod/{pod}", "{local}:{remote}"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}
fn default_vnc_port() -> u16 {
    5900
}
fn default_vnc_remote_path() -> String {
    "/websockify".to_string()
}
fn default_cache_ttl() -> u64 {
    15 * 60
}
fn default_cache_max_entries() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            public_url: default_public_url(),
            data_dir: default_data_dir(),
            persist_sessions: default_true(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            domain: default_domain(),
            cookie_name: default_cookie_name(),
            refresh_cookie_name: default_refresh_cookie_name(),
            cookie_max_age_days: default_cookie_max_age_days(),
            local_dev: false,
            local_ip_probe_url: None,
            local_ip: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            api_url: None,
            token_path: default_token_path(),
            ca_path: default_ca_path(),
            workload_label: default_workload_label(),
            container: None,
            in_cluster: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            max_port_attempts: default_max_port_attempts(),
            ready_timeout_secs: default_ready_timeout(),
            idle_timeout_secs: 0,
            forward_program: default_forward_program(),
            forward_args: default_forward_args(),
        }
    }
}

impl Default for VncConfig {
    fn default() -> Self {
        Self {
            default_port: default_vnc_port(),
            remote_path: default_vnc_remote_path(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `jobportal.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("jobportal.toml").exists() {
            let content =
                std::fs::read_to_string("jobportal.toml").expect("Failed to read jobportal.toml");
            Self::parse(&content).expect("Failed to parse jobportal.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("JOBPORTAL_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("JOBPORTAL_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("JOBPORTAL_PUBLIC_URL") {
            config.server.public_url = url;
        }
        if let Ok(domain) = std::env::var("JOBPORTAL_DOMAIN") {
            config.web.domain = domain;
        }
        if let Ok(dir) = std::env::var("JOBPORTAL_DATA_DIR") {
            config.server.data_dir = dir;
        }

        config
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
