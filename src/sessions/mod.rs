//! Interactive session registry.
//!
//! A session binds an opaque token to exactly one `(job_id, rank)` pair and
//! one access mode. Sessions are created by the job-management collaborator
//! and resolved by every relay on every connection.
//!
//! - [`registry::FileStore`]: append-only JSONL file, survives restarts.
//! - [`MemoryStore`]: same contract without persistence.
//! - [`cache::SessionCache`]: TTL cache in front of either store.

pub mod cache;
pub mod registry;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

/// Length of generated session tokens.
const SESSION_ID_LEN: usize = 32;

/// Interactive access mode granted by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionType {
    #[serde(alias = "shell")]
    Shell,
    #[serde(alias = "web")]
    Web,
    #[serde(alias = "vnc")]
    Vnc,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Web => "web",
            Self::Vnc => "vnc",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted session record (one JSONL line in the registry file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub job_id: String,
    pub rank: u32,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

/// The `(job_id, rank)` a session grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobRank {
    pub job_id: String,
    pub rank: u32,
}

impl Session {
    pub fn new(job_id: &str, rank: u32, session_type: SessionType) -> Self {
        Self {
            id: generate_session_id(),
            job_id: job_id.to_string(),
            rank,
            session_type,
            created_at: crate::util::now_ms(),
        }
    }

    pub fn job_rank(&self) -> JobRank {
        JobRank {
            job_id: self.job_id.clone(),
            rank: self.rank,
        }
    }
}

/// Whether `id` has the shape of a generated token. Anything else can never
/// resolve and is rejected before it reaches a store.
pub fn is_well_formed_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Generate a fresh alphanumeric session token.
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Persistent record of sessions. Append-only from this crate's perspective.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist a session, returning its id.
    async fn create(&self, job_id: &str, rank: u32, session_type: SessionType) -> Result<String>;

    /// Look up a session. A session of a different type counts as not found.
    async fn find(&self, session_id: &str, expected: SessionType) -> Result<Option<JobRank>>;
}

/// In-memory [`SessionStore`], used when persistence is disabled.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, job_id: &str, rank: u32, session_type: SessionType) -> Result<String> {
        let session = Session::new(job_id, rank, session_type);
        let id = session.id.clone();
        self.sessions.write().await.insert(id.clone(), session);
        Ok(id)
    }

    async fn find(&self, session_id: &str, expected: SessionType) -> Result<Option<JobRank>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .filter(|s| s.session_type == expected)
            .map(Session::job_rank))
    }
}
