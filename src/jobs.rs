//! Job descriptors supplied by the job-management collaborator.
//!
//! The scheduler owns jobs; this crate only needs to know where a job's
//! replicas run and which ports and domains it exposes. Descriptors are
//! pushed in through `PUT /api/jobs/{job_id}` and kept in a [`JobRegistry`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Interactive resources a job exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    /// Port of the job's VNC (or websockify) server.
    #[serde(default)]
    pub vnc_port: Option<u16>,
    #[serde(default)]
    pub vnc_password: Option<String>,
    /// Port of the job's web interface (local-dev redirects, default 80).
    #[serde(default)]
    pub web_port: Option<u16>,
    /// Custom hostnames routed straight to the job.
    #[serde(default)]
    pub ingress_domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Filled from the request path when omitted.
    #[serde(default)]
    pub id: String,
    /// Workload name; every replica pod carries it in the workload label.
    pub workload: String,
    /// Namespace override. `None` uses `cluster.namespace`.
    #[serde(default)]
    pub namespace: Option<String>,
    /// Number of replicas (ranks are `0..replicas`).
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub resources: JobResources,
}

fn default_replicas() -> u32 {
    1
}

impl JobDescriptor {
    pub fn namespace<'a>(&'a self, default: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default)
    }
}

/// Lookup side of the job-management collaborator.
#[async_trait]
pub trait JobDirectory: Send + Sync {
    async fn find_job(&self, job_id: &str) -> Option<JobDescriptor>;

    /// Whether `host` is a custom ingress domain bound to some job.
    async fn is_ingress_domain(&self, host: &str) -> bool;
}

/// In-memory [`JobDirectory`] fed by the internal API.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobDescriptor>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a descriptor. Returns `true` if it replaced one.
    pub async fn upsert(&self, job: JobDescriptor) -> bool {
        self.jobs.write().await.insert(job.id.clone(), job).is_some()
    }

    pub async fn remove(&self, job_id: &str) -> Option<JobDescriptor> {
        self.jobs.write().await.remove(job_id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobDirectory for JobRegistry {
    async fn find_job(&self, job_id: &str) -> Option<JobDescriptor> {
        self.jobs.read().await.get(job_id).cloned()
    }

    async fn is_ingress_domain(&self, host: &str) -> bool {
        self.jobs.read().await.values().any(|job| {
            job.resources
                .ingress_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(host))
        })
    }
}
