//! Cluster control-plane access.
//!
//! [`ClusterApi`] is the seam between this crate and the orchestrator: pod
//! discovery, pod liveness, exec channels and (for local development) node
//! ports. [`kube::KubeClient`] implements it against a Kubernetes API server.

pub mod kube;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};

/// The subset of a pod this crate cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    /// Cluster-internal address, once assigned.
    pub ip: Option<String>,
    /// Pod phase as reported by the API (`Pending`, `Running`, ...).
    pub phase: String,
    pub labels: HashMap<String, String>,
}

impl Pod {
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }

    /// Ordinal suffix of the pod name (`job-42-3` → `3`).
    pub fn ordinal(&self) -> Option<u32> {
        self.name.rsplit_once('-').and_then(|(_, n)| n.parse().ok())
    }
}

/// Terminal dimensions for an exec channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TerminalSize {
    #[serde(rename = "Width")]
    pub cols: u16,
    #[serde(rename = "Height")]
    pub rows: u16,
}

/// Why an exec channel stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEnd {
    /// The remote process exited.
    Completed,
    /// The local side cancelled the channel.
    Cancelled,
    /// The pod (or container) disappeared.
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Output(Vec<u8>),
    /// Always the last event on the channel.
    Ended(ExecEnd),
}

/// A live process I/O stream inside a container.
pub struct ExecChannel {
    pub stdin: mpsc::Sender<Vec<u8>>,
    pub resize: mpsc::Sender<TerminalSize>,
    pub output: mpsc::Receiver<ExecEvent>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_pods_by_label(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    /// Fails with [`Error::NotFound`] when the pod does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Open an interactive TTY exec channel running `command` in `pod`.
    async fn exec(&self, pod: &Pod, command: &[String]) -> Result<ExecChannel>;

    /// Node port the cluster assigned to `port` of `service`, if any.
    async fn node_port(&self, namespace: &str, service: &str, port: u16) -> Result<Option<u16>>;
}

/// Locate the pod hosting one replica of a workload.
///
/// Replica pods share the workload label and differ only in their ordinal
/// suffix, which equals the rank.
pub async fn find_pod_for_rank(
    cluster: &dyn ClusterApi,
    namespace: &str,
    workload_label: &str,
    workload: &str,
    rank: u32,
) -> Result<Pod> {
    let selector = format!("{workload_label}={workload}");
    let pods = cluster.list_pods_by_label(namespace, &selector).await?;
    debug!(
        "Found {} pods for {selector} in {namespace}, looking for rank {rank}",
        pods.len()
    );
    pods.into_iter()
        .find(|pod| pod.ordinal() == Some(rank))
        .ok_or_else(|| Error::not_found(format!("No pod for {workload} rank {rank}")))
}

/// Where this process runs relative to the cluster network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Pod addresses are directly routable.
    InCluster,
    /// Operator/dev workflow: pods are reached through port forwards.
    External,
}

impl Placement {
    /// Probe the environment. `cluster.in_cluster` overrides detection.
    pub fn detect(config: &ClusterConfig) -> Self {
        let inside = config.in_cluster.unwrap_or_else(|| {
            std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
                && Path::new(&config.token_path).exists()
        });
        if inside {
            Self::InCluster
        } else {
            Self::External
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InCluster => "in-cluster",
            Self::External => "external",
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeCluster;
    use super::*;

    #[test]
    fn test_pod_ordinal() {
        let mut pod = Pod {
            namespace: "ns".into(),
            name: "job-42-3".into(),
            ip: None,
            phase: "Pending".into(),
            labels: HashMap::new(),
        };
        assert_eq!(pod.ordinal(), Some(3));
        assert!(!pod.is_running());
        pod.name = "nodash".into();
        assert_eq!(pod.ordinal(), None);
        pod.name = "job-x".into();
        assert_eq!(pod.ordinal(), None);
    }

    #[tokio::test]
    async fn test_find_pod_for_rank_matches_ordinal() {
        let cluster = FakeCluster::default();
        cluster.add_pod("job-42", 0, "10.0.0.1");
        cluster.add_pod("job-42", 1, "10.0.0.2");
        cluster.add_pod("job-421", 1, "10.0.0.9");

        let pod = find_pod_for_rank(&cluster, "ns", "volcano.sh/job-name", "job-42", 1)
            .await
            .unwrap();
        assert_eq!(pod.name, "job-42-1");
        assert_eq!(pod.ip.as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn test_find_pod_for_rank_missing_is_not_found() {
        let cluster = FakeCluster::default();
        cluster.add_pod("job-42", 0, "10.0.0.1");

        let err = find_pod_for_rank(&cluster, "ns", "volcano.sh/job-name", "job-42", 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_placement_override() {
        let mut config = ClusterConfig::default();
        config.in_cluster = Some(true);
        assert_eq!(Placement::detect(&config), Placement::InCluster);
        config.in_cluster = Some(false);
        assert_eq!(Placement::detect(&config), Placement::External);
    }

    #[test]
    fn test_resize_wire_format() {
        let size = TerminalSize { cols: 120, rows: 40 };
        assert_eq!(
            serde_json::to_string(&size).unwrap(),
            r#"{"Width":120,"Height":40}"#
        );
    }
}
