//! Network routes from this process into job containers.
//!
//! A [`Tunnel`] is one route to one port of one job replica, in one of two
//! shapes chosen by the process [`crate::cluster::Placement`]:
//!
//! - **Direct**: in-cluster, the pod address is routable. Liveness asks the
//!   cluster API whether the pod is still running at that address.
//! - **Forwarded**: outside the cluster, a port-forward subprocess listens
//!   on a loopback port. Liveness is the subprocess still running.
//!
//! Tunnels are owned by the [`manager::TunnelManager`]; callers borrow an
//! `Arc<Tunnel>` and drop it when done.

pub mod forward;
pub mod manager;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cluster::ClusterApi;
use forward::ForwardedTunnel;

/// Identifies one tunnel. At most one live tunnel exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TunnelKey {
    pub job_id: String,
    pub rank: u32,
    pub port: u16,
}

impl fmt::Display for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.job_id, self.rank, self.port)
    }
}

/// Route to a pod address reachable from this process.
pub struct DirectTunnel {
    cluster: Arc<dyn ClusterApi>,
    namespace: String,
    pod_name: String,
    ip: String,
    port: u16,
}

impl DirectTunnel {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        namespace: String,
        pod_name: String,
        ip: String,
        port: u16,
    ) -> Self {
        Self {
            cluster,
            namespace,
            pod_name,
            ip,
            port,
        }
    }

    async fn is_alive(&self) -> bool {
        match self.cluster.get_pod(&self.namespace, &self.pod_name).await {
            Ok(pod) => pod.is_running() && pod.ip.as_deref() == Some(self.ip.as_str()),
            Err(e) => {
                debug!("Pod {} no longer reachable: {e}", self.pod_name);
                false
            }
        }
    }
}

pub enum Route {
    Direct(DirectTunnel),
    Forwarded(ForwardedTunnel),
}

pub struct Tunnel {
    key: TunnelKey,
    route: Route,
    last_used_ms: AtomicU64,
}

impl Tunnel {
    pub fn new(key: TunnelKey, route: Route) -> Self {
        Self {
            key,
            route,
            last_used_ms: AtomicU64::new(crate::util::now_ms()),
        }
    }

    pub fn key(&self) -> &TunnelKey {
        &self.key
    }

    /// Address to connect to: the pod IP, or loopback for forwarded tunnels.
    pub fn ip_address(&self) -> &str {
        match &self.route {
            Route::Direct(d) => &d.ip,
            Route::Forwarded(_) => "127.0.0.1",
        }
    }

    /// Port to connect to: the target port, or the local forwarded port.
    pub fn local_port(&self) -> u16 {
        match &self.route {
            Route::Direct(d) => d.port,
            Route::Forwarded(f) => f.local_port(),
        }
    }

    /// `host:port` string for `TcpStream::connect` and WebSocket URLs.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip_address(), self.local_port())
    }

    pub fn kind(&self) -> &'static str {
        match &self.route {
            Route::Direct(_) => "direct",
            Route::Forwarded(_) => "forwarded",
        }
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    pub fn touch(&self) {
        self.last_used_ms
            .store(crate::util::now_ms(), Ordering::Relaxed);
    }

    pub async fn is_alive(&self) -> bool {
        match &self.route {
            Route::Direct(d) => d.is_alive().await,
            Route::Forwarded(f) => f.is_alive(),
        }
    }

    /// Local port held by a forwarded tunnel, freed when it is discarded.
    pub(crate) fn forwarded_port(&self) -> Option<u16> {
        match &self.route {
            Route::Direct(_) => None,
            Route::Forwarded(f) => Some(f.local_port()),
        }
    }

    /// Tear the route down. Only the manager calls this.
    pub(crate) fn close(&self) {
        if let Route::Forwarded(f) = &self.route {
            f.close();
        }
    }
}

/// Snapshot of a tunnel for the `/api/tunnels` listing.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    #[serde(flatten)]
    pub key: TunnelKey,
    pub address: String,
    pub local_port: u16,
    pub kind: &'static str,
    pub last_used_ms: u64,
}

impl From<&Tunnel> for TunnelInfo {
    fn from(t: &Tunnel) -> Self {
        Self {
            key: t.key.clone(),
            address: t.ip_address().to_string(),
            local_port: t.local_port(),
            kind: t.kind(),
            last_used_ms: t.last_used_ms(),
        }
    }
}
