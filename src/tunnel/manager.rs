//! Tunnel manager - the single owner of every open route into a job.
//!
//! One async mutex guards the tunnel map and the set of local ports held by
//! forwarded tunnels. It is held for map access only. Liveness probes and
//! tunnel creation run under a per-key slot instead, so two concurrent
//! callers for the same key never spawn two forwarders while other keys and
//! readers carry on.
//!
//! A background sweeper (see [`TunnelManager::start_sweeper`]) drops entries
//! whose route died. Alive tunnels stay open until their pod goes away,
//! unless `tunnel.idle_timeout_secs` is set.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::forward::{ForwardCommand, ForwardedTunnel};
use super::{DirectTunnel, Route, Tunnel, TunnelInfo, TunnelKey};
use crate::cluster::{find_pod_for_rank, ClusterApi, Placement};
use crate::config::{ClusterConfig, TunnelConfig};
use crate::error::{Error, Result};
use crate::jobs::JobDirectory;

#[derive(Default)]
struct TunnelTable {
    tunnels: HashMap<TunnelKey, Arc<Tunnel>>,
    used_ports: HashSet<u16>,
    /// Per-key creation slots, present while a caller works on the key.
    slots: HashMap<TunnelKey, Arc<Mutex<()>>>,
}

impl TunnelTable {
    fn insert(&mut self, tunnel: Arc<Tunnel>) {
        if let Some(port) = tunnel.forwarded_port() {
            self.used_ports.insert(port);
        }
        self.tunnels.insert(tunnel.key().clone(), tunnel);
    }

    fn remove(&mut self, key: &TunnelKey) -> Option<Arc<Tunnel>> {
        let tunnel = self.tunnels.remove(key)?;
        if let Some(port) = tunnel.forwarded_port() {
            self.used_ports.remove(&port);
        }
        Some(tunnel)
    }

    /// Remove `key` only if it still maps to `tunnel`.
    fn remove_if_same(&mut self, key: &TunnelKey, tunnel: &Arc<Tunnel>) -> bool {
        match self.tunnels.get(key) {
            Some(current) if Arc::ptr_eq(current, tunnel) => {
                self.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Pick a port and hold it until the forwarder is inserted or fails.
    fn reserve_port(&mut self, config: &TunnelConfig) -> Result<u16> {
        let port = self.pick_port(config)?;
        self.used_ports.insert(port);
        Ok(port)
    }

    /// Pick a random local port that is neither held by another forwarded
    /// tunnel nor bound by some other process.
    fn pick_port(&self, config: &TunnelConfig) -> Result<u16> {
        let (start, end) = (config.port_range_start, config.port_range_end);
        if start > end {
            return Err(Error::PortsExhausted { attempts: 0 });
        }
        let mut rng = rand::thread_rng();
        for _ in 0..config.max_port_attempts {
            let candidate = rng.gen_range(start..=end);
            if self.used_ports.contains(&candidate) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                return Ok(candidate);
            }
        }
        Err(Error::PortsExhausted {
            attempts: config.max_port_attempts,
        })
    }
}

struct Inner {
    cluster: Arc<dyn ClusterApi>,
    jobs: Arc<dyn JobDirectory>,
    cluster_config: ClusterConfig,
    config: TunnelConfig,
    placement: OnceLock<Placement>,
    table: Mutex<TunnelTable>,
    shutdown: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle; all clones share the same tunnel map.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        jobs: Arc<dyn JobDirectory>,
        cluster_config: ClusterConfig,
        config: TunnelConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                jobs,
                cluster_config,
                config,
                placement: OnceLock::new(),
                table: Mutex::new(TunnelTable::default()),
                shutdown: CancellationToken::new(),
                sweeper: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Placement of this process, probed on first use.
    pub fn placement(&self) -> Placement {
        *self.inner.placement.get_or_init(|| {
            let placement = Placement::detect(&self.inner.cluster_config);
            info!("Tunnel placement: {}", placement.as_str());
            placement
        })
    }

    /// Return the live tunnel for `(job_id, rank, port)`, opening one if needed.
    ///
    /// A dead tunnel found under the key is closed and replaced. Callers for
    /// the same key queue on that key's slot; other keys proceed.
    pub async fn create_or_use_existing(
        &self,
        job_id: &str,
        port: u16,
        rank: u32,
    ) -> Result<Arc<Tunnel>> {
        let key = TunnelKey {
            job_id: job_id.to_string(),
            rank,
            port,
        };

        let slot = {
            let mut table = self.inner.table.lock().await;
            Arc::clone(table.slots.entry(key.clone()).or_default())
        };
        let result = {
            let _creating = slot.lock().await;
            self.open(&key).await
        };

        let mut table = self.inner.table.lock().await;
        // The table and this call hold the only references: nobody is queued.
        let idle = Arc::strong_count(&slot) <= 2
            && table.slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot));
        if idle {
            table.slots.remove(&key);
        }
        result
    }

    async fn open(&self, key: &TunnelKey) -> Result<Arc<Tunnel>> {
        let (job_id, rank, port) = (key.job_id.as_str(), key.rank, key.port);

        let existing = self.inner.table.lock().await.tunnels.get(key).cloned();
        if let Some(existing) = existing {
            if existing.is_alive().await {
                existing.touch();
                return Ok(existing);
            }
            info!(job_id, rank, port, "Tunnel {key} is dead, reopening");
            existing.close();
            self.inner.table.lock().await.remove_if_same(key, &existing);
        }

        let job = self
            .inner
            .jobs
            .find_job(job_id)
            .await
            .ok_or_else(|| Error::not_found(format!("Job {job_id} not found")))?;
        let namespace = job.namespace(&self.inner.cluster_config.namespace).to_string();
        let pod = find_pod_for_rank(
            self.inner.cluster.as_ref(),
            &namespace,
            &self.inner.cluster_config.workload_label,
            &job.workload,
            rank,
        )
        .await?;

        let route = match self.placement() {
            Placement::InCluster => {
                let ip = pod.ip.clone().ok_or_else(|| {
                    Error::not_found(format!("Pod {} has no address yet", pod.name))
                })?;
                Route::Direct(DirectTunnel::new(
                    Arc::clone(&self.inner.cluster),
                    namespace,
                    pod.name.clone(),
                    ip,
                    port,
                ))
            }
            Placement::External => {
                let local_port = self.inner.table.lock().await.reserve_port(&self.inner.config)?;
                let command = ForwardCommand {
                    program: self.inner.config.forward_program.clone(),
                    args: self.inner.config.forward_args.clone(),
                };
                let spawned = ForwardedTunnel::spawn(
                    &command,
                    &namespace,
                    &pod.name,
                    local_port,
                    port,
                    Duration::from_secs(self.inner.config.ready_timeout_secs),
                )
                .await;
                match spawned {
                    Ok(forwarded) => Route::Forwarded(forwarded),
                    Err(e) => {
                        self.inner.table.lock().await.used_ports.remove(&local_port);
                        return Err(e);
                    }
                }
            }
        };

        let tunnel = Arc::new(Tunnel::new(key.clone(), route));
        info!(
            job_id,
            rank,
            port,
            pod = %pod.name,
            kind = tunnel.kind(),
            local_port = tunnel.local_port(),
            "Tunnel opened"
        );
        let mut table = self.inner.table.lock().await;
        if self.inner.shutdown.is_cancelled() {
            tunnel.close();
            if let Some(local_port) = tunnel.forwarded_port() {
                table.used_ports.remove(&local_port);
            }
            return Err(Error::Spawn("tunnel manager is shutting down".to_string()));
        }
        table.insert(Arc::clone(&tunnel));
        Ok(tunnel)
    }

    /// Drop dead tunnels, and idle ones when idle eviction is enabled.
    ///
    /// Liveness is probed outside the table lock. Returns the keys that were
    /// removed.
    pub async fn sweep(&self) -> Vec<TunnelKey> {
        let idle_ms = self.inner.config.idle_timeout_secs.saturating_mul(1000);
        let now = crate::util::now_ms();

        let entries: Vec<(TunnelKey, Arc<Tunnel>)> = {
            let table = self.inner.table.lock().await;
            table
                .tunnels
                .iter()
                .map(|(k, t)| (k.clone(), Arc::clone(t)))
                .collect()
        };

        let mut dead = Vec::new();
        for (key, tunnel) in &entries {
            if !tunnel.is_alive().await {
                dead.push(key.clone());
            }
        }

        let mut table = self.inner.table.lock().await;
        let mut removed = Vec::new();
        for (key, tunnel) in entries {
            if dead.contains(&key) {
                if table.remove_if_same(&key, &tunnel) {
                    debug!("Sweeping dead tunnel {key}");
                    removed.push(key);
                }
                continue;
            }
            // One reference in the table, one here: nobody else holds it.
            let unborrowed = Arc::strong_count(&tunnel) <= 2;
            if idle_ms > 0
                && unborrowed
                && now.saturating_sub(tunnel.last_used_ms()) > idle_ms
                && table.remove_if_same(&key, &tunnel)
            {
                info!("Closing idle tunnel {key}");
                tunnel.close();
                removed.push(key);
            }
        }

        if !removed.is_empty() {
            info!(
                "Tunnel sweep removed {} tunnel(s), {} open",
                removed.len(),
                table.tunnels.len()
            );
        }
        removed
    }

    /// Spawn the periodic sweep task. Calling it twice replaces the first task.
    pub fn start_sweeper(&self) {
        let manager = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = Duration::from_secs(self.inner.config.sweep_interval_secs.max(1));
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.sweep().await;
                    }
                }
            }
            debug!("Tunnel sweeper stopped");
        });

        match self.inner.sweeper.lock() {
            Ok(mut slot) => {
                if let Some(previous) = slot.replace(handle) {
                    previous.abort();
                }
            }
            Err(_) => warn!("Sweeper slot poisoned, sweeper handle not tracked"),
        }
    }

    /// Snapshot of all open tunnels, ordered by key.
    pub async fn list(&self) -> Vec<TunnelInfo> {
        let table = self.inner.table.lock().await;
        let mut infos: Vec<TunnelInfo> = table
            .tunnels
            .values()
            .map(|t| TunnelInfo::from(t.as_ref()))
            .collect();
        infos.sort_by(|a, b| {
            (&a.key.job_id, a.key.rank, a.key.port).cmp(&(&b.key.job_id, b.key.rank, b.key.port))
        });
        infos
    }

    pub async fn len(&self) -> usize {
        self.inner.table.lock().await.tunnels.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.table.lock().await.tunnels.is_empty()
    }

    /// Stop the sweeper and force-close every tunnel.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        if let Ok(mut slot) = self.inner.sweeper.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }

        let mut table = self.inner.table.lock().await;
        let count = table.tunnels.len();
        for tunnel in table.tunnels.values() {
            tunnel.close();
        }
        table.tunnels.clear();
        table.used_ports.clear();
        info!("Closed {count} tunnel(s) on shutdown");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cluster::testing::FakeCluster;
    use crate::jobs::{JobDescriptor, JobRegistry, JobResources};

    async fn jobs() -> Arc<JobRegistry> {
        let registry = Arc::new(JobRegistry::new());
        registry
            .upsert(JobDescriptor {
                id: "job-42".into(),
                workload: "job-42".into(),
                namespace: None,
                replicas: 2,
                resources: JobResources::default(),
            })
            .await;
        registry
    }

    fn in_cluster() -> ClusterConfig {
        ClusterConfig {
            in_cluster: Some(true),
            ..ClusterConfig::default()
        }
    }

    fn external() -> ClusterConfig {
        ClusterConfig {
            in_cluster: Some(false),
            ..ClusterConfig::default()
        }
    }

    fn forwarding(script: &str, start: u16, end: u16) -> TunnelConfig {
        TunnelConfig {
            port_range_start: start,
            port_range_end: end,
            ready_timeout_secs: 5,
            forward_program: "sh".into(),
            forward_args: vec!["-c".into(), script.into()],
            ..TunnelConfig::default()
        }
    }

    const READY: &str = "echo Forwarding from 127.0.0.1:{local}; exec sleep 30";

    async fn wait_dead(tunnel: &Tunnel) {
        for _ in 0..100 {
            if !tunnel.is_alive().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("tunnel {} still alive", tunnel.key());
    }

    #[tokio::test]
    async fn test_same_instance_while_alive() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.7");
        let manager = TunnelManager::new(
            cluster,
            jobs().await,
            in_cluster(),
            TunnelConfig::default(),
        );

        let a = manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        let b = manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.socket_addr(), "10.0.0.7:5900");
        assert_eq!(a.kind(), "direct");
        assert_eq!(manager.len().await, 1);

        let other_port = manager.create_or_use_existing("job-42", 8080, 0).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &other_port));
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn test_reopens_after_pod_restart() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 1, "10.0.0.1");
        let manager = TunnelManager::new(
            cluster.clone(),
            jobs().await,
            in_cluster(),
            TunnelConfig::default(),
        );

        let first = manager.create_or_use_existing("job-42", 5900, 1).await.unwrap();
        cluster.remove_pod("job-42-1");
        assert!(!first.is_alive().await);

        let err = manager
            .create_or_use_existing("job-42", 5900, 1)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(manager.is_empty().await);

        cluster.add_pod("job-42", 1, "10.0.0.2");
        let second = manager.create_or_use_existing("job-42", 5900, 1).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.ip_address(), "10.0.0.2");
    }

    #[tokio::test]
    async fn test_changed_pod_address_is_dead() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        let manager = TunnelManager::new(
            cluster.clone(),
            jobs().await,
            in_cluster(),
            TunnelConfig::default(),
        );

        let first = manager.create_or_use_existing("job-42", 22, 0).await.unwrap();
        cluster.add_pod("job-42", 0, "10.0.0.9");
        let second = manager.create_or_use_existing("job-42", 22, 0).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.ip_address(), "10.0.0.9");
    }

    #[tokio::test]
    async fn test_unknown_job_and_rank() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        let manager = TunnelManager::new(
            cluster,
            jobs().await,
            in_cluster(),
            TunnelConfig::default(),
        );

        let err = manager
            .create_or_use_existing("job-missing", 5900, 0)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = manager
            .create_or_use_existing("job-42", 5900, 1)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_sweep_removes_only_dead() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        cluster.add_pod("job-42", 1, "10.0.0.2");
        let manager = TunnelManager::new(
            cluster.clone(),
            jobs().await,
            in_cluster(),
            TunnelConfig::default(),
        );

        manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        manager.create_or_use_existing("job-42", 5900, 1).await.unwrap();
        cluster.remove_pod("job-42-1");

        let removed = manager.sweep().await;
        assert_eq!(
            removed,
            vec![TunnelKey {
                job_id: "job-42".into(),
                rank: 1,
                port: 5900
            }]
        );
        let open = manager.list().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].key.rank, 0);

        assert!(manager.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_idle_eviction_skips_borrowed() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        cluster.add_pod("job-42", 1, "10.0.0.2");
        let manager = TunnelManager::new(
            cluster,
            jobs().await,
            in_cluster(),
            TunnelConfig {
                idle_timeout_secs: 60,
                ..TunnelConfig::default()
            },
        );

        let borrowed = manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        let idle = manager.create_or_use_existing("job-42", 5900, 1).await.unwrap();
        borrowed.last_used_ms.store(0, Ordering::Relaxed);
        idle.last_used_ms.store(0, Ordering::Relaxed);
        drop(idle);

        let removed = manager.sweep().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].rank, 1);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_forwarded_reuse_and_replace() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        let manager = TunnelManager::new(
            cluster,
            jobs().await,
            external(),
            forwarding(READY, 41000, 41999),
        );

        let first = manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        assert_eq!(first.kind(), "forwarded");
        assert_eq!(first.ip_address(), "127.0.0.1");
        let port = first.local_port();
        assert!((41000..=41999).contains(&port));

        let again = manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        first.close();
        wait_dead(&first).await;

        let second = manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_alive().await);
        {
            let table = manager.inner.table.lock().await;
            assert_eq!(table.used_ports.len(), 1);
            assert!(table.used_ports.contains(&second.local_port()));
        }

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_ports_exhausted() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        let mut config = forwarding(READY, 42317, 42317);
        config.max_port_attempts = 4;
        let manager = TunnelManager::new(cluster, jobs().await, external(), config);

        manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        let err = manager
            .create_or_use_existing("job-42", 8080, 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::PortsExhausted { attempts: 4 }));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        let manager = TunnelManager::new(
            cluster,
            jobs().await,
            external(),
            forwarding("exit 3", 43000, 43999),
        );

        let err = manager
            .create_or_use_existing("job-42", 5900, 0)
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "SPAWN_FAILED");
        let table = manager.inner.table.lock().await;
        assert!(table.tunnels.is_empty());
        assert!(table.used_ports.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_forwarders() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        cluster.add_pod("job-42", 1, "10.0.0.2");
        let manager = TunnelManager::new(
            cluster,
            jobs().await,
            external(),
            forwarding(READY, 44000, 44999),
        );
        manager.start_sweeper();

        let a = manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        let b = manager.create_or_use_existing("job-42", 5900, 1).await.unwrap();
        assert_eq!(manager.len().await, 2);

        manager.shutdown().await;
        assert!(manager.is_empty().await);
        wait_dead(&a).await;
        wait_dead(&b).await;
    }

    #[tokio::test]
    async fn test_slow_forwarder_does_not_block_other_keys() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        cluster.add_pod("job-42", 1, "10.0.0.2");
        let script = "case {pod} in *-0) sleep 2;; esac; \
                      echo Forwarding from 127.0.0.1:{local}; exec sleep 30";
        let manager = TunnelManager::new(
            cluster,
            jobs().await,
            external(),
            forwarding(script, 46000, 46999),
        );

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_or_use_existing("job-42", 5900, 0).await })
        };
        let same_key = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.create_or_use_existing("job-42", 5900, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let open = tokio::time::timeout(Duration::from_millis(500), manager.len())
            .await
            .expect("len() waited behind a slow forwarder");
        assert_eq!(open, 0);
        let fast = tokio::time::timeout(
            Duration::from_millis(1500),
            manager.create_or_use_existing("job-42", 5900, 1),
        )
        .await
        .expect("another key waited behind a slow forwarder")
        .unwrap();
        assert_eq!(fast.key().rank, 1);

        let a = slow.await.unwrap().unwrap();
        let b = same_key.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len().await, 2);
        assert!(manager.inner.table.lock().await.slots.is_empty());

        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_dead_within_one_interval() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_pod("job-42", 0, "10.0.0.1");
        cluster.add_pod("job-42", 1, "10.0.0.2");
        let config = TunnelConfig {
            sweep_interval_secs: 30,
            ..TunnelConfig::default()
        };
        let manager = TunnelManager::new(cluster.clone(), jobs().await, in_cluster(), config);
        manager.start_sweeper();

        manager.create_or_use_existing("job-42", 5900, 0).await.unwrap();
        manager.create_or_use_existing("job-42", 5900, 1).await.unwrap();
        cluster.remove_pod("job-42-1");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.len().await, 2);

        tokio::time::sleep(Duration::from_secs(26)).await;
        let open = manager.list().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].key.rank, 0);

        manager.shutdown().await;
    }

    #[test]
    fn test_pick_port_skips_used() {
        let mut table = TunnelTable::default();
        let config = TunnelConfig {
            port_range_start: 45000,
            port_range_end: 45001,
            max_port_attempts: 64,
            ..TunnelConfig::default()
        };
        table.used_ports.insert(45000);
        assert_eq!(table.pick_port(&config).unwrap(), 45001);

        table.used_ports.insert(45001);
        assert!(matches!(
            table.pick_port(&config),
            Err(Error::PortsExhausted { attempts: 64 })
        ));
    }
}
