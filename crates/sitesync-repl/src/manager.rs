//! Reconciles worker pools against the known sites.

use crate::adapter::NodeAdapterRegistry;
use crate::broker::QueueBroker;
use crate::config::ReplicationProperties;
use crate::error::Result;
use crate::metrics::SiteMetrics;
use crate::pool::WorkerThreadPool;
use crate::site::{Site, SiteManager};
use crate::worker::{WorkerContext, WorkerStats};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ManagerInner {
    broker: Arc<QueueBroker>,
    sites: Arc<dyn SiteManager>,
    adapters: Arc<NodeAdapterRegistry>,
    local_site: Site,
    allowed: HashSet<String>,
    unlock_backoff: Duration,
    pools: Mutex<HashMap<String, Arc<WorkerThreadPool>>>,
}

impl ManagerInner {
    fn eligible(&self, site: &Site) -> bool {
        site.is_schedulable()
            && site.id != self.local_site.id
            && (self.allowed.is_empty() || self.allowed.contains(&site.id))
    }

    fn pool_size(&self, site: &Site) -> usize {
        self.local_site.parallelism().min(site.parallelism()) as usize
    }

    async fn monitor_sites(&self) -> Result<()> {
        let sites: Vec<Site> = self
            .sites
            .objects()
            .await?
            .into_iter()
            .filter(|site| self.eligible(site))
            .collect();

        let mut pools = self.pools.lock().await;
        for site in &sites {
            let size = self.pool_size(site);
            match pools.get(&site.id) {
                Some(pool) => {
                    if let Err(e) = pool.set_size(size) {
                        warn!(site_id = %site.id, error = %e, "failed to resize worker pool");
                    }
                }
                None => {
                    let ctx = WorkerContext {
                        queue: self.broker.site_queue(&site.id),
                        sites: self.sites.clone(),
                        adapters: self.adapters.clone(),
                        stats: Arc::new(WorkerStats::default()),
                        unlock_backoff: self.unlock_backoff,
                    };
                    match WorkerThreadPool::new(ctx, self.local_site.clone(), size) {
                        Ok(pool) => {
                            info!(site_id = %site.id, size, "worker pool created");
                            pools.insert(site.id.clone(), Arc::new(pool));
                        }
                        Err(e) => error!(site_id = %site.id, error = %e, "failed to create worker pool"),
                    }
                }
            }
        }

        let wanted: HashSet<&str> = sites.iter().map(|s| s.id.as_str()).collect();
        let stale: Vec<String> = pools
            .keys()
            .filter(|id| !wanted.contains(id.as_str()))
            .cloned()
            .collect();
        for site_id in stale {
            if let Some(pool) = pools.remove(&site_id) {
                info!(site_id = %site_id, "site no longer eligible, shutting down worker pool");
                pool.shutdown().await;
            }
        }
        Ok(())
    }

    async fn shutdown_pools(&self) {
        let pools: Vec<Arc<WorkerThreadPool>> =
            self.pools.lock().await.drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}

/// Keeps one worker pool per eligible remote site, sized to the smaller parallelism of the local
/// site and the remote site.
pub struct WorkerManager {
    inner: Arc<ManagerInner>,
    monitor_period: Duration,
    monitor: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl WorkerManager {
    /// Create a manager. Fails right away when the local site cannot be resolved.
    pub async fn new(
        broker: Arc<QueueBroker>,
        sites: Arc<dyn SiteManager>,
        adapters: Arc<NodeAdapterRegistry>,
        properties: &ReplicationProperties,
    ) -> Result<Self> {
        let local_site = sites.get(&properties.local_site).await?;
        info!(local_site = %local_site.id, allowed = ?properties.sites, "worker manager created");
        Ok(Self {
            inner: Arc::new(ManagerInner {
                broker,
                sites,
                adapters,
                local_site,
                allowed: properties.sites.iter().cloned().collect(),
                unlock_backoff: properties.unlock_backoff(),
                pools: Mutex::new(HashMap::new()),
            }),
            monitor_period: properties.monitor_period(),
            monitor: parking_lot::Mutex::new(None),
        })
    }

    /// The resolved local site.
    pub fn local_site(&self) -> &Site {
        &self.inner.local_site
    }

    /// Run one reconciliation pass.
    pub async fn monitor_sites(&self) -> Result<()> {
        self.inner.monitor_sites().await
    }

    /// Reconcile now and then every monitor period until stopped. Starting twice does nothing.
    pub fn start(&self) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let period = self.monitor_period;
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.monitor_sites().await {
                            warn!(error = %e, "site reconciliation failed");
                        }
                    }
                }
            }
            debug!("site monitor stopped");
        });
        *monitor = Some((cancel, handle));
        info!(period_secs = period.as_secs(), "worker manager started");
    }

    /// Stop reconciling and shut down every pool.
    pub async fn stop(&self) {
        let monitor = self.monitor.lock().take();
        if let Some((cancel, handle)) = monitor {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "site monitor did not exit cleanly");
            }
        }
        self.inner.shutdown_pools().await;
        info!("worker manager stopped");
    }

    /// Size of each managed pool by site id.
    pub async fn pool_sizes(&self) -> BTreeMap<String, usize> {
        self.inner
            .pools
            .lock()
            .await
            .iter()
            .map(|(id, pool)| (id.clone(), pool.size()))
            .collect()
    }

    /// Metrics snapshot of every managed site, by site id.
    pub async fn site_metrics(&self) -> Vec<SiteMetrics> {
        let pools = self.inner.pools.lock().await;
        let mut metrics: Vec<SiteMetrics> = pools
            .iter()
            .map(|(site_id, pool)| {
                let mut m = SiteMetrics::new(site_id);
                if let Some(queue) = self.inner.broker.get(site_id) {
                    m.queue = queue.stats();
                    m.queue_size = queue.size();
                    m.active_tasks = queue.active_size();
                }
                m.pool_size = pool.size();
                m.pool = pool.stats();
                m.workers = pool.worker_stats();
                m
            })
            .collect();
        metrics.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        metrics
    }

    /// Pool of a site, if managed.
    pub async fn pool(&self, site_id: &str) -> Option<Arc<WorkerThreadPool>> {
        self.inner.pools.lock().await.get(site_id).cloned()
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("local_site", &self.inner.local_site.id)
            .field("allowed", &self.inner.allowed)
            .field("monitor_period", &self.monitor_period)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, AdapterResult, NodeAdapter, NodeAdapterFactory};
    use crate::clock::SystemClock;
    use crate::error::ReplError;
    use crate::site::{InMemorySiteManager, SiteKind, SiteType};

    /// Factory whose adapters can never be opened.
    struct RefusingFactory;

    impl NodeAdapterFactory for RefusingFactory {
        fn create(&self, url: &str) -> AdapterResult<Box<dyn NodeAdapter>> {
            Err(AdapterError::failure(format!("refusing {}", url)))
        }
    }

    fn props(allowed: &[&str]) -> ReplicationProperties {
        ReplicationProperties {
            local_site: "local".to_string(),
            sites: allowed.iter().map(|s| s.to_string()).collect(),
            ..ReplicationProperties::default()
        }
    }

    async fn manager(
        sites: Arc<InMemorySiteManager>,
        allowed: &[&str],
    ) -> Result<WorkerManager> {
        let adapters = Arc::new(NodeAdapterRegistry::new());
        adapters.register(SiteType::Ion, Arc::new(RefusingFactory))?;
        let broker = Arc::new(QueueBroker::new(10, Arc::new(SystemClock)));
        WorkerManager::new(broker, sites, adapters, &props(allowed)).await
    }

    #[tokio::test]
    async fn test_missing_local_site_is_fatal() {
        let sites = Arc::new(InMemorySiteManager::new());
        assert!(matches!(
            manager(sites, &[]).await,
            Err(ReplError::NotFound { kind: "site", .. })
        ));
    }

    #[tokio::test]
    async fn test_pool_creation_failure_skips_site() {
        // the local site type has no working factory, so workers cannot open local adapters
        let sites = Arc::new(InMemorySiteManager::new());
        sites.save(Site::new("local", "u", SiteType::Ion, SiteKind::Regional));
        sites.save(Site::new("remote", "u", SiteType::Ddf, SiteKind::Regional));
        let m = manager(sites, &[]).await.unwrap();
        m.monitor_sites().await.unwrap();
        assert!(m.pool_sizes().await.is_empty());
    }

    #[tokio::test]
    async fn test_eligibility_rules() {
        let sites = Arc::new(InMemorySiteManager::new());
        sites.save(Site::new("local", "u", SiteType::Ion, SiteKind::Regional));
        let m = manager(sites, &["a"]).await.unwrap();
        let inner = &m.inner;

        assert!(inner.eligible(&Site::new("a", "u", SiteType::Ddf, SiteKind::Tactical)));
        assert!(!inner.eligible(&Site::new("b", "u", SiteType::Ddf, SiteKind::Tactical)));
        assert!(!inner.eligible(&Site::new("a", "u", SiteType::Unknown, SiteKind::Tactical)));
        assert!(!inner.eligible(&Site::new("a", "u", SiteType::Ddf, SiteKind::Unknown)));
        assert!(!inner.eligible(&Site::new("local", "u", SiteType::Ion, SiteKind::Regional)));
    }

    #[tokio::test]
    async fn test_pool_size_is_minimum_parallelism() {
        let sites = Arc::new(InMemorySiteManager::new());
        sites.save(Site::new("local", "u", SiteType::Ion, SiteKind::Regional).with_parallelism(3));
        let m = manager(sites, &[]).await.unwrap();
        let inner = &m.inner;

        let remote = Site::new("r", "u", SiteType::Ddf, SiteKind::Regional);
        assert_eq!(inner.pool_size(&remote), 1);
        assert_eq!(inner.pool_size(&remote.clone().with_parallelism(2)), 2);
        assert_eq!(inner.pool_size(&remote.with_parallelism(8)), 3);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let sites = Arc::new(InMemorySiteManager::new());
        sites.save(Site::new("local", "u", SiteType::Ion, SiteKind::Regional));
        let m = manager(sites, &[]).await.unwrap();
        m.start();
        m.start();
        m.stop().await;
        m.stop().await;
        assert!(m.pool_sizes().await.is_empty());
    }
}
