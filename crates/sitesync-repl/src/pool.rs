//! Elastic set of workers draining one site queue.

use crate::adapter::NodeAdapterRegistry;
use crate::error::{ReplError, Result};
use crate::site::Site;
use crate::worker::{Worker, WorkerContext, WorkerStatsSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifetime counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers spawned.
    pub workers_started: u64,
    /// Workers told to stop.
    pub workers_stopped: u64,
}

struct WorkerHandle {
    id: u64,
    cancel: CancellationToken,
    processing: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop the worker only if it is not holding a task.
    fn cancel_if_not_processing(&self) -> bool {
        if self.processing.load(Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Stop the worker once its current task, if any, is released.
    fn interrupt(&self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct PoolState {
    workers: Vec<WorkerHandle>,
    retiring: Vec<WorkerHandle>,
    next_id: u64,
    shutdown: bool,
    stats: PoolStats,
}

/// Workers for one site, resized to follow the site's parallelism.
pub struct WorkerThreadPool {
    ctx: WorkerContext,
    local_site: Site,
    state: Mutex<PoolState>,
}

impl WorkerThreadPool {
    /// Create a pool and start `size` workers. Must be called within a tokio runtime.
    pub fn new(ctx: WorkerContext, local_site: Site, size: usize) -> Result<Self> {
        let pool = Self {
            ctx,
            local_site,
            state: Mutex::new(PoolState::default()),
        };
        if let Err(e) = pool.set_size(size) {
            for worker in pool.state.lock().workers.drain(..) {
                worker.interrupt();
            }
            return Err(e);
        }
        Ok(pool)
    }

    /// Site whose queue this pool drains.
    pub fn site(&self) -> &str {
        self.ctx.queue.site()
    }

    /// Number of live workers.
    pub fn size(&self) -> usize {
        self.state
            .lock()
            .workers
            .iter()
            .filter(|w| !w.join.is_finished())
            .count()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Counters of the workers.
    pub fn worker_stats(&self) -> WorkerStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Whether `shutdown` was called.
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn registry(&self) -> &NodeAdapterRegistry {
        &self.ctx.adapters
    }

    /// Grow or shrink to `size` workers. Setting the current size does nothing; a pool that was
    /// shut down stays empty.
    pub fn set_size(&self, size: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Ok(());
        }
        state.retiring.retain(|w| !w.join.is_finished());
        self.reap_exited(&mut state);

        let current = state.workers.len();
        if size == current {
            return Ok(());
        }
        info!(site_id = %self.site(), from = current, to = size, "resizing worker pool");
        if size > current {
            self.spin_up(&mut state, size - current)
        } else {
            self.spin_down(&mut state, current - size);
            Ok(())
        }
    }

    /// Forget workers whose task ended without being stopped, so the next resize replaces them.
    fn reap_exited(&self, state: &mut PoolState) {
        let before = state.workers.len();
        state.workers.retain(|w| !w.join.is_finished());
        let exited = before - state.workers.len();
        if exited > 0 {
            warn!(site_id = %self.site(), exited, "workers exited unexpectedly");
            state.stats.workers_stopped += exited as u64;
        }
    }

    fn spin_up(&self, state: &mut PoolState, count: usize) -> Result<()> {
        let factory = self.registry().factory_for(self.local_site.site_type)?;
        for _ in 0..count {
            // each worker gets its own local adapter; adapters are not shared
            let local = factory.create(&self.local_site.url).map_err(ReplError::from)?;
            let cancel = CancellationToken::new();
            let worker = Worker::new(self.ctx.clone(), local, cancel.clone());
            let processing = worker.processing_flag();
            let join = tokio::spawn(worker.run());

            let id = state.next_id;
            state.next_id += 1;
            state.stats.workers_started += 1;
            debug!(site_id = %self.site(), worker_id = id, "worker spawned");
            state.workers.push(WorkerHandle {
                id,
                cancel,
                processing,
                join,
            });
        }
        Ok(())
    }

    fn spin_down(&self, state: &mut PoolState, count: usize) {
        let mut stopped = 0;

        // idle workers first, most recently started first
        let mut i = state.workers.len();
        while i > 0 && stopped < count {
            i -= 1;
            if state.workers[i].cancel_if_not_processing() {
                let handle = state.workers.remove(i);
                debug!(site_id = %self.site(), worker_id = handle.id, "idle worker stopped");
                state.retiring.push(handle);
                stopped += 1;
            }
        }

        while stopped < count {
            let Some(handle) = state.workers.pop() else {
                break;
            };
            handle.interrupt();
            debug!(site_id = %self.site(), worker_id = handle.id, "busy worker interrupted");
            state.retiring.push(handle);
            stopped += 1;
        }
        state.stats.workers_stopped += stopped as u64;
    }

    /// Stop every worker and wait for them to exit. Workers holding a task release it first.
    pub async fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut state = self.state.lock();
            state.shutdown = true;
            let active = std::mem::take(&mut state.workers);
            state.stats.workers_stopped += active.len() as u64;
            let mut all = std::mem::take(&mut state.retiring);
            all.extend(active);
            all
        };

        for handle in &handles {
            handle.interrupt();
        }
        for handle in handles {
            if let Err(e) = handle.join.await {
                warn!(site_id = %self.site(), worker_id = handle.id, error = %e, "worker did not exit cleanly");
            }
        }
        info!(site_id = %self.site(), "worker pool shut down");
    }
}

impl Drop for WorkerThreadPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for worker in state.workers.iter().chain(state.retiring.iter()) {
            worker.interrupt();
        }
    }
}

impl std::fmt::Debug for WorkerThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkerThreadPool")
            .field("site", &self.ctx.queue.site())
            .field("workers", &state.workers.len())
            .field("retiring", &state.retiring.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{
        AdapterResult, CreateRequest, CreateStorageRequest, DeleteRequest, Metadata, NodeAdapter,
        NodeAdapterFactory, QueryRequest, QueryResponse, ResourceRequest, ResourceResponse,
        UpdateRequest, UpdateStorageRequest,
    };
    use crate::clock::SystemClock;
    use crate::queue::SiteQueue;
    use crate::site::{InMemorySiteManager, SiteKind, SiteType};
    use crate::worker::WorkerStats;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct IdleAdapter {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeAdapter for IdleAdapter {
        async fn is_available(&self) -> bool {
            true
        }
        fn system_name(&self) -> String {
            "local".to_string()
        }
        async fn exists(&self, _: &Metadata) -> AdapterResult<bool> {
            Ok(true)
        }
        async fn create_request(&self, _: CreateRequest) -> AdapterResult<bool> {
            Ok(true)
        }
        async fn update_request(&self, _: UpdateRequest) -> AdapterResult<bool> {
            Ok(true)
        }
        async fn delete_request(&self, _: DeleteRequest) -> AdapterResult<bool> {
            Ok(true)
        }
        async fn read_resource(&self, _: ResourceRequest) -> AdapterResult<ResourceResponse> {
            Err(crate::adapter::AdapterError::failure("no resources"))
        }
        async fn create_resource(&self, _: CreateStorageRequest) -> AdapterResult<bool> {
            Ok(true)
        }
        async fn update_resource(&self, _: UpdateStorageRequest) -> AdapterResult<bool> {
            Ok(true)
        }
        async fn query(&self, _: QueryRequest) -> AdapterResult<QueryResponse> {
            Ok(QueryResponse::default())
        }
        async fn close(&mut self) -> AdapterResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl NodeAdapterFactory for CountingFactory {
        fn create(&self, _url: &str) -> AdapterResult<Box<dyn NodeAdapter>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleAdapter {
                closed: self.closed.clone(),
            }))
        }
    }

    fn setup(size: usize) -> (WorkerThreadPool, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let adapters = Arc::new(NodeAdapterRegistry::new());
        adapters.register(SiteType::Ddf, factory.clone()).unwrap();
        let ctx = WorkerContext {
            queue: SiteQueue::new("remote", 10, Arc::new(SystemClock)),
            sites: Arc::new(InMemorySiteManager::new()),
            adapters,
            stats: Arc::new(WorkerStats::default()),
            unlock_backoff: Duration::from_millis(5),
        };
        let local = Site::new("local", "https://local", SiteType::Ddf, SiteKind::Regional);
        (WorkerThreadPool::new(ctx, local, size).unwrap(), factory)
    }

    #[tokio::test]
    async fn test_new_pool_starts_workers_with_own_adapters() {
        let (pool, factory) = setup(3);
        assert_eq!(pool.size(), 3);
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_same_size_is_noop() {
        let (pool, factory) = setup(2);
        pool.set_size(2).unwrap();
        pool.set_size(2).unwrap();
        assert_eq!(pool.stats(), PoolStats { workers_started: 2, workers_stopped: 0 });
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_starts_and_stops_delta() {
        let (pool, _) = setup(1);
        pool.set_size(4).unwrap();
        assert_eq!(pool.stats().workers_started, 4);
        pool.set_size(2).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.stats().workers_stopped, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_worker_is_replaced_on_resize() {
        let (pool, factory) = setup(2);
        let gone = pool.state.lock().workers[0].cancel.clone();
        gone.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while pool.size() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        pool.set_size(2).unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.stats(), PoolStats { workers_started: 3, workers_stopped: 1 });
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_joins_and_closes_adapters() {
        let (pool, factory) = setup(2);
        pool.set_size(1).unwrap();
        pool.shutdown().await;
        assert!(pool.is_shutdown());
        assert_eq!(pool.size(), 0);
        assert_eq!(factory.closed.load(Ordering::SeqCst), 2);

        pool.set_size(3).unwrap();
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_missing_local_factory_fails() {
        let ctx = WorkerContext {
            queue: SiteQueue::new("remote", 10, Arc::new(SystemClock)),
            sites: Arc::new(InMemorySiteManager::new()),
            adapters: Arc::new(NodeAdapterRegistry::new()),
            stats: Arc::new(WorkerStats::default()),
            unlock_backoff: Duration::ZERO,
        };
        let local = Site::new("local", "https://local", SiteType::Ion, SiteKind::Regional);
        assert!(matches!(
            WorkerThreadPool::new(ctx, local, 1),
            Err(ReplError::NoAdapterFactory { .. })
        ));
    }
}
