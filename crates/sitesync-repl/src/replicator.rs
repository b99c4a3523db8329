//! Executes replicator configs as sweeps and records each run in the history.

use crate::adapter::{NodeAdapter, NodeAdapterRegistry};
use crate::clock::Clock;
use crate::config::ReplicatorConfig;
use crate::error::{ReplError, Result};
use crate::replication_item::ReplicationItemStore;
use crate::site::SiteManager;
use crate::status::{ReplicationStatus, ReplicatorHistory, Status};
use crate::sync::{SyncCancel, SyncResponse, Syncer};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct ReplicatorState {
    pending: VecDeque<ReplicatorConfig>,
    active: HashMap<String, SyncCancel>,
}

/// Runs sync requests one at a time, at most one request per config queued or running.
pub struct Replicator {
    sites: Arc<dyn SiteManager>,
    adapters: Arc<NodeAdapterRegistry>,
    items: Arc<dyn ReplicationItemStore>,
    history: Arc<dyn ReplicatorHistory>,
    syncer: Syncer,
    clock: Arc<dyn Clock>,
    state: Mutex<ReplicatorState>,
    submitted: Notify,
}

impl Replicator {
    /// Create a replicator with no pending requests.
    pub fn new(
        sites: Arc<dyn SiteManager>,
        adapters: Arc<NodeAdapterRegistry>,
        items: Arc<dyn ReplicationItemStore>,
        history: Arc<dyn ReplicatorHistory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            syncer: Syncer::new(items.clone(), history.clone()),
            sites,
            adapters,
            items,
            history,
            clock,
            state: Mutex::new(ReplicatorState::default()),
            submitted: Notify::new(),
        }
    }

    /// Queue a run of `config`. Returns false when a run of the same config is already queued or
    /// running.
    pub fn submit_sync_request(&self, config: ReplicatorConfig) -> bool {
        let mut state = self.state.lock();
        if state.active.contains_key(&config.id) || state.pending.iter().any(|c| c.id == config.id)
        {
            debug!(replicator = %config.name, "sync request already pending");
            return false;
        }
        debug!(replicator = %config.name, "sync request submitted");
        state.pending.push_back(config);
        drop(state);
        self.submitted.notify_one();
        true
    }

    /// Ids of the configs waiting to run, oldest first.
    pub fn pending_requests(&self) -> Vec<String> {
        self.state.lock().pending.iter().map(|c| c.id.clone()).collect()
    }

    /// Ids of the configs currently running.
    pub fn active_requests(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a queued run of `config_id` or cancel its running sweep.
    pub fn cancel_sync_request(&self, config_id: &str) -> bool {
        let mut state = self.state.lock();
        let queued = state.pending.len();
        state.pending.retain(|c| c.id != config_id);
        if state.pending.len() != queued {
            info!(config_id, "queued sync request cancelled");
            return true;
        }
        match state.active.get(config_id) {
            Some(cancel) => {
                info!(config_id, "cancelling running sync");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel any run of `config` and forget its bookkeeping and history.
    pub async fn remove_config(&self, config: &ReplicatorConfig) -> Result<()> {
        self.cancel_sync_request(&config.id);
        self.items.delete_items_for_config(&config.id).await?;
        self.history.remove_events(&config.name).await?;
        info!(replicator = %config.name, "replicator config removed");
        Ok(())
    }

    /// Run the oldest queued request, if any.
    pub async fn run_next(&self) -> Option<ReplicationStatus> {
        let (config, cancel) = {
            let mut state = self.state.lock();
            let config = state.pending.pop_front()?;
            let cancel = SyncCancel::new();
            state.active.insert(config.id.clone(), cancel.clone());
            (config, cancel)
        };
        let status = self.execute(&config, cancel).await;
        self.state.lock().active.remove(&config.id);
        Some(status)
    }

    /// Execute queued requests until cancelled. A running sweep is cancelled with the loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("replicator started");
        loop {
            let submitted = self.submitted.notified();
            let next = self.state.lock().pending.front().map(|c| c.id.clone());
            match next {
                Some(config_id) => {
                    let run = self.run_next();
                    tokio::pin!(run);
                    tokio::select! {
                        _ = &mut run => {}
                        _ = cancel.cancelled() => {
                            self.cancel_sync_request(&config_id);
                            run.await;
                            break;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = submitted => {}
                    }
                }
            }
        }
        info!("replicator stopped");
    }

    /// Submit every config that is not suspended now and then every `period` until cancelled.
    pub async fn schedule(
        self: Arc<Self>,
        configs: Vec<ReplicatorConfig>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for config in configs.iter().filter(|c| !c.suspended) {
                        self.submit_sync_request(config.clone());
                    }
                }
            }
        }
        debug!("replicator scheduler stopped");
    }

    /// Run one config now: pull first when bidirectional, then push, and record the run.
    pub async fn execute(&self, config: &ReplicatorConfig, cancel: SyncCancel) -> ReplicationStatus {
        let mut status = ReplicationStatus::new(&config.id, &config.name, self.clock.wall_time());
        match self.history.events(&config.name).await {
            Ok(events) => {
                if let Some(previous) = events.first() {
                    status.last_success = previous.last_success;
                    status.last_run = previous.last_run;
                    status.last_metadata_modified = previous.last_metadata_modified;
                }
            }
            Err(e) => warn!(replicator = %config.name, error = %e, "failed to read history"),
        }

        info!(replicator = %config.name, source = %config.source, destination = %config.destination, "replication started");
        if let Err(e) = self.replicate(config, &mut status, &cancel).await {
            error!(replicator = %config.name, error = %e, "replication failed");
            status.status = Status::Failure;
        }

        status.last_run = Some(status.start_time);
        if status.status == Status::Success {
            status.last_success = Some(status.start_time);
        }
        status.set_duration(self.clock.wall_time());
        info!(
            replicator = %config.name,
            status = ?status.status,
            pushed = status.push_count,
            pulled = status.pull_count,
            failed = status.push_fail_count + status.pull_fail_count,
            "replication finished"
        );
        if let Err(e) = self.history.add_event(status.clone()).await {
            error!(replicator = %config.name, error = %e, "failed to record replication run");
        }
        status
    }

    async fn open(&self, site_id: &str) -> Result<Box<dyn NodeAdapter>> {
        let site = self.sites.get(site_id).await?;
        self.adapters.create(&site)
    }

    async fn replicate(
        &self,
        config: &ReplicatorConfig,
        status: &mut ReplicationStatus,
        cancel: &SyncCancel,
    ) -> Result<()> {
        let mut source = match self.open(&config.source).await {
            Ok(adapter) => adapter,
            Err(e) => return unavailable(status, &config.source, e),
        };
        let mut destination = match self.open(&config.destination).await {
            Ok(adapter) => adapter,
            Err(e) => {
                close(source.as_mut(), &config.source).await;
                return unavailable(status, &config.destination, e);
            }
        };

        let result = if !source.is_available().await || !destination.is_available().await {
            warn!(replicator = %config.name, "site unavailable, skipping replication");
            status.status = Status::ConnectionUnavailable;
            Ok(())
        } else {
            self.sweep(config, status, cancel, source.as_ref(), destination.as_ref())
                .await
        };

        close(source.as_mut(), &config.source).await;
        close(destination.as_mut(), &config.destination).await;
        result
    }

    async fn sweep(
        &self,
        config: &ReplicatorConfig,
        status: &mut ReplicationStatus,
        cancel: &SyncCancel,
        source: &dyn NodeAdapter,
        destination: &dyn NodeAdapter,
    ) -> Result<()> {
        let mut pulled = None;
        if config.bidirectional {
            status.status = Status::PullInProgress;
            let response = self
                .syncer
                .create(destination, source, config)
                .with_cancel(cancel.clone())
                .sync()
                .await?;
            status.pull_count += response.items_replicated;
            status.pull_fail_count += response.items_failed;
            status.pull_bytes += response.bytes_transferred;
            pulled = Some(response.status);
            record_sweep(status, &response);
        }

        if pulled.map_or(true, |s| s == Status::Success) {
            status.status = Status::PushInProgress;
            let response = self
                .syncer
                .create(source, destination, config)
                .with_cancel(cancel.clone())
                .sync()
                .await?;
            status.push_count += response.items_replicated;
            status.push_fail_count += response.items_failed;
            status.push_bytes += response.bytes_transferred;
            record_sweep(status, &response);
        }
        Ok(())
    }
}

fn record_sweep(status: &mut ReplicationStatus, response: &SyncResponse) {
    status.status = response.status;
    if let Some(modified) = response.last_metadata_modified {
        if status.last_metadata_modified.map_or(true, |m| modified > m) {
            status.last_metadata_modified = Some(modified);
        }
    }
}

/// Adapter failures mark the run unavailable; anything else fails it.
fn unavailable(status: &mut ReplicationStatus, site_id: &str, e: ReplError) -> Result<()> {
    match e {
        ReplError::Adapter(e) => {
            warn!(site_id, error = %e, "could not connect to site");
            status.status = Status::ConnectionUnavailable;
            Ok(())
        }
        e => Err(e),
    }
}

async fn close(adapter: &mut dyn NodeAdapter, site_id: &str) {
    if let Err(e) = adapter.close().await {
        warn!(site_id, error = %e, "failed to close adapter");
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Replicator")
            .field("pending", &state.pending.len())
            .field("active", &state.active.len())
            .finish()
    }
}
