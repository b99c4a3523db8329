//! Worker: drains one site queue, harvesting items from the site into the local site.
//!
//! Each iteration locks one task and releases it exactly once. Tasks the worker cannot handle
//! (unsupported operation or metadata shape, unresolvable site or adapter) are unlocked and the
//! worker backs off briefly before taking again. Cancellation is only observed while waiting for a
//! task or backing off, never in the middle of one.

use crate::adapter::{
    AdapterError, CreateRequest, CreateStorageRequest, Metadata, NodeAdapter, NodeAdapterRegistry,
    ResourceRequest,
};
use crate::error::{ReplError, Result};
use crate::queue::{LockedTask, SiteQueue};
use crate::site::SiteManager;
use crate::task::{ErrorCode, Task};
use crate::task_info::{MetadataInfo, OperationType};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters shared by the workers of one pool.
#[derive(Debug, Default)]
pub struct WorkerStats {
    tasks_taken: AtomicU64,
    tasks_released: AtomicU64,
    unsupported_skipped: AtomicU64,
    unresolved_site: AtomicU64,
    interrupted: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStatsSnapshot {
    /// Tasks locked by a worker.
    pub tasks_taken: u64,
    /// Tasks completed or failed by a worker.
    pub tasks_released: u64,
    /// Tasks unlocked because their operation or metadata shape is not handled.
    pub unsupported_skipped: u64,
    /// Tasks unlocked because the site or its adapter could not be resolved.
    pub unresolved_site: u64,
    /// Iterations cut short by an adapter interruption.
    pub interrupted: u64,
}

impl WorkerStats {
    /// Copy the counters.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            tasks_taken: self.tasks_taken.load(Ordering::Relaxed),
            tasks_released: self.tasks_released.load(Ordering::Relaxed),
            unsupported_skipped: self.unsupported_skipped.load(Ordering::Relaxed),
            unresolved_site: self.unresolved_site.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Everything a worker needs besides its own local adapter.
#[derive(Clone)]
pub struct WorkerContext {
    /// Queue to drain; its site is the one harvested from.
    pub queue: Arc<SiteQueue>,
    /// Resolves the queue's site.
    pub sites: Arc<dyn SiteManager>,
    /// Creates an adapter for the queue's site.
    pub adapters: Arc<NodeAdapterRegistry>,
    /// Counters shared with the pool.
    pub stats: Arc<WorkerStats>,
    /// Pause after unlocking a task.
    pub unlock_backoff: Duration,
}

/// What an iteration did with its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Completed or failed.
    Released,
    /// Put back for later.
    Unlocked,
}

/// Why a harvest stopped before completing.
enum Abort {
    Fail(ErrorCode, String),
    Interrupted,
}

impl Abort {
    fn fail(code: ErrorCode, msg: String) -> Self {
        Abort::Fail(code, msg)
    }
}

/// Processes tasks from one site queue until cancelled.
pub struct Worker {
    ctx: WorkerContext,
    local: Box<dyn NodeAdapter>,
    cancel: CancellationToken,
    processing: Arc<AtomicBool>,
}

impl Worker {
    /// Create a worker that owns `local` for its whole life.
    pub fn new(ctx: WorkerContext, local: Box<dyn NodeAdapter>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            local,
            cancel,
            processing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag raised while the worker holds a task.
    pub fn processing_flag(&self) -> Arc<AtomicBool> {
        self.processing.clone()
    }

    /// Run until cancelled, then close the local adapter.
    pub async fn run(mut self) {
        let site_id = self.ctx.queue.site().to_string();
        debug!(site_id = %site_id, "worker started");
        while !self.cancel.is_cancelled() {
            match self.do_run().await {
                Ok(()) => {}
                Err(ReplError::Interrupted) if self.cancel.is_cancelled() => break,
                Err(ReplError::Interrupted) => {
                    // an adapter call was interrupted while the worker itself is still wanted
                    debug!(site_id = %site_id, "adapter call interrupted, task unlocked");
                    self.back_off().await;
                }
                Err(e) => error!(site_id = %site_id, error = %e, "worker iteration failed"),
            }
        }
        if let Err(e) = self.local.close().await {
            debug!(site_id = %site_id, error = %e, "failed to close local adapter");
        }
        debug!(site_id = %site_id, "worker stopped");
    }

    /// One iteration: lock a task, handle it, release it.
    pub async fn do_run(&mut self) -> Result<()> {
        let task = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ReplError::Interrupted),
            task = self.ctx.queue.take() => task,
        };
        self.processing.store(true, Ordering::SeqCst);
        self.ctx.stats.tasks_taken.fetch_add(1, Ordering::Relaxed);

        let outcome = if supported(&task) {
            self.handle(task).await
        } else {
            debug!(site_id = %self.ctx.queue.site(), task_id = %task.id(), operation = %task.operation(), "unsupported task, unlocking");
            self.ctx.stats.unsupported_skipped.fetch_add(1, Ordering::Relaxed);
            task.unlock();
            Ok(Disposition::Unlocked)
        };
        self.processing.store(false, Ordering::SeqCst);

        match outcome {
            Ok(Disposition::Released) => {
                self.ctx.stats.tasks_released.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Disposition::Unlocked) => {
                self.back_off().await;
                Ok(())
            }
            Err(e) => {
                self.ctx.stats.interrupted.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn back_off(&self) {
        if self.ctx.unlock_backoff.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.ctx.unlock_backoff) => {}
        }
    }

    async fn handle(&self, task: LockedTask) -> Result<Disposition> {
        let mut remote = match self.remote_adapter().await {
            Ok(remote) => remote,
            Err(ReplError::Interrupted) => {
                task.unlock();
                return Err(ReplError::Interrupted);
            }
            Err(e) => {
                debug!(site_id = %self.ctx.queue.site(), task_id = %task.id(), error = %e, "cannot resolve site adapter, unlocking");
                self.ctx.stats.unresolved_site.fetch_add(1, Ordering::Relaxed);
                task.unlock();
                return Ok(Disposition::Unlocked);
            }
        };

        let result = match self.harvest(&task, remote.as_ref()).await {
            Ok(()) => {
                info!(site_id = %self.ctx.queue.site(), task_id = %task.id(), intel_id = %task.intel_id(), "harvested");
                task.complete();
                Ok(Disposition::Released)
            }
            Err(Abort::Fail(code, msg)) => {
                task.fail(code, msg);
                Ok(Disposition::Released)
            }
            Err(Abort::Interrupted) => {
                task.unlock();
                Err(ReplError::Interrupted)
            }
        };

        if let Err(e) = remote.close().await {
            debug!(site_id = %self.ctx.queue.site(), error = %e, "failed to close site adapter");
        }
        result
    }

    async fn remote_adapter(&self) -> Result<Box<dyn NodeAdapter>> {
        let site = self.ctx.sites.get(self.ctx.queue.site()).await?;
        match self.ctx.adapters.create(&site) {
            Err(ReplError::Adapter(AdapterError::Interrupted)) => Err(ReplError::Interrupted),
            other => other,
        }
    }

    /// Pull the task's item from `source` (the queue's site) into the local site.
    async fn harvest(&self, task: &Task, source: &dyn NodeAdapter) -> std::result::Result<(), Abort> {
        let destination = self.local.as_ref();
        if !destination.is_available().await {
            return Err(unavailable(destination));
        }
        if !source.is_available().await {
            return Err(unavailable(source));
        }

        let metadata = match task_metadata(task) {
            Some(metadata) => metadata,
            None => {
                return Err(Abort::fail(
                    ErrorCode::UnknownError,
                    format!("Task {} carries no supported metadata", task.intel_id()),
                ))
            }
        };
        let source_name = source.system_name();
        let destination_name = destination.system_name();

        match source.exists(&metadata).await {
            Ok(true) => {}
            Ok(false) => {
                info!(intel_id = %task.intel_id(), source = %source_name, destination = %destination_name, "item deleted before it could be harvested");
                return Err(Abort::fail(
                    ErrorCode::NoLongerExists,
                    format!("Metadata deleted from site {} before able to create", source_name),
                ));
            }
            Err(AdapterError::Interrupted) => return Err(Abort::Interrupted),
            Err(e) => {
                debug!(intel_id = %task.intel_id(), error = %e, "existence check failed");
                return Err(Abort::fail(
                    ErrorCode::OperationFailure,
                    format!("Failed check resource existence on {}", destination_name),
                ));
            }
        }

        let operation = task.operation();
        match task.info().resource_uri() {
            Some(uri) => {
                let response = source
                    .read_resource(ResourceRequest {
                        metadata: metadata.clone(),
                    })
                    .await
                    .map_err(|e| match e {
                        AdapterError::Interrupted => Abort::Interrupted,
                        e => {
                            debug!(intel_id = %task.intel_id(), error = %e, "failed to read resource");
                            Abort::fail(
                                ErrorCode::OperationFailure,
                                format!("Failed to read resource from {}", source_name),
                            )
                        }
                    })?;
                let created = destination
                    .create_resource(CreateStorageRequest {
                        resources: vec![response.resource],
                    })
                    .await
                    .map_err(|e| match e {
                        AdapterError::Interrupted => Abort::Interrupted,
                        e => {
                            debug!(intel_id = %task.intel_id(), error = %e, "failed to create resource");
                            Abort::fail(
                                ErrorCode::OperationFailure,
                                format!(
                                    "Failed to create resource from {} to {}",
                                    source_name, destination_name
                                ),
                            )
                        }
                    })?;
                if !created {
                    return Err(Abort::fail(
                        ErrorCode::OperationFailure,
                        format!(
                            "Failed to {} resource {} from {} to {}",
                            operation, uri, source_name, destination_name
                        ),
                    ));
                }
            }
            None => {
                debug!(intel_id = %task.intel_id(), "no resource uri, creating metadata only");
                let created = destination
                    .create_request(CreateRequest {
                        metadata: vec![metadata],
                    })
                    .await
                    .map_err(|e| match e {
                        AdapterError::Interrupted => Abort::Interrupted,
                        e => {
                            debug!(intel_id = %task.intel_id(), error = %e, "failed to create metadata");
                            Abort::fail(
                                ErrorCode::OperationFailure,
                                format!("Failed to retrieve metadata from {}", destination_name),
                            )
                        }
                    })?;
                if !created {
                    return Err(Abort::fail(
                        ErrorCode::OperationFailure,
                        format!(
                            "Failed to {} metadata {} from {} to {}",
                            operation,
                            task.intel_id(),
                            source_name,
                            destination_name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn unavailable(adapter: &dyn NodeAdapter) -> Abort {
    let name = adapter.system_name();
    warn!(site = %name, "site unavailable");
    Abort::fail(ErrorCode::SiteUnavailable, format!("Site {} is unavailable", name))
}

/// Only harvests carrying exactly one DDF metadata are handled.
fn supported(task: &Task) -> bool {
    if task.operation() != OperationType::Harvest {
        return false;
    }
    match task.metadatas() {
        [MetadataInfo::Ddf(_)] => true,
        [_, _, ..] => {
            warn!(task_id = %task.id(), "more than one metadata is not supported");
            false
        }
        _ => false,
    }
}

/// Metadata the adapters operate on, built from the task's DDF payload.
fn task_metadata(task: &Task) -> Option<Metadata> {
    let info = task.metadatas().first()?.as_ddf()?;
    let mut metadata = Metadata::new(task.intel_id(), &info.metadata_type, info.last_modified);
    metadata.raw = info.data.clone();
    metadata.metadata_size = info.size;
    if let Some(resource) = task.resource() {
        metadata.resource_modified = Some(resource.last_modified);
        metadata.resource_size = resource.size;
        metadata.resource_uri = resource.uri.clone();
    }
    Some(metadata)
}
