//! Change detection between two sites.
//!
//! A [`SyncJob`] queries the source for everything that changed since the last successful run of
//! its replicator (plus items that failed before and may be retried), then creates, updates or
//! deletes each one at the destination in ascending modification order. Every processed item
//! leaves a [`ReplicationItem`] behind so the next sweep can tell what is already there.

use crate::adapter::{
    AdapterError, CreateRequest, CreateStorageRequest, DeleteRequest, Metadata, NodeAdapter,
    QueryRequest, ResourceRequest, UpdateRequest, UpdateStorageRequest, DEFAULT_TAG,
    REPLICATED_TAG, VERSION_TAG,
};
use crate::config::ReplicatorConfig;
use crate::error::{ReplError, Result};
use crate::filter::{self, Filter};
use crate::replication_item::{ReplicationItem, ReplicationItemStore};
use crate::status::{ReplicatorHistory, Status};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Page size hint sent with change-set queries.
pub const QUERY_PAGE_SIZE: usize = 100;

/// Outcome of one sweep in one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    /// Items created, updated or deleted at the destination.
    pub items_replicated: u64,
    /// Items that failed.
    pub items_failed: u64,
    /// Resource bytes moved.
    pub bytes_transferred: u64,
    /// `Success`, `Canceled`, `ConnectionLost`, or `Failure` when the change set could not be read.
    pub status: Status,
    /// Newest metadata modified time processed, unless the sweep was cancelled.
    pub last_metadata_modified: Option<DateTime<Utc>>,
}

/// Cooperative cancellation for a running sweep, checked between items.
#[derive(Debug, Clone, Default)]
pub struct SyncCancel(Arc<AtomicBool>);

impl SyncCancel {
    /// A handle that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sweep to stop after the item in flight.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Creates sweeps sharing one bookkeeping store and one history.
#[derive(Clone)]
pub struct Syncer {
    items: Arc<dyn ReplicationItemStore>,
    history: Arc<dyn ReplicatorHistory>,
}

impl Syncer {
    /// Create a syncer.
    pub fn new(items: Arc<dyn ReplicationItemStore>, history: Arc<dyn ReplicatorHistory>) -> Self {
        Self { items, history }
    }

    /// Prepare a sweep from `source` to `destination`. Call [`SyncJob::sync`] to run it.
    pub fn create<'a>(
        &self,
        source: &'a dyn NodeAdapter,
        destination: &'a dyn NodeAdapter,
        config: &'a ReplicatorConfig,
    ) -> SyncJob<'a> {
        SyncJob {
            source_name: source.system_name(),
            destination_name: destination.system_name(),
            source,
            destination,
            config,
            items: self.items.clone(),
            history: self.history.clone(),
            cancel: SyncCancel::new(),
            replicated: 0,
            failed: 0,
            bytes: 0,
        }
    }
}

/// Why processing one item stopped.
#[derive(Debug)]
enum ItemError {
    /// An adapter call failed.
    Adapter(AdapterError),
    /// The destination refused the change.
    Rejected(&'static str),
    /// Bookkeeping could not be read or written.
    Store(ReplError),
}

impl From<AdapterError> for ItemError {
    fn from(e: AdapterError) -> Self {
        ItemError::Adapter(e)
    }
}

impl From<ReplError> for ItemError {
    fn from(e: ReplError) -> Self {
        ItemError::Store(e)
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemError::Adapter(e) => write!(f, "{}", e),
            ItemError::Rejected(op) => write!(f, "{} rejected by destination", op),
            ItemError::Store(e) => write!(f, "bookkeeping failed: {}", e),
        }
    }
}

/// One sweep between a source and a destination.
pub struct SyncJob<'a> {
    source: &'a dyn NodeAdapter,
    destination: &'a dyn NodeAdapter,
    source_name: String,
    destination_name: String,
    config: &'a ReplicatorConfig,
    items: Arc<dyn ReplicationItemStore>,
    history: Arc<dyn ReplicatorHistory>,
    cancel: SyncCancel,
    replicated: u64,
    failed: u64,
    bytes: u64,
}

impl<'a> SyncJob<'a> {
    /// Handle that cancels this sweep.
    pub fn cancel_handle(&self) -> SyncCancel {
        self.cancel.clone()
    }

    /// Use an existing cancellation handle.
    pub fn with_cancel(mut self, cancel: SyncCancel) -> Self {
        self.cancel = cancel;
        self
    }

    /// Selection for this sweep: the replicator's filter, restricted to items that did not come
    /// from the destination and changed since the last successful run, or tombstones recorded
    /// since then, or items on the failure list.
    pub async fn build_filter(&self) -> Result<Filter> {
        let cql = Filter::cql(&self.config.filter)?;
        let mut basic = vec![
            Filter::not(Filter::equals(filter::ORIGINS, self.destination_name.clone())),
            Filter::equals(filter::TAGS, DEFAULT_TAG),
        ];

        let mut selection = match self.history.last_successful(&self.config.name).await? {
            Some(run) => {
                // back off a second to catch changes landing on the boundary
                let since = run.watermark() - Duration::seconds(1);
                basic.push(Filter::after(filter::MODIFIED, since));
                let tombstones = vec![
                    Filter::after(filter::VERSIONED_ON, since),
                    Filter::equals(filter::TAGS, VERSION_TAG),
                    Filter::like(filter::VERSION_ACTION, "Deleted*"),
                ];
                Filter::All(vec![
                    cql,
                    Filter::Any(vec![Filter::All(basic), Filter::All(tombstones)]),
                ])
            }
            None => {
                basic.push(cql);
                Filter::All(basic)
            }
        };

        let failed = self
            .items
            .get_failure_list(
                self.config.failure_retry_count,
                &self.source_name,
                &self.destination_name,
            )
            .await?;
        if !failed.is_empty() {
            let retries = failed
                .into_iter()
                .map(|id| Filter::equals(filter::ID, id))
                .collect();
            selection = Filter::Any(vec![selection, Filter::Any(retries)]);
        }
        Ok(selection)
    }

    /// Run the sweep. Errors are returned only when the change set cannot be computed; item
    /// failures are counted and recorded instead.
    pub async fn sync(mut self) -> Result<SyncResponse> {
        let filter = self.build_filter().await?;
        info!(
            replicator = %self.config.name,
            source = %self.source_name,
            destination = %self.destination_name,
            "starting sweep"
        );

        let mut change_set = match self
            .source
            .query(QueryRequest {
                filter,
                sort_ascending_by_modified: true,
                page_size: QUERY_PAGE_SIZE,
            })
            .await
        {
            Ok(response) => response.metadata,
            Err(e) => {
                let e = ItemError::Adapter(e);
                let status = if self.connection_lost(&e).await {
                    Status::ConnectionLost
                } else {
                    Status::Failure
                };
                warn!(replicator = %self.config.name, source = %self.source_name, error = %e, status = ?status, "change-set query failed");
                return Ok(self.response(status, None));
            }
        };
        change_set.sort_by_key(|m| m.metadata_modified);

        let mut newest: Option<DateTime<Utc>> = None;
        for metadata in change_set {
            if self.cancel.is_cancelled() {
                break;
            }
            let modified = metadata.metadata_modified;
            let id = metadata.id.clone();

            let existing = match self.replication_item(&id).await {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(metadata_id = %id, error = %e, "failed to read bookkeeping");
                    self.failed += 1;
                    continue;
                }
            };

            if let Err(e) = self.process(metadata.clone(), existing.clone()).await {
                if matches!(e, ItemError::Adapter(AdapterError::Interrupted)) {
                    debug!(metadata_id = %id, "sweep interrupted");
                    self.cancel.cancel();
                    break;
                }
                if self.connection_lost(&e).await {
                    warn!(
                        replicator = %self.config.name,
                        source = %self.source_name,
                        destination = %self.destination_name,
                        "connection lost, aborting sweep"
                    );
                    return Ok(self.response(Status::ConnectionLost, None));
                }
                debug!(metadata_id = %id, error = %e, "failed to replicate item");
                self.record_failure(&metadata, existing).await;
            }

            if newest.map_or(true, |n| modified > n) {
                newest = Some(modified);
            }
        }

        let response = if self.cancel.is_cancelled() {
            self.response(Status::Canceled, None)
        } else {
            self.response(Status::Success, newest)
        };
        info!(
            replicator = %self.config.name,
            status = ?response.status,
            replicated = response.items_replicated,
            failed = response.items_failed,
            bytes = response.bytes_transferred,
            "sweep finished"
        );
        Ok(response)
    }

    fn response(&self, status: Status, newest: Option<DateTime<Utc>>) -> SyncResponse {
        SyncResponse {
            items_replicated: self.replicated,
            items_failed: self.failed,
            bytes_transferred: self.bytes,
            status,
            last_metadata_modified: newest,
        }
    }

    async fn connection_lost(&self, e: &ItemError) -> bool {
        matches!(e, ItemError::Adapter(AdapterError::Unavailable { .. }))
            || !self.source.is_available().await
            || !self.destination.is_available().await
    }

    /// Bookkeeping for an item in this direction, taking the newer modified times of the record
    /// kept for the opposite direction so items do not bounce back.
    async fn replication_item(&self, metadata_id: &str) -> Result<Option<ReplicationItem>> {
        let forward = self
            .items
            .get_item(metadata_id, &self.source_name, &self.destination_name)
            .await?;
        let reverse = self
            .items
            .get_item(metadata_id, &self.destination_name, &self.source_name)
            .await?;

        Ok(match (forward, reverse) {
            (None, None) => None,
            (Some(item), None) => Some(item),
            (Some(item), Some(rev)) if item.metadata_modified >= rev.metadata_modified => Some(item),
            (Some(item), Some(rev)) => Some(ReplicationItem {
                resource_modified: rev.resource_modified,
                metadata_modified: rev.metadata_modified,
                ..item
            }),
            (None, Some(rev)) => Some(ReplicationItem::new(
                metadata_id,
                rev.resource_modified,
                rev.metadata_modified,
                &self.source_name,
                &self.destination_name,
                &self.config.id,
            )),
        })
    }

    async fn process(
        &mut self,
        metadata: Metadata,
        existing: Option<ReplicationItem>,
    ) -> std::result::Result<(), ItemError> {
        if metadata.deleted {
            return match existing {
                Some(_) => self.delete(metadata).await,
                None => {
                    trace!(metadata_id = %metadata.id, "no bookkeeping for deleted item, nothing to delete");
                    Ok(())
                }
            };
        }

        let at_destination = self.destination.exists(&metadata).await?;
        match existing {
            Some(item) if at_destination => self.update(metadata, item).await,
            existing => self.create(metadata, existing).await,
        }
    }

    async fn delete(&mut self, metadata: Metadata) -> std::result::Result<(), ItemError> {
        let id = metadata.id.clone();
        debug!(metadata_id = %id, source = %self.source_name, destination = %self.destination_name, "sending delete");

        let deleted = match self
            .destination
            .delete_request(DeleteRequest {
                metadata: vec![metadata],
            })
            .await
        {
            Ok(deleted) => deleted,
            Err(AdapterError::Interrupted) => return Err(AdapterError::Interrupted.into()),
            Err(e) => {
                let e = ItemError::Adapter(e);
                if self.connection_lost(&e).await {
                    return Err(e);
                }
                debug!(metadata_id = %id, error = %e, "delete failed");
                false
            }
        };

        if !deleted {
            self.record_delete_failure(&id).await;
            return Ok(());
        }
        match self
            .items
            .delete_item(&id, &self.source_name, &self.destination_name)
            .await
        {
            Ok(()) | Err(ReplError::NotFound { .. }) => {}
            Err(e) => warn!(metadata_id = %id, error = %e, "failed to remove bookkeeping"),
        }
        self.replicated += 1;
        Ok(())
    }

    async fn update(
        &mut self,
        mut metadata: Metadata,
        item: ReplicationItem,
    ) -> std::result::Result<(), ItemError> {
        let retrying = item.failure_count > 0;
        let update_resource = metadata.has_resource()
            && (metadata.effective_resource_modified() > item.resource_modified || retrying);
        let update_metadata = metadata.metadata_modified > item.metadata_modified || retrying;

        if !update_resource && !update_metadata {
            trace!(metadata_id = %metadata.id, "unchanged since last replication, skipping");
            return Ok(());
        }
        self.add_tags_and_lineage(&mut metadata);

        if update_resource {
            let response = self
                .source
                .read_resource(ResourceRequest {
                    metadata: metadata.clone(),
                })
                .await?;
            debug!(metadata_id = %metadata.id, "sending resource update");
            if !self
                .destination
                .update_resource(UpdateStorageRequest {
                    resources: vec![response.resource],
                })
                .await?
            {
                return Err(ItemError::Rejected("resource update"));
            }
            self.bytes += metadata.resource_size;
        } else {
            debug!(metadata_id = %metadata.id, "sending metadata update");
            if !self
                .destination
                .update_request(UpdateRequest {
                    metadata: vec![metadata.clone()],
                })
                .await?
            {
                return Err(ItemError::Rejected("metadata update"));
            }
        }
        self.record_success(&metadata, Some(item)).await
    }

    async fn create(
        &mut self,
        mut metadata: Metadata,
        existing: Option<ReplicationItem>,
    ) -> std::result::Result<(), ItemError> {
        self.add_tags_and_lineage(&mut metadata);

        if metadata.has_resource() {
            let response = self
                .source
                .read_resource(ResourceRequest {
                    metadata: metadata.clone(),
                })
                .await?;
            debug!(metadata_id = %metadata.id, "sending resource create");
            if !self
                .destination
                .create_resource(CreateStorageRequest {
                    resources: vec![response.resource],
                })
                .await?
            {
                return Err(ItemError::Rejected("resource create"));
            }
            self.bytes += metadata.resource_size;
        } else {
            debug!(metadata_id = %metadata.id, "sending metadata create");
            if !self
                .destination
                .create_request(CreateRequest {
                    metadata: vec![metadata.clone()],
                })
                .await?
            {
                return Err(ItemError::Rejected("metadata create"));
            }
        }
        self.record_success(&metadata, existing).await
    }

    /// Append the source to the item's lineage, dropping the destination and anything after it,
    /// and tag the item as replicated.
    fn add_tags_and_lineage(&self, metadata: &mut Metadata) {
        metadata.origins.push(self.source_name.clone());
        if let Some(pos) = metadata
            .origins
            .iter()
            .position(|o| *o == self.destination_name)
        {
            metadata.origins.truncate(pos);
        }
        metadata.add_tag(REPLICATED_TAG);
    }

    fn bookkeeping_for(
        &self,
        metadata: &Metadata,
        existing: Option<ReplicationItem>,
    ) -> ReplicationItem {
        let mut item = ReplicationItem::new(
            &metadata.id,
            metadata.effective_resource_modified(),
            metadata.metadata_modified,
            &self.source_name,
            &self.destination_name,
            &self.config.id,
        );
        if let Some(existing) = existing {
            item.id = existing.id;
            item.failure_count = existing.failure_count;
        }
        item
    }

    async fn record_success(
        &mut self,
        metadata: &Metadata,
        existing: Option<ReplicationItem>,
    ) -> std::result::Result<(), ItemError> {
        let item = self.bookkeeping_for(metadata, existing).with_failure_count(0);
        self.items.save_item(item).await?;
        self.replicated += 1;
        Ok(())
    }

    /// Count a failed delete against the item's existing record, which puts the tombstone on the
    /// failure list of the next sweep. No record is created.
    async fn record_delete_failure(&mut self, metadata_id: &str) {
        self.failed += 1;
        let existing = self
            .items
            .get_item(metadata_id, &self.source_name, &self.destination_name)
            .await;
        match existing {
            Ok(Some(mut item)) => {
                item.increment_failure_count();
                if let Err(e) = self.items.save_item(item).await {
                    warn!(metadata_id, error = %e, "failed to record delete failure");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(metadata_id, error = %e, "failed to read bookkeeping"),
        }
    }

    async fn record_failure(&mut self, metadata: &Metadata, existing: Option<ReplicationItem>) {
        self.failed += 1;
        let mut item = match existing {
            Some(item) => item,
            None => self.bookkeeping_for(metadata, None),
        };
        item.increment_failure_count();
        if let Err(e) = self.items.save_item(item).await {
            warn!(metadata_id = %metadata.id, error = %e, "failed to record item failure");
        }
    }
}
