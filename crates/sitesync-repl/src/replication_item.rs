//! Bookkeeping of what a sweep last replicated for each item.

use crate::error::{ReplError, Result};
use crate::persistable::{require_non_empty, Persistable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PERSISTABLE_KIND: &str = "replication item";

/// Last known replicated state of one item between one source and one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationItem {
    /// Record id.
    pub id: Uuid,
    /// Identifier of the replicated item.
    pub metadata_id: String,
    /// Resource modified time that was last replicated.
    pub resource_modified: DateTime<Utc>,
    /// Metadata modified time that was last replicated.
    pub metadata_modified: DateTime<Utc>,
    /// Source system name.
    pub source: String,
    /// Destination system name.
    pub destination: String,
    /// Replicator config the record belongs to.
    pub config_id: String,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
}

impl ReplicationItem {
    /// Create a record with no failures.
    pub fn new(
        metadata_id: &str,
        resource_modified: DateTime<Utc>,
        metadata_modified: DateTime<Utc>,
        source: &str,
        destination: &str,
        config_id: &str,
    ) -> Self {
        Self {
            id: Persistable::new(PERSISTABLE_KIND).id,
            metadata_id: metadata_id.to_string(),
            resource_modified,
            metadata_modified,
            source: source.to_string(),
            destination: destination.to_string(),
            config_id: config_id.to_string(),
            failure_count: 0,
        }
    }

    /// Builder-style failure count setter.
    pub fn with_failure_count(mut self, failure_count: u32) -> Self {
        self.failure_count = failure_count;
        self
    }

    /// Record another failure.
    pub fn increment_failure_count(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
    }

    /// Check the fields a store requires.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("metadata_id", &self.metadata_id)?;
        require_non_empty("source", &self.source)?;
        require_non_empty("destination", &self.destination)?;
        require_non_empty("config_id", &self.config_id)
    }

    fn key(&self) -> ItemKey {
        ItemKey::new(&self.metadata_id, &self.source, &self.destination)
    }
}

/// Persistence contract for replication items.
#[async_trait]
pub trait ReplicationItemStore: Send + Sync {
    /// Record for an item between a source and a destination.
    async fn get_item(
        &self,
        metadata_id: &str,
        source: &str,
        destination: &str,
    ) -> Result<Option<ReplicationItem>>;

    /// Records belonging to a config, paged.
    async fn items_for_config(
        &self,
        config_id: &str,
        start_index: usize,
        page_size: usize,
    ) -> Result<Vec<ReplicationItem>>;

    /// Insert or replace a record.
    async fn save_item(&self, item: ReplicationItem) -> Result<()>;

    /// Delete the record for an item between a source and a destination.
    async fn delete_item(&self, metadata_id: &str, source: &str, destination: &str) -> Result<()>;

    /// Delete every record of a config.
    async fn delete_items_for_config(&self, config_id: &str) -> Result<()>;

    /// Ids of items that failed at least once but fewer than `limit` times.
    async fn get_failure_list(
        &self,
        limit: u32,
        source: &str,
        destination: &str,
    ) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ItemKey {
    metadata_id: String,
    source: String,
    destination: String,
}

impl ItemKey {
    fn new(metadata_id: &str, source: &str, destination: &str) -> Self {
        Self {
            metadata_id: metadata_id.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
        }
    }
}

/// Replication item store held in memory.
#[derive(Debug, Default)]
pub struct InMemoryReplicationItemStore {
    items: DashMap<ItemKey, ReplicationItem>,
}

impl InMemoryReplicationItemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every record.
    pub fn clear(&self) {
        self.items.clear();
    }
}

#[async_trait]
impl ReplicationItemStore for InMemoryReplicationItemStore {
    async fn get_item(
        &self,
        metadata_id: &str,
        source: &str,
        destination: &str,
    ) -> Result<Option<ReplicationItem>> {
        let key = ItemKey::new(metadata_id, source, destination);
        Ok(self.items.get(&key).map(|item| item.clone()))
    }

    async fn items_for_config(
        &self,
        config_id: &str,
        start_index: usize,
        page_size: usize,
    ) -> Result<Vec<ReplicationItem>> {
        let mut items: Vec<ReplicationItem> = self
            .items
            .iter()
            .filter(|e| e.value().config_id == config_id)
            .map(|e| e.value().clone())
            .collect();
        items.sort_by(|a, b| a.metadata_id.cmp(&b.metadata_id));
        Ok(items.into_iter().skip(start_index).take(page_size).collect())
    }

    async fn save_item(&self, item: ReplicationItem) -> Result<()> {
        item.validate()?;
        self.items.insert(item.key(), item);
        Ok(())
    }

    async fn delete_item(&self, metadata_id: &str, source: &str, destination: &str) -> Result<()> {
        let key = ItemKey::new(metadata_id, source, destination);
        self.items
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| ReplError::NotFound {
                kind: PERSISTABLE_KIND,
                id: metadata_id.to_string(),
            })
    }

    async fn delete_items_for_config(&self, config_id: &str) -> Result<()> {
        self.items.retain(|_, item| item.config_id != config_id);
        Ok(())
    }

    async fn get_failure_list(
        &self,
        limit: u32,
        source: &str,
        destination: &str,
    ) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .items
            .iter()
            .map(|e| e.value().clone())
            .filter(|item| {
                item.source == source
                    && item.destination == destination
                    && item.failure_count > 0
                    && item.failure_count < limit
            })
            .map(|item| item.metadata_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
