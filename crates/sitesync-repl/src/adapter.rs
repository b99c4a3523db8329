//! Node adapter boundary: the capability the core drives to talk to a site's remote system.
//!
//! Concrete adapters (DDF, Ion, ...) live outside this crate; they are registered by site type
//! with a [`NodeAdapterRegistry`] and created per site URL.

use crate::error::{ReplError, Result};
use crate::filter::Filter;
use crate::site::{Site, SiteType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Tag added to every item written by replication.
pub const REPLICATED_TAG: &str = "replicated";

/// Tag carried by regular catalog entries.
pub const DEFAULT_TAG: &str = "resource";

/// Tag carried by tombstones (version records of deleted entries).
pub const VERSION_TAG: &str = "revision";

/// Errors raised by adapter calls.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    /// The remote call failed.
    #[error("adapter operation failed: {msg}")]
    Failure {
        /// Error message describing the failure.
        msg: String,
    },

    /// The call was interrupted before it could complete.
    #[error("adapter operation interrupted")]
    Interrupted,

    /// The remote system cannot be reached.
    #[error("remote system {system} unavailable")]
    Unavailable {
        /// Name of the unreachable system.
        system: String,
    },
}

impl AdapterError {
    /// Shorthand for a failed operation.
    pub fn failure(msg: impl Into<String>) -> Self {
        AdapterError::Failure { msg: msg.into() }
    }
}

/// Result type of adapter calls.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// A catalog entry moved between sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Identifier of the logical item.
    pub id: String,
    /// Type of the raw payload (e.g. "xml").
    pub metadata_type: String,
    /// Opaque payload.
    pub raw: serde_json::Value,
    /// When the metadata was last modified at its origin.
    pub metadata_modified: DateTime<Utc>,
    /// When the associated resource was last modified, if any.
    pub resource_modified: Option<DateTime<Utc>>,
    /// Location of the associated resource, if any.
    pub resource_uri: Option<String>,
    /// Size in bytes of the associated resource.
    pub resource_size: u64,
    /// Size in bytes of the metadata payload.
    pub metadata_size: u64,
    /// Catalog tags.
    pub tags: Vec<String>,
    /// Names of the sites this item has been replicated through, oldest first.
    pub origins: Vec<String>,
    /// Tombstone marker: the item was deleted at its origin.
    pub deleted: bool,
}

impl Metadata {
    /// Create a live, metadata-only item tagged with [`DEFAULT_TAG`].
    pub fn new(id: &str, metadata_type: &str, modified: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            metadata_type: metadata_type.to_string(),
            raw: serde_json::Value::Null,
            metadata_modified: modified,
            resource_modified: None,
            resource_uri: None,
            resource_size: 0,
            metadata_size: 0,
            tags: vec![DEFAULT_TAG.to_string()],
            origins: Vec::new(),
            deleted: false,
        }
    }

    /// Attach a resource to this item.
    pub fn with_resource(mut self, uri: &str, size: u64, modified: DateTime<Utc>) -> Self {
        self.resource_uri = Some(uri.to_string());
        self.resource_size = size;
        self.resource_modified = Some(modified);
        self
    }

    /// Turn this item into a tombstone recorded at its current modified time.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self.tags = vec![VERSION_TAG.to_string()];
        self
    }

    /// Whether a resource accompanies this item.
    pub fn has_resource(&self) -> bool {
        self.resource_uri.is_some()
    }

    /// Resource modified time, falling back to the metadata modified time.
    pub fn effective_resource_modified(&self) -> DateTime<Utc> {
        self.resource_modified.unwrap_or(self.metadata_modified)
    }

    /// Add a tag unless already present.
    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }
}

/// Binary content attached to an item.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Identifier of the owning item.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
    /// Location the resource was read from.
    pub uri: String,
    /// Content.
    pub data: Bytes,
    /// The owning item.
    pub metadata: Metadata,
}

/// Request to create metadata-only items.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRequest {
    /// Items to create.
    pub metadata: Vec<Metadata>,
}

/// Request to update metadata-only items.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    /// Items to update.
    pub metadata: Vec<Metadata>,
}

/// Request to delete items.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    /// Items to delete.
    pub metadata: Vec<Metadata>,
}

/// Request to create items together with their resources.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateStorageRequest {
    /// Resources to store.
    pub resources: Vec<Resource>,
}

/// Request to update items together with their resources.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStorageRequest {
    /// Resources to store.
    pub resources: Vec<Resource>,
}

/// Request to read the resource of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    /// The item whose resource is wanted.
    pub metadata: Metadata,
}

/// Response to a [`ResourceRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceResponse {
    /// The resource read.
    pub resource: Resource,
}

/// Change-set query sent to a source adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    /// Selection filter.
    pub filter: Filter,
    /// Results must be sorted by metadata modified time, ascending.
    pub sort_ascending_by_modified: bool,
    /// Page size hint.
    pub page_size: usize,
}

/// Result of a change-set query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResponse {
    /// Matching items.
    pub metadata: Vec<Metadata>,
}

/// Operations the core performs against a site's remote system.
#[async_trait]
pub trait NodeAdapter: Send + Sync {
    /// Whether the remote system currently answers.
    async fn is_available(&self) -> bool;

    /// Name of the remote system, used in messages and bookkeeping.
    fn system_name(&self) -> String;

    /// Whether the remote system holds the given item.
    async fn exists(&self, metadata: &Metadata) -> AdapterResult<bool>;

    /// Create metadata-only items.
    async fn create_request(&self, request: CreateRequest) -> AdapterResult<bool>;

    /// Update metadata-only items.
    async fn update_request(&self, request: UpdateRequest) -> AdapterResult<bool>;

    /// Delete items.
    async fn delete_request(&self, request: DeleteRequest) -> AdapterResult<bool>;

    /// Read the resource attached to an item.
    async fn read_resource(&self, request: ResourceRequest) -> AdapterResult<ResourceResponse>;

    /// Create items with their resources.
    async fn create_resource(&self, request: CreateStorageRequest) -> AdapterResult<bool>;

    /// Update items with their resources.
    async fn update_resource(&self, request: UpdateStorageRequest) -> AdapterResult<bool>;

    /// Query the change set.
    async fn query(&self, request: QueryRequest) -> AdapterResult<QueryResponse>;

    /// Release any connection held by this adapter.
    async fn close(&mut self) -> AdapterResult<()>;
}

/// Creates adapters for one site type.
pub trait NodeAdapterFactory: Send + Sync {
    /// Create an adapter connected to the given URL.
    fn create(&self, url: &str) -> AdapterResult<Box<dyn NodeAdapter>>;
}

/// Lookup of adapter factories by site type.
#[derive(Default)]
pub struct NodeAdapterRegistry {
    factories: DashMap<SiteType, Arc<dyn NodeAdapterFactory>>,
}

impl NodeAdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for a site type. Registering a type twice is an error.
    pub fn register(&self, site_type: SiteType, factory: Arc<dyn NodeAdapterFactory>) -> Result<()> {
        match self.factories.entry(site_type) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ReplError::FactoryAlreadyRegistered {
                site_type: site_type.to_string(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(factory);
                Ok(())
            }
        }
    }

    /// Factory for a site type.
    pub fn factory_for(&self, site_type: SiteType) -> Result<Arc<dyn NodeAdapterFactory>> {
        self.factories
            .get(&site_type)
            .map(|f| f.value().clone())
            .ok_or_else(|| ReplError::NoAdapterFactory {
                site_type: site_type.to_string(),
            })
    }

    /// Create an adapter for a site.
    pub fn create(&self, site: &Site) -> Result<Box<dyn NodeAdapter>> {
        let factory = self.factory_for(site.site_type)?;
        Ok(factory.create(&site.url)?)
    }
}

impl std::fmt::Debug for NodeAdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<SiteType> = self.factories.iter().map(|e| *e.key()).collect();
        f.debug_struct("NodeAdapterRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFactory;

    impl NodeAdapterFactory for NoopFactory {
        fn create(&self, url: &str) -> AdapterResult<Box<dyn NodeAdapter>> {
            Err(AdapterError::failure(format!("cannot connect to {}", url)))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = NodeAdapterRegistry::new();
        registry.register(SiteType::Ddf, Arc::new(NoopFactory)).unwrap();
        assert!(registry.factory_for(SiteType::Ddf).is_ok());
        assert!(matches!(
            registry.factory_for(SiteType::Ion),
            Err(ReplError::NoAdapterFactory { .. })
        ));
    }

    #[test]
    fn test_register_twice_fails() {
        let registry = NodeAdapterRegistry::new();
        registry.register(SiteType::Ddf, Arc::new(NoopFactory)).unwrap();
        let second = registry.register(SiteType::Ddf, Arc::new(NoopFactory));
        assert!(matches!(second, Err(ReplError::FactoryAlreadyRegistered { .. })));
    }

    #[test]
    fn test_create_propagates_factory_error() {
        let registry = NodeAdapterRegistry::new();
        registry.register(SiteType::Ddf, Arc::new(NoopFactory)).unwrap();
        let site = Site::new("a", "https://a", SiteType::Ddf, crate::site::SiteKind::Regional);
        assert!(matches!(
            registry.create(&site),
            Err(ReplError::Adapter(AdapterError::Failure { .. }))
        ));
    }

    #[test]
    fn test_metadata_helpers() {
        let now = Utc::now();
        let mut m = Metadata::new("id", "xml", now);
        assert!(!m.has_resource());
        assert_eq!(m.effective_resource_modified(), now);
        m.add_tag(REPLICATED_TAG);
        m.add_tag(REPLICATED_TAG);
        assert_eq!(m.tags, vec![DEFAULT_TAG.to_string(), REPLICATED_TAG.to_string()]);
        let m = m.with_resource("file:/x", 10, now).deleted();
        assert!(m.has_resource());
        assert!(m.deleted);
        assert_eq!(m.tags, vec![VERSION_TAG.to_string()]);
    }
}
