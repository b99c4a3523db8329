//! Common test utilities: an in-process site whose adapters record every call.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use sitesync_repl::sync::SyncCancel;
use sitesync_repl::adapter::{
    AdapterError, AdapterResult, CreateRequest, CreateStorageRequest, DeleteRequest, Metadata,
    NodeAdapter, NodeAdapterFactory, QueryRequest, QueryResponse, Resource, ResourceRequest,
    ResourceResponse, UpdateRequest, UpdateStorageRequest,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Fixed point in time, `secs` after the epoch.
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

/// Shared state of one fake site. Every adapter created for it sees the same catalog.
pub struct MockSite {
    name: String,
    available: AtomicBool,
    catalog: Mutex<Vec<Metadata>>,
    calls: Mutex<Vec<String>>,
    closed: AtomicUsize,
    /// Result of `exists` when the item is not in the catalog: `None` means "look it up".
    exists_override: Mutex<Option<AdapterResult<bool>>>,
    /// Result of create/update/delete calls.
    writes_succeed: AtomicBool,
    /// Error returned by every write call, when set.
    write_error: Mutex<Option<AdapterError>>,
    /// Drop availability after this many writes.
    fail_after_writes: Mutex<Option<usize>>,
    writes: AtomicUsize,
    /// Cancelled by the first write.
    cancel_on_write: Mutex<Option<SyncCancel>>,
    /// Error returned by `query`, when set.
    query_error: Mutex<Option<AdapterError>>,
}

impl MockSite {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            available: AtomicBool::new(true),
            catalog: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
            exists_override: Mutex::new(None),
            writes_succeed: AtomicBool::new(true),
            write_error: Mutex::new(None),
            fail_after_writes: Mutex::new(None),
            writes: AtomicUsize::new(0),
            cancel_on_write: Mutex::new(None),
            query_error: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_exists(&self, result: Option<AdapterResult<bool>>) {
        *self.exists_override.lock() = result;
    }

    pub fn set_writes_succeed(&self, ok: bool) {
        self.writes_succeed.store(ok, Ordering::SeqCst);
    }

    pub fn set_write_error(&self, error: Option<AdapterError>) {
        *self.write_error.lock() = error;
    }

    pub fn go_down_after_writes(&self, writes: usize) {
        *self.fail_after_writes.lock() = Some(writes);
    }

    pub fn cancel_on_write(&self, cancel: SyncCancel) {
        *self.cancel_on_write.lock() = Some(cancel);
    }

    pub fn set_query_error(&self, error: Option<AdapterError>) {
        *self.query_error.lock() = error;
    }

    /// Add or replace an item.
    pub fn put(&self, metadata: Metadata) {
        let mut catalog = self.catalog.lock();
        catalog.retain(|m| m.id != metadata.id);
        catalog.push(metadata);
    }

    pub fn get(&self, id: &str) -> Option<Metadata> {
        self.catalog.lock().iter().find(|m| m.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.catalog.lock().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_named(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(op)).count()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn write(&self, op: &str, items: Vec<Metadata>, delete: bool) -> AdapterResult<bool> {
        for m in &items {
            self.record(format!("{} {}", op, m.id));
        }
        if let Some(cancel) = self.cancel_on_write.lock().take() {
            cancel.cancel();
        }
        if let Some(e) = self.write_error.lock().clone() {
            return Err(e);
        }
        let done = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = *self.fail_after_writes.lock() {
            if done > limit {
                self.set_available(false);
                return Err(AdapterError::Unavailable {
                    system: self.name.clone(),
                });
            }
        }
        if !self.writes_succeed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        for m in items {
            if delete {
                self.catalog.lock().retain(|c| c.id != m.id);
            } else {
                self.put(m);
            }
        }
        Ok(true)
    }
}

/// Adapter handle onto a [`MockSite`].
pub struct MockAdapter {
    site: Arc<MockSite>,
}

#[async_trait]
impl NodeAdapter for MockAdapter {
    async fn is_available(&self) -> bool {
        self.site.available.load(Ordering::SeqCst)
    }

    fn system_name(&self) -> String {
        self.site.name.clone()
    }

    async fn exists(&self, metadata: &Metadata) -> AdapterResult<bool> {
        self.site.record(format!("exists {}", metadata.id));
        if let Some(result) = self.site.exists_override.lock().clone() {
            return result;
        }
        Ok(self.site.get(&metadata.id).is_some())
    }

    async fn create_request(&self, request: CreateRequest) -> AdapterResult<bool> {
        self.site.write("create", request.metadata, false)
    }

    async fn update_request(&self, request: UpdateRequest) -> AdapterResult<bool> {
        self.site.write("update", request.metadata, false)
    }

    async fn delete_request(&self, request: DeleteRequest) -> AdapterResult<bool> {
        self.site.write("delete", request.metadata, true)
    }

    async fn read_resource(&self, request: ResourceRequest) -> AdapterResult<ResourceResponse> {
        let metadata = request.metadata;
        self.site.record(format!("read {}", metadata.id));
        let data = Bytes::from(vec![0u8; metadata.resource_size as usize]);
        Ok(ResourceResponse {
            resource: Resource {
                id: metadata.id.clone(),
                name: format!("{}.bin", metadata.id),
                mime_type: "application/octet-stream".to_string(),
                size: metadata.resource_size,
                uri: metadata.resource_uri.clone().unwrap_or_default(),
                data,
                metadata,
            },
        })
    }

    async fn create_resource(&self, request: CreateStorageRequest) -> AdapterResult<bool> {
        let items = request.resources.into_iter().map(|r| r.metadata).collect();
        self.site.write("create_resource", items, false)
    }

    async fn update_resource(&self, request: UpdateStorageRequest) -> AdapterResult<bool> {
        let items = request.resources.into_iter().map(|r| r.metadata).collect();
        self.site.write("update_resource", items, false)
    }

    async fn query(&self, request: QueryRequest) -> AdapterResult<QueryResponse> {
        self.site.record("query".to_string());
        if !self.site.available.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable {
                system: self.site.name.clone(),
            });
        }
        if let Some(e) = self.site.query_error.lock().clone() {
            return Err(e);
        }
        let mut metadata: Vec<Metadata> = self
            .site
            .catalog
            .lock()
            .iter()
            .filter(|m| request.filter.matches(m))
            .cloned()
            .collect();
        metadata.sort_by_key(|m| m.metadata_modified);
        Ok(QueryResponse { metadata })
    }

    async fn close(&mut self) -> AdapterResult<()> {
        self.site.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory resolving site URLs to registered [`MockSite`]s.
#[derive(Default)]
pub struct MockFactory {
    sites: Mutex<HashMap<String, Arc<MockSite>>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, url: &str, site: Arc<MockSite>) {
        self.sites.lock().insert(url.to_string(), site);
    }

    pub fn adapter(site: &Arc<MockSite>) -> MockAdapter {
        MockAdapter { site: site.clone() }
    }
}

impl NodeAdapterFactory for MockFactory {
    fn create(&self, url: &str) -> AdapterResult<Box<dyn NodeAdapter>> {
        match self.sites.lock().get(url) {
            Some(site) => Ok(Box::new(MockAdapter { site: site.clone() })),
            None => Err(AdapterError::failure(format!("no site at {}", url))),
        }
    }
}
