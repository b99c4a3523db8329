//! Lookup of per-site queues.

use crate::clock::Clock;
use crate::queue::SiteQueue;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Creates each site's queue on first use and hands out the same queue afterwards.
pub struct QueueBroker {
    capacity: usize,
    clock: Arc<dyn Clock>,
    queues: DashMap<String, Arc<SiteQueue>>,
}

impl QueueBroker {
    /// Create a broker whose queues hold up to `capacity` tasks each.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            clock,
            queues: DashMap::new(),
        }
    }

    /// Queue for a site, created when missing.
    pub fn site_queue(&self, site_id: &str) -> Arc<SiteQueue> {
        self.queues
            .entry(site_id.to_string())
            .or_insert_with(|| {
                info!(site_id = %site_id, capacity = self.capacity, "creating site queue");
                SiteQueue::new(site_id, self.capacity, self.clock.clone())
            })
            .clone()
    }

    /// Queue for a site, if one was created.
    pub fn get(&self, site_id: &str) -> Option<Arc<SiteQueue>> {
        self.queues.get(site_id).map(|q| q.value().clone())
    }

    /// Sites with a queue, sorted.
    pub fn sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        sites.sort();
        sites
    }

    /// All queues.
    pub fn queues(&self) -> Vec<Arc<SiteQueue>> {
        self.queues.iter().map(|e| e.value().clone()).collect()
    }
}

impl std::fmt::Debug for QueueBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBroker")
            .field("capacity", &self.capacity)
            .field("sites", &self.sites())
            .finish()
    }
}
