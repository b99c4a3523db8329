//! Configuration for the replication subsystem.

use crate::error::{ReplError, Result};
use crate::filter::validate_cql;
use crate::persistable::require_non_empty;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Node-wide replication settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationProperties {
    /// Id of the site this node runs as.
    pub local_site: String,
    /// Sites allowed to get workers. Empty means every known site.
    pub sites: Vec<String>,
    /// Capacity of each site queue.
    pub queue_capacity: usize,
    /// Seconds between site reconciliation passes.
    pub monitor_period_secs: u64,
    /// Seconds between replicator sweeps.
    pub sync_period_secs: u64,
    /// Milliseconds a worker waits after putting back a task it could not handle.
    pub unlock_backoff_ms: u64,
    /// Sweep-driven replicators.
    pub replicators: Vec<ReplicatorConfig>,
}

impl Default for ReplicationProperties {
    fn default() -> Self {
        Self {
            local_site: String::new(),
            sites: Vec::new(),
            queue_capacity: 1000,
            monitor_period_secs: 30,
            sync_period_secs: 300,
            unlock_backoff_ms: 1000,
            replicators: Vec::new(),
        }
    }
}

impl ReplicationProperties {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(ReplError::Config {
                msg: format!("unsupported config file extension: {}", ext),
            }),
        }
    }

    /// Whether a site passes the allow-list.
    pub fn is_site_allowed(&self, site_id: &str) -> bool {
        self.sites.is_empty() || self.sites.iter().any(|s| s == site_id)
    }

    /// Reconciliation period.
    pub fn monitor_period(&self) -> Duration {
        Duration::from_secs(self.monitor_period_secs.max(1))
    }

    /// Sweep period.
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs.max(1))
    }

    /// Worker back-off after an unlock.
    pub fn unlock_backoff(&self) -> Duration {
        Duration::from_millis(self.unlock_backoff_ms)
    }

    /// Check the settings and every replicator config.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("local_site", &self.local_site)?;
        if self.queue_capacity == 0 {
            return Err(ReplError::Config {
                msg: "queue_capacity must be at least 1".to_string(),
            });
        }
        for replicator in &self.replicators {
            replicator.validate()?;
        }
        Ok(())
    }
}

fn default_failure_retry_count() -> u32 {
    5
}

/// A sweep-driven replication between two sites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Config id.
    pub id: String,
    /// Display name; history is kept by name.
    pub name: String,
    /// Source site id.
    pub source: String,
    /// Destination site id.
    pub destination: String,
    /// CQL selecting the items to replicate.
    pub filter: String,
    /// Also replicate from the destination back to the source.
    #[serde(default)]
    pub bidirectional: bool,
    /// Failed items are retried until they failed this many times.
    #[serde(default = "default_failure_retry_count")]
    pub failure_retry_count: u32,
    /// Skipped by the scheduler while set.
    #[serde(default)]
    pub suspended: bool,
    /// Free text.
    #[serde(default)]
    pub description: Option<String>,
}

impl ReplicatorConfig {
    /// A one-way config with default retry count.
    pub fn new(id: &str, name: &str, source: &str, destination: &str, filter: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            filter: filter.to_string(),
            bidirectional: false,
            failure_retry_count: default_failure_retry_count(),
            suspended: false,
            description: None,
        }
    }

    /// Reject empty ids and malformed filters.
    pub fn validate(&self) -> Result<()> {
        require_non_empty("id", &self.id)?;
        require_non_empty("name", &self.name)?;
        require_non_empty("source", &self.source)?;
        require_non_empty("destination", &self.destination)?;
        if self.source == self.destination {
            return Err(ReplError::InvalidField {
                field: "destination",
                msg: "must differ from source".to_string(),
            });
        }
        validate_cql(&self.filter)
    }
}
