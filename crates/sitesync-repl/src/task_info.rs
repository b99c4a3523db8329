//! Immutable descriptions of replication work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lowest task priority.
pub const MIN_PRIORITY: u8 = 0;
/// Highest task priority.
pub const MAX_PRIORITY: u8 = 9;

/// Operation a task asks a worker to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    /// Pull an item from the remote site into the local site.
    Harvest,
    /// Push an item to the remote site.
    ReplicateTo,
    /// Pull an item from the remote site on its behalf.
    ReplicateFrom,
    /// Delete an item.
    Delete,
    /// Unrecognized operation read from storage.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationType::Harvest => "HARVEST",
            OperationType::ReplicateTo => "REPLICATE_TO",
            OperationType::ReplicateFrom => "REPLICATE_FROM",
            OperationType::Delete => "DELETE",
            OperationType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Resource attached to the item a task moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Where the resource can be read, when known.
    pub uri: Option<String>,
    /// When the resource was last modified.
    pub last_modified: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

/// Metadata carried by a DDF catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdfMetadataInfo {
    /// Type of the metadata payload.
    pub metadata_type: String,
    /// When the metadata was last modified.
    pub last_modified: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
    /// Class name of the payload at its origin.
    pub data_class: String,
    /// The payload itself.
    pub data: serde_json::Value,
}

/// Metadata variants a task may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MetadataInfo {
    /// DDF metadata.
    #[serde(rename = "ddf")]
    Ddf(DdfMetadataInfo),
    /// Variant written by a newer build; kept opaque.
    #[serde(other)]
    Unknown,
}

impl MetadataInfo {
    /// Metadata type, if known.
    pub fn metadata_type(&self) -> Option<&str> {
        match self {
            MetadataInfo::Ddf(info) => Some(&info.metadata_type),
            MetadataInfo::Unknown => None,
        }
    }

    /// Last modified time, if known.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        match self {
            MetadataInfo::Ddf(info) => Some(info.last_modified),
            MetadataInfo::Unknown => None,
        }
    }

    /// The DDF payload, if this is one.
    pub fn as_ddf(&self) -> Option<&DdfMetadataInfo> {
        match self {
            MetadataInfo::Ddf(info) => Some(info),
            MetadataInfo::Unknown => None,
        }
    }
}

/// Immutable description of one unit of replication work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Identifies the logical item.
    pub intel_id: String,
    /// Requested priority before clamping.
    priority: i32,
    /// What to do with the item.
    pub operation: OperationType,
    /// When the item was last modified.
    pub last_modified: DateTime<Utc>,
    /// Resource accompanying the item, if any.
    #[serde(default)]
    pub resource: Option<ResourceInfo>,
    /// Metadata accompanying the item, in order.
    #[serde(default)]
    pub metadatas: Vec<MetadataInfo>,
}

impl TaskInfo {
    /// Describe an operation on an item.
    pub fn new(
        intel_id: &str,
        priority: i32,
        operation: OperationType,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            intel_id: intel_id.to_string(),
            priority,
            operation,
            last_modified,
            resource: None,
            metadatas: Vec::new(),
        }
    }

    /// Builder-style resource setter.
    pub fn with_resource(mut self, resource: ResourceInfo) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Builder-style metadata append.
    pub fn with_metadata(mut self, metadata: MetadataInfo) -> Self {
        self.metadatas.push(metadata);
        self
    }

    /// Priority clamped to `MIN_PRIORITY..=MAX_PRIORITY`.
    pub fn priority(&self) -> u8 {
        self.priority
            .clamp(MIN_PRIORITY as i32, MAX_PRIORITY as i32) as u8
    }

    /// Resource URI, when the task carries a resource with a known location.
    pub fn resource_uri(&self) -> Option<&str> {
        self.resource.as_ref().and_then(|r| r.uri.as_deref())
    }

    /// Whether anything in this info was written by a newer build and cannot be round-tripped.
    pub fn has_unknowns(&self) -> bool {
        self.operation == OperationType::Unknown
            || self
                .metadatas
                .iter()
                .any(|m| matches!(m, MetadataInfo::Unknown))
    }
}
