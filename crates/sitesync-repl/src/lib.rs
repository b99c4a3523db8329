#![warn(missing_docs)]

//! SiteSync replication subsystem: per-site task queues drained by elastic worker pools, and
//! change-detection sweeps between sites.

pub mod adapter;
pub mod broker;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod filter;
pub mod manager;
pub mod metrics;
pub mod persistable;
pub mod pool;
pub mod queue;
pub mod replication_item;
pub mod replicator;
pub mod site;
pub mod status;
pub mod sync;
pub mod task;
pub mod task_info;
pub mod worker;

pub use adapter::{Metadata, NodeAdapter, NodeAdapterFactory, NodeAdapterRegistry};
pub use broker::QueueBroker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ReplicationProperties, ReplicatorConfig};
pub use error::{ReplError, Result};
pub use manager::WorkerManager;
pub use queue::{LockedTask, SiteQueue, TaskEvent, TaskOutcome};
pub use replicator::Replicator;
pub use site::{InMemorySiteManager, Site, SiteKind, SiteManager, SiteType};
pub use status::{ReplicationStatus, Status};
pub use sync::{SyncResponse, Syncer};
pub use task::{ErrorCode, State, Task};
pub use task_info::{OperationType, TaskInfo};
