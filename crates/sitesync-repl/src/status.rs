//! Outcome of replication runs and the history they are appended to.

use crate::error::Result;
use crate::persistable::Persistable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const PERSISTABLE_KIND: &str = "replication status";

/// State of a replication run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Waiting to be processed.
    Pending,
    /// Moving items from the source to the destination.
    PushInProgress,
    /// Moving items from the destination back to the source.
    PullInProgress,
    /// Finished.
    Success,
    /// Stopped by an unexpected error.
    Failure,
    /// Cancelled while processing.
    Canceled,
    /// Lost the connection to one side while moving items.
    ConnectionLost,
    /// Could not connect to one side before starting.
    ConnectionUnavailable,
}

impl Status {
    /// Whether the run is still going.
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Status::Pending | Status::PushInProgress | Status::PullInProgress
        )
    }
}

/// Aggregate outcome of one replication run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Record id.
    pub id: Uuid,
    /// Config the run belongs to.
    pub replicator_id: String,
    /// Name of that config.
    pub replicator_name: String,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// Start of the most recent successful run, carried forward.
    pub last_success: Option<DateTime<Utc>>,
    /// Start of the most recent run, carried forward.
    pub last_run: Option<DateTime<Utc>>,
    /// Run length in seconds, once finished.
    pub duration_secs: Option<i64>,
    /// Current state.
    pub status: Status,
    /// Items moved source to destination.
    pub push_count: u64,
    /// Items moved destination to source.
    pub pull_count: u64,
    /// Items that failed source to destination.
    pub push_fail_count: u64,
    /// Items that failed destination to source.
    pub pull_fail_count: u64,
    /// Resource bytes moved source to destination.
    pub push_bytes: u64,
    /// Resource bytes moved destination to source.
    pub pull_bytes: u64,
    /// Newest metadata modified time seen by the last completed sweep.
    pub last_metadata_modified: Option<DateTime<Utc>>,
}

impl ReplicationStatus {
    /// A pending run starting at `start_time`.
    pub fn new(replicator_id: &str, replicator_name: &str, start_time: DateTime<Utc>) -> Self {
        Self {
            id: Persistable::new(PERSISTABLE_KIND).id,
            replicator_id: replicator_id.to_string(),
            replicator_name: replicator_name.to_string(),
            start_time,
            last_success: None,
            last_run: None,
            duration_secs: None,
            status: Status::Pending,
            push_count: 0,
            pull_count: 0,
            push_fail_count: 0,
            pull_fail_count: 0,
            push_bytes: 0,
            pull_bytes: 0,
            last_metadata_modified: None,
        }
    }

    /// Restart the clock of this run.
    pub fn mark_start_time(&mut self, now: DateTime<Utc>) {
        self.start_time = now;
    }

    /// Record the run length as of `now`.
    pub fn set_duration(&mut self, now: DateTime<Utc>) {
        self.duration_secs = Some((now - self.start_time).num_seconds().max(0));
    }

    /// Run length in seconds, running or finished.
    pub fn duration(&self, now: DateTime<Utc>) -> i64 {
        self.duration_secs
            .unwrap_or_else(|| (now - self.start_time).num_seconds().max(0))
    }

    /// Lower bound for the next sweep: the later of this run's start and its last success.
    pub fn watermark(&self) -> DateTime<Utc> {
        match self.last_success {
            Some(last_success) if last_success > self.start_time => last_success,
            _ => self.start_time,
        }
    }
}

/// Append-only log of replication runs.
#[async_trait]
pub trait ReplicatorHistory: Send + Sync {
    /// Append a finished run.
    async fn add_event(&self, status: ReplicationStatus) -> Result<()>;

    /// Runs of a replicator, most recent first.
    async fn events(&self, replicator_name: &str) -> Result<Vec<ReplicationStatus>>;

    /// Forget every run of a replicator.
    async fn remove_events(&self, replicator_name: &str) -> Result<()>;

    /// Most recent successful run of a replicator.
    async fn last_successful(&self, replicator_name: &str) -> Result<Option<ReplicationStatus>> {
        Ok(self
            .events(replicator_name)
            .await?
            .into_iter()
            .find(|s| s.status == Status::Success))
    }
}

/// Replicator history held in memory.
#[derive(Debug, Default)]
pub struct InMemoryReplicatorHistory {
    events: Mutex<Vec<ReplicationStatus>>,
}

impl InMemoryReplicatorHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs recorded for all replicators.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether no run was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl ReplicatorHistory for InMemoryReplicatorHistory {
    async fn add_event(&self, status: ReplicationStatus) -> Result<()> {
        self.events.lock().push(status);
        Ok(())
    }

    async fn events(&self, replicator_name: &str) -> Result<Vec<ReplicationStatus>> {
        Ok(self
            .events
            .lock()
            .iter()
            .rev()
            .filter(|s| s.replicator_name == replicator_name)
            .cloned()
            .collect())
    }

    async fn remove_events(&self, replicator_name: &str) -> Result<()> {
        self.events
            .lock()
            .retain(|s| s.replicator_name != replicator_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_watermark_prefers_later_success() {
        let start = Utc::now();
        let mut status = ReplicationStatus::new("c1", "r1", start);
        assert_eq!(status.watermark(), start);
        status.last_success = Some(start + Duration::seconds(5));
        assert_eq!(status.watermark(), start + Duration::seconds(5));
        status.last_success = Some(start - Duration::seconds(5));
        assert_eq!(status.watermark(), start);
    }

    #[test]
    fn test_duration() {
        let start = Utc::now();
        let mut status = ReplicationStatus::new("c1", "r1", start);
        assert_eq!(status.duration(start + Duration::seconds(3)), 3);
        status.set_duration(start + Duration::seconds(7));
        assert_eq!(status.duration(start + Duration::seconds(60)), 7);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&Status::ConnectionUnavailable).unwrap();
        assert_eq!(json, "\"CONNECTION_UNAVAILABLE\"");
        assert!(Status::PullInProgress.is_in_progress());
        assert!(!Status::Canceled.is_in_progress());
    }

    #[tokio::test]
    async fn test_history_most_recent_first() {
        let history = InMemoryReplicatorHistory::new();
        let start = Utc::now();
        for (i, status) in [Status::Success, Status::Failure, Status::Success, Status::Canceled]
            .into_iter()
            .enumerate()
        {
            let mut s = ReplicationStatus::new("c1", "r1", start + Duration::seconds(i as i64));
            s.status = status;
            history.add_event(s).await.unwrap();
        }
        history
            .add_event(ReplicationStatus::new("c2", "r2", start))
            .await
            .unwrap();

        let events = history.events("r1").await.unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].status, Status::Canceled);

        let last = history.last_successful("r1").await.unwrap().unwrap();
        assert_eq!(last.start_time, start + Duration::seconds(2));
        assert!(history.last_successful("r2").await.unwrap().is_none());

        history.remove_events("r1").await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
