//! Tasks: a [`TaskInfo`] plus lifecycle state and duration accounting.
//!
//! Durations accumulate from the monotonic clock, and only while the task sits in the state the
//! duration tracks. A task written to storage is frozen at a single instant; when it is revived
//! the wall time it spent frozen is credited back to the state it resumes in.

use crate::clock::Clock;
use crate::error::{ReplError, Result};
use crate::persistable::Persistable;
use crate::task_info::{MetadataInfo, OperationType, ResourceInfo, TaskInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const PERSISTABLE_KIND: &str = "task";

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 1;
/// Oldest version this build can read.
pub const MINIMUM_VERSION: u32 = 1;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Waiting in a queue.
    Pending,
    /// Locked by a worker.
    Active,
    /// Finished unsuccessfully.
    Failed,
    /// Finished successfully.
    Successful,
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unexpected internal failure.
    InternalError,
    /// A site could not be reached.
    SiteUnavailable,
    /// A site did not answer in time.
    SiteTimeout,
    /// A service the site depends on could not be reached.
    UpstreamServiceUnavailable,
    /// A service the site depends on did not answer in time.
    UpstreamServiceTimeout,
    /// The item was deleted at its source before it could be moved.
    NoLongerExists,
    /// The adapter reported the operation as failed.
    OperationFailure,
    /// Anything else.
    UnknownError,
}

impl ErrorCode {
    /// Whether a task failing with this code goes back to its queue for another attempt.
    pub fn should_be_retried(self) -> bool {
        matches!(
            self,
            ErrorCode::InternalError
                | ErrorCode::SiteUnavailable
                | ErrorCode::SiteTimeout
                | ErrorCode::UpstreamServiceUnavailable
                | ErrorCode::UpstreamServiceTimeout
        )
    }
}

/// Failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure classification.
    pub code: ErrorCode,
    /// Human-readable reason.
    pub reason: String,
}

/// Mutable, stateful wrapper around a [`TaskInfo`].
#[derive(Clone)]
pub struct Task {
    identity: Persistable,
    info: TaskInfo,
    priority: u8,
    attempts: u32,
    state: State,
    original_queued_time: DateTime<Utc>,
    queued_time: DateTime<Utc>,
    /// Monotonic reading from which the current state's elapsed time is measured.
    start_time: u64,
    duration: Duration,
    pending_duration: Duration,
    active_duration: Duration,
    failure: Option<TaskFailure>,
    clock: Arc<dyn Clock>,
}

impl Task {
    /// Wrap a task info as it is being queued.
    pub fn new(info: TaskInfo, clock: Arc<dyn Clock>) -> Self {
        let now = clock.wall_time();
        Self {
            identity: Persistable::new(PERSISTABLE_KIND),
            priority: info.priority(),
            info,
            attempts: 1,
            state: State::Pending,
            original_queued_time: now,
            queued_time: now,
            start_time: clock.monotonic_time(),
            duration: Duration::ZERO,
            pending_duration: Duration::ZERO,
            active_duration: Duration::ZERO,
            failure: None,
            clock,
        }
    }

    /// Unique task id.
    pub fn id(&self) -> Uuid {
        self.identity.id
    }

    /// Persisted identity.
    pub fn identity(&self) -> &Persistable {
        &self.identity
    }

    /// The wrapped info.
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    /// Identifier of the item this task moves.
    pub fn intel_id(&self) -> &str {
        &self.info.intel_id
    }

    /// Clamped priority.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Operation to perform.
    pub fn operation(&self) -> OperationType {
        self.info.operation
    }

    /// When the item was last modified.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.info.last_modified
    }

    /// Resource accompanying the item.
    pub fn resource(&self) -> Option<&ResourceInfo> {
        self.info.resource.as_ref()
    }

    /// Metadata accompanying the item.
    pub fn metadatas(&self) -> &[MetadataInfo] {
        &self.info.metadatas
    }

    /// How many times this task has been attempted, starting at 1.
    pub fn total_attempts(&self) -> u32 {
        self.attempts
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Reason of the last failure, if any.
    pub fn failure(&self) -> Option<&TaskFailure> {
        self.failure.as_ref()
    }

    /// When the first attempt was queued.
    pub fn original_queued_time(&self) -> DateTime<Utc> {
        self.original_queued_time
    }

    /// When the current attempt was queued.
    pub fn queued_time(&self) -> DateTime<Utc> {
        self.queued_time
    }

    /// Whether the task reached a terminal state.
    pub fn is_completed(&self) -> bool {
        matches!(self.state, State::Failed | State::Successful)
    }

    /// Whether the task completed successfully.
    pub fn was_successful(&self) -> bool {
        self.state == State::Successful
    }

    /// Whether the task completed unsuccessfully.
    pub fn has_failed(&self) -> bool {
        self.state == State::Failed
    }

    /// Total time spent pending or active.
    pub fn duration(&self) -> Duration {
        self.duration_at(self.clock.monotonic_time())
    }

    /// Total time spent pending.
    pub fn pending_duration(&self) -> Duration {
        self.pending_duration_at(self.clock.monotonic_time())
    }

    /// Total time spent active.
    pub fn active_duration(&self) -> Duration {
        self.active_duration_at(self.clock.monotonic_time())
    }

    fn elapsed_since_start(&self, monotonic: u64) -> Duration {
        Duration::from_nanos(monotonic.saturating_sub(self.start_time))
    }

    fn duration_at(&self, monotonic: u64) -> Duration {
        match self.state {
            State::Pending | State::Active => self.duration + self.elapsed_since_start(monotonic),
            State::Failed | State::Successful => self.duration,
        }
    }

    fn pending_duration_at(&self, monotonic: u64) -> Duration {
        match self.state {
            State::Pending => self.pending_duration + self.elapsed_since_start(monotonic),
            _ => self.pending_duration,
        }
    }

    fn active_duration_at(&self, monotonic: u64) -> Duration {
        match self.state {
            State::Active => self.active_duration + self.elapsed_since_start(monotonic),
            _ => self.active_duration,
        }
    }

    /// Fold the time spent in the current state into the accumulators and enter `to`.
    fn transition(&mut self, to: State) {
        let now = self.clock.monotonic_time();
        self.duration = self.duration_at(now);
        self.pending_duration = self.pending_duration_at(now);
        self.active_duration = self.active_duration_at(now);
        self.start_time = now;
        self.state = to;
    }

    pub(crate) fn activate(&mut self) {
        self.transition(State::Active);
    }

    /// Back to pending without counting an attempt.
    pub(crate) fn release(&mut self) {
        self.transition(State::Pending);
    }

    /// Back to pending for another attempt after a retryable failure.
    pub(crate) fn requeue(&mut self, failure: TaskFailure) {
        self.transition(State::Pending);
        self.attempts += 1;
        self.queued_time = self.clock.wall_time();
        self.failure = Some(failure);
    }

    pub(crate) fn succeed(&mut self) {
        self.transition(State::Successful);
        self.failure = None;
    }

    pub(crate) fn fail(&mut self, failure: TaskFailure) {
        self.transition(State::Failed);
        self.failure = Some(failure);
    }

    /// Capture this task for storage with every duration computed as of one instant.
    pub fn freeze(&self) -> Result<TaskRecord> {
        if self.info.has_unknowns() {
            return Err(ReplError::InvalidField {
                field: "info",
                msg: format!("task {} carries unknown information", self.id()),
            });
        }
        let frozen_time = self.clock.wall_time();
        let monotonic = self.clock.monotonic_time();

        Ok(TaskRecord {
            version: CURRENT_VERSION,
            id: self.id(),
            info: self.info.clone(),
            state: self.state,
            total_attempts: self.attempts,
            original_queued_time: self.original_queued_time,
            queued_time: self.queued_time,
            duration: self.duration_at(monotonic),
            pending_duration: self.pending_duration_at(monotonic),
            active_duration: self.active_duration_at(monotonic),
            failure: self.failure.clone(),
            frozen_time,
        })
    }

    /// Revive a frozen task, crediting the time it spent frozen to the state it resumes in.
    pub fn revive(record: TaskRecord, clock: Arc<dyn Clock>) -> Result<Self> {
        if record.version < MINIMUM_VERSION {
            return Err(ReplError::UnsupportedVersion {
                kind: PERSISTABLE_KIND,
                version: record.version,
                id: record.id.to_string(),
            });
        }
        if record.total_attempts == 0 {
            return Err(ReplError::InvalidField {
                field: "total_attempts",
                msg: "must be at least 1".to_string(),
            });
        }

        let frozen_for = (clock.wall_time() - record.frozen_time)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let credit = |applies: bool, d: Duration| if applies { d + frozen_for } else { d };
        let state = record.state;

        Ok(Self {
            identity: Persistable::with_id(PERSISTABLE_KIND, record.id),
            priority: record.info.priority(),
            info: record.info,
            attempts: record.total_attempts,
            state,
            original_queued_time: record.original_queued_time,
            queued_time: record.queued_time,
            start_time: clock.monotonic_time(),
            duration: credit(matches!(state, State::Pending | State::Active), record.duration),
            pending_duration: credit(state == State::Pending, record.pending_duration),
            active_duration: credit(state == State::Active, record.active_duration),
            failure: record.failure,
            clock,
        })
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.info == other.info
            && self.priority == other.priority
            && self.attempts == other.attempts
            && self.state == other.state
            && self.original_queued_time == other.original_queued_time
            && self.queued_time == other.queued_time
            && self.start_time == other.start_time
            && self.duration == other.duration
            && self.pending_duration == other.pending_duration
            && self.active_duration == other.active_duration
            && self.failure == other.failure
    }
}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.identity.id)
            .field("intel_id", &self.info.intel_id)
            .field("operation", &self.info.operation)
            .field("priority", &self.priority)
            .field("total_attempts", &self.attempts)
            .field("state", &self.state)
            .field("original_queued_time", &self.original_queued_time)
            .field("queued_time", &self.queued_time)
            .field("duration", &self.duration)
            .field("pending_duration", &self.pending_duration)
            .field("active_duration", &self.active_duration)
            .field("failure", &self.failure)
            .finish()
    }
}

/// Storage form of a task, frozen at `frozen_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Document version.
    pub version: u32,
    /// Task id.
    pub id: Uuid,
    /// The wrapped info.
    pub info: TaskInfo,
    /// State at freeze time.
    pub state: State,
    /// Attempts so far.
    pub total_attempts: u32,
    /// When the first attempt was queued.
    pub original_queued_time: DateTime<Utc>,
    /// When the current attempt was queued.
    pub queued_time: DateTime<Utc>,
    /// Total pending + active time as of `frozen_time`.
    pub duration: Duration,
    /// Pending time as of `frozen_time`.
    pub pending_duration: Duration,
    /// Active time as of `frozen_time`.
    pub active_duration: Duration,
    /// Last failure.
    #[serde(default)]
    pub failure: Option<TaskFailure>,
    /// Wall time at which the durations were computed.
    pub frozen_time: DateTime<Utc>,
}

/// Closed set of task kinds that can be stored, tagged by a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistedTask {
    /// A site-queue task.
    SiteTask(TaskRecord),
}

impl PersistedTask {
    /// Encode a task as a JSON document.
    pub fn encode(task: &Task) -> Result<String> {
        Ok(serde_json::to_string(&PersistedTask::SiteTask(task.freeze()?))?)
    }

    /// Decode a JSON document and revive the task it holds.
    pub fn decode(json: &str, clock: Arc<dyn Clock>) -> Result<Task> {
        match serde_json::from_str::<PersistedTask>(json)? {
            PersistedTask::SiteTask(record) => Task::revive(record, clock),
        }
    }
}
