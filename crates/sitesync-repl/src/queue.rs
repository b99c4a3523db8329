//! Per-site bounded task queues.
//!
//! A queue holds one FIFO per priority and serves the highest non-empty priority first. Its size
//! counts both pending tasks and tasks currently locked by a worker, so putting a locked task back
//! never needs to wait for room.
//!
//! [`SiteQueue::take`] hands out a [`LockedTask`]. The guard must be consumed by exactly one of
//! [`LockedTask::complete`], [`LockedTask::fail`] or [`LockedTask::unlock`]; a guard dropped
//! without any of them unlocks its task and logs the leak.

use crate::clock::Clock;
use crate::error::{ReplError, Result};
use crate::task::{ErrorCode, Task, TaskFailure};
use crate::task_info::{TaskInfo, MAX_PRIORITY};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, warn};

const PRIORITY_LEVELS: usize = MAX_PRIORITY as usize + 1;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// How a locked task was released.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Completed successfully and removed from the queue.
    Completed,
    /// Failed for good and removed from the queue.
    Failed(TaskFailure),
    /// Failed with a retryable code and put back at the end of its priority.
    Requeued(TaskFailure),
    /// Put back at the front of its priority without counting an attempt.
    Unlocked,
}

/// Published by a queue each time a locked task is released.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// Site owning the queue.
    pub site: String,
    /// Task as it was right after the release.
    pub task: Task,
    /// What happened.
    pub outcome: TaskOutcome,
}

/// Counters kept by a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    /// Tasks accepted by `put`/`offer`.
    pub queued: u64,
    /// Tasks handed out by `take`/`poll`.
    pub taken: u64,
    /// Tasks completed successfully.
    pub succeeded: u64,
    /// Tasks failed for good.
    pub failed: u64,
    /// Tasks put back after a retryable failure.
    pub requeued: u64,
    /// Tasks unlocked.
    pub unlocked: u64,
    /// Offers rejected because the queue was full.
    pub rejected: u64,
}

struct QueueState {
    pending: [VecDeque<Task>; PRIORITY_LEVELS],
    active: usize,
    stats: QueueStats,
}

impl QueueState {
    fn pending_len(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    fn len(&self) -> usize {
        self.pending_len() + self.active
    }

    fn pop_highest(&mut self) -> Option<Task> {
        self.pending.iter_mut().rev().find_map(VecDeque::pop_front)
    }
}

/// Bounded, blocking queue of tasks for one site.
pub struct SiteQueue {
    site: String,
    capacity: usize,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    events: broadcast::Sender<TaskEvent>,
}

impl SiteQueue {
    /// Create an empty queue for a site. A capacity of zero is raised to one.
    pub fn new(site: &str, capacity: usize, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            site: site.to_string(),
            capacity: capacity.max(1),
            clock,
            state: Mutex::new(QueueState {
                pending: Default::default(),
                active: 0,
                stats: QueueStats::default(),
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            events,
        })
    }

    /// Id of the site this queue feeds.
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Maximum number of pending plus locked tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pending plus locked tasks.
    pub fn size(&self) -> usize {
        self.state.lock().len()
    }

    /// Tasks waiting to be taken.
    pub fn pending_size(&self) -> usize {
        self.state.lock().pending_len()
    }

    /// Tasks currently locked by workers.
    pub fn active_size(&self) -> usize {
        self.state.lock().active
    }

    /// Room left before producers block.
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.size())
    }

    /// Whether nothing is pending or locked.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats.clone()
    }

    /// Subscribe to release events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the pending tasks, highest priority first.
    pub fn pending_tasks(&self) -> Vec<Task> {
        let state = self.state.lock();
        state.pending.iter().rev().flatten().cloned().collect()
    }

    fn try_enqueue(&self, info: &TaskInfo) -> Option<Task> {
        let mut state = self.state.lock();
        if state.len() >= self.capacity {
            return None;
        }
        let task = Task::new(info.clone(), self.clock.clone());
        state.pending[task.priority() as usize].push_back(task.clone());
        state.stats.queued += 1;
        drop(state);

        debug!(site_id = %self.site, task_id = %task.id(), intel_id = %task.intel_id(), priority = task.priority(), "task queued");
        self.not_empty.notify_one();
        Some(task)
    }

    /// Queue a task, waiting for room when the queue is full.
    pub async fn put(&self, info: TaskInfo) -> Task {
        loop {
            let room = self.not_full.notified();
            if let Some(task) = self.try_enqueue(&info) {
                return task;
            }
            room.await;
        }
    }

    /// Queue a task if there is room right now.
    pub fn offer(&self, info: TaskInfo) -> Result<Task> {
        match self.try_enqueue(&info) {
            Some(task) => Ok(task),
            None => {
                self.state.lock().stats.rejected += 1;
                Err(ReplError::QueueFull {
                    site: self.site.clone(),
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Queue a task, waiting at most `timeout` for room.
    pub async fn offer_timeout(&self, info: TaskInfo, timeout: Duration) -> Result<Task> {
        match tokio::time::timeout(timeout, self.put(info.clone())).await {
            Ok(task) => Ok(task),
            Err(_) => self.offer(info),
        }
    }

    fn try_take(self: &Arc<Self>) -> Option<LockedTask> {
        let mut state = self.state.lock();
        let mut task = state.pop_highest()?;
        task.activate();
        state.active += 1;
        state.stats.taken += 1;
        let more = state.pending_len() > 0;
        drop(state);

        // pass the wakeup on so other idle workers see what is left
        if more {
            self.not_empty.notify_one();
        }
        Some(LockedTask {
            queue: Arc::clone(self),
            task: Some(task),
        })
    }

    /// Lock the next task, waiting until one is available. Dropping the returned future before it
    /// resolves takes nothing.
    pub async fn take(self: &Arc<Self>) -> LockedTask {
        loop {
            let available = self.not_empty.notified();
            if let Some(locked) = self.try_take() {
                return locked;
            }
            available.await;
        }
    }

    /// Lock the next task, waiting at most `timeout`.
    pub async fn poll(self: &Arc<Self>, timeout: Duration) -> Option<LockedTask> {
        tokio::time::timeout(timeout, self.take()).await.ok()
    }

    fn release(&self, mut task: Task, outcome: TaskOutcome) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        let freed = match &outcome {
            TaskOutcome::Completed => {
                task.succeed();
                state.stats.succeeded += 1;
                true
            }
            TaskOutcome::Failed(failure) => {
                task.fail(failure.clone());
                state.stats.failed += 1;
                true
            }
            TaskOutcome::Requeued(failure) => {
                task.requeue(failure.clone());
                state.stats.requeued += 1;
                state.pending[task.priority() as usize].push_back(task.clone());
                false
            }
            TaskOutcome::Unlocked => {
                task.release();
                state.stats.unlocked += 1;
                state.pending[task.priority() as usize].push_front(task.clone());
                false
            }
        };
        drop(state);

        if freed {
            self.not_full.notify_one();
        } else {
            self.not_empty.notify_one();
        }
        // no subscribers is fine
        let _ = self.events.send(TaskEvent {
            site: self.site.clone(),
            task,
            outcome,
        });
    }
}

impl std::fmt::Debug for SiteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SiteQueue")
            .field("site", &self.site)
            .field("capacity", &self.capacity)
            .field("pending", &state.pending_len())
            .field("active", &state.active)
            .finish()
    }
}

/// A task locked by a worker. Release it with exactly one of `complete`, `fail` or `unlock`.
#[must_use = "a locked task must be completed, failed or unlocked"]
pub struct LockedTask {
    queue: Arc<SiteQueue>,
    task: Option<Task>,
}

impl LockedTask {
    fn into_task(mut self) -> Task {
        match self.task.take() {
            Some(task) => task,
            None => unreachable!("locked task released twice"),
        }
    }

    /// Site owning the task.
    pub fn site(&self) -> &str {
        self.queue.site()
    }

    /// Mark the task successful and remove it from the queue.
    pub fn complete(self) {
        let queue = Arc::clone(&self.queue);
        let task = self.into_task();
        debug!(site_id = %queue.site, task_id = %task.id(), "task completed");
        queue.release(task, TaskOutcome::Completed);
    }

    /// Record a failure. Retryable codes put the task back at the end of its priority with one
    /// more attempt; the others remove it as failed.
    pub fn fail(self, code: ErrorCode, reason: impl Into<String>) {
        let queue = Arc::clone(&self.queue);
        let task = self.into_task();
        let failure = TaskFailure {
            code,
            reason: reason.into(),
        };
        if code.should_be_retried() {
            warn!(site_id = %queue.site, task_id = %task.id(), code = ?code, reason = %failure.reason, attempts = task.total_attempts(), "task failed, requeued");
            queue.release(task, TaskOutcome::Requeued(failure));
        } else {
            warn!(site_id = %queue.site, task_id = %task.id(), code = ?code, reason = %failure.reason, "task failed");
            queue.release(task, TaskOutcome::Failed(failure));
        }
    }

    /// Put the task back at the front of its priority to be tried again later.
    pub fn unlock(self) {
        let queue = Arc::clone(&self.queue);
        let task = self.into_task();
        debug!(site_id = %queue.site, task_id = %task.id(), "task unlocked");
        queue.release(task, TaskOutcome::Unlocked);
    }
}

impl Deref for LockedTask {
    type Target = Task;

    fn deref(&self) -> &Task {
        match &self.task {
            Some(task) => task,
            None => unreachable!("locked task released twice"),
        }
    }
}

impl Drop for LockedTask {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            error!(site_id = %self.queue.site, task_id = %task.id(), intel_id = %task.intel_id(), "locked task dropped without release, unlocking");
            self.queue.release(task, TaskOutcome::Unlocked);
        }
    }
}

impl std::fmt::Debug for LockedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedTask")
            .field("site", &self.queue.site)
            .field("task", &self.task)
            .finish()
    }
}
