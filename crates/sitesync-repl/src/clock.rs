//! Wall and monotonic time sources.
//!
//! Task durations are accumulated from the monotonic reading so they stay correct when the wall
//! clock is adjusted. The wall reading is only used for timestamps shown to operators and for
//! the time a task spent frozen in storage.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Source of wall-clock and monotonic time.
pub trait Clock: Send + Sync + Debug {
    /// Current wall-clock time.
    fn wall_time(&self) -> DateTime<Utc>;

    /// Current monotonic time in nanoseconds from an arbitrary origin.
    fn monotonic_time(&self) -> u64;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

fn process_origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

impl Clock for SystemClock {
    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_time(&self) -> u64 {
        process_origin().elapsed().as_nanos() as u64
    }
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Utc>,
    monotonic: u64,
}

/// Clock whose readings only change when told to.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    /// Create a manual clock starting at the given wall time and monotonic zero.
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ManualState { wall, monotonic: 0 }),
        }
    }

    /// Advance both readings by `by`.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.monotonic += by.as_nanos() as u64;
        state.wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Advance only the wall reading, as happens across a process restart.
    pub fn advance_wall(&self, by: Duration) {
        let mut state = self.state.lock();
        state.wall += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Move the wall reading to an arbitrary time without touching monotonic time.
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        self.state.lock().wall = wall;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn wall_time(&self) -> DateTime<Utc> {
        self.state.lock().wall
    }

    fn monotonic_time(&self) -> u64 {
        self.state.lock().monotonic
    }
}
