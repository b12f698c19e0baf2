use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Monotonic counters tracked by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CounterName {
    /// Commands dispatched, including rejected ones.
    Commands,
    /// Commands answered with `Error` because of a caller mistake.
    CallerErrors,
    /// Sessions torn down by a fatal error.
    FatalErrors,
    /// Event records pushed to clients.
    Pushes,
    /// Snapshot lines emitted during marked passes.
    Snapshots,
}

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of all counters.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CountersSnapshot {
    pub started_at: String,
    pub commands: u64,
    pub caller_errors: u64,
    pub fatal_errors: u64,
    pub pushes: u64,
    pub snapshots: u64,
}

pub struct Counters {
    started_at: DateTime<Utc>,
    commands: Counter,
    caller_errors: Counter,
    fatal_errors: Counter,
    pushes: Counter,
    snapshots: Counter,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            commands: Counter::new(),
            caller_errors: Counter::new(),
            fatal_errors: Counter::new(),
            pushes: Counter::new(),
            snapshots: Counter::new(),
        }
    }

    fn counter(&self, name: CounterName) -> &Counter {
        match name {
            CounterName::Commands => &self.commands,
            CounterName::CallerErrors => &self.caller_errors,
            CounterName::FatalErrors => &self.fatal_errors,
            CounterName::Pushes => &self.pushes,
            CounterName::Snapshots => &self.snapshots,
        }
    }

    pub fn incr(&self, name: CounterName) {
        self.add(name, 1);
    }

    pub fn add(&self, name: CounterName, n: u64) {
        self.counter(name).increment(n);
    }

    pub fn get(&self, name: CounterName) -> u64 {
        self.counter(name).get()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            started_at: self.started_at.to_rfc3339(),
            commands: self.commands.get(),
            caller_errors: self.caller_errors.get(),
            fatal_errors: self.fatal_errors.get(),
            pushes: self.pushes.get(),
            snapshots: self.snapshots.get(),
        }
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}
