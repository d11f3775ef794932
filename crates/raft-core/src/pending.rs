//! # pending
//!
//! why: park client appends until their entry is applied, and fail them all on step-down
//! relations: owned by log.rs; resolved by the apply loop and by clear_pending_commits
//! what: PendingCommits registry (index -> CommitHandle), CommitStatus state machine

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Lifecycle of one client append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Pending,
    Committed,
    Failed,
    /// The waiter gave up; the handle was removed from the registry.
    TimedOut,
}

/// Completion handle for a single log index.
#[derive(Debug)]
pub struct CommitHandle {
    index: u64,
    status: Mutex<CommitStatus>,
    resolved: Condvar,
}

impl CommitHandle {
    fn new(index: u64) -> Self {
        Self {
            index,
            status: Mutex::new(CommitStatus::Pending),
            resolved: Condvar::new(),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn status(&self) -> CommitStatus {
        *self.status.lock()
    }

    /// Move out of `Pending`. Later resolutions are ignored.
    fn resolve(&self, outcome: CommitStatus) {
        let mut status = self.status.lock();
        if *status == CommitStatus::Pending {
            *status = outcome;
            self.resolved.notify_all();
        }
    }
}

/// Registry of outstanding commit waits keyed by log index.
#[derive(Debug, Default)]
pub struct PendingCommits {
    waits: Mutex<HashMap<u64, Arc<CommitHandle>>>,
}

impl PendingCommits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, index: u64) -> Arc<CommitHandle> {
        let handle = Arc::new(CommitHandle::new(index));
        self.waits.lock().insert(index, handle.clone());
        handle
    }

    /// Resolve the wait for `index` as committed, if anyone is waiting.
    pub fn complete(&self, index: u64) {
        if let Some(handle) = self.waits.lock().remove(&index) {
            handle.resolve(CommitStatus::Committed);
        }
    }

    /// Resolve the wait for `index` as failed, if anyone is waiting.
    pub fn fail(&self, index: u64) {
        if let Some(handle) = self.waits.lock().remove(&index) {
            handle.resolve(CommitStatus::Failed);
        }
    }

    /// Fail every outstanding wait.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.waits.lock().drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.resolve(CommitStatus::Failed);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.waits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until `handle` is resolved or `timeout` elapses.
    ///
    /// On timeout the handle is removed from the registry and marked
    /// `TimedOut`, unless a resolution raced in first.
    pub fn wait(&self, handle: &CommitHandle, timeout: Duration) -> CommitStatus {
        let deadline = Instant::now() + timeout;
        {
            let mut status = handle.status.lock();
            while *status == CommitStatus::Pending {
                if handle.resolved.wait_until(&mut status, deadline).timed_out() {
                    break;
                }
            }
            if *status != CommitStatus::Pending {
                return *status;
            }
        }

        self.waits.lock().remove(&handle.index);
        handle.resolve(CommitStatus::TimedOut);
        handle.status()
    }
}
