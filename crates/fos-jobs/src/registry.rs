//! Job Registry
//!
//! Per-pool list of registered jobs. A job stays registered from
//! `add_job` until its execution finishes or it is canceled.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::queue::CommandQueue;
use crate::sync::lock;
use crate::types::PoolKind;

/// Unique identifier for a registered job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({})", self.0)
    }
}

pub(crate) type Entries = VecDeque<(JobId, CommandQueue)>;

/// Registered jobs of one pool
pub(crate) struct JobRegistry {
    kind: PoolKind,
    entries: Mutex<Entries>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kind", &self.kind)
            .field("jobs", &self.len())
            .finish()
    }
}

impl JobRegistry {
    pub(crate) fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Lock the entries; dispatch and cancellation decide under this lock
    pub(crate) fn lock(&self) -> MutexGuard<'_, Entries> {
        lock(&self.entries)
    }

    /// Append a job, returning the still-locked entries
    pub(crate) fn insert(&self, id: JobId, queue: CommandQueue) -> MutexGuard<'_, Entries> {
        let mut entries = self.lock();
        entries.push_back((id, queue));
        entries
    }

    pub(crate) fn contains(&self, id: JobId, queue: &CommandQueue) -> bool {
        position(&self.lock(), id, queue).is_some()
    }

    pub(crate) fn contains_queue(&self, queue: &CommandQueue) -> bool {
        self.lock().iter().any(|(_, q)| q == queue)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub(crate) fn position(entries: &Entries, id: JobId, queue: &CommandQueue) -> Option<usize> {
    entries.iter().position(|(i, q)| *i == id && q == queue)
}
