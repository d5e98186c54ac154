//! Command Queues
//!
//! A queue owns the command lists of one (category, affinity) pair. A
//! single gate serializes admission, execution and cancellation: callers
//! try-acquire it and get [`JobError::QueueBusy`] instead of blocking.

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{JobError, Result};
use crate::list::{CommandFailure, CommandList};
use crate::sync::lock;
use crate::types::{ThreadAffinity, WorkloadCategory};

/// Queue ID counter
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a command queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue({})", self.0)
    }
}

#[derive(Default)]
struct QueueLists {
    resident: Vec<CommandList>,
    lone: VecDeque<CommandList>,
}

pub(crate) struct QueueShared {
    id: QueueId,
    category: WorkloadCategory,
    affinity: ThreadAffinity,
    /// Gate flag, true while held
    gate: Mutex<bool>,
    lists: Mutex<QueueLists>,
    resident_count: AtomicUsize,
    lone_count: AtomicUsize,
}

impl QueueShared {
    fn try_acquire(self: &Arc<Self>) -> Option<QueueLockGuard> {
        let mut held = lock(&self.gate);
        if *held {
            return None;
        }
        *held = true;
        Some(QueueLockGuard {
            shared: Arc::clone(self),
        })
    }
}

/// Held queue gate, released on drop
pub struct QueueLockGuard {
    shared: Arc<QueueShared>,
}

impl QueueLockGuard {
    /// Release the gate
    pub fn release(self) {}

    pub fn queue(&self) -> CommandQueue {
        CommandQueue::from_shared(Arc::clone(&self.shared))
    }
}

impl fmt::Debug for QueueLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueLockGuard")
            .field("queue", &self.shared.id)
            .finish()
    }
}

impl Drop for QueueLockGuard {
    fn drop(&mut self) {
        let mut held = lock(&self.shared.gate);
        *held = false;
    }
}

/// A list the queue refused, handed back with the reason
#[derive(Debug, thiserror::Error)]
#[error("{} not admitted: {}", .list.id(), .error)]
pub struct AdmitError {
    pub error: JobError,
    pub list: CommandList,
}

impl AdmitError {
    pub fn into_list(self) -> CommandList {
        self.list
    }
}

impl From<AdmitError> for JobError {
    fn from(e: AdmitError) -> Self {
        e.error
    }
}

/// Outcome of executing lists
#[derive(Debug, Default)]
pub struct ExecutionReport {
    /// Lists visited
    pub lists: usize,
    /// Command bodies invoked
    pub executed: usize,
    pub failures: Vec<CommandFailure>,
}

impl ExecutionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, list: &mut CommandList) {
        self.lists += 1;
        self.executed += list.run(&mut self.failures);
    }
}

/// Shared handle to a queue of command lists
#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<QueueShared>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.shared.id)
            .field("category", &self.shared.category)
            .field("affinity", &self.shared.affinity)
            .field("lists", &self.list_count())
            .field("lone_lists", &self.lone_list_count())
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl PartialEq for CommandQueue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for CommandQueue {}

impl Hash for CommandQueue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl CommandQueue {
    pub fn new(category: WorkloadCategory, affinity: ThreadAffinity) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                id: QueueId::next(),
                category,
                affinity,
                gate: Mutex::new(false),
                lists: Mutex::new(QueueLists::default()),
                resident_count: AtomicUsize::new(0),
                lone_count: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<QueueShared> {
        Arc::downgrade(&self.shared)
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn category(&self) -> WorkloadCategory {
        self.shared.category
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.shared.affinity
    }

    /// Resident lists
    pub fn list_count(&self) -> usize {
        self.shared.resident_count.load(Ordering::Acquire)
    }

    /// Lone lists waiting for their single run
    pub fn lone_list_count(&self) -> usize {
        self.shared.lone_count.load(Ordering::Acquire)
    }

    pub fn is_locked(&self) -> bool {
        *lock(&self.shared.gate)
    }

    /// Try to take the gate without blocking
    pub fn request_lock(&self) -> Result<QueueLockGuard> {
        self.try_lock().ok_or_else(|| {
            tracing::warn!(
                "{} ({}/{}) is locked",
                self.id(),
                self.category(),
                self.affinity()
            );
            self.busy_error()
        })
    }

    pub(crate) fn try_lock(&self) -> Option<QueueLockGuard> {
        self.shared.try_acquire()
    }

    pub(crate) fn busy_error(&self) -> JobError {
        JobError::QueueBusy {
            queue: self.id(),
            category: self.category(),
            affinity: self.affinity(),
        }
    }

    /// Admit an `AnyThread` list that runs once, apart from the resident batch.
    ///
    /// A refused list comes back inside the error.
    pub fn add_lone_list(&self, list: CommandList) -> std::result::Result<(), AdmitError> {
        self.admit(list, ThreadAffinity::AnyThread, true)
    }

    /// Admit a resident list with the queue's affinity
    pub fn add_list(&self, list: CommandList) -> std::result::Result<(), AdmitError> {
        self.admit(list, self.affinity(), false)
    }

    fn admit(
        &self,
        mut list: CommandList,
        expected: ThreadAffinity,
        lone: bool,
    ) -> std::result::Result<(), AdmitError> {
        let _guard = match self.request_lock() {
            Ok(guard) => guard,
            Err(error) => return Err(AdmitError { error, list }),
        };
        if list.affinity() != expected {
            tracing::error!(
                "{} rejected by {}: affinity {} does not match {} ({})",
                list.id(),
                self.id(),
                list.affinity(),
                expected,
                list.category()
            );
            let error = JobError::AffinityMismatch {
                expected,
                found: list.affinity(),
            };
            return Err(AdmitError { error, list });
        }

        list.attach(&self.shared);
        if let Err(error) = list.verify_and_commit() {
            return Err(AdmitError { error, list });
        }

        tracing::debug!("{} admitted {} ({} commands)", self.id(), list.id(), list.len());
        let mut lists = lock(&self.shared.lists);
        if lone {
            lists.lone.push_back(list);
            self.shared.lone_count.fetch_add(1, Ordering::AcqRel);
        } else {
            lists.resident.push(list);
            self.shared.resident_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Run `list` on the calling thread, outside the queue's batch
    pub fn execute_lone_list(&self, list: &mut CommandList) -> ExecutionReport {
        list.attach(&self.shared);
        let mut report = ExecutionReport::default();
        report.record(list);
        report
    }

    /// Run pending lone lists once, then every resident list.
    ///
    /// Resident lists run in insertion order, or by descending priority
    /// (stable) when `respect_priority` is set.
    pub fn execute(&self, respect_priority: bool) -> Result<ExecutionReport> {
        let guard = self.request_lock()?;
        Ok(self.execute_locked(&guard, respect_priority))
    }

    pub(crate) fn execute_locked(
        &self,
        _guard: &QueueLockGuard,
        respect_priority: bool,
    ) -> ExecutionReport {
        // The gate keeps other writers out, so run without the list mutex
        let (mut lone, mut resident) = {
            let mut lists = lock(&self.shared.lists);
            (
                std::mem::take(&mut lists.lone),
                std::mem::take(&mut lists.resident),
            )
        };
        self.shared.lone_count.store(0, Ordering::Release);

        let mut report = ExecutionReport::default();
        while let Some(mut list) = lone.pop_front() {
            report.record(&mut list);
        }

        let mut order: Vec<usize> = (0..resident.len()).collect();
        if respect_priority {
            order.sort_by_key(|&i| Reverse(resident[i].priority()));
        }
        for i in order {
            report.record(&mut resident[i]);
        }

        lock(&self.shared.lists).resident = resident;

        if !report.is_clean() {
            tracing::warn!(
                "{} ({}) finished with {} failed commands",
                self.id(),
                self.category(),
                report.failures.len()
            );
        }
        report
    }

    /// Run a single resident list by position
    pub fn execute_resident(&self, index: usize) -> Result<ExecutionReport> {
        let _guard = self.request_lock()?;
        let mut list = {
            let mut lists = lock(&self.shared.lists);
            if index >= lists.resident.len() {
                tracing::error!("{} has no resident list at {}", self.id(), index);
                return Err(JobError::ListNotFound {
                    queue: self.id(),
                    index,
                });
            }
            lists.resident.remove(index)
        };

        // Run outside the list mutex; the gate keeps writers out
        let mut report = ExecutionReport::default();
        report.record(&mut list);
        lock(&self.shared.lists).resident.insert(index, list);
        Ok(report)
    }

    /// Release every list without running it.
    ///
    /// Commands that never ran are marked canceled. Returns the number of
    /// released lists.
    pub fn clear(&self) -> Result<usize> {
        let _guard = self.request_lock()?;
        let QueueLists { resident, lone } = std::mem::take(&mut *lock(&self.shared.lists));
        self.shared.resident_count.store(0, Ordering::Release);
        self.shared.lone_count.store(0, Ordering::Release);

        let released = resident.len() + lone.len();
        for list in resident.iter().chain(lone.iter()) {
            list.cancel_pending();
        }
        tracing::debug!("{} cleared {} lists", self.id(), released);
        Ok(released)
    }

    /// Return canceled commands to pending so a new job can run them
    pub(crate) fn rearm(&self) -> usize {
        let lists = lock(&self.shared.lists);
        lists
            .resident
            .iter()
            .chain(lists.lone.iter())
            .map(CommandList::rearm)
            .sum()
    }

    /// Mark commands that never ran as canceled; caller holds the gate
    pub(crate) fn cancel_pending(&self, _guard: &QueueLockGuard) -> usize {
        let lists = lock(&self.shared.lists);
        lists
            .resident
            .iter()
            .chain(lists.lone.iter())
            .map(CommandList::cancel_pending)
            .sum()
    }
}
