//! Worker Pools
//!
//! One work channel per pool kind, drained by named worker threads.
//! Activity bookkeeping for `wait()` lives here too.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{JobError, Result};
use crate::queue::CommandQueue;
use crate::registry::JobId;
use crate::sync::{lock, wait, wait_timeout};
use crate::system::SystemCore;
use crate::types::PoolKind;

/// Poll interval while every waiting ticket belongs to a locked queue
const LOCKED_RETRY: Duration = Duration::from_millis(5);

/// Dispatch record for one registered job
#[derive(Debug, Clone)]
pub(crate) struct Ticket {
    pub(crate) id: JobId,
    pub(crate) queue: CommandQueue,
}

/// Ticket channel of one pool
pub(crate) struct WorkChannel {
    tickets: Mutex<VecDeque<Ticket>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl WorkChannel {
    pub(crate) fn new() -> Self {
        Self {
            tickets: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn push(&self, ticket: Ticket) {
        let mut tickets = lock(&self.tickets);
        tickets.push_back(ticket);
        self.condvar.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<Ticket> {
        lock(&self.tickets).pop_front()
    }

    /// Block until a ticket of an unlocked queue arrives; `None` once shut down.
    ///
    /// Tickets of locked queues keep their place and are retried later.
    fn wait_for_ticket(&self) -> Option<Ticket> {
        let mut tickets = lock(&self.tickets);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }

            if let Some(pos) = tickets.iter().position(|t| !t.queue.is_locked()) {
                return tickets.remove(pos);
            }

            // Gate releases are not signalled here, so poll while tickets wait
            let pause = if tickets.is_empty() {
                Duration::from_millis(100)
            } else {
                LOCKED_RETRY
            };
            tickets = wait_timeout(&self.condvar, tickets, pause).0;
        }
    }

    /// Drop the ticket of a canceled job, if no worker took it yet
    pub(crate) fn remove(&self, id: JobId) -> bool {
        let mut tickets = lock(&self.tickets);
        match tickets.iter().position(|t| t.id == id) {
            Some(pos) => {
                tickets.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.tickets).len()
    }

    pub(crate) fn shutdown(&self) {
        let _tickets = lock(&self.tickets);
        self.shutdown.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    pub(crate) fn reopen(&self) {
        lock(&self.tickets).clear();
        self.shutdown.store(false, Ordering::Release);
    }
}

/// A worker thread bound to one pool
pub(crate) struct Worker {
    name: String,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Worker {
    fn spawn(kind: PoolKind, index: usize, core: Arc<SystemCore>) -> Result<Self> {
        let name = format!("fos-jobs-{}-{}", kind.name(), index);
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::debug!("Worker {} started", kind.name());
            let channel = core.channel(kind);
            while let Some(ticket) = channel.wait_for_ticket() {
                // Locked again since it was picked; put it back
                if let Some(deferred) = core.dispatch(kind, ticket) {
                    channel.push(deferred);
                }
            }
            tracing::debug!("Worker {} stopped", kind.name());
        })?;

        Ok(Self {
            name,
            thread: Some(thread),
        })
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Worker {} exited by panic", self.name);
            }
        }
    }
}

/// Worker threads of one pool
pub(crate) struct WorkerPool {
    kind: PoolKind,
    workers: Mutex<Vec<Worker>>,
    next_index: AtomicUsize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("kind", &self.kind)
            .field("workers", &*lock(&self.workers))
            .finish()
    }
}

impl WorkerPool {
    pub(crate) fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            workers: Mutex::new(Vec::new()),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Spawn `count` workers, stopping at the first failure
    pub(crate) fn spawn(&self, count: usize, core: &Arc<SystemCore>) -> Result<()> {
        let mut workers = lock(&self.workers);
        for _ in 0..count {
            let index = self.next_index.fetch_add(1, Ordering::Relaxed);
            match Worker::spawn(self.kind, index, Arc::clone(core)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    tracing::error!("Failed to spawn {} worker: {}", self.kind, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Join every worker; the channel must already be shut down
    pub(crate) fn join_all(&self) -> usize {
        let mut workers = std::mem::take(&mut *lock(&self.workers));
        for worker in &mut workers {
            worker.join();
        }
        self.next_index.store(0, Ordering::Relaxed);
        workers.len()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ActivityState {
    pending: [usize; 4],
    active: [usize; 4],
    completed: u64,
    failed_commands: u64,
}

impl ActivityState {
    fn is_idle(&self) -> bool {
        self.pending.iter().all(|&n| n == 0) && self.active.iter().all(|&n| n == 0)
    }
}

/// Snapshot of pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ActivitySnapshot {
    pub(crate) pending: [usize; 4],
    pub(crate) active: [usize; 4],
    pub(crate) completed: u64,
    pub(crate) failed_commands: u64,
}

/// Pending and active tickets per pool
#[derive(Debug, Default)]
pub(crate) struct Activity {
    state: Mutex<ActivityState>,
    idle: Condvar,
}

impl Activity {
    /// Count a new ticket unless the pool already has `limit` pending
    pub(crate) fn reserve(&self, kind: PoolKind, limit: usize) -> Result<usize> {
        let mut state = lock(&self.state);
        let pending = &mut state.pending[kind.index()];
        if *pending >= limit {
            return Err(JobError::Saturated {
                kind,
                pending: *pending,
            });
        }
        *pending += 1;
        Ok(*pending)
    }

    /// A ticket left the channel without running
    pub(crate) fn release(&self, kind: PoolKind) {
        let mut state = lock(&self.state);
        let pending = &mut state.pending[kind.index()];
        *pending = pending.saturating_sub(1);
        if state.is_idle() {
            self.idle.notify_all();
        }
    }

    /// A ticket was taken by a thread
    pub(crate) fn begin(&self, kind: PoolKind) {
        let mut state = lock(&self.state);
        let i = kind.index();
        state.pending[i] = state.pending[i].saturating_sub(1);
        state.active[i] += 1;
    }

    /// A taken ticket went back to its channel
    pub(crate) fn defer(&self, kind: PoolKind) {
        let mut state = lock(&self.state);
        let i = kind.index();
        state.active[i] = state.active[i].saturating_sub(1);
        state.pending[i] += 1;
    }

    pub(crate) fn finish(&self, kind: PoolKind, executed: bool, failed_commands: usize) {
        let mut state = lock(&self.state);
        let i = kind.index();
        state.active[i] = state.active[i].saturating_sub(1);
        if executed {
            state.completed += 1;
        }
        state.failed_commands += failed_commands as u64;
        if state.is_idle() {
            self.idle.notify_all();
        }
    }

    pub(crate) fn pending(&self, kind: PoolKind) -> usize {
        lock(&self.state).pending[kind.index()]
    }

    pub(crate) fn active(&self, kind: PoolKind) -> usize {
        lock(&self.state).active[kind.index()]
    }

    pub(crate) fn snapshot(&self) -> ActivitySnapshot {
        let state = *lock(&self.state);
        ActivitySnapshot {
            pending: state.pending,
            active: state.active,
            completed: state.completed,
            failed_commands: state.failed_commands,
        }
    }

    pub(crate) fn reset(&self) {
        *lock(&self.state) = ActivityState::default();
    }

    /// Block until nothing is pending or active
    pub(crate) fn wait_idle(&self) {
        let mut state = lock(&self.state);
        while !state.is_idle() {
            state = wait(&self.idle, state);
        }
    }

    /// Like `wait_idle` with a deadline; true when idle was reached
    pub(crate) fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while !state.is_idle() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = wait_timeout(&self.idle, state, deadline - now).0;
        }
        true
    }
}
