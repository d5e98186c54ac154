//! Job System
//!
//! Owns the worker pools, the per-pool job registries, command groups and
//! lifetime objects. Jobs are queues registered for one execution on the
//! pool that runs their category.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::JobSystemConfig;
use crate::error::{JobError, Result};
use crate::group::{CommandGroup, GroupId};
use crate::lifetime::{LifetimeRegistry, LifetimeScope};
use crate::pool::{Activity, Ticket, WorkChannel, WorkerPool};
use crate::queue::CommandQueue;
use crate::registry::{JobId, JobRegistry, position};
use crate::sync::{lock, try_read, write};
use crate::types::{PoolKind, ThreadAffinity};

/// State shared with worker threads
pub(crate) struct SystemCore {
    registries: [JobRegistry; 4],
    channels: [WorkChannel; 4],
    activity: Activity,
}

impl SystemCore {
    fn new() -> Self {
        Self {
            registries: PoolKind::ALL.map(JobRegistry::new),
            channels: std::array::from_fn(|_| WorkChannel::new()),
            activity: Activity::default(),
        }
    }

    pub(crate) fn channel(&self, kind: PoolKind) -> &WorkChannel {
        &self.channels[kind.index()]
    }

    fn registry(&self, kind: PoolKind) -> &JobRegistry {
        &self.registries[kind.index()]
    }

    /// Run the job behind `ticket` unless it was canceled.
    ///
    /// A ticket whose queue gate is held is handed back for a later retry.
    pub(crate) fn dispatch(&self, kind: PoolKind, ticket: Ticket) -> Option<Ticket> {
        self.activity.begin(kind);
        let registry = self.registry(kind);

        let entries = registry.lock();
        if position(&entries, ticket.id, &ticket.queue).is_none() {
            drop(entries);
            tracing::debug!("{} was canceled before it ran", ticket.id);
            self.activity.finish(kind, false, 0);
            return None;
        }

        let Some(guard) = ticket.queue.try_lock() else {
            drop(entries);
            self.activity.defer(kind);
            return Some(ticket);
        };
        drop(entries);

        tracing::debug!("Running {} on {} ({} pool)", ticket.id, ticket.queue.id(), kind);
        let report = ticket.queue.execute_locked(&guard, true);

        // Unregister while the gate is still held
        let mut entries = registry.lock();
        if let Some(pos) = position(&entries, ticket.id, &ticket.queue) {
            entries.remove(pos);
        }
        drop(entries);
        drop(guard);

        self.activity.finish(kind, true, report.failures.len());
        None
    }
}

/// Outcome of `cancel_all_jobs`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
    pub canceled: usize,
    /// Jobs left registered because their queue was locked
    pub skipped: usize,
}

/// Job system statistics
#[derive(Debug, Clone, Default)]
pub struct JobSystemStats {
    pub threads: usize,
    pub max_threads: usize,
    pub dynamic_threads: usize,
    pub active_threads: usize,
    pub queued_jobs: usize,
    pub pending_tickets: usize,
    pub completed_jobs: u64,
    pub failed_commands: u64,
    pub command_groups: usize,
    pub lifetime_objects: usize,
}

/// Job scheduler with per-category worker pools
pub struct JobSystem {
    core: Arc<SystemCore>,
    pools: [WorkerPool; 4],
    config: Mutex<JobSystemConfig>,
    running: AtomicBool,
    /// Written by initialize and shutdown, read across job registration
    lifecycle: RwLock<()>,
    max_threads: AtomicUsize,
    dynamic_threads: AtomicUsize,
    groups: Mutex<Vec<CommandGroup>>,
    lifetime: LifetimeRegistry,
}

impl std::fmt::Debug for JobSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSystem")
            .field("running", &self.is_running())
            .field("threads", &self.thread_count())
            .field("max_threads", &self.max_threads())
            .field("queued_jobs", &self.queued_jobs())
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl Default for JobSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSystem {
    /// Create a stopped job system
    pub fn new() -> Self {
        Self {
            core: Arc::new(SystemCore::new()),
            pools: PoolKind::ALL.map(WorkerPool::new),
            config: Mutex::new(JobSystemConfig::default()),
            running: AtomicBool::new(false),
            lifecycle: RwLock::new(()),
            max_threads: AtomicUsize::new(0),
            dynamic_threads: AtomicUsize::new(0),
            groups: Mutex::new(Vec::new()),
            lifetime: LifetimeRegistry::default(),
        }
    }

    /// Create and initialize
    pub fn with_config(config: JobSystemConfig) -> Result<Self> {
        let system = Self::new();
        system.initialize(config)?;
        Ok(system)
    }

    /// Spawn the worker pools described by `config`
    pub fn initialize(&self, config: JobSystemConfig) -> Result<()> {
        let _lifecycle = write(&self.lifecycle);
        if self.is_running() {
            tracing::warn!("Job system is already running");
            return Err(JobError::AlreadyRunning);
        }
        config
            .validate()
            .inspect_err(|e| tracing::error!("Rejected job system config: {}", e))?;

        self.core.activity.reset();
        for channel in &self.core.channels {
            channel.reopen();
        }
        for kind in PoolKind::ALL {
            if let Err(e) = self.pools[kind.index()].spawn(config.threads_for(kind), &self.core) {
                self.stop_workers();
                return Err(e);
            }
        }

        self.max_threads.store(config.total_threads(), Ordering::Release);
        self.dynamic_threads.store(0, Ordering::Release);
        *lock(&self.config) = config.clone();
        self.running.store(true, Ordering::Release);

        tracing::info!(
            "Job system initialized: {} composition, {} script, {} rendering, {} parsing threads",
            config.composition_threadcount,
            config.script_threadcount,
            config.rendering_threadcount,
            config.parsing_threadcount
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> JobSystemConfig {
        lock(&self.config).clone()
    }

    /// Add `count` workers to the pool serving `affinity`
    pub fn create_category_threads(&self, affinity: ThreadAffinity, count: usize) -> Result<()> {
        let Some(kind) = affinity.pool() else {
            tracing::error!("No worker pool serves {} threads", affinity);
            return Err(JobError::UnroutableAffinity(affinity));
        };
        if !self.is_running() {
            return Err(JobError::NotRunning);
        }

        self.pools[kind.index()].spawn(count, &self.core)?;
        self.max_threads.fetch_add(count, Ordering::AcqRel);
        tracing::info!("Added {} {} threads", count, kind);
        Ok(())
    }

    /// Register `queue` for one execution on its category's pool.
    ///
    /// Commands canceled with an earlier job of the queue become pending
    /// again.
    pub fn add_job(&self, queue: &CommandQueue) -> Result<JobId> {
        // Fails while initialize or shutdown is in progress
        let lifecycle = try_read(&self.lifecycle);
        if lifecycle.is_none() || !self.is_running() {
            tracing::warn!("Rejected {}: job system is not running", queue.id());
            return Err(JobError::NotRunning);
        }
        let kind = route(queue)?;
        if queue.is_locked() {
            tracing::warn!("Rejected {}: queue is locked", queue.id());
            return Err(queue.busy_error());
        }

        let config = self.config();
        let pool = &self.pools[kind.index()];
        if pool.len() == 0 && !self.grow(kind, &config) {
            tracing::error!(
                "No {} workers to run {} ({}/{})",
                kind,
                queue.id(),
                queue.category(),
                queue.affinity()
            );
            return Err(JobError::NoWorkers(kind));
        }

        let pending = self
            .core
            .activity
            .reserve(kind, config.max_pending_jobs)
            .inspect_err(|e| tracing::warn!("Rejected {}: {}", queue.id(), e))?;

        let id = JobId::new();
        {
            let _entries = self.core.registry(kind).insert(id, queue.clone());
            let rearmed = queue.rearm();
            if rearmed > 0 {
                tracing::debug!("{}: {} canceled commands pending again", queue.id(), rearmed);
            }
        }
        self.core.channel(kind).push(Ticket {
            id,
            queue: queue.clone(),
        });
        tracing::debug!("Queued {} for {} on the {} pool", id, queue.id(), kind);

        let idle = pool.len().saturating_sub(self.core.activity.active(kind));
        if pending > idle {
            self.grow(kind, &config);
        }
        Ok(id)
    }

    /// Spawn one extra worker if the growth policy allows it
    fn grow(&self, kind: PoolKind, config: &JobSystemConfig) -> bool {
        if !config.allow_dynamic_growth {
            return false;
        }
        let reserved = self
            .dynamic_threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < config.max_dynamic_threads).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }

        match self.pools[kind.index()].spawn(1, &self.core) {
            Ok(()) => {
                tracing::info!(
                    "Spawned extra {} worker ({} of {})",
                    kind,
                    self.dynamic_threads.load(Ordering::Acquire),
                    config.max_dynamic_threads
                );
                true
            }
            Err(_) => {
                self.dynamic_threads.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Submit every queue of `group`.
    ///
    /// Jobs already queued are canceled again if one queue is refused.
    pub fn submit_group(&self, group: &CommandGroup) -> Result<Vec<JobId>> {
        let mut ids = Vec::with_capacity(group.queues().len());
        for queue in group.queues() {
            match self.add_job(queue) {
                Ok(id) => ids.push((id, queue)),
                Err(e) => {
                    tracing::warn!("Submitting group {} failed: {}", group.name(), e);
                    for (id, queue) in ids {
                        let _ = self.cancel_job(id, queue);
                    }
                    return Err(e);
                }
            }
        }
        tracing::debug!("Submitted group {} ({} jobs)", group.name(), ids.len());
        Ok(ids.into_iter().map(|(id, _)| id).collect())
    }

    /// Remove a registered job before it runs
    pub fn cancel_job(&self, id: JobId, queue: &CommandQueue) -> Result<()> {
        let kind = route(queue)?;
        {
            let mut entries = self.core.registry(kind).lock();
            if queue.is_locked() {
                tracing::warn!("Cannot cancel {}: {} is locked", id, queue.id());
                return Err(queue.busy_error());
            }
            let Some(pos) = position(&entries, id, queue) else {
                tracing::warn!("Cannot cancel {}: not registered for {}", id, queue.id());
                return Err(JobError::JobNotFound {
                    id,
                    queue: queue.id(),
                });
            };
            entries.remove(pos);
        }

        self.forget(kind, id, queue);
        tracing::debug!("Canceled {} ({})", id, queue.id());
        Ok(())
    }

    /// Cancel every job of `queue`
    fn cancel_queue_jobs(&self, kind: PoolKind, queue: &CommandQueue) -> Result<usize> {
        let removed: Vec<JobId> = {
            let mut entries = self.core.registry(kind).lock();
            if queue.is_locked() {
                return Err(queue.busy_error());
            }
            let mut removed = Vec::new();
            entries.retain(|(id, q)| {
                if q == queue {
                    removed.push(*id);
                    false
                } else {
                    true
                }
            });
            removed
        };

        for &id in &removed {
            self.forget(kind, id, queue);
        }
        Ok(removed.len())
    }

    /// Drop the ticket of an unregistered job and cancel what it would have run
    fn forget(&self, kind: PoolKind, id: JobId, queue: &CommandQueue) {
        if self.core.channel(kind).remove(id) {
            self.core.activity.release(kind);
        }

        // Decided under the registry lock so a concurrent add_job wins
        let entries = self.core.registry(kind).lock();
        if entries.iter().any(|(_, q)| q == queue) {
            return;
        }
        if let Some(guard) = queue.try_lock() {
            let canceled = queue.cancel_pending(&guard);
            if canceled > 0 {
                tracing::debug!("{}: {} commands canceled", queue.id(), canceled);
            }
        }
    }

    /// Register a command group
    pub fn add_command_group(&self, group: CommandGroup) -> Result<GroupId> {
        if !self.is_running() {
            return Err(JobError::NotRunning);
        }
        let id = group.id();
        tracing::info!(
            "Added command group {} ({}, {} queues)",
            group.name(),
            group.affinity(),
            group.queues().len()
        );
        lock(&self.groups).push(group);
        Ok(id)
    }

    /// Cancel every job of the group's queues and forget the group.
    ///
    /// Locked members are reported with `QueueBusy`; the rest are still
    /// canceled.
    pub fn cancel_job_group(&self, group: &CommandGroup) -> Result<usize> {
        let mut canceled = 0;
        let mut busy = None;

        for queue in group.queues() {
            let Some(kind) = queue.category().pool() else {
                continue;
            };
            match self.cancel_queue_jobs(kind, queue) {
                Ok(n) => canceled += n,
                Err(e) => {
                    tracing::warn!("Group {}: {}", group.name(), e);
                    busy.get_or_insert(e);
                }
            }
        }

        lock(&self.groups).retain(|g| g.id() != group.id());
        tracing::info!("Canceled command group {} ({} jobs)", group.name(), canceled);

        match busy {
            Some(e) => Err(e),
            None => Ok(canceled),
        }
    }

    /// Cancel every registered job whose queue is not locked
    pub fn cancel_all_jobs(&self) -> CancelReport {
        let mut report = CancelReport::default();

        for kind in PoolKind::ALL {
            let removed: Vec<(JobId, CommandQueue)> = {
                let mut entries = self.core.registry(kind).lock();
                let (locked, free): (VecDeque<_>, VecDeque<_>) =
                    entries.drain(..).partition(|(_, q)| q.is_locked());
                *entries = locked;
                report.skipped += entries.len();
                Vec::from(free)
            };

            for (id, queue) in &removed {
                self.forget(kind, *id, queue);
            }
            report.canceled += removed.len();
        }

        if report.skipped > 0 {
            tracing::warn!(
                "Canceled {} jobs, {} skipped on locked queues",
                report.canceled,
                report.skipped
            );
        } else if report.canceled > 0 {
            tracing::debug!("Canceled {} jobs", report.canceled);
        }
        report
    }

    /// Whether `id` is still registered for `queue`
    pub fn is_job_running(&self, id: JobId, queue: &CommandQueue) -> bool {
        queue
            .category()
            .pool()
            .is_some_and(|kind| self.core.registry(kind).contains(id, queue))
    }

    pub fn is_job_group_running(&self, group: &CommandGroup) -> bool {
        group.queues().iter().any(|queue| {
            queue
                .category()
                .pool()
                .is_some_and(|kind| self.core.registry(kind).contains_queue(queue))
        })
    }

    /// Block until no ticket is pending and no worker is busy
    pub fn wait(&self) {
        self.core.activity.wait_idle();
    }

    /// Like [`wait`](Self::wait) with a timeout; true if the system went idle
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.core.activity.wait_idle_timeout(timeout)
    }

    /// Run pending jobs of every pool on the calling thread.
    ///
    /// Jobs whose queue is locked stay queued. Returns the number of
    /// tickets handled.
    pub fn run_general(&self) -> usize {
        let mut handled = 0;
        for kind in PoolKind::ALL {
            let channel = self.core.channel(kind);
            for _ in 0..channel.len() {
                let Some(ticket) = channel.pop() else {
                    break;
                };
                match self.core.dispatch(kind, ticket) {
                    Some(deferred) => channel.push(deferred),
                    None => handled += 1,
                }
            }
        }
        handled
    }

    /// Cancel, drain and stop everything
    pub fn shutdown(&self) {
        let _lifecycle = write(&self.lifecycle);
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if !was_running && self.thread_count() == 0 {
            return;
        }

        loop {
            let report = self.cancel_all_jobs();
            self.wait();
            if self.queued_jobs() == 0 {
                break;
            }
            tracing::debug!("Shutdown waiting on {} jobs of locked queues", report.skipped);
        }
        debug_assert!(PoolKind::ALL.iter().all(|&k| self.core.registry(k).is_empty()));

        let joined = self.stop_workers();
        let released = self.lifetime.clear();
        let groups = std::mem::take(&mut *lock(&self.groups)).len();
        self.max_threads.store(0, Ordering::Release);
        self.dynamic_threads.store(0, Ordering::Release);

        tracing::info!(
            "Job system shut down: joined {} workers, released {} lifetime objects and {} groups",
            joined,
            released,
            groups
        );
    }

    fn stop_workers(&self) -> usize {
        for channel in &self.core.channels {
            channel.shutdown();
        }
        self.pools.iter().map(WorkerPool::join_all).sum()
    }

    /// Workers currently running a job
    pub fn active_threads(&self) -> usize {
        PoolKind::ALL
            .iter()
            .map(|&kind| self.core.activity.active(kind))
            .sum()
    }

    /// Configured worker capacity
    pub fn max_threads(&self) -> usize {
        self.max_threads.load(Ordering::Acquire)
    }

    /// Live worker threads, including dynamic ones
    pub fn thread_count(&self) -> usize {
        self.pools.iter().map(WorkerPool::len).sum()
    }

    /// Tickets of `kind` waiting for a worker
    pub fn pending_jobs(&self, kind: PoolKind) -> usize {
        self.core.activity.pending(kind)
    }

    pub fn pool_threads(&self, kind: PoolKind) -> usize {
        self.pools[kind.index()].len()
    }

    /// Registered jobs across all pools
    pub fn queued_jobs(&self) -> usize {
        self.core.registries.iter().map(JobRegistry::len).sum()
    }

    pub fn active_composition_threads(&self) -> usize {
        self.core.activity.active(PoolKind::Composition)
    }

    pub fn active_script_threads(&self) -> usize {
        self.core.activity.active(PoolKind::Scripting)
    }

    pub fn active_rendering_threads(&self) -> usize {
        self.core.activity.active(PoolKind::Rendering)
    }

    pub fn active_parsing_threads(&self) -> usize {
        self.core.activity.active(PoolKind::Parsing)
    }

    pub fn stats(&self) -> JobSystemStats {
        let activity = self.core.activity.snapshot();
        JobSystemStats {
            threads: self.thread_count(),
            max_threads: self.max_threads(),
            dynamic_threads: self.dynamic_threads.load(Ordering::Acquire),
            active_threads: activity.active.iter().sum(),
            queued_jobs: self.queued_jobs(),
            pending_tickets: activity.pending.iter().sum(),
            completed_jobs: activity.completed,
            failed_commands: activity.failed_commands,
            command_groups: lock(&self.groups).len(),
            lifetime_objects: self.lifetime.total(),
        }
    }

    pub fn command_groups(&self) -> Vec<CommandGroup> {
        lock(&self.groups).clone()
    }

    pub fn required_groups(&self) -> Vec<CommandGroup> {
        lock(&self.groups)
            .iter()
            .filter(|g| g.is_required())
            .cloned()
            .collect()
    }

    /// Keep `object` alive until shutdown
    pub fn add_lifetime_object<T: Any + Send + Sync>(&self, scope: LifetimeScope, object: Arc<T>) {
        tracing::debug!("Holding {} lifetime object", scope);
        self.lifetime.add(scope, object);
    }

    /// Lifetime objects of type `T` held in `scope`
    pub fn lifetime_objects<T: Any + Send + Sync>(&self, scope: LifetimeScope) -> Vec<Arc<T>> {
        self.lifetime.get(scope)
    }

    pub fn lifetime_object_count(&self, scope: LifetimeScope) -> usize {
        self.lifetime.len(scope)
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pool that runs `queue`, checking its affinity against the category
fn route(queue: &CommandQueue) -> Result<PoolKind> {
    let Some(kind) = queue.category().pool() else {
        tracing::error!(
            "No worker pool runs {} work ({})",
            queue.category(),
            queue.affinity()
        );
        return Err(JobError::UnroutableCategory(queue.category()));
    };

    if let Some(pinned) = queue.affinity().pool() {
        if pinned != kind {
            tracing::error!(
                "{} pins {} work to {} threads",
                queue.id(),
                queue.category(),
                queue.affinity()
            );
            return Err(JobError::AffinityMismatch {
                expected: kind.affinity(),
                found: queue.affinity(),
            });
        }
    }
    Ok(kind)
}
