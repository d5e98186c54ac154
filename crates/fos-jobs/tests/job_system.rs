//! Job system integration tests
//!
//! Worker scheduling, cancellation, groups and shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use fos_jobs::*;

const TIMEOUT: Duration = Duration::from_secs(5);

fn single(category: WorkloadCategory, task: impl FnMut() + Send + 'static) -> (CommandQueue, CommandHandle) {
    let queue = CommandQueue::new(category, ThreadAffinity::AnyThread);
    let command = Command::from_fn(category, ThreadAffinity::AnyThread, task);
    let handle = command.handle();
    queue
        .add_list(CommandList::for_queue(&queue).with_command(command))
        .unwrap();
    (queue, handle)
}

fn counting(category: WorkloadCategory, counter: &Arc<AtomicUsize>) -> (CommandQueue, CommandHandle) {
    let counter = Arc::clone(counter);
    single(category, move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

/// Occupies a worker until `release` is sent to
struct Blocker {
    release: Sender<()>,
}

impl Blocker {
    fn start(system: &JobSystem, category: WorkloadCategory) -> Self {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx): (Sender<()>, Receiver<()>) = mpsc::channel();
        let (queue, _) = single(category, move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(TIMEOUT);
        });
        system.add_job(&queue).unwrap();
        started_rx.recv_timeout(TIMEOUT).unwrap();
        Self {
            release: release_tx,
        }
    }

    fn release(self) {
        let _ = self.release.send(());
    }
}

fn parsing_only(threads: usize) -> JobSystemConfig {
    JobSystemConfig::new(0, 0, 0, threads)
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_initialize_counts_threads() {
    let system = JobSystem::with_config(JobSystemConfig::new(2, 1, 1, 0)).unwrap();

    assert!(system.is_running());
    assert_eq!(system.thread_count(), 4);
    assert_eq!(system.max_threads(), 4);
    assert_eq!(system.pool_threads(PoolKind::Composition), 2);
    assert_eq!(system.pool_threads(PoolKind::Parsing), 0);

    let counter = Arc::new(AtomicUsize::new(0));
    let (layout, _) = counting(WorkloadCategory::Layout, &counter);
    assert!(matches!(
        system.add_job(&layout),
        Err(JobError::NoWorkers(PoolKind::Parsing))
    ));

    system.shutdown();
    assert_eq!(system.thread_count(), 0);
    assert_eq!(system.max_threads(), 0);
}

#[test]
fn test_initialize_twice_fails() {
    let system = JobSystem::with_config(JobSystemConfig::default()).unwrap();
    assert!(matches!(
        system.initialize(JobSystemConfig::default()),
        Err(JobError::AlreadyRunning)
    ));

    system.shutdown();
    system.initialize(parsing_only(1)).unwrap();
    assert_eq!(system.thread_count(), 1);
}

#[test]
fn test_initialize_rejects_invalid_config() {
    let system = JobSystem::new();
    assert!(matches!(
        system.initialize(JobSystemConfig::new(0, 0, 0, 0)),
        Err(JobError::InvalidConfig(_))
    ));
    assert!(!system.is_running());
}

#[test]
fn test_create_category_threads() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();

    system.create_category_threads(ThreadAffinity::FreeScripting, 2).unwrap();
    assert_eq!(system.pool_threads(PoolKind::Scripting), 2);
    assert_eq!(system.thread_count(), 3);
    assert_eq!(system.max_threads(), 3);

    assert!(matches!(
        system.create_category_threads(ThreadAffinity::AnyThread, 1),
        Err(JobError::UnroutableAffinity(ThreadAffinity::AnyThread))
    ));
}

#[test]
fn test_shutdown_joins_workers() {
    let system = JobSystem::with_config(JobSystemConfig::new(1, 1, 1, 1)).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = [
        WorkloadCategory::Composition,
        WorkloadCategory::Scripting,
        WorkloadCategory::Rendering,
        WorkloadCategory::Css,
    ]
    .into_iter()
    .map(|category| {
        let (queue, handle) = counting(category, &counter);
        system.add_job(&queue).unwrap();
        (queue, handle)
    })
    .collect();

    system.shutdown();
    assert_eq!(system.thread_count(), 0);
    assert_eq!(system.queued_jobs(), 0);
    assert!(matches!(
        system.add_job(&handles[0].0),
        Err(JobError::NotRunning)
    ));

    // Every job either ran or was canceled
    for (_, handle) in &handles {
        assert!(matches!(
            handle.state(),
            CommandState::Retired | CommandState::Canceled
        ));
    }
    let ran = handles.iter().filter(|(_, h)| h.is_retired()).count();
    assert_eq!(counter.load(Ordering::SeqCst), ran);

    // Idempotent
    system.shutdown();
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[test]
fn test_jobs_run_lists_in_order() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let queue = CommandQueue::new(WorkloadCategory::Css, ThreadAffinity::FreeCss);

    for list_index in 0..3 {
        let mut list = CommandList::for_queue(&queue);
        for command_index in 0..4 {
            let log = Arc::clone(&log);
            list.add_command(Command::from_fn(
                WorkloadCategory::Css,
                ThreadAffinity::FreeCss,
                move || log.lock().unwrap().push((list_index, command_index)),
            ));
        }
        queue.add_list(list).unwrap();
    }

    let id = system.add_job(&queue).unwrap();
    system.wait();

    let expected: Vec<_> = (0..3).flat_map(|l| (0..4).map(move |c| (l, c))).collect();
    assert_eq!(*log.lock().unwrap(), expected);
    assert!(!system.is_job_running(id, &queue));
    assert_eq!(system.queued_jobs(), 0);
}

#[test]
fn test_wait_returns_when_idle() {
    let system = JobSystem::with_config(JobSystemConfig::new(1, 1, 2, 1)).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    let mut queues = Vec::new();

    for _ in 0..5 {
        for category in [
            WorkloadCategory::Composition,
            WorkloadCategory::Rendering,
            WorkloadCategory::Layout,
        ] {
            let (queue, _) = counting(category, &counter);
            system.add_job(&queue).unwrap();
            queues.push(queue);
        }
    }

    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 15);
    assert_eq!(system.active_threads(), 0);
    assert_eq!(system.stats().completed_jobs, 15);
}

#[test]
fn test_active_threads_while_blocked() {
    let system = JobSystem::with_config(JobSystemConfig::new(0, 1, 0, 1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Scripting);

    assert_eq!(system.active_script_threads(), 1);
    assert_eq!(system.active_parsing_threads(), 0);
    assert_eq!(system.active_threads(), 1);
    assert!(!system.wait_timeout(Duration::from_millis(20)));

    blocker.release();
    assert!(system.wait_timeout(TIMEOUT));
    assert_eq!(system.active_threads(), 0);
}

#[test]
fn test_add_job_rejections() {
    let system = JobSystem::with_config(JobSystemConfig::default()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let (locked, _) = counting(WorkloadCategory::Css, &counter);
    let guard = locked.request_lock().unwrap();
    let err = system.add_job(&locked).unwrap_err();
    assert!(matches!(err, JobError::QueueBusy { .. }));
    assert!(err.is_retryable());
    drop(guard);

    let (custom, _) = counting(WorkloadCategory::Custom, &counter);
    assert!(matches!(
        system.add_job(&custom),
        Err(JobError::UnroutableCategory(WorkloadCategory::Custom))
    ));

    let pinned = CommandQueue::new(WorkloadCategory::Rendering, ThreadAffinity::FreeLayout);
    assert!(matches!(
        system.add_job(&pinned),
        Err(JobError::AffinityMismatch {
            expected: ThreadAffinity::FreeRendering,
            found: ThreadAffinity::FreeLayout,
        })
    ));

    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_backpressure() {
    let system = JobSystem::with_config(parsing_only(1).with_max_pending_jobs(2)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));

    let (a, _) = counting(WorkloadCategory::Layout, &counter);
    let (b, _) = counting(WorkloadCategory::Layout, &counter);
    let (c, _) = counting(WorkloadCategory::Layout, &counter);
    system.add_job(&a).unwrap();
    system.add_job(&b).unwrap();
    assert_eq!(system.pending_jobs(PoolKind::Parsing), 2);

    let err = system.add_job(&c).unwrap_err();
    assert!(matches!(
        err,
        JobError::Saturated {
            kind: PoolKind::Parsing,
            pending: 2,
        }
    ));
    assert!(err.is_retryable());

    blocker.release();
    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    // Room again once drained
    system.add_job(&c).unwrap();
    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_dynamic_growth() {
    let config = parsing_only(1)
        .with_dynamic_growth(true)
        .with_max_dynamic_threads(1);
    let system = JobSystem::with_config(config).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);

    let counter = Arc::new(AtomicUsize::new(0));
    let (queue, handle) = counting(WorkloadCategory::Layout, &counter);
    system.add_job(&queue).unwrap();

    // The extra worker runs it while the first one is blocked
    handle.join(Some(TIMEOUT)).unwrap();
    assert_eq!(system.thread_count(), 2);
    assert_eq!(system.stats().dynamic_threads, 1);
    assert_eq!(system.max_threads(), 1);

    blocker.release();
    system.wait();
}

#[test]
fn test_panicking_command_is_contained() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let (bad, handle) = single(WorkloadCategory::Layout, || panic!("layout overflow"));
    system.add_job(&bad).unwrap();
    system.wait();

    assert!(handle.end_result().is_error());
    assert_eq!(system.stats().failed_commands, 1);

    // The worker survives
    let counter = Arc::new(AtomicUsize::new(0));
    let (good, _) = counting(WorkloadCategory::Layout, &counter);
    system.add_job(&good).unwrap();
    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reentrant_add_job_reports_busy() {
    let system = Arc::new(JobSystem::with_config(parsing_only(1)).unwrap());
    let weak: Weak<JobSystem> = Arc::downgrade(&system);
    let outcome = Arc::new(Mutex::new(None));

    let queue = CommandQueue::new(WorkloadCategory::Layout, ThreadAffinity::AnyThread);
    let (inner_queue, inner_outcome) = (queue.clone(), Arc::clone(&outcome));
    queue
        .add_list(CommandList::for_queue(&queue).with_command(Command::from_fn(
            WorkloadCategory::Layout,
            ThreadAffinity::AnyThread,
            move || {
                if let Some(system) = weak.upgrade() {
                    let busy = matches!(
                        system.add_job(&inner_queue),
                        Err(JobError::QueueBusy { .. })
                    );
                    *inner_outcome.lock().unwrap() = Some(busy);
                }
            },
        )))
        .unwrap();

    system.add_job(&queue).unwrap();
    system.wait();
    assert_eq!(*outcome.lock().unwrap(), Some(true));
    system.shutdown();
}

#[test]
fn test_locked_queue_does_not_stall_pool() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));

    let (held, held_handle) = counting(WorkloadCategory::Layout, &counter);
    let id = system.add_job(&held).unwrap();
    let guard = held.request_lock().unwrap();

    let (other, other_handle) = counting(WorkloadCategory::Layout, &counter);
    system.add_job(&other).unwrap();
    blocker.release();

    // The only worker moves past the held queue
    other_handle.join(Some(TIMEOUT)).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(held_handle.state(), CommandState::Pending);
    assert!(system.is_job_running(id, &held));

    guard.release();
    held_handle.join(Some(TIMEOUT)).unwrap();
    assert!(system.wait_timeout(TIMEOUT));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(!system.is_job_running(id, &held));
}

#[test]
fn test_add_job_racing_shutdown() {
    let system = Arc::new(JobSystem::with_config(parsing_only(2)).unwrap());
    let counter = Arc::new(AtomicUsize::new(0));

    let submitter = {
        let system = Arc::clone(&system);
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
            let mut queues = Vec::new();
            for _ in 0..10_000 {
                let (queue, _) = counting(WorkloadCategory::Layout, &counter);
                match system.add_job(&queue) {
                    Ok(_) => queues.push(queue),
                    Err(JobError::NotRunning) => break,
                    Err(_) => std::thread::yield_now(),
                }
            }
            queues
        })
    };

    std::thread::sleep(Duration::from_millis(10));
    system.shutdown();
    let queues = submitter.join().unwrap();

    // Nothing registered after the workers stopped
    assert_eq!(system.queued_jobs(), 0);
    assert_eq!(system.pending_jobs(PoolKind::Parsing), 0);
    assert!(system.wait_timeout(TIMEOUT));
    assert!(counter.load(Ordering::SeqCst) <= queues.len());

    let (late, _) = counting(WorkloadCategory::Layout, &counter);
    assert!(matches!(system.add_job(&late), Err(JobError::NotRunning)));
}

#[test]
fn test_run_general_with_idle_system() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    assert_eq!(system.run_general(), 0);
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[test]
fn test_cancel_job_respects_queue_lock() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);

    let counter = Arc::new(AtomicUsize::new(0));
    let (target, handle) = counting(WorkloadCategory::Layout, &counter);
    let id = system.add_job(&target).unwrap();
    assert!(system.is_job_running(id, &target));

    let guard = target.request_lock().unwrap();
    assert!(matches!(
        system.cancel_job(id, &target),
        Err(JobError::QueueBusy { .. })
    ));
    assert!(system.is_job_running(id, &target));
    drop(guard);

    system.cancel_job(id, &target).unwrap();
    assert!(!system.is_job_running(id, &target));
    assert_eq!(handle.state(), CommandState::Canceled);
    assert!(matches!(
        system.cancel_job(id, &target),
        Err(JobError::JobNotFound { .. })
    ));

    blocker.release();
    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_then_resubmit_runs_commands() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));

    let (queue, handle) = counting(WorkloadCategory::Layout, &counter);
    let id = system.add_job(&queue).unwrap();
    system.cancel_job(id, &queue).unwrap();
    assert!(matches!(handle.join(Some(Duration::ZERO)), Err(JobError::Canceled)));

    // Registering again makes the commands pending before anything runs
    system.add_job(&queue).unwrap();
    assert_eq!(handle.state(), CommandState::Pending);
    let joiner = {
        let handle = handle.clone();
        std::thread::spawn(move || handle.join(Some(TIMEOUT)))
    };

    blocker.release();
    assert!(joiner.join().unwrap().is_ok());
    system.wait();
    assert_eq!(handle.run_count(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancel_all_jobs_skips_locked_queues() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));

    let queues: Vec<_> = (0..3)
        .map(|_| {
            let (queue, _) = counting(WorkloadCategory::Layout, &counter);
            system.add_job(&queue).unwrap();
            queue
        })
        .collect();
    assert_eq!(system.queued_jobs(), 4);

    // The blocker's queue is held by its worker
    let guard = queues[0].request_lock().unwrap();
    let report = system.cancel_all_jobs();
    assert_eq!(report, CancelReport { canceled: 2, skipped: 2 });
    drop(guard);

    let report = system.cancel_all_jobs();
    assert_eq!(report, CancelReport { canceled: 1, skipped: 1 });

    blocker.release();
    system.wait();
    assert_eq!(system.queued_jobs(), 0);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_all_jobs_empties_registry() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));
    let (queue, _) = counting(WorkloadCategory::Layout, &counter);
    system.add_job(&queue).unwrap();

    blocker.release();
    system.wait();
    system.cancel_all_jobs();
    assert_eq!(system.queued_jobs(), 0);
}

// ============================================================================
// GROUPS
// ============================================================================

#[test]
fn test_group_lifecycle() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));

    let (first, _) = counting(WorkloadCategory::Layout, &counter);
    let (second, _) = counting(WorkloadCategory::Css, &counter);
    let group = CommandGroup::new("style", ThreadAffinity::FreeCss)
        .with_queue(first)
        .with_queue(second)
        .required(true);
    let twin = CommandGroup::new("style", ThreadAffinity::FreeCss)
        .with_queue(group.queues()[0].clone())
        .with_queue(group.queues()[1].clone())
        .required(true);
    assert!(group.eq_ignoring_id(&twin));
    assert_ne!(group, twin);

    let id = system.add_command_group(group.clone()).unwrap();
    assert_eq!(id, group.id());
    assert_eq!(system.required_groups().len(), 1);

    let jobs = system.submit_group(&group).unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(system.is_job_group_running(&group));

    assert_eq!(system.cancel_job_group(&group).unwrap(), 2);
    assert!(!system.is_job_group_running(&group));
    assert!(system.command_groups().is_empty());

    blocker.release();
    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_job_group_reports_locked_member() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));

    let (free, _) = counting(WorkloadCategory::Layout, &counter);
    let (held, _) = counting(WorkloadCategory::Layout, &counter);
    let group = CommandGroup::new("layout", ThreadAffinity::FreeLayout)
        .with_queue(free.clone())
        .with_queue(held.clone());
    system.submit_group(&group).unwrap();

    let guard = held.request_lock().unwrap();
    assert!(matches!(
        system.cancel_job_group(&group),
        Err(JobError::QueueBusy { .. })
    ));
    // The free member is gone, the held one and the blocker remain
    assert_eq!(system.queued_jobs(), 2);
    drop(guard);

    blocker.release();
    system.wait();
    // Only the locked member ran
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_submit_group_rolls_back_on_error() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let blocker = Blocker::start(&system, WorkloadCategory::Css);
    let counter = Arc::new(AtomicUsize::new(0));

    let (layout, _) = counting(WorkloadCategory::Layout, &counter);
    let (unroutable, _) = counting(WorkloadCategory::Presentation, &counter);
    let group = CommandGroup::new("mixed", ThreadAffinity::AnyThread)
        .with_queue(layout)
        .with_queue(unroutable);

    assert!(matches!(
        system.submit_group(&group),
        Err(JobError::UnroutableCategory(WorkloadCategory::Presentation))
    ));
    // Only the blocker is still registered
    assert_eq!(system.queued_jobs(), 1);

    blocker.release();
    system.wait();
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

// ============================================================================
// LIFETIME OBJECTS
// ============================================================================

#[test]
fn test_lifetime_objects() {
    let system = JobSystem::with_config(parsing_only(1)).unwrap();
    let runtime = Arc::new(String::from("script runtime"));
    system.add_lifetime_object(LifetimeScope::Script, Arc::clone(&runtime));
    system.add_lifetime_object(LifetimeScope::General, Arc::new(42u64));

    assert_eq!(system.lifetime_object_count(LifetimeScope::Script), 1);
    assert_eq!(*system.lifetime_objects::<u64>(LifetimeScope::General)[0], 42);
    assert_eq!(system.stats().lifetime_objects, 2);

    system.shutdown();
    assert_eq!(Arc::strong_count(&runtime), 1);
}
