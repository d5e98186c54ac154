//! Commands
//!
//! A command is the smallest unit of work: a callable tagged with the kind
//! of work it does and the threads allowed to run it. Commands are owned by
//! their [`CommandList`](crate::CommandList); other threads observe them
//! through a [`CommandHandle`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{JobError, Result};
use crate::list::ListId;
use crate::queue::{CommandQueue, QueueShared};
use crate::sync::{lock, wait, wait_timeout};
use crate::types::{EndResult, ThreadAffinity, WorkloadCategory};

/// Boxed command body
pub type CommandFn = Box<dyn FnMut() -> EndResult + Send + 'static>;

/// Lifecycle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Not run yet
    Pending,
    /// Callable is running
    Executing,
    /// Finished at least one run
    Retired,
    /// Released or canceled without running
    Canceled,
}

#[derive(Debug)]
struct SignalState {
    state: CommandState,
    result: EndResult,
    runs: u64,
}

/// Shared completion state between a command and its handles
#[derive(Debug)]
struct Signal {
    inner: Mutex<SignalState>,
    changed: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SignalState {
                state: CommandState::Pending,
                result: EndResult::None,
                runs: 0,
            }),
            changed: Condvar::new(),
        }
    }

    fn begin(&self) {
        let mut inner = lock(&self.inner);
        inner.state = CommandState::Executing;
        inner.result = EndResult::None;
    }

    fn retire(&self, result: EndResult) {
        let mut inner = lock(&self.inner);
        inner.state = CommandState::Retired;
        inner.runs += 1;
        // A body returning nothing keeps whatever it reported explicitly
        if !result.is_none() {
            inner.result = result;
        }
        self.changed.notify_all();
    }

    fn cancel_if_pending(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != CommandState::Pending {
            return false;
        }
        inner.state = CommandState::Canceled;
        self.changed.notify_all();
        true
    }

    fn rearm_if_canceled(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != CommandState::Canceled {
            return false;
        }
        inner.state = CommandState::Pending;
        true
    }

    fn report(&self, result: EndResult) {
        lock(&self.inner).result = result;
    }
}

/// Thread-safe view of a command
#[derive(Debug, Clone)]
pub struct CommandHandle {
    signal: Arc<Signal>,
}

impl CommandHandle {
    pub fn state(&self) -> CommandState {
        lock(&self.signal.inner).state
    }

    pub fn is_executing(&self) -> bool {
        self.state() == CommandState::Executing
    }

    pub fn is_retired(&self) -> bool {
        self.state() == CommandState::Retired
    }

    /// Number of completed runs
    pub fn run_count(&self) -> u64 {
        lock(&self.signal.inner).runs
    }

    pub fn end_result(&self) -> EndResult {
        lock(&self.signal.inner).result.clone()
    }

    /// Report a result from inside the running body
    pub fn report(&self, result: impl Into<EndResult>) {
        self.signal.report(result.into());
    }

    /// Block until the command has retired.
    ///
    /// Returns immediately when it already has. Fails with
    /// [`JobError::Canceled`] if the command is released without running
    /// and with [`JobError::JoinTimeout`] once `timeout` elapses.
    pub fn join(&self, timeout: Option<Duration>) -> Result<EndResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = lock(&self.signal.inner);

        loop {
            match inner.state {
                CommandState::Retired => return Ok(inner.result.clone()),
                CommandState::Canceled => return Err(JobError::Canceled),
                CommandState::Pending | CommandState::Executing => {}
            }

            inner = match deadline {
                None => wait(&self.signal.changed, inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(JobError::JoinTimeout);
                    }
                    wait_timeout(&self.signal.changed, inner, deadline - now).0
                }
            };
        }
    }
}

/// Where a committed command lives
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub(crate) list: ListId,
    pub(crate) queue: Option<Weak<QueueShared>>,
}

/// A single unit of work
pub struct Command {
    category: WorkloadCategory,
    affinity: ThreadAffinity,
    task: Option<CommandFn>,
    signal: Arc<Signal>,
    parent: Option<ParentLink>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("category", &self.category)
            .field("affinity", &self.affinity)
            .field("has_task", &self.task.is_some())
            .field("state", &self.state())
            .field("parent", &self.parent.as_ref().map(|p| p.list))
            .finish()
    }
}

impl Command {
    /// Create a command without a body
    pub fn new(category: WorkloadCategory, affinity: ThreadAffinity) -> Self {
        Self {
            category,
            affinity,
            task: None,
            signal: Arc::new(Signal::new()),
            parent: None,
        }
    }

    /// Create a command running `task`
    pub fn from_fn<F, R>(category: WorkloadCategory, affinity: ThreadAffinity, task: F) -> Self
    where
        F: FnMut() -> R + Send + 'static,
        R: Into<EndResult>,
    {
        Self::new(category, affinity).with_task(task)
    }

    /// Replace the body
    pub fn with_task<F, R>(mut self, task: F) -> Self
    where
        F: FnMut() -> R + Send + 'static,
        R: Into<EndResult>,
    {
        self.set_task(task);
        self
    }

    pub fn set_task<F, R>(&mut self, mut task: F)
    where
        F: FnMut() -> R + Send + 'static,
        R: Into<EndResult>,
    {
        self.task = Some(Box::new(move || task().into()));
    }

    pub fn category(&self) -> WorkloadCategory {
        self.category
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.affinity
    }

    pub fn handle(&self) -> CommandHandle {
        CommandHandle {
            signal: Arc::clone(&self.signal),
        }
    }

    pub fn state(&self) -> CommandState {
        lock(&self.signal.inner).state
    }

    pub fn is_executing(&self) -> bool {
        self.state() == CommandState::Executing
    }

    pub fn end_result(&self) -> EndResult {
        lock(&self.signal.inner).result.clone()
    }

    /// Report a result explicitly
    pub fn set_end_result(&mut self, result: impl Into<EndResult>) {
        self.signal.report(result.into());
    }

    /// List this command was committed to
    pub fn parent_list(&self) -> Option<ListId> {
        self.parent.as_ref().map(|p| p.list)
    }

    /// Queue owning the parent list, while it is alive
    pub fn parent_queue(&self) -> Option<CommandQueue> {
        self.parent
            .as_ref()
            .and_then(|p| p.queue.as_ref())
            .and_then(Weak::upgrade)
            .map(CommandQueue::from_shared)
    }

    pub(crate) fn set_parent(&mut self, parent: ParentLink) {
        self.parent = Some(parent);
    }

    /// Change the thread affinity
    pub fn set_run_type(&mut self, affinity: ThreadAffinity) -> Result<()> {
        self.update_tags(|c| c.affinity = affinity)
    }

    /// Change the workload category
    pub fn set_category(&mut self, category: WorkloadCategory) -> Result<()> {
        self.update_tags(|c| c.category = category)
    }

    fn update_tags(&mut self, apply: impl FnOnce(&mut Self)) -> Result<()> {
        if self.is_executing() {
            tracing::warn!(
                "Cannot retag command ({}/{}) while it executes",
                self.category,
                self.affinity
            );
            return Err(JobError::CommandExecuting {
                category: self.category,
                affinity: self.affinity,
            });
        }

        // Held until the end of the scope; dropped only if acquired
        let _guard = match self.parent_queue() {
            Some(queue) => Some(queue.request_lock()?),
            None => None,
        };
        apply(self);
        Ok(())
    }

    /// Block until this command has retired
    pub fn request_join_from_parent_queue(&self, timeout: Option<Duration>) -> Result<EndResult> {
        self.handle().join(timeout)
    }

    /// Run the body on the calling thread.
    ///
    /// A command without a body retires immediately. A panicking body is
    /// caught; the command still retires and the panic is returned.
    pub fn execute(&mut self) -> Result<EndResult> {
        let Some(task) = self.task.as_mut() else {
            self.signal.retire(EndResult::None);
            return Ok(EndResult::None);
        };

        self.signal.begin();
        match catch_unwind(AssertUnwindSafe(|| task())) {
            Ok(result) => {
                self.signal.retire(result);
                Ok(self.end_result())
            }
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(
                    "Command ({}/{}) panicked: {}",
                    self.category,
                    self.affinity,
                    message
                );
                self.signal.retire(EndResult::Error(message.clone()));
                Err(JobError::CommandPanicked {
                    category: self.category,
                    message,
                })
            }
        }
    }

    /// Mark as canceled if it never ran
    pub(crate) fn cancel(&self) -> bool {
        self.signal.cancel_if_pending()
    }

    /// Undo a cancel before the command is scheduled again
    pub(crate) fn rearm(&self) -> bool {
        self.signal.rearm_if_canceled()
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        self.signal.cancel_if_pending();
    }
}
