//! Command Lists
//!
//! Ordered, homogeneously-typed batches of commands.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::command::{Command, ParentLink};
use crate::error::{JobError, Result};
use crate::queue::{CommandQueue, QueueShared};
use crate::types::{ListPriority, ThreadAffinity, WorkloadCategory};

/// List ID counter
static NEXT_LIST_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListId(u64);

impl ListId {
    fn next() -> Self {
        Self(NEXT_LIST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "List({})", self.0)
    }
}

/// Command failure recorded while executing a list
#[derive(Debug)]
pub struct CommandFailure {
    pub list: ListId,
    /// Position of the command in its list
    pub index: usize,
    pub error: JobError,
}

/// Ordered batch of commands sharing one category and affinity
pub struct CommandList {
    id: ListId,
    category: WorkloadCategory,
    affinity: ThreadAffinity,
    priority: ListPriority,
    commands: Vec<Command>,
    queue: Option<Weak<QueueShared>>,
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("affinity", &self.affinity)
            .field("priority", &self.priority)
            .field("commands", &self.commands.len())
            .finish()
    }
}

impl CommandList {
    pub fn new(category: WorkloadCategory, affinity: ThreadAffinity) -> Self {
        Self {
            id: ListId::next(),
            category,
            affinity,
            priority: ListPriority::default(),
            commands: Vec::new(),
            queue: None,
        }
    }

    /// Create a list bound to `queue`, taking the queue's tags
    pub fn for_queue(queue: &CommandQueue) -> Self {
        let mut list = Self::new(queue.category(), queue.affinity());
        list.queue = Some(queue.downgrade());
        list
    }

    pub fn with_priority(mut self, priority: ListPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.add_command(command);
        self
    }

    pub fn add_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn id(&self) -> ListId {
        self.id
    }

    pub fn category(&self) -> WorkloadCategory {
        self.category
    }

    pub fn set_category(&mut self, category: WorkloadCategory) {
        self.category = category;
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.affinity
    }

    pub fn set_affinity(&mut self, affinity: ThreadAffinity) {
        self.affinity = affinity;
    }

    pub fn priority(&self) -> ListPriority {
        self.priority
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queue this list belongs to, while it is alive
    pub fn queue(&self) -> Option<CommandQueue> {
        self.queue
            .as_ref()
            .and_then(Weak::upgrade)
            .map(CommandQueue::from_shared)
    }

    pub(crate) fn attach(&mut self, queue: &Arc<QueueShared>) {
        self.queue = Some(Arc::downgrade(queue));
    }

    /// Check every command against the list category and commit them.
    ///
    /// Nothing is committed unless every command matches.
    pub fn verify_and_commit(&mut self) -> Result<()> {
        if let Some(bad) = self.commands.iter().find(|c| c.category() != self.category) {
            tracing::error!(
                "{} rejected: command of type {} in a {} list ({})",
                self.id,
                bad.category(),
                self.category,
                self.affinity
            );
            return Err(JobError::CategoryMismatch {
                expected: self.category,
                found: bad.category(),
            });
        }

        let link = ParentLink {
            list: self.id,
            queue: self.queue.clone(),
        };
        for command in &mut self.commands {
            command.set_parent(link.clone());
        }
        Ok(())
    }

    /// Run every command on the calling thread.
    ///
    /// Mismatched commands are skipped and reported; the rest still run.
    /// Returns the number of commands executed.
    pub(crate) fn run(&mut self, failures: &mut Vec<CommandFailure>) -> usize {
        let link = ParentLink {
            list: self.id,
            queue: self.queue.clone(),
        };
        let mut executed = 0;

        for (index, command) in self.commands.iter_mut().enumerate() {
            if command.category() != self.category {
                tracing::error!(
                    "Skipping command {} of {}: type {} does not match {}",
                    index,
                    self.id,
                    command.category(),
                    self.category
                );
                failures.push(CommandFailure {
                    list: self.id,
                    index,
                    error: JobError::CategoryMismatch {
                        expected: self.category,
                        found: command.category(),
                    },
                });
                continue;
            }

            command.set_parent(link.clone());
            executed += 1;
            if let Err(error) = command.execute() {
                failures.push(CommandFailure {
                    list: self.id,
                    index,
                    error,
                });
            }
        }

        executed
    }

    /// Mark every command that never ran as canceled
    pub(crate) fn cancel_pending(&self) -> usize {
        self.commands.iter().filter(|c| c.cancel()).count()
    }

    pub(crate) fn rearm(&self) -> usize {
        self.commands.iter().filter(|c| c.rearm()).count()
    }
}
