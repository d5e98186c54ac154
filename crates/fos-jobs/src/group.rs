//! Command Groups
//!
//! Named sets of queues submitted and canceled together.

use std::fmt;

use uuid::Uuid;

use crate::queue::CommandQueue;
use crate::types::ThreadAffinity;

/// Unique identifier for a command group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({})", self.0)
    }
}

/// Named aggregate of queues
#[derive(Debug, Clone)]
pub struct CommandGroup {
    name: String,
    affinity: ThreadAffinity,
    queues: Vec<CommandQueue>,
    id: GroupId,
    required: bool,
}

impl CommandGroup {
    pub fn new(name: impl Into<String>, affinity: ThreadAffinity) -> Self {
        Self {
            name: name.into(),
            affinity,
            queues: Vec::new(),
            id: GroupId::new(),
            required: false,
        }
    }

    pub fn with_queue(mut self, queue: CommandQueue) -> Self {
        self.add_queue(queue);
        self
    }

    /// Mark the group as required for a frame
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn add_queue(&mut self, queue: CommandQueue) {
        self.queues.push(queue);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.affinity
    }

    pub fn queues(&self) -> &[CommandQueue] {
        &self.queues
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Compare everything but the id
    pub fn eq_ignoring_id(&self, other: &Self) -> bool {
        self.name == other.name
            && self.affinity == other.affinity
            && self.required == other.required
            && self.queues == other.queues
    }
}

impl PartialEq for CommandGroup {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.eq_ignoring_id(other)
    }
}

impl Eq for CommandGroup {}
