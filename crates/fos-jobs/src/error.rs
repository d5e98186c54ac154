//! Job system errors

use crate::registry::JobId;
use crate::queue::QueueId;
use crate::types::{PoolKind, ThreadAffinity, WorkloadCategory};

/// Job system error
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Category mismatch: expected {expected}, found {found}")]
    CategoryMismatch {
        expected: WorkloadCategory,
        found: WorkloadCategory,
    },

    #[error("Affinity mismatch: expected {expected}, found {found}")]
    AffinityMismatch {
        expected: ThreadAffinity,
        found: ThreadAffinity,
    },

    #[error("Queue {queue} ({category}/{affinity}) is locked")]
    QueueBusy {
        queue: QueueId,
        category: WorkloadCategory,
        affinity: ThreadAffinity,
    },

    #[error("Command ({category}/{affinity}) is executing")]
    CommandExecuting {
        category: WorkloadCategory,
        affinity: ThreadAffinity,
    },

    #[error("Command ({category}) panicked: {message}")]
    CommandPanicked {
        category: WorkloadCategory,
        message: String,
    },

    #[error("Job {id} not found in queue {queue}")]
    JobNotFound { id: JobId, queue: QueueId },

    #[error("Queue {queue} has no resident list at {index}")]
    ListNotFound { queue: QueueId, index: usize },

    #[error("No worker pool runs {0} work")]
    UnroutableCategory(WorkloadCategory),

    #[error("No worker pool runs {0} threads")]
    UnroutableAffinity(ThreadAffinity),

    #[error("The {0} pool has no worker threads")]
    NoWorkers(PoolKind),

    #[error("The {kind} pool is saturated ({pending} pending jobs)")]
    Saturated { kind: PoolKind, pending: usize },

    #[error("Job system is not running")]
    NotRunning,

    #[error("Job system is already running")]
    AlreadyRunning,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Timed out joining command")]
    JoinTimeout,

    #[error("Command was canceled before it ran")]
    Canceled,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl JobError {
    /// Soft failures leave the system consistent and can be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueBusy { .. } | Self::Saturated { .. } | Self::JoinTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
