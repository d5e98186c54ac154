//! fOS Jobs
//!
//! Typed job scheduling for the engine's per-category worker threads.
//!
//! # Model
//! - [`Command`]: one callable tagged with a [`WorkloadCategory`] and a
//!   [`ThreadAffinity`]
//! - [`CommandList`]: ordered commands of a single category
//! - [`CommandQueue`]: lists sharing one affinity, guarded by a
//!   non-blocking gate
//! - [`CommandGroup`]: named set of queues submitted together
//! - [`JobSystem`]: worker pools for composition, script, rendering and
//!   parsing work
//!
//! # Example
//! ```rust,no_run
//! use fos_jobs::{
//!     Command, CommandList, CommandQueue, JobSystem, JobSystemConfig, ThreadAffinity,
//!     WorkloadCategory,
//! };
//!
//! let system = JobSystem::with_config(JobSystemConfig::default())?;
//! let queue = CommandQueue::new(WorkloadCategory::Layout, ThreadAffinity::FreeLayout);
//! let list = CommandList::for_queue(&queue)
//!     .with_command(Command::from_fn(WorkloadCategory::Layout, ThreadAffinity::FreeLayout, || 1i64));
//! queue.add_list(list)?;
//!
//! system.add_job(&queue)?;
//! system.wait();
//! system.shutdown();
//! # Ok::<(), fos_jobs::JobError>(())
//! ```

mod command;
mod config;
mod error;
mod group;
mod lifetime;
mod list;
mod pool;
mod queue;
mod registry;
mod sync;
mod system;
mod types;

pub use command::{Command, CommandFn, CommandHandle, CommandState};
pub use config::JobSystemConfig;
pub use error::{JobError, Result};
pub use group::{CommandGroup, GroupId};
pub use lifetime::LifetimeScope;
pub use list::{CommandFailure, CommandList, ListId};
pub use queue::{AdmitError, CommandQueue, ExecutionReport, QueueId, QueueLockGuard};
pub use registry::JobId;
pub use system::{CancelReport, JobSystem, JobSystemStats};
pub use types::{EndResult, ListPriority, ParseTagError, PoolKind, ThreadAffinity, WorkloadCategory};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
