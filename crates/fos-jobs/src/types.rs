//! Job Types
//!
//! Workload categories, thread affinities and the values commands produce.

use std::fmt;
use std::str::FromStr;

/// Kind of work a command performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WorkloadCategory {
    #[default]
    Unknown,
    /// Style parsing and cascade
    Css,
    /// Layer composition
    Composition,
    /// Box tree layout
    Layout,
    /// Painting and rasterization
    Rendering,
    /// Frame presentation
    Presentation,
    /// Script evaluation
    Scripting,
    /// Embedder defined work
    Custom,
}

impl WorkloadCategory {
    pub const ALL: [WorkloadCategory; 8] = [
        Self::Unknown,
        Self::Css,
        Self::Composition,
        Self::Layout,
        Self::Rendering,
        Self::Presentation,
        Self::Scripting,
        Self::Custom,
    ];

    /// Get category name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Css => "CSS",
            Self::Composition => "Composition",
            Self::Layout => "Layout",
            Self::Rendering => "Rendering",
            Self::Presentation => "Presentation",
            Self::Scripting => "Scripting",
            Self::Custom => "Custom",
        }
    }

    /// Pool that runs queues of this category, if any
    pub fn pool(&self) -> Option<PoolKind> {
        match self {
            Self::Composition => Some(PoolKind::Composition),
            Self::Scripting => Some(PoolKind::Scripting),
            Self::Rendering => Some(PoolKind::Rendering),
            Self::Layout | Self::Css => Some(PoolKind::Parsing),
            Self::Unknown | Self::Presentation | Self::Custom => None,
        }
    }
}

impl fmt::Display for WorkloadCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for WorkloadCategory {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTagError(s.to_string()))
    }
}

/// Which threads may run a command, list or queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadAffinity {
    /// Unconstrained, any thread may run it
    #[default]
    AnyThread,
    FreeCss,
    FreeComposition,
    FreeLayout,
    FreeRendering,
    FreeScripting,
    FreePresentation,
    FreeCustom,
}

impl ThreadAffinity {
    pub const ALL: [ThreadAffinity; 8] = [
        Self::AnyThread,
        Self::FreeCss,
        Self::FreeComposition,
        Self::FreeLayout,
        Self::FreeRendering,
        Self::FreeScripting,
        Self::FreePresentation,
        Self::FreeCustom,
    ];

    /// Get affinity name
    pub fn name(&self) -> &'static str {
        match self {
            Self::AnyThread => "AnyThread",
            Self::FreeCss => "FreeThread_CSS",
            Self::FreeComposition => "FreeThread_Composition",
            Self::FreeLayout => "FreeThread_Layout",
            Self::FreeRendering => "FreeThread_Rendering",
            Self::FreeScripting => "FreeThread_Scripting",
            Self::FreePresentation => "FreeThread_Presentation",
            Self::FreeCustom => "FreeThread_Custom",
        }
    }

    /// Dedicated pool for this affinity, if any
    pub fn pool(&self) -> Option<PoolKind> {
        match self {
            Self::FreeComposition => Some(PoolKind::Composition),
            Self::FreeScripting => Some(PoolKind::Scripting),
            Self::FreeRendering => Some(PoolKind::Rendering),
            Self::FreeLayout | Self::FreeCss => Some(PoolKind::Parsing),
            Self::AnyThread | Self::FreePresentation | Self::FreeCustom => None,
        }
    }

    pub fn is_any_thread(&self) -> bool {
        matches!(self, Self::AnyThread)
    }
}

impl fmt::Display for ThreadAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ThreadAffinity {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseTagError(s.to_string()))
    }
}

/// Unrecognized category or affinity name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown tag: {0:?}")]
pub struct ParseTagError(pub String);

/// The dedicated worker pools owned by a job system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Composition,
    Scripting,
    Rendering,
    Parsing,
}

impl PoolKind {
    pub const ALL: [PoolKind; 4] = [
        Self::Composition,
        Self::Scripting,
        Self::Rendering,
        Self::Parsing,
    ];

    /// Get pool name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Composition => "composition",
            Self::Scripting => "script",
            Self::Rendering => "rendering",
            Self::Parsing => "parsing",
        }
    }

    /// Affinity of the threads in this pool
    pub fn affinity(&self) -> ThreadAffinity {
        match self {
            Self::Composition => ThreadAffinity::FreeComposition,
            Self::Scripting => ThreadAffinity::FreeScripting,
            Self::Rendering => ThreadAffinity::FreeRendering,
            Self::Parsing => ThreadAffinity::FreeLayout,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Self::Composition => 0,
            Self::Scripting => 1,
            Self::Rendering => 2,
            Self::Parsing => 3,
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordering hint for resident lists when a queue executes with priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ListPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

/// Value produced by a command
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EndResult {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Error(String),
}

impl EndResult {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl From<()> for EndResult {
    fn from(_: ()) -> Self {
        Self::None
    }
}

impl From<bool> for EndResult {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for EndResult {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for EndResult {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for EndResult {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for EndResult {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}
