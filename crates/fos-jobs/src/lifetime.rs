//! Lifetime Objects
//!
//! Objects kept alive for as long as the job system runs. They are
//! released on shutdown.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// Which subsystem an object belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeScope {
    General,
    Script,
    Rendering,
    Parsing,
}

impl LifetimeScope {
    pub const ALL: [LifetimeScope; 4] = [
        LifetimeScope::General,
        LifetimeScope::Script,
        LifetimeScope::Rendering,
        LifetimeScope::Parsing,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Script => "script",
            Self::Rendering => "rendering",
            Self::Parsing => "parsing",
        }
    }
}

impl fmt::Display for LifetimeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Object = Arc<dyn Any + Send + Sync>;

/// Per-instance store of lifetime objects
#[derive(Default)]
pub(crate) struct LifetimeRegistry {
    objects: Mutex<HashMap<LifetimeScope, Vec<Object>>>,
}

impl fmt::Debug for LifetimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeRegistry")
            .field("objects", &self.total())
            .finish()
    }
}

impl LifetimeRegistry {
    pub(crate) fn add<T: Any + Send + Sync>(&self, scope: LifetimeScope, object: Arc<T>) {
        lock(&self.objects).entry(scope).or_default().push(object);
    }

    /// Objects of type `T` in `scope`, in insertion order
    pub(crate) fn get<T: Any + Send + Sync>(&self, scope: LifetimeScope) -> Vec<Arc<T>> {
        lock(&self.objects)
            .get(&scope)
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(|o| Arc::clone(o).downcast::<T>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn len(&self, scope: LifetimeScope) -> usize {
        lock(&self.objects).get(&scope).map_or(0, Vec::len)
    }

    pub(crate) fn total(&self) -> usize {
        lock(&self.objects).values().map(Vec::len).sum()
    }

    /// Release everything, returning how many objects were held
    pub(crate) fn clear(&self) -> usize {
        let objects = std::mem::take(&mut *lock(&self.objects));
        objects.values().map(Vec::len).sum()
    }
}
