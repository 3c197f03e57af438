//! Session-scoped registry of temporary row sets.
//!
//! Previews and upserts register the incoming rows under a unique name while
//! they work on them. Registration hands back a [`ScratchGuard`]; dropping
//! the guard unregisters the rows, on every exit path.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use arrow::record_batch::RecordBatch;
use tracing::debug;
use uuid::Uuid;

/// Temporary row sets owned by a session.
#[derive(Debug, Clone, Default)]
pub struct ScratchSpace {
    entries: Arc<Mutex<HashMap<String, RecordBatch>>>,
}

impl ScratchSpace {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `rows` under a fresh name derived from `prefix`.
    pub fn register(&self, prefix: &str, rows: RecordBatch) -> ScratchGuard {
        let name = format!("{prefix}_{}", Uuid::new_v4().simple());
        self.lock().insert(name.clone(), rows.clone());
        debug!(%name, "registered scratch rows");
        ScratchGuard {
            space: self.clone(),
            name,
            rows,
        }
    }

    /// Rows registered under `name`, if still registered.
    pub fn get(&self, name: &str) -> Option<RecordBatch> {
        self.lock().get(name).cloned()
    }

    /// Names currently registered.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RecordBatch>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps a scratch registration alive.
///
/// The guard owns its rows, so they stay readable through it even if the
/// registry entry is gone.
#[derive(Debug)]
pub struct ScratchGuard {
    space: ScratchSpace,
    name: String,
    rows: RecordBatch,
}

impl ScratchGuard {
    /// Registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registered rows.
    pub fn rows(&self) -> &RecordBatch {
        &self.rows
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        self.space.lock().remove(&self.name);
        debug!(name = %self.name, "unregistered scratch rows");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array};

    fn rows() -> RecordBatch {
        RecordBatch::try_from_iter(vec![(
            "id",
            Arc::new(Int64Array::from(vec![1, 2])) as ArrayRef,
        )])
        .expect("valid batch")
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let space = ScratchSpace::new();
        let guard = space.register("preview", rows());
        assert!(guard.name().starts_with("preview_"));
        assert_eq!(guard.rows().num_rows(), 2);
        assert_eq!(space.get(guard.name()).map(|b| b.num_rows()), Some(2));
        assert_eq!(space.names(), vec![guard.name().to_string()]);

        drop(guard);
        assert!(space.is_empty());
    }

    #[test]
    fn guard_unregisters_on_early_return() {
        fn failing_step(space: &ScratchSpace) -> Result<(), &'static str> {
            let _guard = space.register("upsert", rows());
            Err("boom")
        }

        let space = ScratchSpace::new();
        assert!(failing_step(&space).is_err());
        assert!(space.is_empty());
    }

    #[test]
    fn guard_rows_outlive_the_registry_entry() {
        let space = ScratchSpace::new();
        let guard = space.register("upsert", rows());
        space.lock().clear();

        assert!(space.get(guard.name()).is_none());
        assert_eq!(guard.rows().num_rows(), 2);
    }
}
