use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::types::Projection;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// An immutable batch of projections plus an id → position index.
///
/// If the batch repeats an id, the first occurrence is the one `get` returns.
#[derive(Debug, Default)]
pub struct Snapshot {
    projections: Vec<Projection>,
    index: HashMap<String, usize>,
}

impl Snapshot {
    pub fn new(projections: Vec<Projection>) -> Self {
        let mut index = HashMap::with_capacity(projections.len());
        for (pos, p) in projections.iter().enumerate() {
            index.entry(p.id.clone()).or_insert(pos);
        }
        Self { projections, index }
    }

    pub fn get(&self, id: &str) -> Option<&Projection> {
        self.index.get(id).map(|&pos| &self.projections[pos])
    }

    pub fn projections(&self) -> &[Projection] {
        &self.projections
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

/// Holds exactly one snapshot: the baseline the next batch is diffed against.
///
/// Replacement builds the new snapshot outside the lock and swaps a single
/// `Arc` under it, so readers see either the whole old batch or the whole new one.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current baseline (possibly empty). Cheap: clones the `Arc`.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Unconditionally overwrite the baseline with `batch`.
    pub fn replace(&self, batch: Vec<Projection>) {
        let next = Arc::new(Snapshot::new(batch));
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
