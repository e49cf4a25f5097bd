//! Sources of cell presence.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use lodestar_core::models::CellPresence;

use crate::Result;

/// Reports which cells are alive right now.
#[async_trait]
pub trait CellPresenceSource: Send + Sync {
    /// Returns the live cells at the time of the call.
    async fn cells(&self) -> Result<Vec<CellPresence>>;

    /// Returns the ids of the live cells.
    async fn cell_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .cells()
            .await?
            .into_iter()
            .map(|cell| cell.cell_id)
            .collect())
    }
}

/// A fixed cell list, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticCells {
    cells: Vec<CellPresence>,
}

impl StaticCells {
    /// Creates a source that always reports `cell_ids`.
    #[must_use]
    pub fn new(cell_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            cells: cell_ids
                .into_iter()
                .map(|id| CellPresence::new(id, ""))
                .collect(),
        }
    }
}

#[async_trait]
impl CellPresenceSource for StaticCells {
    async fn cells(&self) -> Result<Vec<CellPresence>> {
        Ok(self.cells.clone())
    }
}

/// A mutable cell set. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCells {
    cells: Arc<RwLock<BTreeMap<String, CellPresence>>>,
}

impl InMemoryCells {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a cell.
    pub fn register(&self, cell: CellPresence) {
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cell.cell_id.clone(), cell);
    }

    /// Removes a cell. Returns false if it was not present.
    pub fn remove(&self, cell_id: &str) -> bool {
        self.cells
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cell_id)
            .is_some()
    }
}

#[async_trait]
impl CellPresenceSource for InMemoryCells {
    async fn cells(&self) -> Result<Vec<CellPresence>> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        Ok(cells.values().cloned().collect())
    }
}
