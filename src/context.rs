//! Explicit "current cell" context handed to component hooks

use std::sync::Arc;

use crate::cell::Cell;
use crate::scheduler::{RequestOutcome, StatusScheduler};
use crate::tree::CellTree;
use crate::types::{CellId, CellStatus};

/// The cell a hook is running for, plus the means to act on other cells.
///
/// The scheduler builds a fresh context for every transition and drops it on
/// every exit path, panics included.
#[derive(Clone)]
pub struct CellContext {
    cell: Arc<Cell>,
    scheduler: StatusScheduler,
}

impl CellContext {
    pub(crate) fn new(cell: Arc<Cell>, scheduler: StatusScheduler) -> Self {
        Self { cell, scheduler }
    }

    /// The current cell
    pub fn cell(&self) -> &Arc<Cell> {
        &self.cell
    }

    /// Id of the current cell
    pub fn id(&self) -> CellId {
        self.cell.id()
    }

    /// Look up another cached cell
    pub fn lookup(&self, id: CellId) -> Option<Arc<Cell>> {
        self.scheduler.tree().get(id)
    }

    /// The tree the cell belongs to
    pub fn tree(&self) -> &Arc<CellTree> {
        self.scheduler.tree()
    }

    /// Parent of the current cell
    pub fn parent(&self) -> Option<Arc<Cell>> {
        self.cell.parent().and_then(|p| self.lookup(p))
    }

    /// Request a status change on any cell. Never blocks on the transition.
    pub fn request_status(&self, id: CellId, target: CellStatus) -> RequestOutcome {
        self.scheduler.request_status(id, target)
    }

    /// Scheduler handle
    pub fn scheduler(&self) -> &StatusScheduler {
        &self.scheduler
    }
}

impl std::fmt::Debug for CellContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellContext").field("cell", &self.cell.id()).finish()
    }
}
