//! Arena of cached cells
//!
//! Cells are owned by the arena and keyed by id. A parent stores its children
//! as an ordered id list; a child stores its parent id for lookup only.
//! Child lists are guarded per parent cell.

use std::sync::Arc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cell::Cell;
use crate::error::{CellError, Result};
use crate::transform::CellBounds;
use crate::types::CellId;

/// Arena of cells with parent/child links
#[derive(Default)]
pub struct CellTree {
    cells: DashMap<CellId, Arc<Cell>>,
    roots: Mutex<Vec<CellId>>,
}

impl CellTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cell
    pub fn get(&self, id: CellId) -> Option<Arc<Cell>> {
        self.cells.get(&id).map(|c| c.value().clone())
    }

    /// Whether the cell is cached
    pub fn contains(&self, id: CellId) -> bool {
        self.cells.contains_key(&id)
    }

    /// Number of cached cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell is cached
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Snapshot of every cached cell
    pub fn cells(&self) -> Vec<Arc<Cell>> {
        self.cells.iter().map(|c| c.value().clone()).collect()
    }

    /// Root cell ids in registration order
    pub fn roots(&self) -> Vec<CellId> {
        self.roots.lock().clone()
    }

    /// Add a freshly created cell under `parent`, or as a root
    pub fn insert(&self, cell: Arc<Cell>, parent: Option<CellId>) -> Result<()> {
        let id = cell.id();
        let parent_cell = match parent {
            Some(parent_id) => Some(self.get(parent_id).ok_or(CellError::UnknownParent {
                cell: id,
                parent: parent_id,
            })?),
            None => None,
        };

        match self.cells.entry(id) {
            Entry::Occupied(_) => return Err(CellError::DuplicateCell(id)),
            Entry::Vacant(slot) => {
                slot.insert(cell.clone());
            }
        }

        match parent_cell {
            Some(parent_cell) => {
                parent_cell.children_mut().push(id);
                cell.set_parent(Some(parent_cell.id()));
            }
            None => self.roots.lock().push(id),
        }
        debug!(cell = %id, parent = ?parent, "Cell inserted");
        Ok(())
    }

    /// Attach a parentless cell under `parent`
    pub fn attach(&self, parent: CellId, child: CellId) -> Result<()> {
        let child_cell = self.get(child).ok_or(CellError::UnknownCell(child))?;
        let parent_cell = self.get(parent).ok_or(CellError::UnknownCell(parent))?;

        if let Some(existing) = child_cell.parent() {
            return Err(CellError::MultipleParents {
                cell: child,
                parent: existing,
            });
        }
        if self.is_ancestor_or_self(child, parent) {
            return Err(CellError::CyclicParent { cell: child, parent });
        }

        {
            let mut children = parent_cell.children_mut();
            children.push(child);
            child_cell.set_parent(Some(parent));
        }
        self.roots.lock().retain(|r| *r != child);
        Ok(())
    }

    /// Detach a cell from its parent (or from the root set); returns the old parent
    pub fn detach(&self, child: CellId) -> Option<CellId> {
        let child_cell = self.get(child)?;
        self.detach_cell(&child_cell)
    }

    fn detach_cell(&self, child_cell: &Cell) -> Option<CellId> {
        let child = child_cell.id();
        match child_cell.parent() {
            Some(parent) => {
                if let Some(parent_cell) = self.get(parent) {
                    let mut children = parent_cell.children_mut();
                    children.retain(|c| *c != child);
                    child_cell.set_parent(None);
                } else {
                    child_cell.set_parent(None);
                }
                Some(parent)
            }
            None => {
                self.roots.lock().retain(|r| *r != child);
                None
            }
        }
    }

    /// Move a cell under a new parent, or to the root set when `new_parent` is
    /// `None`. The tree is untouched when the move is rejected. Returns the old
    /// parent.
    pub fn reparent(&self, id: CellId, new_parent: Option<CellId>) -> Result<Option<CellId>> {
        let cell = self.get(id).ok_or(CellError::UnknownCell(id))?;
        if let Some(parent) = new_parent {
            if !self.contains(parent) {
                return Err(CellError::UnknownCell(parent));
            }
            if self.is_ancestor_or_self(id, parent) {
                return Err(CellError::CyclicParent { cell: id, parent });
            }
        }

        let old_parent = self.detach_cell(&cell);
        match new_parent {
            Some(parent) => self.attach_or_restore(id, parent, old_parent)?,
            None => self.push_root(id),
        }
        Ok(old_parent)
    }

    /// Attach a detached cell under `parent`. On failure the cell goes back
    /// under `old_parent`, or to the root set if that is gone too.
    fn attach_or_restore(&self, id: CellId, parent: CellId, old_parent: Option<CellId>) -> Result<()> {
        let Err(e) = self.attach(parent, id) else {
            return Ok(());
        };
        warn!(cell = %id, parent = %parent, error = %e, "Reparent failed, restoring previous link");
        match old_parent {
            Some(old) if self.attach(old, id).is_ok() => {}
            _ => self.push_root(id),
        }
        Err(e)
    }

    fn push_root(&self, id: CellId) {
        let mut roots = self.roots.lock();
        if !roots.contains(&id) {
            roots.push(id);
        }
    }

    /// Detach a cell and drop it and all its descendants from the arena.
    ///
    /// Returns the removed cells in preorder; their internal links stay intact
    /// so the caller can still tear the subtree down children-first.
    pub fn remove_subtree(&self, id: CellId) -> Vec<Arc<Cell>> {
        let Some(cell) = self.get(id) else {
            return Vec::new();
        };
        self.detach_cell(&cell);
        let removed = self.subtree(id);
        for cell in &removed {
            self.cells.remove(&cell.id());
        }
        removed
    }

    /// Cell and all its descendants in preorder
    pub fn subtree(&self, id: CellId) -> Vec<Arc<Cell>> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(cell) = self.get(next) {
                let children = cell.children();
                stack.extend(children.into_iter().rev());
                out.push(cell);
            }
        }
        out
    }

    /// Whether `ancestor` is `id` or one of its ancestors
    pub fn is_ancestor_or_self(&self, ancestor: CellId, id: CellId) -> bool {
        let mut current = Some(id);
        while let Some(next) = current {
            if next == ancestor {
                return true;
            }
            current = self.get(next).and_then(|c| c.parent());
        }
        false
    }

    /// Ancestors of a cell, nearest first
    pub fn ancestors(&self, id: CellId) -> Vec<Arc<Cell>> {
        let mut out = Vec::new();
        let mut current = self.get(id).and_then(|c| c.parent());
        while let Some(next) = current {
            match self.get(next) {
                Some(cell) => {
                    current = cell.parent();
                    out.push(cell);
                }
                None => break,
            }
        }
        out
    }

    /// World bounds of a cell merged with those of all its descendants
    pub fn subtree_bounds(&self, id: CellId) -> Option<CellBounds> {
        self.subtree(id)
            .iter()
            .filter_map(|c| c.world_bounds())
            .reduce(|acc, b| acc.merge(&b))
    }
}

impl std::fmt::Debug for CellTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellTree")
            .field("cells", &self.cells.len())
            .field("roots", &*self.roots.lock())
            .finish()
    }
}
