//! Registry of cell constructors keyed by type identifier
//!
//! Filled once at startup; the cache looks up the constructor named by each
//! create message.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cell::{CellComponent, ConfigPayload};
use crate::error::{CellError, Result};
use crate::types::CellId;

/// Type identifier of the built-in container cell
pub const GROUP_CELL: &str = "group";

/// What a constructor produces for a new cell
#[derive(Default)]
pub struct CellBlueprint {
    /// Components attached before the cell is first configured
    pub components: Vec<Arc<dyn CellComponent>>,
    /// URLs to preload before the cell may rise above `Disk`
    pub resources: Vec<String>,
}

impl CellBlueprint {
    /// Blueprint with no components and no resources
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add a component
    pub fn with_component(mut self, component: Arc<dyn CellComponent>) -> Self {
        self.components.push(component);
        self
    }

    /// Add a preload URL
    pub fn with_resource(mut self, url: impl Into<String>) -> Self {
        self.resources.push(url.into());
        self
    }
}

impl std::fmt::Debug for CellBlueprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<&str> = self.components.iter().map(|c| c.kind()).collect();
        f.debug_struct("CellBlueprint")
            .field("components", &kinds)
            .field("resources", &self.resources)
            .finish()
    }
}

/// Constructor for one cell type
pub type CellConstructor = fn(CellId, &ConfigPayload) -> Result<CellBlueprint>;

fn group_cell(_id: CellId, _payload: &ConfigPayload) -> Result<CellBlueprint> {
    Ok(CellBlueprint::empty())
}

/// Type identifier to constructor map
#[derive(Debug, Clone)]
pub struct CellFactory {
    constructors: HashMap<String, CellConstructor>,
}

impl CellFactory {
    /// Registry holding only the built-in `group` type
    pub fn new() -> Self {
        let mut constructors: HashMap<String, CellConstructor> = HashMap::new();
        constructors.insert(GROUP_CELL.to_string(), group_cell);
        Self { constructors }
    }

    /// Register a constructor, replacing any earlier one for the same type
    pub fn register(mut self, type_name: impl Into<String>, constructor: CellConstructor) -> Self {
        self.constructors.insert(type_name.into(), constructor);
        self
    }

    /// Whether a type is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }

    /// Registered type identifiers, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the constructor for `type_name`
    pub fn build(&self, id: CellId, type_name: &str, payload: &ConfigPayload) -> Result<CellBlueprint> {
        let constructor = self
            .constructors
            .get(type_name)
            .ok_or_else(|| CellError::UnknownCellType(type_name.to_string()))?;
        constructor(id, payload)
    }
}

impl Default for CellFactory {
    fn default() -> Self {
        Self::new()
    }
}
