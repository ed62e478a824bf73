//! A cached cell and its capability set
//!
//! ## Table of Contents
//! - **Cell**: One node of the mirrored scene graph
//! - **CellComponent**: Capability attached to a cell, driven by lifecycle hooks
//! - **RendererBinding**: Renderer-side object following a cell's world transform
//! - **ResourceState**: Progress of a cell's preload resolution

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::context::CellContext;
use crate::error::{CellError, Result};
use crate::transform::{CellBounds, CellTransform};
use crate::types::{CellId, CellStatus, ChangeSource, StatusStep};

/// Opaque configuration payload delivered by the server
pub type ConfigPayload = serde_json::Value;

/// Capability attached to a cell.
///
/// Hooks run on lifecycle worker threads while the cell's transition lock is
/// held; they may request further transitions through the context.
pub trait CellComponent: Send + Sync {
    /// Component kind; a cell holds at most one component per kind
    fn kind(&self) -> &str;

    /// Called for every advancing step, before the cell's status is updated
    fn attach(&self, _ctx: &CellContext, _step: StatusStep) -> Result<()> {
        Ok(())
    }

    /// Called for every retreating step, before the cell's status is updated
    fn detach(&self, _ctx: &CellContext, _step: StatusStep) -> Result<()> {
        Ok(())
    }

    /// Called when the server delivers a new configuration payload
    fn configure(&self, _ctx: &CellContext, _payload: &ConfigPayload) -> Result<()> {
        Ok(())
    }
}

/// Renderer-side object bound to a cell
#[cfg_attr(test, mockall::automock)]
pub trait RendererBinding: Send + Sync {
    /// The cell's world transform changed
    fn transform_updated(&self, cell: CellId, world: &CellTransform);
}

/// Per-cell status listener, called after every step
pub type StatusListener = Arc<dyn Fn(&Cell, StatusStep) + Send + Sync>;

/// Per-cell transform listener, called after the world transform changes
pub type TransformListener = Arc<dyn Fn(&Cell, ChangeSource) + Send + Sync>;

/// Progress of a cell's preload resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Nothing declared
    None,
    /// Fetches outstanding
    Resolving,
    /// Every transitively referenced resource fetched
    Ready,
    /// A fetch failed; the resolution will not complete
    Failed,
}

impl ResourceState {
    /// Whether increases may proceed
    pub fn is_ready(self) -> bool {
        matches!(self, ResourceState::None | ResourceState::Ready)
    }
}

/// Fields guarded by the cell's monitor
#[derive(Debug)]
struct CellState {
    name: String,
    status: CellStatus,
    local: Option<CellTransform>,
    world: Option<CellTransform>,
    local_bounds: Option<CellBounds>,
    world_bounds: Option<CellBounds>,
    payload: ConfigPayload,
    resources: ResourceState,
    released: bool,
}

/// One node of the mirrored scene graph
pub struct Cell {
    id: CellId,
    type_name: String,
    declared_resources: Vec<String>,
    state: RwLock<CellState>,
    /// Status whose notification has been fully delivered
    settled: AtomicU8,
    parent: RwLock<Option<CellId>>,
    children: Mutex<Vec<CellId>>,
    components: RwLock<Vec<Arc<dyn CellComponent>>>,
    status_listeners: RwLock<Vec<StatusListener>>,
    transform_listeners: RwLock<Vec<TransformListener>>,
    renderer: RwLock<Option<Arc<dyn RendererBinding>>>,
    transition: ReentrantMutex<()>,
}

impl Cell {
    /// Create a cell at `Disk` with no parent
    pub fn new(
        id: CellId,
        type_name: impl Into<String>,
        name: Option<String>,
        local_bounds: Option<CellBounds>,
        declared_resources: Vec<String>,
    ) -> Self {
        let resources = if declared_resources.is_empty() {
            ResourceState::None
        } else {
            ResourceState::Resolving
        };
        Self {
            id,
            type_name: type_name.into(),
            declared_resources,
            state: RwLock::new(CellState {
                name: name.unwrap_or_else(|| id.to_string()),
                status: CellStatus::Disk,
                local: None,
                world: None,
                local_bounds,
                world_bounds: local_bounds,
                payload: ConfigPayload::Null,
                resources,
                released: false,
            }),
            settled: AtomicU8::new(CellStatus::Disk.ordinal()),
            parent: RwLock::new(None),
            children: Mutex::new(Vec::new()),
            components: RwLock::new(Vec::new()),
            status_listeners: RwLock::new(Vec::new()),
            transform_listeners: RwLock::new(Vec::new()),
            renderer: RwLock::new(None),
            transition: ReentrantMutex::new(()),
        }
    }

    /// Cell id
    pub fn id(&self) -> CellId {
        self.id
    }

    /// Type identifier the cell was created from
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Display name (defaults to the id)
    pub fn name(&self) -> String {
        self.state.read().name.clone()
    }

    /// Rename the cell
    pub fn set_name(&self, name: impl Into<String>) {
        self.state.write().name = name.into();
    }

    /// Current lifecycle status
    pub fn status(&self) -> CellStatus {
        self.state.read().status
    }

    /// Status as seen by the scheduler: only steps whose notifications have
    /// been delivered
    pub(crate) fn settled_status(&self) -> CellStatus {
        CellStatus::from_ordinal(self.settled.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn settle(&self, status: CellStatus) {
        self.settled.store(status.ordinal(), Ordering::Release);
    }

    pub(crate) fn set_status_field(&self, status: CellStatus) {
        self.state.write().status = status;
    }

    /// Whether the cell reached `Disk` through a decrease
    pub fn is_released(&self) -> bool {
        self.state.read().released
    }

    /// Local transform relative to the parent
    pub fn local_transform(&self) -> Option<CellTransform> {
        self.state.read().local
    }

    /// Cached local-to-world transform
    pub fn world_transform(&self) -> Option<CellTransform> {
        self.state.read().world
    }

    /// Local bounds
    pub fn local_bounds(&self) -> Option<CellBounds> {
        self.state.read().local_bounds
    }

    /// Cached world bounds (this cell only, not its subtree)
    pub fn world_bounds(&self) -> Option<CellBounds> {
        self.state.read().world_bounds
    }

    /// Replace the local bounds; world bounds follow the current world transform
    pub fn set_local_bounds(&self, bounds: Option<CellBounds>) {
        let mut state = self.state.write();
        state.local_bounds = bounds;
        state.world_bounds = match (bounds, state.world) {
            (Some(b), Some(w)) => Some(b.transformed(&w)),
            (b, None) => b,
            (None, _) => None,
        };
    }

    pub(crate) fn set_local_field(&self, local: Option<CellTransform>) {
        self.state.write().local = local;
    }

    /// Store a new world transform and recompute world bounds from it
    pub(crate) fn set_world(&self, world: CellTransform) -> Option<CellBounds> {
        let mut state = self.state.write();
        state.world = Some(world);
        state.world_bounds = state.local_bounds.map(|b| b.transformed(&world));
        state.world_bounds
    }

    /// Last configuration payload
    pub fn payload(&self) -> ConfigPayload {
        self.state.read().payload.clone()
    }

    pub(crate) fn set_payload(&self, payload: ConfigPayload) {
        self.state.write().payload = payload;
    }

    /// Root URLs the cell must preload before increasing
    pub fn declared_resources(&self) -> &[String] {
        &self.declared_resources
    }

    /// Preload progress
    pub fn resource_state(&self) -> ResourceState {
        self.state.read().resources
    }

    pub(crate) fn set_resource_state(&self, resources: ResourceState) {
        self.state.write().resources = resources;
    }

    /// Parent id, `None` for roots
    pub fn parent(&self) -> Option<CellId> {
        *self.parent.read()
    }

    pub(crate) fn set_parent(&self, parent: Option<CellId>) {
        *self.parent.write() = parent;
    }

    /// Child ids in attach order
    pub fn children(&self) -> Vec<CellId> {
        self.children.lock().clone()
    }

    /// Number of children
    pub fn num_children(&self) -> usize {
        self.children.lock().len()
    }

    pub(crate) fn children_mut(&self) -> parking_lot::MutexGuard<'_, Vec<CellId>> {
        self.children.lock()
    }

    /// Snapshot of the attached components
    pub fn components(&self) -> Vec<Arc<dyn CellComponent>> {
        self.components.read().clone()
    }

    /// Component of the given kind, if attached
    pub fn component(&self, kind: &str) -> Option<Arc<dyn CellComponent>> {
        self.components.read().iter().find(|c| c.kind() == kind).cloned()
    }

    pub(crate) fn insert_component(&self, component: Arc<dyn CellComponent>) -> Result<()> {
        let mut components = self.components.write();
        if components.iter().any(|c| c.kind() == component.kind()) {
            return Err(CellError::DuplicateComponent {
                cell: self.id,
                kind: component.kind().to_string(),
            });
        }
        components.push(component);
        Ok(())
    }

    pub(crate) fn take_component(&self, kind: &str) -> Option<Arc<dyn CellComponent>> {
        let mut components = self.components.write();
        let index = components.iter().position(|c| c.kind() == kind)?;
        Some(components.remove(index))
    }

    /// Listen for this cell's status steps
    pub fn add_status_listener(&self, listener: StatusListener) {
        self.status_listeners.write().push(listener);
    }

    /// Listen for this cell's world transform changes
    pub fn add_transform_listener(&self, listener: TransformListener) {
        self.transform_listeners.write().push(listener);
    }

    /// Bind the renderer-side object; returns the previous binding
    pub fn bind_renderer(&self, renderer: Arc<dyn RendererBinding>) -> Option<Arc<dyn RendererBinding>> {
        self.renderer.write().replace(renderer)
    }

    /// Remove the renderer binding
    pub fn unbind_renderer(&self) -> Option<Arc<dyn RendererBinding>> {
        self.renderer.write().take()
    }

    pub(crate) fn notify_status_listeners(&self, step: StatusStep) {
        let listeners = self.status_listeners.read().clone();
        for listener in listeners {
            listener(self, step);
        }
    }

    pub(crate) fn notify_transform_listeners(&self, source: ChangeSource) {
        let listeners = self.transform_listeners.read().clone();
        for listener in listeners {
            listener(self, source);
        }
        if let (Some(renderer), Some(world)) = (self.renderer.read().clone(), self.world_transform()) {
            renderer.transform_updated(self.id, &world);
        }
    }

    /// Drop every capability and listener; the cell cannot be raised again
    pub(crate) fn release(&self) {
        self.components.write().clear();
        self.status_listeners.write().clear();
        self.transform_listeners.write().clear();
        self.renderer.write().take();
        self.state.write().released = true;
    }

    /// Serialise transitions on this cell; re-entrant for hooks on the same thread
    pub(crate) fn lock_transition(&self) -> ReentrantMutexGuard<'_, ()> {
        self.transition.lock()
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("name", &state.name)
            .field("status", &state.status)
            .field("parent", &*self.parent.read())
            .field("resources", &state.resources)
            .finish_non_exhaustive()
    }
}
