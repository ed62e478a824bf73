//! Client-side cell cache
//!
//! Mirrors the server's cell hierarchy. Hierarchy messages create, move,
//! configure, and remove cells; lifecycle changes run on the scheduler's
//! pool and resource downloads on the download runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;
use tracing::{debug, error, info, info_span, warn};

use crate::cell::{Cell, ConfigPayload};
use crate::config::CacheConfig;
use crate::context::CellContext;
use crate::error::{CellError, Result};
use crate::events::{BoxedEventSink, CellEvent, CellEventSink, EventHub, EventStream};
use crate::factory::CellFactory;
use crate::lifecycle;
use crate::metrics::{CacheMetrics, Timer};
use crate::propagate::{self, TransformUpdate};
use crate::protocol::{CellMessage, UpstreamMessage, UpstreamSink};
use crate::resolver::ResourceResolver;
use crate::scheduler::{RequestOutcome, StatusScheduler};
use crate::transform::{CellBounds, CellTransform};
use crate::tree::CellTree;
use crate::types::{CellId, CellStatus, ChangeSource};

/// Description of a cell to create
#[derive(Debug, Clone, PartialEq)]
pub struct NewCell {
    /// Server-assigned id
    pub cell_id: CellId,
    /// Type identifier
    pub type_name: String,
    /// Local bounds
    pub local_bounds: Option<CellBounds>,
    /// Parent, `None` for a root
    pub parent_id: Option<CellId>,
    /// Local transform
    pub local_transform: Option<CellTransform>,
    /// Configuration payload
    pub payload: ConfigPayload,
    /// Display name
    pub name: Option<String>,
}

impl NewCell {
    /// Root cell of the given type with no transform or payload
    pub fn new(cell_id: CellId, type_name: impl Into<String>) -> Self {
        Self {
            cell_id,
            type_name: type_name.into(),
            local_bounds: None,
            parent_id: None,
            local_transform: None,
            payload: ConfigPayload::Null,
            name: None,
        }
    }

    /// Set the parent
    pub fn with_parent(mut self, parent: CellId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// Set the local transform
    pub fn with_transform(mut self, transform: CellTransform) -> Self {
        self.local_transform = Some(transform);
        self
    }

    /// Set the local bounds
    pub fn with_bounds(mut self, bounds: CellBounds) -> Self {
        self.local_bounds = Some(bounds);
        self
    }

    /// Set the configuration payload
    pub fn with_payload(mut self, payload: ConfigPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// The cell cache
pub struct CellCache {
    config: CacheConfig,
    tree: Arc<CellTree>,
    scheduler: StatusScheduler,
    resolver: ResourceResolver,
    factory: CellFactory,
    events: Arc<EventHub>,
    upstream: Arc<dyn UpstreamSink>,
    metrics: Option<Arc<CacheMetrics>>,
    view_ready: AtomicBool,
    runtime: Option<Runtime>,
}

impl CellCache {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CacheConfig,
        tree: Arc<CellTree>,
        scheduler: StatusScheduler,
        resolver: ResourceResolver,
        factory: CellFactory,
        events: Arc<EventHub>,
        upstream: Arc<dyn UpstreamSink>,
        metrics: Option<Arc<CacheMetrics>>,
        runtime: Option<Runtime>,
    ) -> Self {
        Self {
            config,
            tree,
            scheduler,
            resolver,
            factory,
            events,
            upstream,
            metrics,
            view_ready: AtomicBool::new(false),
            runtime,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Cell tree
    pub fn tree(&self) -> &Arc<CellTree> {
        &self.tree
    }

    /// Lifecycle scheduler
    pub fn scheduler(&self) -> &StatusScheduler {
        &self.scheduler
    }

    /// Get metrics (if enabled)
    pub fn metrics(&self) -> Option<&Arc<CacheMetrics>> {
        self.metrics.as_ref()
    }

    /// Event hub every notification goes through
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Register a synchronous event sink
    pub fn add_sink(&self, sink: BoxedEventSink) {
        self.events.add_sink(sink);
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Look up a cell
    pub fn get(&self, id: CellId) -> Option<Arc<Cell>> {
        self.tree.get(id)
    }

    /// Whether a cell is cached
    pub fn contains(&self, id: CellId) -> bool {
        self.tree.contains(id)
    }

    /// Number of cached cells
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Root cells in creation order
    pub fn root_cells(&self) -> Vec<Arc<Cell>> {
        self.tree
            .roots()
            .into_iter()
            .filter_map(|id| self.tree.get(id))
            .collect()
    }

    /// Hook context for a cached cell, for adding or removing components
    pub fn context(&self, id: CellId) -> Option<CellContext> {
        self.tree.get(id).map(|cell| self.scheduler.context(cell))
    }

    /// Whether the view has been reported ready
    pub fn is_view_ready(&self) -> bool {
        self.view_ready.load(Ordering::SeqCst)
    }

    /// Dispatch one hierarchy message. Messages about unknown cells are
    /// logged and dropped.
    pub fn handle(&self, message: CellMessage) -> Result<()> {
        let message_type = message.message_type().to_string();
        let result = match message {
            CellMessage::Create {
                cell_id,
                type_name,
                local_bounds,
                parent_id,
                local_transform,
                payload,
                name,
            } => self
                .create(NewCell {
                    cell_id,
                    type_name,
                    local_bounds,
                    parent_id,
                    local_transform,
                    payload,
                    name,
                })
                .map(|_| ()),
            CellMessage::Reparent {
                cell_id,
                parent_id,
                local_transform,
            } => self.reparent(cell_id, parent_id, local_transform),
            CellMessage::Configure { cell_id, payload, name } => self.configure(cell_id, payload, name),
            CellMessage::Remove { cell_id } => self.remove(cell_id).map(|_| ()),
            CellMessage::ViewReady => {
                self.set_view_ready();
                Ok(())
            }
        };

        match result {
            Err(e) if e.is_stale() => {
                warn!(message = %message_type, error = %e, "Ignoring stale cell message");
                Ok(())
            }
            other => other,
        }
    }

    /// Create a cell, attach it, and start loading its resources
    pub fn create(&self, new: NewCell) -> Result<Arc<Cell>> {
        let timer = Timer::start();
        let id = new.cell_id;
        let _span = info_span!("cell_create", cell = %id, type_name = %new.type_name).entered();

        if self.tree.contains(id) {
            error!(cell = %id, "Attempt to create cell that already exists");
            self.record_load_failure("duplicate");
            return Err(CellError::DuplicateCell(id));
        }

        if let Some(parent) = new.parent_id {
            if !self.tree.contains(parent) {
                warn!(cell = %id, parent = %parent, "Failed to find parent, requesting reparent");
                self.upstream.send(UpstreamMessage::ReparentRequest {
                    cell_id: id,
                    parent_id: parent,
                });
                return Err(self.load_failed(&new, CellError::UnknownParent { cell: id, parent }));
            }
        }

        let cell = match self.build_cell(&new) {
            Ok(cell) => cell,
            Err(e) => return Err(self.load_failed(&new, e)),
        };
        if let Err(e) = self.tree.insert(cell.clone(), new.parent_id) {
            return Err(self.load_failed(&new, e));
        }

        propagate::refresh_subtree(&self.tree, &cell, ChangeSource::ServerAdjust, &*self.events);
        self.events.on_event(&CellEvent::Loaded {
            cell: id,
            type_name: new.type_name.clone(),
        });
        info!(cell = %id, type_name = %new.type_name, parent = ?new.parent_id, "Cell loaded");

        self.resolver.resolve(&cell);
        self.scheduler.on_children_changed(new.parent_id, id);
        if self.is_view_ready() || self.config.activate_on_create {
            self.scheduler.request_status(id, self.config.load_status);
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_loaded();
            metrics.load_time.observe(timer.stop());
        }
        Ok(cell)
    }

    /// Construct the cell, attach its components, and configure it, all
    /// before it becomes visible in the tree
    fn build_cell(&self, new: &NewCell) -> Result<Arc<Cell>> {
        let blueprint = self.factory.build(new.cell_id, &new.type_name, &new.payload)?;
        let cell = Arc::new(Cell::new(
            new.cell_id,
            new.type_name.clone(),
            new.name.clone(),
            new.local_bounds,
            blueprint.resources,
        ));

        let ctx = self.scheduler.context(cell.clone());
        for component in blueprint.components {
            lifecycle::add_component(&ctx, component)?;
        }
        if new.payload.is_null() {
            debug!(cell = %new.cell_id, "Cell created without configuration");
        } else {
            lifecycle::configure(&ctx, new.payload.clone())?;
        }
        cell.set_local_field(new.local_transform);
        Ok(cell)
    }

    fn load_failed(&self, new: &NewCell, err: CellError) -> CellError {
        error!(cell = %new.cell_id, type_name = %new.type_name, error = %err, "Failed to load cell");
        self.events.on_event(&CellEvent::LoadFailed {
            cell: new.cell_id,
            type_name: new.type_name.clone(),
            parent: new.parent_id,
            cause: err.to_string(),
        });
        let reason = match &err {
            CellError::UnknownParent { .. } => "unknown_parent",
            CellError::UnknownCellType(_) => "unknown_type",
            CellError::DuplicateCell(_) => "duplicate",
            _ => "construction",
        };
        self.record_load_failure(reason);
        err
    }

    fn record_load_failure(&self, reason: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_load_failure(reason);
        }
    }

    /// Move a cell under a new parent (or make it a root) with a new local
    /// transform. Statuses are left as they are.
    pub fn reparent(
        &self,
        id: CellId,
        parent: Option<CellId>,
        local: Option<CellTransform>,
    ) -> Result<()> {
        let cell = self.tree.get(id).ok_or(CellError::UnknownCell(id))?;
        let old_parent = self.tree.reparent(id, parent)?;
        cell.set_local_field(local);
        let update = propagate::refresh_subtree(&self.tree, &cell, ChangeSource::Remote, &*self.events);
        info!(cell = %id, from = ?old_parent, to = ?parent, touched = update.touched, "Cell reparented");

        self.scheduler.on_children_changed(old_parent, id);
        self.scheduler.on_children_changed(parent, id);
        Ok(())
    }

    /// Deliver a new name and configuration to a cell
    pub fn configure(&self, id: CellId, payload: ConfigPayload, name: Option<String>) -> Result<()> {
        let cell = self.tree.get(id).ok_or(CellError::UnknownCell(id))?;
        if let Some(name) = name {
            if name != cell.name() {
                cell.set_name(name);
            }
        }
        if payload.is_null() {
            return Ok(());
        }
        lifecycle::configure(&self.scheduler.context(cell), payload)
    }

    /// Remove a cell and its subtree. The removed cells are taken down to
    /// `Disk` off the calling thread. Returns the removed ids in preorder.
    pub fn remove(&self, id: CellId) -> Result<Vec<CellId>> {
        let cell = self.tree.get(id).ok_or(CellError::UnknownCell(id))?;
        let parent = cell.parent();
        let removed = self.tree.remove_subtree(id);
        let ids: Vec<CellId> = removed.iter().map(|c| c.id()).collect();
        info!(cell = %id, removed = ids.len(), "Cell removed");

        self.scheduler.retire(removed);
        self.scheduler.on_children_changed(parent, id);
        Ok(ids)
    }

    /// Ask for a status change on a cell
    pub fn request_status(&self, id: CellId, target: CellStatus) -> RequestOutcome {
        self.scheduler.request_status(id, target)
    }

    /// Change a cell's local transform from the client side
    pub fn set_local_transform(
        &self,
        id: CellId,
        local: Option<CellTransform>,
        source: ChangeSource,
    ) -> Result<TransformUpdate> {
        let cell = self.tree.get(id).ok_or(CellError::UnknownCell(id))?;
        Ok(propagate::set_local_transform(&self.tree, &cell, local, source, &*self.events))
    }

    /// The client's view is in place: drive every cell to the load status,
    /// parents before children, and do the same for cells created later
    pub fn set_view_ready(&self) {
        if self.view_ready.swap(true, Ordering::SeqCst) {
            debug!("View already ready");
            return;
        }
        let target = self.config.load_status;
        let mut requested = 0usize;
        for root in self.tree.roots() {
            for cell in self.tree.subtree(root) {
                if cell.status() < target {
                    self.scheduler.request_status(cell.id(), target);
                    requested += 1;
                }
            }
        }
        info!(target = %target, requested, "View ready");
    }

    /// Block until no lifecycle work is running
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }
}

impl Drop for CellCache {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for CellCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellCache")
            .field("cells", &self.tree.len())
            .field("view_ready", &self.is_view_ready())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
