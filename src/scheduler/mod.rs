//! Eligibility scheduler for cell status changes
//!
//! Requests that cannot run yet wait in a registry keyed by cell id and are
//! re-tested when:
//! - the cell, its parent, or one of its children settles a lifecycle step
//! - a child is added to or removed from the cell
//! - the cell's declared resources finish downloading
//!
//! Eligible requests run on a bounded rayon pool. The registry lock covers
//! bookkeeping only and is never held across hooks or I/O.

pub mod queue;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, trace, warn};

use crate::cell::Cell;
use crate::context::CellContext;
use crate::error::{CellError, Result};
use crate::events::{BoxedEventSink, CellEvent};
use crate::lifecycle;
use crate::metrics::CacheMetrics;
use crate::tree::CellTree;
use crate::types::{CellId, CellStatus, StatusStep};

pub use queue::{InFlight, PendingRequest, WaitingRegistry};

/// What happened to a status request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The cell is already at the target; any older request was dropped
    Unchanged,
    /// Waiting for its preconditions
    Queued,
    /// Handed to the lifecycle pool
    Dispatched,
    /// No such cell in the tree
    UnknownCell,
}

struct Shared {
    tree: Arc<CellTree>,
    registry: Mutex<WaitingRegistry>,
    idle: Condvar,
    pool: ThreadPool,
    sink: BoxedEventSink,
    metrics: Option<Arc<CacheMetrics>>,
}

/// Handle to the scheduler. Cloning is cheap; every clone drives the same pool.
#[derive(Clone)]
pub struct StatusScheduler {
    shared: Arc<Shared>,
}

type Job = (Arc<Cell>, CellStatus);

impl StatusScheduler {
    /// Create a scheduler over `tree`. `threads == 0` sizes the pool to the
    /// available parallelism.
    pub fn new(
        tree: Arc<CellTree>,
        sink: BoxedEventSink,
        threads: usize,
        metrics: Option<Arc<CacheMetrics>>,
    ) -> Result<Self> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            threads
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("cell-lifecycle-{}", i))
            .build()
            .map_err(|e| CellError::internal(format!("Failed to start lifecycle pool: {}", e)))?;
        info!(threads, "Lifecycle pool started");

        Ok(Self {
            shared: Arc::new(Shared {
                tree,
                registry: Mutex::new(WaitingRegistry::new()),
                idle: Condvar::new(),
                pool,
                sink,
                metrics,
            }),
        })
    }

    /// The tree this scheduler drives
    pub fn tree(&self) -> &Arc<CellTree> {
        &self.shared.tree
    }

    /// Sink receiving status notifications
    pub fn sink(&self) -> &BoxedEventSink {
        &self.shared.sink
    }

    /// Context for running work on behalf of `cell`
    pub fn context(&self, cell: Arc<Cell>) -> CellContext {
        CellContext::new(cell, self.clone())
    }

    /// Ask for `id` to reach `target`. Never blocks on the transition itself.
    pub fn request_status(&self, id: CellId, target: CellStatus) -> RequestOutcome {
        let Some(cell) = self.shared.tree.get(id) else {
            debug!(cell = %id, target = %target, "Status request for unknown cell");
            return RequestOutcome::UnknownCell;
        };

        let jobs = {
            let mut registry = self.shared.registry.lock();
            if registry.in_flight(id).is_none() && cell.status() == target {
                if registry.remove(id).is_some() {
                    debug!(cell = %id, target = %target, "Pending request dropped");
                }
                self.update_gauges(&registry);
                return RequestOutcome::Unchanged;
            }
            if let Some(old) = registry.push(id, target) {
                debug!(cell = %id, old = %old.target, new = %target, "Pending request replaced");
            }
            self.collect_eligible(&mut registry, &[id])
        };

        let outcome = if jobs.iter().any(|(cell, _)| cell.id() == id) {
            RequestOutcome::Dispatched
        } else {
            trace!(cell = %id, target = %target, "Status request queued");
            RequestOutcome::Queued
        };
        self.dispatch(jobs);
        outcome
    }

    /// Re-test the pending requests of the given cells
    pub fn reevaluate(&self, ids: &[CellId]) {
        let jobs = {
            let mut registry = self.shared.registry.lock();
            self.collect_eligible(&mut registry, ids)
        };
        self.dispatch(jobs);
    }

    /// A child was added to or removed from `parent`
    pub fn on_children_changed(&self, parent: Option<CellId>, child: CellId) {
        match parent {
            Some(parent) => self.reevaluate(&[parent, child]),
            None => self.reevaluate(&[child]),
        }
    }

    /// The cell's resources finished downloading
    pub fn on_resources_ready(&self, id: CellId) {
        self.reevaluate(&[id]);
    }

    /// Drop the pending request of a cell
    pub fn cancel(&self, id: CellId) -> Option<PendingRequest> {
        let mut registry = self.shared.registry.lock();
        let removed = registry.remove(id);
        self.update_gauges(&registry);
        removed
    }

    /// Pending request of a cell
    pub fn pending(&self, id: CellId) -> Option<PendingRequest> {
        self.shared.registry.lock().get(id).cloned()
    }

    /// Every pending request, oldest first
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.shared.registry.lock().pending()
    }

    /// Number of pending requests
    pub fn pending_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Number of transitions running on the pool
    pub fn in_flight_count(&self) -> usize {
        self.shared.registry.lock().in_flight_count()
    }

    /// Block until no transition or teardown is running, or `timeout` passes.
    /// Returns whether the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut registry = self.shared.registry.lock();
        while !registry.is_idle() {
            if self.shared.idle.wait_until(&mut registry, deadline).timed_out() {
                return registry.is_idle();
            }
        }
        true
    }

    /// Tear down cells already removed from the tree.
    ///
    /// `cells` is in preorder; they are taken to `Disk` children-first on the
    /// pool and an `Unloaded` event is fired for each. Their pending requests
    /// are dropped immediately.
    pub fn retire(&self, cells: Vec<Arc<Cell>>) {
        if cells.is_empty() {
            return;
        }
        {
            let mut registry = self.shared.registry.lock();
            for cell in &cells {
                if let Some(request) = registry.remove(cell.id()) {
                    debug!(cell = %cell.id(), target = %request.target, "Pending request of removed cell dropped");
                }
            }
            registry.begin_teardown();
            self.update_gauges(&registry);
        }

        let scheduler = self.clone();
        self.shared.pool.spawn(move || scheduler.teardown(cells));
    }

    fn collect_eligible(&self, registry: &mut WaitingRegistry, ids: &[CellId]) -> Vec<Job> {
        let mut jobs = Vec::new();
        for &id in ids {
            if registry.in_flight(id).is_some() {
                continue;
            }
            let Some(target) = registry.get(id).map(|r| r.target) else {
                continue;
            };
            let Some(cell) = self.shared.tree.get(id) else {
                registry.remove(id);
                continue;
            };

            let current = cell.settled_status();
            if current == target {
                registry.remove(id);
                continue;
            }

            let resources_ready = cell.resource_state().is_ready();
            let eligible = if target > current {
                resources_ready && self.parent_allows(registry, &cell, target)
            } else {
                self.children_allow(registry, &cell, target)
            };

            if eligible {
                let attempts = registry.remove(id).map_or(0, |request| request.attempts);
                trace!(cell = %id, target = %target, attempts, "Request eligible");
                registry.start(
                    id,
                    InFlight {
                        from: current,
                        target,
                    },
                );
                jobs.push((cell, target));
            } else if let Some(request) = registry.get_mut(id) {
                request.resources_ready = resources_ready;
                request.attempts += 1;
            }
        }
        self.update_gauges(registry);
        jobs
    }

    /// An increase to `target` needs the parent to be at or above it and
    /// not heading below it.
    fn parent_allows(&self, registry: &WaitingRegistry, cell: &Cell, target: CellStatus) -> bool {
        let Some(parent_id) = cell.parent() else {
            return true;
        };
        let Some(parent) = self.shared.tree.get(parent_id) else {
            return false;
        };
        let settled = parent.settled_status();
        let floor = match registry.in_flight(parent_id) {
            Some(flight) => settled.min(flight.target),
            None => settled,
        };
        floor >= target
    }

    /// A decrease to `target` needs every child at or below it and none
    /// heading above it.
    fn children_allow(&self, registry: &WaitingRegistry, cell: &Cell, target: CellStatus) -> bool {
        cell.children().into_iter().all(|child_id| match self.shared.tree.get(child_id) {
            Some(child) => {
                let settled = child.settled_status();
                let ceiling = match registry.in_flight(child_id) {
                    Some(flight) => settled.max(flight.target),
                    None => settled,
                };
                ceiling <= target
            }
            None => true,
        })
    }

    fn dispatch(&self, jobs: Vec<Job>) {
        for (cell, target) in jobs {
            debug!(cell = %cell.id(), target = %target, "Transition dispatched");
            let scheduler = self.clone();
            self.shared.pool.spawn(move || scheduler.execute(cell, target));
        }
    }

    fn execute(&self, cell: Arc<Cell>, target: CellStatus) {
        let id = cell.id();
        if self.shared.tree.contains(id) {
            let ctx = self.context(cell.clone());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                lifecycle::set_status(&ctx, target, &*self.shared.sink, &mut |step| {
                    self.on_step(&cell, step)
                })
            }));
            drop(ctx);

            match outcome {
                Ok(Ok(change)) => debug!(cell = %id, target = %target, ?change, "Transition finished"),
                Ok(Err(e)) => {
                    error!(cell = %id, target = %target, error = %e, "Transition failed");
                    self.record_failure();
                }
                Err(payload) => {
                    error!(cell = %id, target = %target, panic = %panic_message(payload.as_ref()), "Transition panicked");
                    self.record_failure();
                }
            }

            // A sink or listener that failed mid-step leaves the settled copy behind
            let status = cell.status();
            if cell.settled_status() != status {
                warn!(cell = %id, status = %status, "Settled status resynced after failed notification");
                cell.settle(status);
                if status == CellStatus::Disk && target == CellStatus::Disk && !cell.is_released() {
                    cell.release();
                }
            }
        } else {
            debug!(cell = %id, target = %target, "Cell removed before its transition ran");
        }

        let jobs = {
            let mut registry = self.shared.registry.lock();
            registry.finish(id);
            let jobs = self.collect_eligible(&mut registry, &neighbours(&cell));
            if registry.is_idle() {
                self.shared.idle.notify_all();
            }
            jobs
        };
        self.dispatch(jobs);
    }

    fn on_step(&self, cell: &Cell, step: StatusStep) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_step(step);
        }
        self.reevaluate(&neighbours(cell));
    }

    fn teardown(&self, cells: Vec<Arc<Cell>>) {
        for cell in cells.iter().rev() {
            let id = cell.id();
            let ctx = self.context(cell.clone());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                lifecycle::set_status(&ctx, CellStatus::Disk, &*self.shared.sink, &mut |step| {
                    if let Some(metrics) = &self.shared.metrics {
                        metrics.record_step(step);
                    }
                })
            }));
            drop(ctx);

            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(cell = %id, error = %e, "Teardown of removed cell failed");
                    self.record_failure();
                }
                Err(payload) => {
                    warn!(cell = %id, panic = %panic_message(payload.as_ref()), "Teardown of removed cell panicked");
                    self.record_failure();
                }
            }
            if !cell.is_released() {
                cell.release();
            }

            self.shared.sink.on_event(&CellEvent::Unloaded { cell: id });
            if let Some(metrics) = &self.shared.metrics {
                metrics.record_unloaded();
            }
        }

        let mut registry = self.shared.registry.lock();
        registry.end_teardown();
        if registry.is_idle() {
            self.shared.idle.notify_all();
        }
    }

    fn record_failure(&self) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_transition_failure();
        }
    }

    fn update_gauges(&self, registry: &WaitingRegistry) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.set_scheduler_load(registry.len(), registry.in_flight_count());
        }
    }
}

impl std::fmt::Debug for StatusScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.shared.registry.lock();
        f.debug_struct("StatusScheduler")
            .field("threads", &self.shared.pool.current_num_threads())
            .field("pending", &registry.len())
            .field("in_flight", &registry.in_flight_count())
            .finish()
    }
}

/// The cell, its parent, and its children
fn neighbours(cell: &Cell) -> Vec<CellId> {
    let mut ids = vec![cell.id()];
    ids.extend(cell.parent());
    ids.extend(cell.children());
    ids
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::ResourceState;
    use crate::testing::{wait_until, RecordingComponent, TestHarness};

    const LEVELS: [CellStatus; 4] = [
        CellStatus::Bounded,
        CellStatus::Inactive,
        CellStatus::Active,
        CellStatus::Visible,
    ];

    fn id(n: u64) -> CellId {
        CellId::new(n)
    }

    #[test]
    fn test_root_climbs_one_step_at_a_time() {
        let harness = TestHarness::new();
        harness.root(1);

        let outcome = harness.scheduler.request_status(id(1), CellStatus::Visible);
        assert_eq!(outcome, RequestOutcome::Dispatched);
        harness.settle();

        assert_eq!(harness.sink.statuses(id(1)), LEVELS.to_vec());
        assert_eq!(harness.scheduler.pending_count(), 0);
    }

    #[test]
    fn test_request_for_current_status_is_noop() {
        let harness = TestHarness::new();
        harness.root(1);

        assert_eq!(
            harness.scheduler.request_status(id(1), CellStatus::Disk),
            RequestOutcome::Unchanged
        );
        assert_eq!(
            harness.scheduler.request_status(id(9), CellStatus::Active),
            RequestOutcome::UnknownCell
        );
        harness.settle();
        assert!(harness.sink.events().is_empty());
    }

    #[test]
    fn test_child_waits_for_parent() {
        let harness = TestHarness::new();
        harness.root(1);
        harness.child(2, 1);

        let outcome = harness.scheduler.request_status(id(2), CellStatus::Visible);
        assert_eq!(outcome, RequestOutcome::Queued);
        harness.settle();
        assert_eq!(harness.tree.get(id(2)).unwrap().status(), CellStatus::Disk);
        assert!(harness.sink.statuses(id(2)).is_empty());

        let pending = harness.scheduler.pending(id(2)).unwrap();
        assert_eq!(pending.target, CellStatus::Visible);
        assert!(pending.resources_ready);
        assert!(pending.attempts >= 1);

        harness.scheduler.request_status(id(1), CellStatus::Visible);
        harness.settle();

        assert_eq!(harness.sink.statuses(id(2)), LEVELS.to_vec());
        let parent_done = harness.sink.step_position(id(1), CellStatus::Active, CellStatus::Visible).unwrap();
        let child_start = harness.sink.step_position(id(2), CellStatus::Disk, CellStatus::Bounded).unwrap();
        assert!(parent_done < child_start);
    }

    #[test]
    fn test_concurrent_increases_respect_ancestry() {
        let harness = TestHarness::new();
        harness.root(1);
        harness.child(2, 1);
        harness.child(3, 2);

        std::thread::scope(|scope| {
            for n in [3, 2, 1] {
                let scheduler = harness.scheduler.clone();
                scope.spawn(move || scheduler.request_status(id(n), CellStatus::Visible));
            }
        });
        assert!(wait_until(Duration::from_secs(5), || {
            harness.tree.get(id(3)).unwrap().status() == CellStatus::Visible
        }));
        harness.settle();

        for (i, level) in LEVELS.iter().enumerate() {
            let from = if i == 0 { CellStatus::Disk } else { LEVELS[i - 1] };
            let a = harness.sink.step_position(id(1), from, *level).unwrap();
            let b = harness.sink.step_position(id(2), from, *level).unwrap();
            let c = harness.sink.step_position(id(3), from, *level).unwrap();
            assert!(a < b && b < c, "level {} out of order: {} {} {}", level, a, b, c);
        }
    }

    #[test]
    fn test_parent_waits_for_children_to_descend() {
        let harness = TestHarness::new();
        harness.root(1);
        harness.child(2, 1);
        harness.scheduler.request_status(id(1), CellStatus::Visible);
        harness.scheduler.request_status(id(2), CellStatus::Visible);
        harness.settle();
        assert_eq!(harness.tree.get(id(2)).unwrap().status(), CellStatus::Visible);

        assert_eq!(
            harness.scheduler.request_status(id(1), CellStatus::Disk),
            RequestOutcome::Queued
        );
        harness.settle();
        assert_eq!(harness.tree.get(id(1)).unwrap().status(), CellStatus::Visible);

        harness.scheduler.request_status(id(2), CellStatus::Disk);
        harness.settle();

        assert_eq!(harness.tree.get(id(1)).unwrap().status(), CellStatus::Disk);
        let child_down = harness.sink.step_position(id(2), CellStatus::Bounded, CellStatus::Disk).unwrap();
        let parent_first = harness.sink.step_position(id(1), CellStatus::Visible, CellStatus::Active).unwrap();
        assert!(child_down < parent_first);
    }

    #[test]
    fn test_newest_request_replaces_pending() {
        let harness = TestHarness::new();
        harness.root(1);
        harness.child(2, 1);

        harness.scheduler.request_status(id(2), CellStatus::Visible);
        harness.scheduler.request_status(id(2), CellStatus::Bounded);
        assert_eq!(harness.scheduler.pending_count(), 1);
        assert_eq!(harness.scheduler.pending(id(2)).unwrap().target, CellStatus::Bounded);

        harness.scheduler.request_status(id(1), CellStatus::Active);
        harness.settle();
        assert_eq!(harness.tree.get(id(2)).unwrap().status(), CellStatus::Bounded);

        // Back to the current status drops whatever is still waiting
        harness.scheduler.request_status(id(2), CellStatus::Visible);
        assert_eq!(
            harness.scheduler.request_status(id(2), CellStatus::Bounded),
            RequestOutcome::Unchanged
        );
        assert!(harness.scheduler.pending(id(2)).is_none());
    }

    #[test]
    fn test_resources_gate_increase() {
        let harness = TestHarness::new();
        let ctx = harness.root_with_resources(1, vec!["asset://host/model".to_string()]);

        assert_eq!(
            harness.scheduler.request_status(id(1), CellStatus::Active),
            RequestOutcome::Queued
        );
        harness.settle();
        assert!(!harness.scheduler.pending(id(1)).unwrap().resources_ready);

        ctx.cell().set_resource_state(ResourceState::Ready);
        harness.scheduler.on_resources_ready(id(1));
        harness.settle();
        assert_eq!(ctx.cell().status(), CellStatus::Active);
    }

    #[test]
    fn test_failed_transition_is_isolated() {
        let harness = TestHarness::new();
        let broken = harness.root(1);
        lifecycle::add_component(
            &broken,
            Arc::new(RecordingComponent::failing_at("model", CellStatus::Active)),
        )
        .unwrap();
        harness.root(2);

        harness.scheduler.request_status(id(1), CellStatus::Visible);
        harness.scheduler.request_status(id(2), CellStatus::Visible);
        harness.settle();

        assert_eq!(broken.cell().status(), CellStatus::Inactive);
        assert_eq!(harness.tree.get(id(2)).unwrap().status(), CellStatus::Visible);

        harness.scheduler.request_status(id(1), CellStatus::Bounded);
        harness.settle();
        assert_eq!(broken.cell().status(), CellStatus::Bounded);
    }

    #[test]
    fn test_panicking_hook_is_isolated() {
        let harness = TestHarness::with_threads(1);
        let broken = harness.root(1);
        lifecycle::add_component(
            &broken,
            Arc::new(RecordingComponent::panicking_at("model", CellStatus::Inactive)),
        )
        .unwrap();
        harness.root(2);

        harness.scheduler.request_status(id(1), CellStatus::Visible);
        harness.settle();
        assert_eq!(broken.cell().status(), CellStatus::Bounded);
        assert_eq!(harness.scheduler.in_flight_count(), 0);

        harness.scheduler.request_status(id(2), CellStatus::Active);
        harness.settle();
        assert_eq!(harness.tree.get(id(2)).unwrap().status(), CellStatus::Active);
    }

    #[test]
    fn test_panicking_status_listener_does_not_block_children() {
        let harness = TestHarness::new();
        let parent = harness.root(1);
        harness.child(2, 1);
        parent.cell().add_status_listener(Arc::new(|_cell: &Cell, step: StatusStep| {
            if step.to == CellStatus::Bounded {
                panic!("listener failed");
            }
        }));

        harness.scheduler.request_status(id(1), CellStatus::Bounded);
        harness.settle();
        assert_eq!(parent.cell().status(), CellStatus::Bounded);
        assert_eq!(parent.cell().settled_status(), CellStatus::Bounded);

        harness.scheduler.request_status(id(2), CellStatus::Bounded);
        harness.settle();
        assert_eq!(harness.tree.get(id(2)).unwrap().status(), CellStatus::Bounded);
        assert_eq!(harness.scheduler.pending_count(), 0);
    }

    #[test]
    fn test_hook_may_request_other_cells() {
        let harness = TestHarness::new();
        let parent = harness.root(1);
        harness.child(2, 1);
        let component = RecordingComponent::new("spawner").on_attach(|ctx, step| {
            if step.to == CellStatus::Active {
                ctx.request_status(CellId::new(2), CellStatus::Active);
            }
        });
        lifecycle::add_component(&parent, Arc::new(component)).unwrap();

        harness.scheduler.request_status(id(1), CellStatus::Visible);
        assert!(wait_until(Duration::from_secs(5), || {
            harness.tree.get(id(2)).unwrap().status() == CellStatus::Active
        }));
        harness.settle();
    }

    #[test]
    fn test_retire_drops_pending_and_unloads() {
        let harness = TestHarness::new();
        harness.root(1);
        harness.child(2, 1);
        harness.child(3, 2);
        harness.scheduler.request_status(id(2), CellStatus::Visible);
        assert_eq!(harness.scheduler.pending_count(), 1);

        let removed = harness.tree.remove_subtree(id(2));
        harness.scheduler.retire(removed);
        assert_eq!(harness.scheduler.pending_count(), 0);

        harness.scheduler.request_status(id(1), CellStatus::Visible);
        harness.settle();

        assert!(harness.sink.statuses(id(2)).is_empty());
        let unloaded: Vec<CellId> = harness
            .sink
            .events()
            .iter()
            .filter_map(|e| match e {
                CellEvent::Unloaded { cell } => Some(*cell),
                _ => None,
            })
            .collect();
        assert_eq!(unloaded, vec![id(3), id(2)]);
    }
}
