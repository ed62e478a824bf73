//! Fixtures shared by the unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cell::{Cell, CellComponent, ConfigPayload};
use crate::context::CellContext;
use crate::error::{CellError, Result};
use crate::events::{CellEvent, CellEventSink};
use crate::scheduler::StatusScheduler;
use crate::tree::CellTree;
use crate::types::{CellId, CellStatus, StatusStep};

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Sink that keeps every event in arrival order
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CellEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<CellEvent> {
        self.events.lock().clone()
    }

    /// Statuses a cell stepped into, in order
    pub fn statuses(&self, cell: CellId) -> Vec<CellStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CellEvent::StatusChanged { cell: c, to, .. } if *c == cell => Some(*to),
                _ => None,
            })
            .collect()
    }

    /// Index of a status step among all recorded events
    pub fn step_position(&self, cell: CellId, from: CellStatus, to: CellStatus) -> Option<usize> {
        let wanted = CellEvent::StatusChanged { cell, from, to };
        self.events.lock().iter().position(|e| *e == wanted)
    }
}

impl CellEventSink for RecordingSink {
    fn on_event(&self, event: &CellEvent) {
        self.events.lock().push(event.clone());
    }
}

enum Behaviour {
    Normal,
    FailAt(CellStatus),
    PanicAt(CellStatus),
}

type AttachHook = Box<dyn Fn(&CellContext, StatusStep) + Send + Sync>;

/// Component that records every hook call
pub struct RecordingComponent {
    kind: String,
    behaviour: Behaviour,
    hook: Option<AttachHook>,
    attached: Mutex<Vec<CellStatus>>,
    detached: Mutex<Vec<CellStatus>>,
    configured: AtomicUsize,
}

impl RecordingComponent {
    pub fn new(kind: &str) -> Self {
        Self::with_behaviour(kind, Behaviour::Normal)
    }

    /// Attach fails when stepping into `status`
    pub fn failing_at(kind: &str, status: CellStatus) -> Self {
        Self::with_behaviour(kind, Behaviour::FailAt(status))
    }

    /// Attach panics when stepping into `status`
    pub fn panicking_at(kind: &str, status: CellStatus) -> Self {
        Self::with_behaviour(kind, Behaviour::PanicAt(status))
    }

    fn with_behaviour(kind: &str, behaviour: Behaviour) -> Self {
        Self {
            kind: kind.to_string(),
            behaviour,
            hook: None,
            attached: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            configured: AtomicUsize::new(0),
        }
    }

    /// Run `hook` after every successful attach
    pub fn on_attach(mut self, hook: impl Fn(&CellContext, StatusStep) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub fn attached(&self) -> Vec<CellStatus> {
        self.attached.lock().clone()
    }

    pub fn detached(&self) -> Vec<CellStatus> {
        self.detached.lock().clone()
    }

    pub fn configured(&self) -> usize {
        self.configured.load(Ordering::SeqCst)
    }
}

impl CellComponent for RecordingComponent {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn attach(&self, ctx: &CellContext, step: StatusStep) -> Result<()> {
        match self.behaviour {
            Behaviour::FailAt(status) if status == step.to => {
                return Err(CellError::hook(ctx.id(), self.kind.clone(), step.to, "refused"));
            }
            Behaviour::PanicAt(status) if status == step.to => {
                panic!("{} exploded entering {}", self.kind, step.to);
            }
            _ => {}
        }
        self.attached.lock().push(step.to);
        if let Some(hook) = &self.hook {
            hook(ctx, step);
        }
        Ok(())
    }

    fn detach(&self, _ctx: &CellContext, step: StatusStep) -> Result<()> {
        self.detached.lock().push(step.from);
        Ok(())
    }

    fn configure(&self, _ctx: &CellContext, _payload: &ConfigPayload) -> Result<()> {
        self.configured.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A tree, a recording sink, and a scheduler driving them
pub struct TestHarness {
    pub tree: Arc<CellTree>,
    pub sink: Arc<RecordingSink>,
    pub scheduler: StatusScheduler,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_threads(4)
    }

    pub fn with_threads(threads: usize) -> Self {
        let tree = Arc::new(CellTree::new());
        let sink = Arc::new(RecordingSink::default());
        let scheduler = StatusScheduler::new(tree.clone(), sink.clone(), threads, None).unwrap();
        Self {
            tree,
            sink,
            scheduler,
        }
    }

    pub fn root(&self, id: u64) -> CellContext {
        self.insert(Cell::new(CellId::new(id), "test", None, None, Vec::new()), None)
    }

    pub fn root_with_resources(&self, id: u64, resources: Vec<String>) -> CellContext {
        self.insert(Cell::new(CellId::new(id), "test", None, None, resources), None)
    }

    pub fn child(&self, id: u64, parent: u64) -> CellContext {
        self.insert(
            Cell::new(CellId::new(id), "test", None, None, Vec::new()),
            Some(CellId::new(parent)),
        )
    }

    pub fn insert(&self, cell: Cell, parent: Option<CellId>) -> CellContext {
        let cell = Arc::new(cell);
        self.tree.insert(cell.clone(), parent).unwrap();
        self.scheduler.context(cell)
    }

    /// Wait for every dispatched transition to finish
    pub fn settle(&self) {
        assert!(self.scheduler.wait_idle(Duration::from_secs(5)), "scheduler did not go idle");
    }
}
