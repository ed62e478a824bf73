//! Waiting registry for status requests
//!
//! Holds at most one pending request per cell, keyed by cell id, plus the
//! set of cells whose transition is currently running. A newer request for
//! the same cell replaces the older one.

use std::collections::HashMap;

use crate::types::{CellId, CellStatus};

/// A status request that could not run yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Cell to move
    pub cell: CellId,
    /// Requested status
    pub target: CellStatus,
    /// Resource readiness seen by the last eligibility test
    pub resources_ready: bool,
    /// Registration order
    pub sequence: u64,
    /// Number of eligibility tests this request failed
    pub attempts: u32,
}

impl PendingRequest {
    /// Create new pending request
    pub fn new(cell: CellId, target: CellStatus, sequence: u64) -> Self {
        Self {
            cell,
            target,
            resources_ready: false,
            sequence,
            attempts: 0,
        }
    }
}

/// Transition currently running on a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    /// Status when the transition was dispatched
    pub from: CellStatus,
    /// Status the transition is heading to
    pub target: CellStatus,
}

/// Registry of waiting and running requests. Guarded by the scheduler lock.
#[derive(Debug, Default)]
pub struct WaitingRegistry {
    waiting: HashMap<CellId, PendingRequest>,
    in_flight: HashMap<CellId, InFlight>,
    teardowns: usize,
    sequence: u64,
}

impl WaitingRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, replacing any older one for the same cell
    pub fn push(&mut self, cell: CellId, target: CellStatus) -> Option<PendingRequest> {
        self.sequence += 1;
        self.waiting
            .insert(cell, PendingRequest::new(cell, target, self.sequence))
    }

    /// Pending request for a cell
    pub fn get(&self, cell: CellId) -> Option<&PendingRequest> {
        self.waiting.get(&cell)
    }

    /// Pending request for a cell, mutably
    pub fn get_mut(&mut self, cell: CellId) -> Option<&mut PendingRequest> {
        self.waiting.get_mut(&cell)
    }

    /// Remove a pending request
    pub fn remove(&mut self, cell: CellId) -> Option<PendingRequest> {
        self.waiting.remove(&cell)
    }

    /// Pending requests ordered by registration
    pub fn pending(&self) -> Vec<PendingRequest> {
        let mut all: Vec<PendingRequest> = self.waiting.values().cloned().collect();
        all.sort_by_key(|r| r.sequence);
        all
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Check if no request is pending
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Mark a transition as running
    pub fn start(&mut self, cell: CellId, flight: InFlight) {
        self.in_flight.insert(cell, flight);
    }

    /// Mark a transition as finished
    pub fn finish(&mut self, cell: CellId) -> Option<InFlight> {
        self.in_flight.remove(&cell)
    }

    /// Running transition for a cell
    pub fn in_flight(&self, cell: CellId) -> Option<InFlight> {
        self.in_flight.get(&cell).copied()
    }

    /// Number of running transitions
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// A removed subtree started tearing down
    pub fn begin_teardown(&mut self) {
        self.teardowns += 1;
    }

    /// A removed subtree reached `Disk`
    pub fn end_teardown(&mut self) {
        self.teardowns = self.teardowns.saturating_sub(1);
    }

    /// No transition or teardown is running
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.teardowns == 0
    }
}
