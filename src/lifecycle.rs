//! Cell lifecycle state machine
//!
//! Drives a cell between statuses one ordinal at a time. For every step the
//! component hooks run, the status is updated, and the notification is
//! delivered before the next step begins.

use std::sync::Arc;
use tracing::{debug, debug_span, warn};

use crate::cell::{CellComponent, ConfigPayload};
use crate::context::CellContext;
use crate::error::{CellError, Result};
use crate::events::{CellEvent, CellEventSink};
use crate::types::{CellStatus, StatusStep};

/// Result of a status request on one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// Already at the target
    Unchanged,
    /// Moved from one status to another
    Changed {
        /// Status before the first step
        from: CellStatus,
        /// Status after the last step
        to: CellStatus,
    },
}

/// Move the context's cell to `target`, one step at a time.
///
/// `after_step` is called once each step's notification has been delivered.
/// An attach failure stops the advance at the last completed step; detach
/// failures are logged and the retreat carries on, returning the first
/// failure at the end. Reaching `Disk` by retreat releases the cell.
pub fn set_status(
    ctx: &CellContext,
    target: CellStatus,
    sink: &dyn CellEventSink,
    after_step: &mut dyn FnMut(StatusStep),
) -> Result<StatusChange> {
    let cell = ctx.cell().clone();
    let _span = debug_span!("cell_status", cell = %cell.id(), target = %target).entered();
    let _transition = cell.lock_transition();

    let from = cell.status();
    if from == target {
        return Ok(StatusChange::Unchanged);
    }
    if target > from && cell.is_released() {
        return Err(CellError::Released(cell.id()));
    }

    let mut deferred: Option<CellError> = None;
    for step in from.path_to(target) {
        let components = cell.components();
        if step.is_advance() {
            for component in &components {
                component.attach(ctx, step)?;
            }
        } else {
            for component in &components {
                if let Err(e) = component.detach(ctx, step) {
                    warn!(cell = %cell.id(), kind = component.kind(), step = %step, error = %e, "Detach hook failed");
                    deferred.get_or_insert(e);
                }
            }
        }

        cell.set_status_field(step.to);
        debug!(cell = %cell.id(), step = %step, "Status step");

        sink.on_event(&CellEvent::StatusChanged {
            cell: cell.id(),
            from: step.from,
            to: step.to,
        });
        cell.notify_status_listeners(step);
        cell.settle(step.to);

        if step.to == CellStatus::Disk {
            cell.release();
        }
        after_step(step);
    }

    match deferred {
        Some(e) => Err(e),
        None => Ok(StatusChange::Changed { from, to: target }),
    }
}

/// Attach a component, bringing it up to the cell's current status
pub fn add_component(ctx: &CellContext, component: Arc<dyn CellComponent>) -> Result<()> {
    let cell = ctx.cell();
    let _transition = cell.lock_transition();
    if cell.is_released() {
        return Err(CellError::Released(cell.id()));
    }
    cell.insert_component(component.clone())?;

    for step in CellStatus::Disk.path_to(cell.status()) {
        if let Err(e) = component.attach(ctx, step) {
            cell.take_component(component.kind());
            return Err(e);
        }
    }
    Ok(())
}

/// Detach a component, taking it back down to `Disk`
pub fn remove_component(ctx: &CellContext, kind: &str) -> Result<Option<Arc<dyn CellComponent>>> {
    let cell = ctx.cell();
    let _transition = cell.lock_transition();
    let Some(component) = cell.take_component(kind) else {
        return Ok(None);
    };

    let mut first: Option<CellError> = None;
    for step in cell.status().path_to(CellStatus::Disk) {
        if let Err(e) = component.detach(ctx, step) {
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(Some(component)),
    }
}

/// Store a new configuration payload and hand it to every component
pub fn configure(ctx: &CellContext, payload: ConfigPayload) -> Result<()> {
    let cell = ctx.cell();
    let _transition = cell.lock_transition();
    cell.set_payload(payload.clone());

    let mut first: Option<CellError> = None;
    for component in cell.components() {
        if let Err(e) = component.configure(ctx, &payload) {
            warn!(cell = %cell.id(), kind = component.kind(), error = %e, "Configure failed");
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
