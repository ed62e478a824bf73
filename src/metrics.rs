//! Metrics and monitoring for the cell cache
//!
//! ## Table of Contents
//! - **CacheMetrics**: Prometheus counters and gauges on a private registry
//! - **Timer**: Wall-clock timer feeding the histograms

use crate::error::{CellError, Result};
use crate::types::StatusStep;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};

/// Core metrics for the cell cache
pub struct CacheMetrics {
    registry: Registry,

    // Cell metrics
    /// Cells created and inserted into the tree
    pub cells_loaded: Counter,
    /// Cells torn down after removal
    pub cells_unloaded: Counter,
    /// Failed creates, by reason
    pub load_failures: CounterVec,
    /// Time spent creating a cell
    pub load_time: Histogram,

    // Scheduler metrics
    /// Single-ordinal status steps, by direction
    pub status_steps: CounterVec,
    /// Transitions that returned an error or panicked
    pub transition_failures: Counter,
    /// Requests waiting for eligibility
    pub pending_requests: Gauge,
    /// Transitions running on the lifecycle pool
    pub transitions_in_flight: Gauge,

    // Resource metrics
    /// Resource fetches, by outcome
    pub resource_fetches: CounterVec,
}

impl CacheMetrics {
    /// Create a new metrics instance
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        // Cell metrics
        let cells_loaded = Counter::new("cells_loaded_total", "Total cells created")?;
        let cells_unloaded = Counter::new("cells_unloaded_total", "Total cells removed")?;
        let load_failures = CounterVec::new(
            Opts::new("cells_load_failures_total", "Total failed cell creations"),
            &["reason"],
        )?;
        let load_time = Histogram::with_opts(
            HistogramOpts::new("cells_load_seconds", "Time spent creating a cell")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        // Scheduler metrics
        let status_steps = CounterVec::new(
            Opts::new("cells_status_steps_total", "Lifecycle steps taken"),
            &["direction"],
        )?;
        let transition_failures = Counter::new(
            "cells_transition_failures_total",
            "Transitions that ended in an error or panic",
        )?;
        let pending_requests = Gauge::new("cells_pending_requests", "Requests waiting for eligibility")?;
        let transitions_in_flight =
            Gauge::new("cells_transitions_in_flight", "Transitions running on the lifecycle pool")?;

        // Resource metrics
        let resource_fetches = CounterVec::new(
            Opts::new("cells_resource_fetches_total", "Resource streams opened"),
            &["outcome"],
        )?;

        registry.register(Box::new(cells_loaded.clone()))?;
        registry.register(Box::new(cells_unloaded.clone()))?;
        registry.register(Box::new(load_failures.clone()))?;
        registry.register(Box::new(load_time.clone()))?;
        registry.register(Box::new(status_steps.clone()))?;
        registry.register(Box::new(transition_failures.clone()))?;
        registry.register(Box::new(pending_requests.clone()))?;
        registry.register(Box::new(transitions_in_flight.clone()))?;
        registry.register(Box::new(resource_fetches.clone()))?;

        Ok(Self {
            registry,
            cells_loaded,
            cells_unloaded,
            load_failures,
            load_time,
            status_steps,
            transition_failures,
            pending_requests,
            transitions_in_flight,
            resource_fetches,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a created cell
    pub fn record_loaded(&self) {
        self.cells_loaded.inc();
    }

    /// Record a removed cell
    pub fn record_unloaded(&self) {
        self.cells_unloaded.inc();
    }

    /// Record a rejected creation
    pub fn record_load_failure(&self, reason: &str) {
        self.load_failures.with_label_values(&[reason]).inc();
    }

    /// Record one lifecycle step
    pub fn record_step(&self, step: StatusStep) {
        let direction = if step.is_advance() { "up" } else { "down" };
        self.status_steps.with_label_values(&[direction]).inc();
    }

    /// Record a transition that failed or panicked
    pub fn record_transition_failure(&self) {
        self.transition_failures.inc();
    }

    /// Update scheduler occupancy
    pub fn set_scheduler_load(&self, pending: usize, in_flight: usize) {
        self.pending_requests.set(pending as f64);
        self.transitions_in_flight.set(in_flight as f64);
    }

    /// Record a resource fetch
    pub fn record_fetch(&self, success: bool) {
        let outcome = if success { "success" } else { "failed" };
        self.resource_fetches.with_label_values(&[outcome]).inc();
    }

    /// Gather all metrics as text
    pub fn gather_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| CellError::Metrics(format!("Encode error: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| CellError::Metrics(format!("UTF8 error: {}", e)))
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("cells_loaded", &self.cells_loaded.get())
            .field("pending_requests", &self.pending_requests.get())
            .finish()
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: std::time::Instant,
}

impl Timer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Stop and return elapsed seconds
    pub fn stop(self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
