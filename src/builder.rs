//! CellCacheBuilder for configuring and constructing cell caches
//!
//! ## Table of Contents
//! - **CellCacheBuilder**: Builder pattern for the cache and its collaborators

use crate::cache::CellCache;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::events::{BoxedEventSink, EventHub};
use crate::factory::{CellConstructor, CellFactory};
use crate::metrics::CacheMetrics;
use crate::protocol::{NullUpstream, UpstreamSink};
use crate::resolver::{FetchContext, ResourceResolver, StreamOpener};
use crate::scheduler::StatusScheduler;
use crate::tree::CellTree;
use std::io::{self, Read};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// Opener used when none is configured; every fetch fails
struct MissingOpener;

impl StreamOpener for MissingOpener {
    fn open(&self, _ctx: &FetchContext, url: &str) -> io::Result<Box<dyn Read + Send>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("no stream opener configured for {}", url),
        ))
    }
}

/// Builder for constructing cell caches
pub struct CellCacheBuilder {
    config: CacheConfig,
    factory: CellFactory,
    opener: Option<Arc<dyn StreamOpener>>,
    sinks: Vec<BoxedEventSink>,
    upstream: Option<Arc<dyn UpstreamSink>>,
    runtime: Option<Handle>,
}

impl CellCacheBuilder {
    /// Create a new CellCacheBuilder with default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            factory: CellFactory::new(),
            opener: None,
            sinks: Vec::new(),
            upstream: None,
            runtime: None,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a prepared factory registry
    pub fn with_factory(mut self, factory: CellFactory) -> Self {
        self.factory = factory;
        self
    }

    /// Register one cell type
    pub fn register(mut self, type_name: impl Into<String>, constructor: CellConstructor) -> Self {
        self.factory = self.factory.register(type_name, constructor);
        self
    }

    /// Set the opener used to fetch declared resources
    pub fn with_stream_opener(mut self, opener: Arc<dyn StreamOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Add a synchronous event sink
    pub fn with_event_sink(mut self, sink: BoxedEventSink) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Set the channel for messages back to the server
    pub fn with_upstream(mut self, upstream: Arc<dyn UpstreamSink>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Run downloads on an existing tokio runtime instead of a private one
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Set lifecycle worker threads
    pub fn with_lifecycle_threads(mut self, threads: usize) -> Self {
        self.config.lifecycle_threads = threads;
        self
    }

    /// Enable or disable metrics
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.config.metrics_enabled = enabled;
        self
    }

    /// Build the cache
    pub fn build(self) -> Result<CellCache> {
        self.config.validate()?;
        info!(
            lifecycle_threads = self.config.effective_lifecycle_threads(),
            max_download_threads = self.config.max_download_threads,
            load_status = %self.config.load_status,
            types = self.factory.type_names().len(),
            "Building cell cache"
        );

        // Create metrics
        let metrics = if self.config.metrics_enabled {
            Some(Arc::new(CacheMetrics::new()?))
        } else {
            None
        };

        let events = Arc::new(EventHub::default());
        for sink in self.sinks {
            events.add_sink(sink);
        }

        let tree = Arc::new(CellTree::new());
        let scheduler = StatusScheduler::new(
            tree.clone(),
            events.clone(),
            self.config.lifecycle_threads,
            metrics.clone(),
        )?;

        // Downloads run on the blocking pool of a runtime we own unless one was provided
        let (handle, runtime) = match self.runtime {
            Some(handle) => (handle, None),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(self.config.max_download_threads)
                    .thread_name("cell-download")
                    .enable_all()
                    .build()?;
                (runtime.handle().clone(), Some(runtime))
            }
        };

        let opener = self.opener.unwrap_or_else(|| Arc::new(MissingOpener));
        let resolver = ResourceResolver::new(opener, handle, scheduler.clone(), metrics.clone());
        let upstream = self.upstream.unwrap_or_else(|| Arc::new(NullUpstream));

        Ok(CellCache::new(
            self.config,
            tree,
            scheduler,
            resolver,
            self.factory,
            events,
            upstream,
            metrics,
            runtime,
        ))
    }
}

impl Default for CellCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
