//! Recursive resolution of a cell's declared resources
//!
//! Every declared URL is opened through the injected [`StreamOpener`] on the
//! download runtime's blocking pool. An opener may report further URLs it
//! finds while reading through [`FetchContext::discover`]; those are fetched
//! the same way. A cell's resources are ready once every URL reached this
//! way has been read, each URL at most once per pass.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, debug_span, error, info};

use crate::cell::{Cell, ResourceState};
use crate::error::{CellError, Result};
use crate::metrics::CacheMetrics;
use crate::scheduler::StatusScheduler;
use crate::types::CellId;

/// Opens a byte stream for a resource URL
pub trait StreamOpener: Send + Sync {
    /// Open `url`. References found in the resource are reported through
    /// `ctx.discover`, either here or while the returned stream is read.
    fn open(&self, ctx: &FetchContext, url: &str) -> io::Result<Box<dyn Read + Send>>;
}

/// What a stream-open callback is running for
#[derive(Clone)]
pub struct FetchContext {
    url: String,
    pass: Arc<Pass>,
}

impl FetchContext {
    /// Cell whose resources are being resolved
    pub fn cell(&self) -> CellId {
        self.pass.cell.id()
    }

    /// URL being fetched
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Report a URL referenced by the current resource. Returns `false` when
    /// the URL was already part of this pass.
    pub fn discover(&self, url: &str) -> bool {
        Pass::discover(&self.pass, url)
    }
}

/// Fold a guarded fetch into a resource error naming the URL
fn fetch_result(url: &str, outcome: std::thread::Result<io::Result<u64>>) -> Result<u64> {
    match outcome {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(e)) => Err(CellError::resource(url, e.to_string())),
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(CellError::resource(url, format!("opener panicked: {}", reason)))
        }
    }
}

impl std::fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchContext")
            .field("cell", &self.cell())
            .field("url", &self.url)
            .finish()
    }
}

/// One resolution of one cell
struct Pass {
    cell: Arc<Cell>,
    resolver: Arc<Inner>,
    seen: Mutex<HashSet<String>>,
    outstanding: AtomicUsize,
    failed: AtomicBool,
}

impl Pass {
    fn discover(pass: &Arc<Pass>, url: &str) -> bool {
        if !pass.seen.lock().insert(url.to_string()) {
            return false;
        }
        pass.outstanding.fetch_add(1, Ordering::SeqCst);
        debug!(cell = %pass.cell.id(), url, "Resource queued");

        let task = pass.clone();
        let url = url.to_string();
        let _detached = pass
            .resolver
            .handle
            .spawn_blocking(move || Pass::fetch(task, url));
        true
    }

    fn fetch(pass: Arc<Pass>, url: String) {
        let cell = pass.cell.id();
        let _span = debug_span!("cell_fetch", cell = %cell, url = %url).entered();
        let ctx = FetchContext {
            url: url.clone(),
            pass: pass.clone(),
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> io::Result<u64> {
            let mut stream = pass.resolver.opener.open(&ctx, &url)?;
            io::copy(&mut stream, &mut io::sink())
        }));
        drop(ctx);

        match fetch_result(&url, outcome) {
            Ok(bytes) => {
                debug!(cell = %cell, url = %url, bytes, "Resource fetched");
                pass.resolver.record_fetch(true);
                pass.complete_one();
            }
            Err(e) => {
                error!(cell = %cell, error = %e, "Resource fetch failed");
                pass.resolver.record_fetch(false);
                pass.fail();
            }
        }
    }

    fn complete_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) != 1 || self.failed.load(Ordering::SeqCst) {
            return;
        }
        let urls = self.seen.lock().len();
        info!(cell = %self.cell.id(), urls, "Resources ready");
        self.cell.set_resource_state(ResourceState::Ready);
        self.resolver.scheduler.on_resources_ready(self.cell.id());
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.cell.set_resource_state(ResourceState::Failed);
    }
}

struct Inner {
    opener: Arc<dyn StreamOpener>,
    handle: Handle,
    scheduler: StatusScheduler,
    metrics: Option<Arc<CacheMetrics>>,
}

impl Inner {
    fn record_fetch(&self, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fetch(success);
        }
    }
}

/// Resolves declared resources on the download pool and reports completion
/// to the scheduler
#[derive(Clone)]
pub struct ResourceResolver {
    inner: Arc<Inner>,
}

impl ResourceResolver {
    /// Create a resolver running fetches on `handle`'s blocking pool
    pub fn new(
        opener: Arc<dyn StreamOpener>,
        handle: Handle,
        scheduler: StatusScheduler,
        metrics: Option<Arc<CacheMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                opener,
                handle,
                scheduler,
                metrics,
            }),
        }
    }

    /// Start resolving the cell's declared resources. Does nothing for a
    /// cell that declares none.
    pub fn resolve(&self, cell: &Arc<Cell>) {
        let roots = cell.declared_resources();
        if roots.is_empty() {
            return;
        }
        cell.set_resource_state(ResourceState::Resolving);

        let pass = Arc::new(Pass {
            cell: cell.clone(),
            resolver: self.inner.clone(),
            seen: Mutex::new(HashSet::new()),
            // Held until every root is queued
            outstanding: AtomicUsize::new(1),
            failed: AtomicBool::new(false),
        });
        for url in roots {
            Pass::discover(&pass, url);
        }
        pass.complete_one();
    }
}

impl std::fmt::Debug for ResourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceResolver").finish_non_exhaustive()
    }
}

/// Opens `scheme://host/path` URLs as files under `root/host/path`
#[derive(Debug, Clone)]
pub struct FileStreamOpener {
    root: PathBuf,
}

impl FileStreamOpener {
    /// Create opener rooted at a local cache directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File backing `url`
    pub fn path_for(&self, url: &str) -> io::Result<PathBuf> {
        let rest = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("not a URL: {}", url)))?;
        let relative = Path::new(rest);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("URL escapes the cache root: {}", url),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl StreamOpener for FileStreamOpener {
    fn open(&self, _ctx: &FetchContext, url: &str) -> io::Result<Box<dyn Read + Send>> {
        let path = self.path_for(url)?;
        Ok(Box::new(File::open(path)?))
    }
}
