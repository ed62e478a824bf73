//! # Eustress Cells
//!
//! Client-side mirror of a server-authoritative scene graph. Every cell moves
//! through an ordered lifecycle (`Disk < Bounded < Inactive < Active < Visible`)
//! off the calling thread, never rising above its parent or falling below its
//! children, while world transforms and bounds follow local changes down the
//! hierarchy.
//!
//! ## Features
//!
//! - **Lifecycle scheduling**: Non-blocking status requests on a bounded pool
//! - **Resource preloading**: Recursive resource discovery gating increases
//! - **Transform propagation**: World transforms and bounds kept in sync
//! - **Events**: Synchronous sinks and broadcast subscriptions
//! - **Metrics**: Prometheus-compatible metrics export
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eustress_cells::prelude::*;
//!
//! fn main() -> eustress_cells::Result<()> {
//!     eustress_cells::telemetry::init_logging("info")?;
//!
//!     let cache = CellCacheBuilder::new()
//!         .with_stream_opener(std::sync::Arc::new(FileStreamOpener::new("asset-cache")))
//!         .build()?;
//!
//!     cache.handle(CellMessage::Create {
//!         cell_id: CellId::new(1),
//!         type_name: "group".to_string(),
//!         local_bounds: None,
//!         parent_id: None,
//!         local_transform: None,
//!         payload: serde_json::Value::Null,
//!         name: Some("world".to_string()),
//!     })?;
//!     cache.handle(CellMessage::ViewReady)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod builder;
pub mod cache;
pub mod cell;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod factory;
pub mod lifecycle;
pub mod metrics;
pub mod propagate;
pub mod protocol;
pub mod resolver;
pub mod scheduler;
pub mod telemetry;
pub mod transform;
pub mod tree;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for ergonomic API
pub use builder::CellCacheBuilder;
pub use cache::{CellCache, NewCell};
pub use cell::{Cell, CellComponent, ConfigPayload, RendererBinding, ResourceState};
pub use config::CacheConfig;
pub use context::CellContext;
pub use error::{CellError, Result};
pub use events::{BoxedEventSink, CellEvent, CellEventSink, EventHub, EventStream, NullSink};
pub use factory::{CellBlueprint, CellConstructor, CellFactory};
pub use lifecycle::StatusChange;
pub use metrics::CacheMetrics;
pub use propagate::TransformUpdate;
pub use protocol::{CellMessage, NullUpstream, UpstreamMessage, UpstreamSink};
pub use resolver::{FetchContext, FileStreamOpener, ResourceResolver, StreamOpener};
pub use scheduler::{PendingRequest, RequestOutcome, StatusScheduler};
pub use transform::{CellBounds, CellTransform};
pub use tree::CellTree;
pub use types::{CellId, CellStatus, ChangeSource, StatusStep};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builder::CellCacheBuilder;
    pub use crate::cache::{CellCache, NewCell};
    pub use crate::cell::{CellComponent, ConfigPayload};
    pub use crate::config::CacheConfig;
    pub use crate::context::CellContext;
    pub use crate::error::Result;
    pub use crate::events::{CellEvent, CellEventSink};
    pub use crate::factory::CellBlueprint;
    pub use crate::protocol::CellMessage;
    pub use crate::resolver::{FileStreamOpener, StreamOpener};
    pub use crate::types::{CellId, CellStatus, ChangeSource, StatusStep};
}
