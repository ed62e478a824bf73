//! # Cache Configuration
//!
//! Thread pool sizes and loading policy for the cell cache.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CellError, Result};
use crate::types::CellStatus;

// ============================================================================
// Main Config
// ============================================================================

/// Cell cache configuration.
///
/// Every field has a default, so a TOML document only needs the keys it
/// changes:
///
/// ```toml
/// lifecycle_threads = 4
/// load_status = "active"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifecycle worker threads, 0 for one per available core
    pub lifecycle_threads: usize,

    /// Upper bound on concurrent resource downloads
    pub max_download_threads: usize,

    /// Status requested for every cell once the view is ready
    pub load_status: CellStatus,

    /// Request `load_status` for new cells even before the view is ready
    pub activate_on_create: bool,

    /// Collect Prometheus metrics
    pub metrics_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lifecycle_threads: 0,
            max_download_threads: 64,
            load_status: CellStatus::Visible,
            activate_on_create: false,
            metrics_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Create default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check values that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.max_download_threads == 0 {
            return Err(CellError::config("max_download_threads must be at least 1"));
        }
        if self.load_status == CellStatus::Disk {
            return Err(CellError::config("load_status must be above disk"));
        }
        Ok(())
    }

    /// Lifecycle worker count with 0 resolved to the core count
    pub fn effective_lifecycle_threads(&self) -> usize {
        if self.lifecycle_threads > 0 {
            return self.lifecycle_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Set lifecycle worker threads
    pub fn lifecycle_threads(mut self, threads: usize) -> Self {
        self.lifecycle_threads = threads;
        self
    }

    /// Set the download thread limit
    pub fn max_download_threads(mut self, threads: usize) -> Self {
        self.max_download_threads = threads;
        self
    }

    /// Set the status cells are driven to
    pub fn load_status(mut self, status: CellStatus) -> Self {
        self.load_status = status;
        self
    }

    /// Request the load status on create
    pub fn activate_on_create(mut self, enabled: bool) -> Self {
        self.activate_on_create = enabled;
        self
    }

    /// Enable or disable metrics
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.load_status, CellStatus::Visible);
        assert!(!config.activate_on_create);
        assert!(config.effective_lifecycle_threads() >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = CacheConfig::from_toml_str(
            r#"
            lifecycle_threads = 2
            load_status = "active"
            "#,
        )
        .unwrap();
        assert_eq!(config.lifecycle_threads, 2);
        assert_eq!(config.effective_lifecycle_threads(), 2);
        assert_eq!(config.load_status, CellStatus::Active);
        assert_eq!(config.max_download_threads, 64);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            CacheConfig::from_toml_str("load_status = \"disk\""),
            Err(CellError::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_toml_str("lifecycle_threads = \"many\""),
            Err(CellError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.toml");
        std::fs::write(&path, "activate_on_create = true\n").unwrap();
        let config = CacheConfig::from_file(&path).unwrap();
        assert!(config.activate_on_create);
    }

    #[test]
    fn test_builder_setters() {
        let config = CacheConfig::new()
            .lifecycle_threads(3)
            .max_download_threads(8)
            .load_status(CellStatus::Inactive)
            .activate_on_create(true)
            .metrics_enabled(false);
        assert_eq!(config.lifecycle_threads, 3);
        assert_eq!(config.max_download_threads, 8);
        assert!(!config.metrics_enabled);
    }
}
