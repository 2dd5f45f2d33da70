//! Host application context and the registry's non-owning handle to it
//!
//! The host owns its [`AppContext`] (an `Arc`); the registry only keeps a
//! [`ContextHandle`], which may stop resolving once the host drops its context
//! or once the registry is shut down. Every consumer handles the absent case.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// First platform API level with BLE peripheral advertising in a background service
pub const MIN_BACKGROUND_API_LEVEL: u32 = 21;

/// Long-lived application context provided by the host
#[derive(Debug, Clone)]
pub struct AppContext {
    package: String,
    data_dir: PathBuf,
    api_level: u32,
    min_background_api_level: u32,
}

impl AppContext {
    pub fn new(package: impl Into<String>, data_dir: impl Into<PathBuf>, api_level: u32) -> Self {
        Self {
            package: package.into(),
            data_dir: data_dir.into(),
            api_level,
            min_background_api_level: MIN_BACKGROUND_API_LEVEL,
        }
    }

    /// Override the capability gate threshold
    pub fn with_min_background_api_level(mut self, level: u32) -> Self {
        self.min_background_api_level = level;
        self
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn api_level(&self) -> u32 {
        self.api_level
    }

    /// Whether the platform can host the background advertising service
    pub fn supports_background_services(&self) -> bool {
        self.api_level >= self.min_background_api_level
    }

    fn legacy_preferences_path(&self, name: &str) -> PathBuf {
        self.data_dir
            .join("shared_prefs")
            .join(format!("{}.json", name))
    }

    /// Delete the obsolete preference file left by older releases.
    ///
    /// Returns whether a file was removed. Never fails: anything other than
    /// "not found" is logged and ignored.
    pub fn purge_legacy_preferences(&self, name: &str) -> bool {
        let path = self.legacy_preferences_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!("Removed legacy preferences at {}", path.display());
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                tracing::warn!(
                    "Could not remove legacy preferences at {}: {}",
                    path.display(),
                    e
                );
                false
            }
        }
    }
}

/// Weak, clearable reference to the host context
#[derive(Debug, Default, Clone)]
pub struct ContextHandle {
    inner: Option<Weak<AppContext>>,
}

impl ContextHandle {
    pub fn new(context: &Arc<AppContext>) -> Self {
        Self {
            inner: Some(Arc::downgrade(context)),
        }
    }

    /// Point at a (possibly different) context
    pub fn replace(&mut self, context: &Arc<AppContext>) {
        self.inner = Some(Arc::downgrade(context));
    }

    pub fn clear(&mut self) {
        self.inner = None;
    }

    /// The context, if the handle was not cleared and the host still holds it
    pub fn get(&self) -> Option<Arc<AppContext>> {
        self.inner.as_ref().and_then(Weak::upgrade)
    }
}
