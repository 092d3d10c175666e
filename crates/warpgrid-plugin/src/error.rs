//! Plugin loader error types.

use std::path::PathBuf;

use thiserror::Error;
use warpgrid_gather::GatherError;

/// Result type alias for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur while loading plugins or resolving their symbols.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The module is missing, malformed, or does not satisfy the plugin ABI.
    #[error("failed to load plugin {}: {reason}", .path.display())]
    Load { path: PathBuf, reason: String },

    #[error("symbol `{symbol}` not found in plugin {}", .path.display())]
    SymbolNotFound { path: PathBuf, symbol: String },

    /// The export exists but does not have the requested shape.
    #[error("symbol `{symbol}` has the wrong type: {reason}")]
    SymbolType { symbol: String, reason: String },

    /// A call into the module trapped.
    #[error("call to `{symbol}` failed: {reason}")]
    Trap { symbol: String, reason: String },

    /// A gatherer declared by the module could not be registered.
    #[error("plugin {} could not register its gatherers: {source}", .path.display())]
    Register {
        path: PathBuf,
        #[source]
        source: GatherError,
    },

    #[error("wasm engine error: {0}")]
    Engine(String),
}

impl PluginError {
    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::Load {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
