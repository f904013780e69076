//! Error types for the engine bridge.

use thiserror::Error;

/// Errors surfaced by the handle/session lifecycle layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Native module could not be resolved, extracted or loaded.
    #[error("failed to load native module '{component}': {reason}")]
    LoadFailure { component: String, reason: String },

    /// Operation attempted on a disposed session.
    #[error("session is disposed")]
    SessionClosed,

    /// Operation attempted on a released proxy.
    #[error("native handle has been released")]
    HandleReleased,

    /// The engine reported a failure for the current session.
    #[error("engine error: {0}")]
    Engine(String),

    /// Entry point not present in the loaded module.
    #[error("entry point not found: {0}")]
    SymbolNotFound(String),

    /// Argument list does not match the entry point signature.
    #[error("invalid argument count: expected {expected}, got {got}")]
    InvalidArgCount { expected: usize, got: usize },

    /// More arguments than the dispatch layer supports.
    #[error("too many arguments: {0} (max 6)")]
    TooManyArgs(usize),

    /// Value cannot be marshaled across the engine ABI.
    #[error("cannot marshal value: {0}")]
    Marshal(String),

    /// Filesystem failure during resource materialization.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Wrap any failure as a load failure for the given component.
    pub(crate) fn load_failure(component: &str, reason: impl ToString) -> Self {
        BridgeError::LoadFailure {
            component: component.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
