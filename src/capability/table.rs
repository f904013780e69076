//! The per-module capability table.
//!
//! A loaded engine module exposes a fixed set of lifecycle entry points plus
//! an open-ended family of domain entry points. The bridge core only knows
//! the lifecycle subset; everything else goes through [`CapabilityTable::invoke`]
//! with an explicit signature and is interpreted by higher-level collaborators.

use std::sync::Arc;

use crate::bridge::ErrorBridge;
use crate::error::Result;
use super::types::{EngineValue, Handle, SessionId, Signature};

/// Entry point allocating a fresh session id.
pub const ENTRY_ALLOC_SESSION: &str = "engineAllocSessionId";
/// Entry point releasing a session id and all its handles.
pub const ENTRY_RELEASE_SESSION: &str = "engineReleaseSessionId";
/// Entry point selecting the session subsequent calls apply to.
pub const ENTRY_SET_SESSION: &str = "engineSetSessionId";
/// Entry point freeing a single handle.
pub const ENTRY_FREE: &str = "engineFree";
/// Entry point returning the last error text for the active session.
pub const ENTRY_LAST_ERROR: &str = "engineGetLastError";
/// Entry point registering the error callback with a context token.
pub const ENTRY_SET_ERROR_HANDLER: &str = "engineSetErrorHandler";

/// The capability table of one loaded engine module.
///
/// The engine keeps one global "current session" slot, so callers must treat
/// activation and the subsequent call as one atomic unit; the session layer
/// enforces this with a process-wide call lock. Implementations only perform
/// the raw calls.
pub trait CapabilityTable: Send + Sync {
    /// Allocate a new session id.
    fn alloc_session(&self) -> Result<SessionId>;

    /// Release a session id. Best effort; the engine discards all state the
    /// session owned, including its handles.
    fn release_session(&self, sid: SessionId);

    /// Make `sid` the engine's current session.
    fn activate_session(&self, sid: SessionId);

    /// Free one handle in the current session. Returns the raw engine code;
    /// negative means failure.
    fn free_handle(&self, handle: Handle) -> i64;

    /// Last error text for the current session.
    fn last_error(&self) -> String;

    /// Register the module's error callback, routing messages through the
    /// given bridge. Called exactly once per loaded module, at load time.
    fn install_error_handler(&self, bridge: Arc<ErrorBridge>);

    /// Call an arbitrary entry point. Marshaling-level problems (unknown
    /// symbol, arity mismatch) are errors; engine-level failures are encoded
    /// in the returned value (negative integer, or [`EngineValue::Unit`] in
    /// place of a string) and checked by the caller through the bridge.
    fn invoke(&self, sig: &Signature, args: &[EngineValue]) -> Result<EngineValue>;
}
