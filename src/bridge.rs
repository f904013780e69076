//! Error bridge between engine failure signals and structured errors.
//!
//! Each loaded module registers one error callback with the engine. The
//! callback only receives a message, so the bridge scopes an in-flight
//! session token around every native call (activation and call are serialized
//! process-wide, see [`crate::session::ActiveSession`]) and routes messages
//! back to the caller that triggered them instead of through ambient state.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::capability::{CapabilityTable, SessionId};
use crate::error::BridgeError;

/// Per-module router for engine error reports.
#[derive(Debug, Default)]
pub struct ErrorBridge {
    /// Token of the call currently executing under the engine call lock
    current: Mutex<Option<SessionId>>,
    /// Most recent callback message per session token
    messages: Mutex<HashMap<SessionId, String>>,
}

impl ErrorBridge {
    /// Create an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope the in-flight token. Called by the activation guard with the
    /// call lock held.
    pub(crate) fn begin(&self, token: SessionId) {
        *self.current.lock() = Some(token);
    }

    /// Clear the in-flight token when the activation guard is dropped.
    pub(crate) fn end(&self) {
        *self.current.lock() = None;
    }

    /// Record a callback message against the in-flight token. Messages that
    /// arrive outside any native call have no caller to route to and are
    /// logged instead.
    pub fn report(&self, message: &str) {
        match *self.current.lock() {
            Some(token) => {
                self.messages.lock().insert(token, message.to_string());
            }
            None => {
                tracing::warn!(message, "engine error reported outside any call");
            }
        }
    }

    /// Take the recorded message for a token, if any.
    pub(crate) fn take(&self, token: SessionId) -> Option<String> {
        self.messages.lock().remove(&token)
    }

    /// Build the error for a failed call: prefer the message the callback
    /// routed to this token, fall back to the engine's last-error entry point.
    pub(crate) fn failure(&self, table: &dyn CapabilityTable, token: SessionId) -> BridgeError {
        let message = self.take(token).unwrap_or_else(|| table.last_error());
        BridgeError::Engine(message)
    }
}
