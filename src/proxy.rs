//! Managed wrappers around engine handles.
//!
//! A [`ManagedProxy`] owns one integer handle inside one session. Handles can
//! reference into each other inside the engine (an atom into its molecule),
//! so a proxy derived from another holds an `Arc` to it: the referenced
//! engine state cannot be freed while anything derived from it is reachable.
//! Shared ownership is the whole mechanism; there is no registration step to
//! forget.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capability::{EngineValue, Handle, RELEASED_HANDLE};
use crate::error::{BridgeError, Result};
use crate::session::SessionContext;

/// Entry point advancing an engine-side iterator handle; returns the next
/// element's handle, or zero when exhausted.
const ENTRY_NEXT: &str = "engineNext";

/// One engine handle, bound to the session that owns it.
pub struct ManagedProxy {
    /// Raw handle; [`RELEASED_HANDLE`] once released.
    handle: Mutex<Handle>,
    session: Arc<SessionContext>,
    /// Keep-alive for the proxy this one was derived from.
    parent: Option<Arc<ManagedProxy>>,
}

impl ManagedProxy {
    /// Wrap a handle the caller already obtained from the engine.
    pub fn adopt(session: Arc<SessionContext>, handle: Handle) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(handle),
            session,
            parent: None,
        })
    }

    /// Call a handle-producing entry point and wrap the result.
    pub fn create(
        session: &Arc<SessionContext>,
        entry: &str,
        args: &[EngineValue],
    ) -> Result<Arc<Self>> {
        let raw = session.enter()?.call_int(entry, args)?;
        Ok(Self::adopt(session.clone(), handle_from_raw(raw)?))
    }

    /// Current raw handle; [`RELEASED_HANDLE`] after release.
    pub fn handle(&self) -> Handle {
        *self.handle.lock()
    }

    /// Whether this proxy has been released.
    pub fn is_released(&self) -> bool {
        self.handle() == RELEASED_HANDLE
    }

    /// The session this handle belongs to.
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// The proxy this one keeps alive, if it was derived.
    pub fn parent(&self) -> Option<&Arc<ManagedProxy>> {
        self.parent.as_ref()
    }

    fn live_handle(&self) -> Result<Handle> {
        let handle = self.handle();
        if handle == RELEASED_HANDLE {
            return Err(BridgeError::HandleReleased);
        }
        Ok(handle)
    }

    fn with_receiver(&self, args: &[EngineValue]) -> Result<Vec<EngineValue>> {
        let handle = self.live_handle()?;
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(EngineValue::Int(handle as i64));
        full.extend_from_slice(args);
        Ok(full)
    }

    /// Call an integer-returning entry point with this handle as receiver.
    pub fn call_int(&self, entry: &str, args: &[EngineValue]) -> Result<i64> {
        let full = self.with_receiver(args)?;
        self.session.enter()?.call_int(entry, &full)
    }

    /// Call a float-returning entry point with this handle as receiver.
    pub fn call_float(&self, entry: &str, args: &[EngineValue]) -> Result<f64> {
        let full = self.with_receiver(args)?;
        self.session.enter()?.call_float(entry, &full)
    }

    /// Call a string-returning entry point with this handle as receiver.
    pub fn call_str(&self, entry: &str, args: &[EngineValue]) -> Result<String> {
        let full = self.with_receiver(args)?;
        self.session.enter()?.call_str(entry, &full)
    }

    /// Call a status-only entry point with this handle as receiver.
    pub fn call_unit(&self, entry: &str, args: &[EngineValue]) -> Result<()> {
        let full = self.with_receiver(args)?;
        self.session.enter()?.call_unit(entry, &full)
    }

    /// Call a handle-producing entry point and wrap the result as a child
    /// that keeps this proxy alive. A zero result means the engine had
    /// nothing to return (no such atom, no match) and maps to `None`.
    pub fn derive(
        self: &Arc<Self>,
        entry: &str,
        args: &[EngineValue],
    ) -> Result<Option<Arc<Self>>> {
        let raw = self.call_int(entry, args)?;
        if raw == 0 {
            return Ok(None);
        }
        Ok(Some(Arc::new(Self {
            handle: Mutex::new(handle_from_raw(raw)?),
            session: self.session.clone(),
            parent: Some(self.clone()),
        })))
    }

    /// Iterate the engine-side collection behind this handle. Each yielded
    /// proxy keeps the receiver alive.
    pub fn iter(self: &Arc<Self>) -> ProxyIter {
        self.iter_entry(ENTRY_NEXT)
    }

    /// Iterate through a custom advancing entry point.
    pub fn iter_entry(self: &Arc<Self>, entry: impl Into<String>) -> ProxyIter {
        ProxyIter {
            receiver: self.clone(),
            entry: entry.into(),
            done: false,
        }
    }

    /// Free the handle. Idempotent; the native free is skipped when the
    /// owning session is already disposed (the engine dropped the handle with
    /// the session). The proxy transitions to released even when the native
    /// free fails, but that failure is surfaced to the caller.
    pub fn release(&self) -> Result<()> {
        let handle = {
            let mut slot = self.handle.lock();
            std::mem::replace(&mut *slot, RELEASED_HANDLE)
        };
        if handle == RELEASED_HANDLE {
            return Ok(());
        }
        match self.session.enter() {
            Ok(guard) => guard.free_handle(handle),
            Err(_) => {
                tracing::debug!(handle, "handle release skipped, session closed");
                Ok(())
            }
        }
    }
}

/// Engine handles are 32-bit; a wider result is a protocol violation, not a
/// value to wrap around.
fn handle_from_raw(raw: i64) -> Result<Handle> {
    Handle::try_from(raw)
        .map_err(|_| BridgeError::Marshal(format!("handle {raw} exceeds the engine handle range")))
}

impl fmt::Debug for ManagedProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProxy")
            .field("handle", &self.handle())
            .field("sid", &self.session.id())
            .field("derived", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for ManagedProxy {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "native free failed during drop");
        }
    }
}

/// Iterator over an engine-side collection; see [`ManagedProxy::iter`].
pub struct ProxyIter {
    receiver: Arc<ManagedProxy>,
    entry: String,
    done: bool,
}

impl Iterator for ProxyIter {
    type Item = Result<Arc<ManagedProxy>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.receiver.call_int(&self.entry, &[]) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(raw) => match handle_from_raw(raw) {
                Ok(handle) => Some(Ok(Arc::new(ManagedProxy {
                    handle: Mutex::new(handle),
                    session: self.receiver.session.clone(),
                    parent: Some(self.receiver.clone()),
                }))),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
