//! Engine sessions.
//!
//! The engine keeps exactly one "current session" slot per process, selected
//! with a set-session entry point. Every native call must therefore run as an
//! activate-then-call unit with nothing interleaved, or two sessions on
//! different threads would corrupt each other's state. [`SessionContext::enter`]
//! enforces this structurally: it takes a process-wide call lock, activates
//! the session, and hands back a guard that is the only way to reach the
//! engine. Re-activation happens on every call, never "once per thread".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::capability::{
    CapabilityTable, EngineType, EngineValue, Handle, SessionId, Signature,
};
use crate::error::{BridgeError, Result};
use crate::loader::NativeModule;

/// Serializes activation and the call that follows it, process-wide.
static ENGINE_CALL_LOCK: Mutex<()> = Mutex::new(());

const ENTRY_SET_OPTION: &str = "engineSetOption";
const ENTRY_SET_OPTION_INT: &str = "engineSetOptionInt";
const ENTRY_SET_OPTION_BOOL: &str = "engineSetOptionBool";
const ENTRY_SET_OPTION_FLOAT: &str = "engineSetOptionFloat";
const ENTRY_SET_OPTION_COLOR: &str = "engineSetOptionColor";
const ENTRY_GET_OPTION: &str = "engineGetOption";
const ENTRY_RESET_OPTIONS: &str = "engineResetOptions";
const ENTRY_VERSION: &str = "engineVersion";
const ENTRY_COUNT_REFERENCES: &str = "engineCountReferences";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Live,
    Disposed,
}

/// One engine session: an id allocated from a loaded module, plus the state
/// needed to activate it safely and to tear it down exactly once.
pub struct SessionContext {
    sid: SessionId,
    module: Arc<NativeModule>,
    state: Mutex<SessionState>,
}

impl SessionContext {
    /// Allocate a fresh session against a loaded module and apply the
    /// configured option defaults to it.
    pub fn allocate(module: Arc<NativeModule>) -> Result<Arc<Self>> {
        let defaults: HashMap<String, String> = module
            .registry()
            .map(|r| r.config().session.options.clone())
            .unwrap_or_default();

        let sid = {
            let _lock = ENGINE_CALL_LOCK.lock();
            module.table().alloc_session()?
        };
        tracing::debug!(sid, "allocated engine session");

        let session = Self {
            sid,
            module,
            state: Mutex::new(SessionState::Live),
        };
        for (name, value) in &defaults {
            if let Err(e) = session.set_option(name, value) {
                session.dispose();
                return Err(e);
            }
        }
        Ok(Arc::new(session))
    }

    /// The engine-assigned session id.
    pub fn id(&self) -> SessionId {
        self.sid
    }

    /// Whether this session can still make native calls.
    pub fn is_live(&self) -> bool {
        *self.state.lock() == SessionState::Live && self.module.registry_is_current()
    }

    /// Activate this session and take the process-wide call lock. All native
    /// calls go through the returned guard.
    pub fn enter(&self) -> Result<ActiveSession<'_>> {
        let lock = ENGINE_CALL_LOCK.lock();
        if *self.state.lock() == SessionState::Disposed || !self.module.registry_is_current() {
            return Err(BridgeError::SessionClosed);
        }
        self.module.table().activate_session(self.sid);
        self.module.bridge().begin(self.sid);
        Ok(ActiveSession {
            session: self,
            _lock: lock,
        })
    }

    /// Release the session id. Idempotent; the native release is skipped when
    /// the creating registry is gone, because the engine state behind the id
    /// no longer exists.
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Disposed {
                return;
            }
            *state = SessionState::Disposed;
        }
        if !self.module.registry_is_current() {
            tracing::debug!(sid = self.sid, "session disposed after registry teardown");
            return;
        }
        let _lock = ENGINE_CALL_LOCK.lock();
        self.module.table().release_session(self.sid);
        tracing::debug!(sid = self.sid, "released engine session");
    }

    /// Set a string-valued engine option on this session.
    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        self.enter()?
            .call_unit(ENTRY_SET_OPTION, &[name.into(), value.into()])
    }

    /// Set an integer-valued engine option.
    pub fn set_option_int(&self, name: &str, value: i64) -> Result<()> {
        self.enter()?
            .call_unit(ENTRY_SET_OPTION_INT, &[name.into(), value.into()])
    }

    /// Set a boolean engine option. The engine ABI encodes booleans as 0/1.
    pub fn set_option_bool(&self, name: &str, value: bool) -> Result<()> {
        self.enter()?
            .call_unit(ENTRY_SET_OPTION_BOOL, &[name.into(), i64::from(value).into()])
    }

    /// Set a float-valued engine option.
    pub fn set_option_float(&self, name: &str, value: f64) -> Result<()> {
        self.enter()?
            .call_unit(ENTRY_SET_OPTION_FLOAT, &[name.into(), value.into()])
    }

    /// Set a color-valued engine option (three float components).
    pub fn set_option_color(&self, name: &str, r: f64, g: f64, b: f64) -> Result<()> {
        self.enter()?.call_unit(
            ENTRY_SET_OPTION_COLOR,
            &[name.into(), r.into(), g.into(), b.into()],
        )
    }

    /// Read an engine option back as text.
    pub fn get_option(&self, name: &str) -> Result<String> {
        self.enter()?.call_str(ENTRY_GET_OPTION, &[name.into()])
    }

    /// Reset every option of this session to engine defaults.
    pub fn reset_options(&self) -> Result<()> {
        self.enter()?.call_unit(ENTRY_RESET_OPTIONS, &[])
    }

    /// Engine version string.
    pub fn version(&self) -> Result<String> {
        self.enter()?.call_str(ENTRY_VERSION, &[])
    }

    /// Number of live handles the engine tracks for this session.
    pub fn count_references(&self) -> Result<i64> {
        self.enter()?.call_int(ENTRY_COUNT_REFERENCES, &[])
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("sid", &self.sid)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Activation guard: proof that this session is the engine's current one and
/// that the call lock is held. Also scopes the error-bridge token so callback
/// messages route to this session.
pub struct ActiveSession<'a> {
    session: &'a SessionContext,
    _lock: MutexGuard<'static, ()>,
}

impl ActiveSession<'_> {
    fn table(&self) -> &dyn CapabilityTable {
        self.session.module.table()
    }

    fn failure(&self) -> BridgeError {
        self.session
            .module
            .bridge()
            .failure(self.table(), self.session.sid)
    }

    /// Raw call with an explicit signature. Engine failure sentinels are left
    /// in the value; most callers want the typed helpers instead.
    pub fn invoke(&self, sig: &Signature, args: &[EngineValue]) -> Result<EngineValue> {
        self.table().invoke(sig, args)
    }

    /// Call an entry point returning an integer; negative means failure.
    pub fn call_int(&self, entry: &str, args: &[EngineValue]) -> Result<i64> {
        let sig = Signature::for_args(entry, args, EngineType::Int);
        match self.invoke(&sig, args)?.as_int() {
            Some(v) if v >= 0 => Ok(v),
            Some(_) => Err(self.failure()),
            None => Err(BridgeError::Marshal(format!(
                "{entry} returned a non-integer value"
            ))),
        }
    }

    /// Call an entry point returning a float; values below -0.5 mean failure.
    pub fn call_float(&self, entry: &str, args: &[EngineValue]) -> Result<f64> {
        let sig = Signature::for_args(entry, args, EngineType::Float);
        match self.invoke(&sig, args)?.as_float() {
            Some(v) if v >= -0.5 => Ok(v),
            Some(_) => Err(self.failure()),
            None => Err(BridgeError::Marshal(format!(
                "{entry} returned a non-float value"
            ))),
        }
    }

    /// Call an entry point returning a string; a null result means failure.
    pub fn call_str(&self, entry: &str, args: &[EngineValue]) -> Result<String> {
        let sig = Signature::for_args(entry, args, EngineType::Str);
        match self.invoke(&sig, args)? {
            EngineValue::Str(s) => Ok(s),
            EngineValue::Unit => Err(self.failure()),
            other => Err(BridgeError::Marshal(format!(
                "{entry} returned {} instead of a string",
                other.engine_type()
            ))),
        }
    }

    /// Call a status-only entry point; any non-negative code is success.
    pub fn call_unit(&self, entry: &str, args: &[EngineValue]) -> Result<()> {
        self.call_int(entry, args).map(|_| ())
    }

    /// Free one handle in this session.
    pub(crate) fn free_handle(&self, handle: Handle) -> Result<()> {
        if self.table().free_handle(handle) < 0 {
            return Err(self.failure());
        }
        Ok(())
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        self.session.module.bridge().end();
    }
}
