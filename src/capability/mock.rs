//! Test-only engine double.
//!
//! Implements the capability table in pure Rust and records which session id
//! is active at every call, so lifecycle tests can assert activation ordering
//! without a real native module.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bridge::ErrorBridge;
use crate::error::{BridgeError, Result};
use crate::loader::PlatformLoader;
use super::table::CapabilityTable;
use super::types::{EngineType, EngineValue, Handle, SessionId, Signature};

/// Recording engine double.
#[derive(Default)]
pub(crate) struct MockEngine {
    next_sid: AtomicI64,
    next_handle: AtomicI32,
    active: Mutex<Option<SessionId>>,
    live_sessions: Mutex<HashSet<SessionId>>,
    released_sessions: Mutex<Vec<SessionId>>,
    activations: Mutex<Vec<SessionId>>,
    /// (entry, session active at the call)
    calls: Mutex<Vec<(String, Option<SessionId>)>>,
    /// (session active at the free, handle)
    freed: Mutex<Vec<(Option<SessionId>, Handle)>>,
    /// Scripted return values per entry name
    script: Mutex<HashMap<String, EngineValue>>,
    /// Entries that fail, with the message the callback reports
    failures: Mutex<HashMap<String, String>>,
    last_error: Mutex<String>,
    bridge: Mutex<Option<Arc<ErrorBridge>>>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        let engine = Self::default();
        engine.next_sid.store(1, Ordering::SeqCst);
        engine.next_handle.store(100, Ordering::SeqCst);
        engine
    }

    pub(crate) fn script(&self, entry: &str, value: EngineValue) {
        self.script.lock().insert(entry.to_string(), value);
    }

    pub(crate) fn fail_entry(&self, entry: &str, message: &str) {
        self.failures
            .lock()
            .insert(entry.to_string(), message.to_string());
    }

    pub(crate) fn set_last_error(&self, message: &str) {
        *self.last_error.lock() = message.to_string();
    }

    pub(crate) fn activations(&self) -> Vec<SessionId> {
        self.activations.lock().clone()
    }

    pub(crate) fn calls(&self) -> Vec<(String, Option<SessionId>)> {
        self.calls.lock().clone()
    }

    pub(crate) fn freed(&self) -> Vec<(Option<SessionId>, Handle)> {
        self.freed.lock().clone()
    }

    pub(crate) fn released_sessions(&self) -> Vec<SessionId> {
        self.released_sessions.lock().clone()
    }

    pub(crate) fn is_session_live(&self, sid: SessionId) -> bool {
        self.live_sessions.lock().contains(&sid)
    }

    fn fresh_handle(&self) -> Handle {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }
}

impl CapabilityTable for MockEngine {
    fn alloc_session(&self) -> Result<SessionId> {
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        self.live_sessions.lock().insert(sid);
        Ok(sid)
    }

    fn release_session(&self, sid: SessionId) {
        self.live_sessions.lock().remove(&sid);
        self.released_sessions.lock().push(sid);
    }

    fn activate_session(&self, sid: SessionId) {
        *self.active.lock() = Some(sid);
        self.activations.lock().push(sid);
    }

    fn free_handle(&self, handle: Handle) -> i64 {
        let active = *self.active.lock();
        self.freed.lock().push((active, handle));
        let failure = self.failures.lock().get(super::table::ENTRY_FREE).cloned();
        if let Some(message) = failure {
            if let Some(bridge) = self.bridge.lock().as_ref() {
                bridge.report(&message);
            }
            return -1;
        }
        0
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }

    fn install_error_handler(&self, bridge: Arc<ErrorBridge>) {
        *self.bridge.lock() = Some(bridge);
    }

    fn invoke(&self, sig: &Signature, args: &[EngineValue]) -> Result<EngineValue> {
        if !sig.matches(args) {
            return Err(BridgeError::InvalidArgCount {
                expected: sig.params.len(),
                got: args.len(),
            });
        }
        let active = *self.active.lock();
        self.calls.lock().push((sig.name.clone(), active));

        let failure = self.failures.lock().get(&sig.name).cloned();
        if let Some(message) = failure {
            if let Some(bridge) = self.bridge.lock().as_ref() {
                bridge.report(&message);
            }
            return Ok(match sig.ret {
                EngineType::Str => EngineValue::Unit,
                EngineType::Float => EngineValue::Float(-1.0),
                _ => EngineValue::Int(-1),
            });
        }

        if let Some(value) = self.script.lock().get(&sig.name) {
            return Ok(value.clone());
        }

        Ok(match sig.ret {
            EngineType::Str => EngineValue::Str("mock".to_string()),
            EngineType::Float => EngineValue::Float(0.0),
            _ => EngineValue::Int(self.fresh_handle() as i64),
        })
    }
}

/// Table wrapper whose drop is counted, standing in for the OS unload.
pub(crate) struct ClosingTable {
    inner: MockEngine,
    label: String,
    closes: Arc<AtomicUsize>,
    closed_order: Arc<Mutex<Vec<String>>>,
}

impl Drop for ClosingTable {
    fn drop(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed_order.lock().push(self.label.clone());
    }
}

impl CapabilityTable for ClosingTable {
    fn alloc_session(&self) -> Result<SessionId> {
        self.inner.alloc_session()
    }
    fn release_session(&self, sid: SessionId) {
        self.inner.release_session(sid)
    }
    fn activate_session(&self, sid: SessionId) {
        self.inner.activate_session(sid)
    }
    fn free_handle(&self, handle: Handle) -> i64 {
        self.inner.free_handle(handle)
    }
    fn last_error(&self) -> String {
        self.inner.last_error()
    }
    fn install_error_handler(&self, bridge: Arc<ErrorBridge>) {
        self.inner.install_error_handler(bridge)
    }
    fn invoke(&self, sig: &Signature, args: &[EngineValue]) -> Result<EngineValue> {
        self.inner.invoke(sig, args)
    }
}

/// Platform loader double counting OS-level loads and unloads.
pub(crate) struct CountingLoader {
    pub(crate) opens: Arc<AtomicUsize>,
    pub(crate) closes: Arc<AtomicUsize>,
    pub(crate) closed_order: Arc<Mutex<Vec<String>>>,
}

impl CountingLoader {
    pub(crate) fn new() -> Self {
        Self {
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
            closed_order: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl PlatformLoader for CountingLoader {
    fn os_tag(&self) -> &'static str {
        "test"
    }

    fn library_filename(&self, component: &str) -> String {
        format!("lib{component}.mock")
    }

    fn search_path_var(&self) -> &'static str {
        "CHEMBRIDGE_MOCK_PATH"
    }

    fn register_search_dir(&self, _dir: &Path) {
        // Tests must not mutate real linker search variables.
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn CapabilityTable>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Arc::new(ClosingTable {
            inner: MockEngine::new(),
            label,
            closes: self.closes.clone(),
            closed_order: self.closed_order.clone(),
        }))
    }
}
