//! Production capability table backed by a dynamically loaded module.
//!
//! Owns the OS library handle for the lifetime of the table, caches resolved
//! symbol addresses, and dispatches calls by arity. Dropping the table is the
//! OS-level unload.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use parking_lot::Mutex;

use crate::bridge::ErrorBridge;
use crate::error::{BridgeError, Result};
use super::table::{
    CapabilityTable, ENTRY_ALLOC_SESSION, ENTRY_FREE, ENTRY_LAST_ERROR, ENTRY_RELEASE_SESSION,
    ENTRY_SET_ERROR_HANDLER, ENTRY_SET_SESSION,
};
use super::types::{EngineType, EngineValue, Handle, SessionId, Signature};

/// Error callback signature the engine expects: message plus the context
/// token supplied at registration.
type ErrorCallback = unsafe extern "C" fn(*const c_char, *mut c_void);

/// Capability table resolved from a loaded native module.
pub struct NativeCapabilityTable {
    path: PathBuf,
    library: Library,
    /// Cached symbol addresses
    symbols: Mutex<HashMap<String, usize>>,
    /// Keeps the registered bridge alive while the engine may still call back
    bridge: Mutex<Option<Arc<ErrorBridge>>>,
}

impl NativeCapabilityTable {
    /// Load the module at `path` and wrap its entry points.
    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, libloading::Error> {
        let path = path.as_ref().to_path_buf();

        // Safety: loading a dynamic library runs its initializers. The
        // registry only hands over paths it resolved or extracted itself.
        let library = unsafe { Library::new(&path)? };

        Ok(Self {
            path,
            library,
            symbols: Mutex::new(HashMap::new()),
            bridge: Mutex::new(None),
        })
    }

    /// Path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve an entry point address, consulting the cache first.
    fn symbol(&self, name: &str) -> Result<usize> {
        let mut cache = self.symbols.lock();
        if let Some(&addr) = cache.get(name) {
            return Ok(addr);
        }

        let c_name = CString::new(name)
            .map_err(|_| BridgeError::SymbolNotFound(name.to_string()))?;

        // Safety: the symbol address stays valid while `self.library` is
        // loaded, and the table owns the library.
        let symbol: Symbol<*const ()> = unsafe {
            self.library
                .get(c_name.as_bytes_with_nul())
                .map_err(|_| BridgeError::SymbolNotFound(name.to_string()))?
        };

        let addr = *symbol as usize;
        cache.insert(name.to_string(), addr);
        Ok(addr)
    }

    /// Marshal one argument to a machine word. C strings are copied into
    /// `keep` so their storage outlives the call; byte buffers are passed by
    /// pointer and stay alive through the borrowed argument slice.
    fn marshal(arg: &EngineValue, keep: &mut Vec<CString>) -> Result<u64> {
        match arg {
            EngineValue::Unit => Err(BridgeError::Marshal(
                "unit is not a passable argument".to_string(),
            )),
            EngineValue::Int(v) => Ok(*v as u64),
            EngineValue::Float(v) => Ok(v.to_bits()),
            EngineValue::Str(s) => {
                let c = CString::new(s.as_str())
                    .map_err(|_| BridgeError::Marshal("string contains NUL".to_string()))?;
                let ptr = c.as_ptr() as u64;
                keep.push(c);
                Ok(ptr)
            }
            EngineValue::Bytes(b) => Ok(b.as_ptr() as u64),
        }
    }

    // Dispatch helpers. Rust FFI needs the exact parameter count at compile
    // time, so each return kind matches on arity.

    fn call_i64(&self, addr: usize, words: &[u64]) -> Result<i64> {
        // Safety: the address came from the loaded module and the caller
        // supplied a matching signature; argument count is checked above.
        unsafe {
            Ok(match words.len() {
                0 => std::mem::transmute::<usize, extern "C" fn() -> i64>(addr)(),
                1 => std::mem::transmute::<usize, extern "C" fn(u64) -> i64>(addr)(words[0]),
                2 => std::mem::transmute::<usize, extern "C" fn(u64, u64) -> i64>(addr)(
                    words[0], words[1],
                ),
                3 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64) -> i64>(addr)(
                    words[0], words[1], words[2],
                ),
                4 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64, u64) -> i64>(addr)(
                    words[0], words[1], words[2], words[3],
                ),
                5 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64, u64, u64) -> i64>(
                    addr,
                )(words[0], words[1], words[2], words[3], words[4]),
                6 => std::mem::transmute::<
                    usize,
                    extern "C" fn(u64, u64, u64, u64, u64, u64) -> i64,
                >(addr)(
                    words[0], words[1], words[2], words[3], words[4], words[5],
                ),
                n => return Err(BridgeError::TooManyArgs(n)),
            })
        }
    }

    fn call_f64(&self, addr: usize, words: &[u64]) -> Result<f64> {
        // Safety: as for call_i64; float returns use their own transmute so
        // the value comes back through the right register.
        unsafe {
            Ok(match words.len() {
                0 => std::mem::transmute::<usize, extern "C" fn() -> f64>(addr)(),
                1 => std::mem::transmute::<usize, extern "C" fn(u64) -> f64>(addr)(words[0]),
                2 => std::mem::transmute::<usize, extern "C" fn(u64, u64) -> f64>(addr)(
                    words[0], words[1],
                ),
                3 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64) -> f64>(addr)(
                    words[0], words[1], words[2],
                ),
                4 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64, u64) -> f64>(addr)(
                    words[0], words[1], words[2], words[3],
                ),
                5 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64, u64, u64) -> f64>(
                    addr,
                )(words[0], words[1], words[2], words[3], words[4]),
                6 => std::mem::transmute::<
                    usize,
                    extern "C" fn(u64, u64, u64, u64, u64, u64) -> f64,
                >(addr)(
                    words[0], words[1], words[2], words[3], words[4], words[5],
                ),
                n => return Err(BridgeError::TooManyArgs(n)),
            })
        }
    }

    fn call_ptr(&self, addr: usize, words: &[u64]) -> Result<*const c_char> {
        // Safety: as for call_i64.
        unsafe {
            Ok(match words.len() {
                0 => std::mem::transmute::<usize, extern "C" fn() -> *const c_char>(addr)(),
                1 => std::mem::transmute::<usize, extern "C" fn(u64) -> *const c_char>(addr)(
                    words[0],
                ),
                2 => std::mem::transmute::<usize, extern "C" fn(u64, u64) -> *const c_char>(addr)(
                    words[0], words[1],
                ),
                3 => std::mem::transmute::<usize, extern "C" fn(u64, u64, u64) -> *const c_char>(
                    addr,
                )(words[0], words[1], words[2]),
                4 => std::mem::transmute::<
                    usize,
                    extern "C" fn(u64, u64, u64, u64) -> *const c_char,
                >(addr)(words[0], words[1], words[2], words[3]),
                5 => std::mem::transmute::<
                    usize,
                    extern "C" fn(u64, u64, u64, u64, u64) -> *const c_char,
                >(addr)(words[0], words[1], words[2], words[3], words[4]),
                6 => std::mem::transmute::<
                    usize,
                    extern "C" fn(u64, u64, u64, u64, u64, u64) -> *const c_char,
                >(addr)(
                    words[0], words[1], words[2], words[3], words[4], words[5],
                ),
                n => return Err(BridgeError::TooManyArgs(n)),
            })
        }
    }
}

/// Routes engine error callbacks into the bridge registered as context.
///
/// Must never unwind into the engine; it only copies the message out.
unsafe extern "C" fn error_trampoline(message: *const c_char, context: *mut c_void) {
    if message.is_null() || context.is_null() {
        return;
    }
    let bridge = unsafe { &*(context as *const ErrorBridge) };
    let text = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    bridge.report(&text);
}

impl CapabilityTable for NativeCapabilityTable {
    fn alloc_session(&self) -> Result<SessionId> {
        let addr = self.symbol(ENTRY_ALLOC_SESSION)?;
        let sid = self.call_i64(addr, &[])?;
        if sid < 0 {
            return Err(BridgeError::Engine(self.last_error()));
        }
        Ok(sid)
    }

    fn release_session(&self, sid: SessionId) {
        if let Ok(addr) = self.symbol(ENTRY_RELEASE_SESSION) {
            let _ = self.call_i64(addr, &[sid as u64]);
        }
    }

    fn activate_session(&self, sid: SessionId) {
        if let Ok(addr) = self.symbol(ENTRY_SET_SESSION) {
            let _ = self.call_i64(addr, &[sid as u64]);
        }
    }

    fn free_handle(&self, handle: Handle) -> i64 {
        match self.symbol(ENTRY_FREE) {
            Ok(addr) => self.call_i64(addr, &[handle as u64]).unwrap_or(-1),
            Err(_) => -1,
        }
    }

    fn last_error(&self) -> String {
        let Ok(addr) = self.symbol(ENTRY_LAST_ERROR) else {
            return "unknown engine error".to_string();
        };
        match self.call_ptr(addr, &[]) {
            Ok(ptr) if !ptr.is_null() => {
                // Safety: the engine returns a NUL-terminated string owned by
                // the current session's error slot.
                unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
            }
            _ => "unknown engine error".to_string(),
        }
    }

    fn install_error_handler(&self, bridge: Arc<ErrorBridge>) {
        let Ok(addr) = self.symbol(ENTRY_SET_ERROR_HANDLER) else {
            // Older engine builds have no callback; last_error still works.
            tracing::debug!(module = %self.path.display(), "no error handler entry point");
            return;
        };
        let context = Arc::as_ptr(&bridge) as *mut c_void;
        *self.bridge.lock() = Some(bridge);

        // Safety: `context` stays valid while the bridge Arc is held in
        // `self.bridge`, which outlives the library's ability to call back.
        unsafe {
            let register: extern "C" fn(ErrorCallback, *mut c_void) =
                std::mem::transmute(addr);
            register(error_trampoline, context);
        }
    }

    fn invoke(&self, sig: &Signature, args: &[EngineValue]) -> Result<EngineValue> {
        if !sig.matches(args) {
            return Err(BridgeError::InvalidArgCount {
                expected: sig.params.len(),
                got: args.len(),
            });
        }
        let addr = self.symbol(&sig.name)?;

        let mut keep = Vec::new();
        let words = args
            .iter()
            .map(|a| Self::marshal(a, &mut keep))
            .collect::<Result<Vec<u64>>>()?;

        match sig.ret {
            EngineType::Unit | EngineType::Int => {
                self.call_i64(addr, &words).map(EngineValue::Int)
            }
            EngineType::Float => self.call_f64(addr, &words).map(EngineValue::Float),
            EngineType::Str => {
                let ptr = self.call_ptr(addr, &words)?;
                if ptr.is_null() {
                    // Failure sentinel for string-returning entry points; the
                    // bridge turns this into an EngineError.
                    return Ok(EngineValue::Unit);
                }
                // Safety: non-null return is a NUL-terminated string valid
                // until the next call on this session.
                let text = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
                Ok(EngineValue::Str(text))
            }
            EngineType::Bytes => Err(BridgeError::Marshal(
                "byte buffers are returned through writer handles".to_string(),
            )),
        }
    }
}
