//! chembridge - Session Bridge for a Native Chemistry Engine
//!
//! Bridges a session-scoped, integer-handle-based native engine into safe
//! Rust. The engine hands out opaque integer handles, scopes all of them to
//! explicitly allocated sessions, and keeps one process-global "current
//! session" slot that must be set before every call. This crate owns that
//! lifecycle so callers never touch raw handles, session activation or the
//! dynamic loader directly.
//!
//! # Features
//!
//! - **Module loading**: embedded engine binaries are extracted to a
//!   version-qualified temp location (atomically, tolerating racing
//!   processes) and loaded with per-OS strategies; loads are reference
//!   counted and torn down in reverse order
//! - **Sessions**: [`SessionContext`] allocates an engine session and makes
//!   activate-then-call atomic through a process-wide guard, so concurrent
//!   sessions never observe each other's state
//! - **Managed handles**: [`ManagedProxy`] wraps one handle, releases it at
//!   most once, and keeps referenced-into parents alive by shared ownership
//! - **Error routing**: engine failure sentinels and callback messages are
//!   converted into [`BridgeError`] values attributed to the calling session
//!
//! # Example
//!
//! ```no_run
//! use chembridge::{ManagedProxy, NativeLibraryRegistry, SessionContext};
//!
//! # fn main() -> chembridge::Result<()> {
//! let registry = NativeLibraryRegistry::global();
//! registry.register_payload("engine", std::fs::read("libengine.so")?);
//!
//! let module = registry.load("engine")?;
//! let session = SessionContext::allocate(module)?;
//! session.set_option("timeout", "60000")?;
//!
//! let molecule = ManagedProxy::create(&session, "engineLoadMolecule", &["CCO".into()])?;
//! let formula = molecule.call_str("engineGrossFormula", &[])?;
//! println!("{formula}");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod loader;
pub mod proxy;
pub mod session;

pub use bridge::ErrorBridge;
pub use capability::{
    CapabilityTable, EngineType, EngineValue, Handle, NativeCapabilityTable, SessionId,
    Signature, RELEASED_HANDLE,
};
pub use config::{BridgeConfig, ConfigError, LIBRARY_PATH_VAR};
pub use error::{BridgeError, Result};
pub use loader::{default_loader, NativeLibraryRegistry, NativeModule, PlatformLoader};
pub use proxy::{ManagedProxy, ProxyIter};
pub use session::{ActiveSession, SessionContext};
