//! Capability tables for loaded engine modules.
//!
//! A module's entry points all take and return integer handles, scalars,
//! C strings or byte buffers. This layer models that table: the lifecycle
//! subset the core depends on as trait methods, everything domain-level
//! through an opaque signature-driven [`CapabilityTable::invoke`].
//!
//! ```text
//! SessionContext / ManagedProxy
//!         │
//!         ▼
//! CapabilityTable (trait)
//!         │
//!         ▼
//! NativeCapabilityTable (libloading, arity dispatch)
//!         │
//!         ▼
//! Engine entry point
//! ```

mod native;
mod table;
mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use native::NativeCapabilityTable;
pub use table::{
    CapabilityTable, ENTRY_ALLOC_SESSION, ENTRY_FREE, ENTRY_LAST_ERROR, ENTRY_RELEASE_SESSION,
    ENTRY_SET_ERROR_HANDLER, ENTRY_SET_SESSION,
};
pub use types::{EngineType, EngineValue, Handle, SessionId, Signature, RELEASED_HANDLE};
