//! Native module location, extraction and lifecycle.

pub(crate) mod extract;
mod platform;
mod registry;

pub use platform::{default_loader, LinuxLoader, MacLoader, PlatformLoader, WindowsLoader};
pub use registry::{NativeLibraryRegistry, NativeModule};
