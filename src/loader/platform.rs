//! Per-OS dynamic loading strategies.
//!
//! Each operating system differs in library naming, the dynamic-linker search
//! variable, and load quirks. One [`PlatformLoader`] implementation exists per
//! OS behind a common trait; [`default_loader`] selects the right one once at
//! startup and everything else depends only on the trait.

use std::path::Path;
use std::sync::Arc;

use crate::capability::{CapabilityTable, NativeCapabilityTable};
use crate::error::{BridgeError, Result};

/// Platform-specific dynamic loading strategy.
pub trait PlatformLoader: Send + Sync {
    /// Short OS tag used in extraction paths ("linux", "macos", "windows").
    fn os_tag(&self) -> &'static str;

    /// Map a component name to the platform library filename.
    fn library_filename(&self, component: &str) -> String;

    /// The process environment variable the dynamic linker searches.
    fn search_path_var(&self) -> &'static str;

    /// Make `dir` visible to the dynamic linker. Appends to the search
    /// variable; callers deduplicate so each directory is added once.
    fn register_search_dir(&self, dir: &Path) {
        let var = self.search_path_var();
        let mut paths: Vec<std::path::PathBuf> = std::env::var_os(var)
            .map(|v| std::env::split_paths(&v).collect())
            .unwrap_or_default();
        if paths.iter().any(|p| p == dir) {
            return;
        }
        paths.push(dir.to_path_buf());
        if let Ok(joined) = std::env::join_paths(paths) {
            std::env::set_var(var, joined);
            tracing::debug!(dir = %dir.display(), var, "registered library search dir");
        }
    }

    /// Perform the OS-level load and resolve the module's capability table.
    fn open(&self, path: &Path) -> Result<Arc<dyn CapabilityTable>>;
}

fn open_native(path: &Path) -> Result<Arc<dyn CapabilityTable>> {
    let component = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let table = NativeCapabilityTable::open(path)
        .map_err(|e| BridgeError::load_failure(&component, e))?;
    tracing::debug!(path = %path.display(), "loaded native module");
    Ok(Arc::new(table))
}

/// Loader for Linux and other ELF platforms.
pub struct LinuxLoader;

impl PlatformLoader for LinuxLoader {
    fn os_tag(&self) -> &'static str {
        "linux"
    }

    fn library_filename(&self, component: &str) -> String {
        if component.starts_with("lib") && component.ends_with(".so") {
            component.to_string()
        } else {
            format!("lib{}.so", component)
        }
    }

    fn search_path_var(&self) -> &'static str {
        "LD_LIBRARY_PATH"
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn CapabilityTable>> {
        open_native(path)
    }
}

/// Loader for macOS.
pub struct MacLoader;

impl PlatformLoader for MacLoader {
    fn os_tag(&self) -> &'static str {
        "macos"
    }

    fn library_filename(&self, component: &str) -> String {
        if component.starts_with("lib") && component.ends_with(".dylib") {
            component.to_string()
        } else {
            format!("lib{}.dylib", component)
        }
    }

    fn search_path_var(&self) -> &'static str {
        "DYLD_LIBRARY_PATH"
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn CapabilityTable>> {
        open_native(path)
    }
}

/// Loader for Windows.
pub struct WindowsLoader;

/// Runtime DLLs the engine links against. Loaded before the engine module so
/// resolution does not depend on the system directory; individual failures
/// are tolerated because the DLL may already be present process-wide.
const COMPANION_DLLS: &[&str] = &["vcruntime140.dll", "vcruntime140_1.dll", "msvcp140.dll"];

impl PlatformLoader for WindowsLoader {
    fn os_tag(&self) -> &'static str {
        "windows"
    }

    fn library_filename(&self, component: &str) -> String {
        if component.ends_with(".dll") {
            component.to_string()
        } else {
            format!("{}.dll", component)
        }
    }

    fn search_path_var(&self) -> &'static str {
        "PATH"
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn CapabilityTable>> {
        if let Some(dir) = path.parent() {
            for dll in COMPANION_DLLS {
                let companion = dir.join(dll);
                if !companion.exists() {
                    continue;
                }
                // Safety: loading the vendor runtime DLL; it stays loaded for
                // the life of the process, matching LoadLibrary semantics.
                match unsafe { libloading::Library::new(&companion) } {
                    Ok(lib) => std::mem::forget(lib),
                    Err(e) => {
                        tracing::debug!(dll, error = %e, "companion runtime not loaded");
                    }
                }
            }
        }
        open_native(path)
    }
}

/// Select the loader for the current OS. Called once at registry construction.
pub fn default_loader() -> Box<dyn PlatformLoader> {
    #[cfg(target_os = "windows")]
    {
        Box::new(WindowsLoader)
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(MacLoader)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        Box::new(LinuxLoader)
    }
}
