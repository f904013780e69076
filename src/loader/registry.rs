//! Native module registry.
//!
//! Locates, extracts, loads, reference-counts and unloads engine modules.
//! A registry is an ordinary value: construct one with [`NativeLibraryRegistry::new`]
//! and pass it where it is needed. The [`NativeLibraryRegistry::global`]
//! accessor provides the conventional process-wide instance on top, built
//! with double-checked locking and torn down explicitly.
//!
//! Every construction bumps a process-wide generation counter. Sessions
//! record the generation of the registry their module came from and refuse
//! native calls once that registry is gone, because the engine state behind
//! their ids no longer exists.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::bridge::ErrorBridge;
use crate::capability::CapabilityTable;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use super::extract;
use super::platform::{default_loader, PlatformLoader};

/// Bumped once per registry construction, process-wide.
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Guards first construction of the global instance.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// The global instance slot.
static GLOBAL: RwLock<Option<Arc<NativeLibraryRegistry>>> = RwLock::new(None);

/// One loaded engine module.
///
/// The capability table owns the OS library handle, so the OS-level unload
/// happens exactly once, when the last holder of this module drops.
pub struct NativeModule {
    component: String,
    path: PathBuf,
    table: Arc<dyn CapabilityTable>,
    bridge: Arc<ErrorBridge>,
    generation: u64,
    registry: Weak<NativeLibraryRegistry>,
}

impl NativeModule {
    /// Component name this module was loaded as.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Filesystem path the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Generation of the registry that loaded this module.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the creating registry is still the live one. False after
    /// teardown or replacement; dependent sessions treat that as closed.
    pub fn registry_is_current(&self) -> bool {
        self.registry
            .upgrade()
            .map(|r| r.is_alive() && r.generation() == self.generation)
            .unwrap_or(false)
    }

    pub(crate) fn table(&self) -> &dyn CapabilityTable {
        self.table.as_ref()
    }

    pub(crate) fn bridge(&self) -> &ErrorBridge {
        &self.bridge
    }

    pub(crate) fn registry(&self) -> Option<Arc<NativeLibraryRegistry>> {
        self.registry.upgrade()
    }

    /// Build a module over an arbitrary table, bypassing the OS loader.
    #[cfg(test)]
    pub(crate) fn for_table(
        registry: &Arc<NativeLibraryRegistry>,
        table: Arc<dyn CapabilityTable>,
    ) -> Arc<Self> {
        let bridge = Arc::new(ErrorBridge::new());
        table.install_error_handler(bridge.clone());
        Arc::new(Self {
            component: "mock".to_string(),
            path: PathBuf::new(),
            table,
            bridge,
            generation: registry.generation(),
            registry: Arc::downgrade(registry),
        })
    }
}

impl fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModule")
            .field("component", &self.component)
            .field("path", &self.path)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct ModuleEntry {
    component: String,
    module: Arc<NativeModule>,
    refcount: usize,
}

/// Locates, extracts, loads and unloads native engine modules.
pub struct NativeLibraryRegistry {
    config: BridgeConfig,
    loader: Box<dyn PlatformLoader>,
    generation: u64,
    alive: AtomicBool,
    /// Load order is preserved so teardown can unload in reverse.
    modules: Mutex<Vec<ModuleEntry>>,
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    registered_dirs: Mutex<HashSet<PathBuf>>,
}

impl NativeLibraryRegistry {
    /// Create a registry with the host platform's loader strategy.
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Self::with_loader(config, default_loader())
    }

    /// Create a registry with an explicit loader strategy.
    pub fn with_loader(config: BridgeConfig, loader: Box<dyn PlatformLoader>) -> Arc<Self> {
        let generation = GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(generation, "constructing native library registry");
        Arc::new(Self {
            config,
            loader,
            generation,
            alive: AtomicBool::new(true),
            modules: Mutex::new(Vec::new()),
            payloads: Mutex::new(HashMap::new()),
            registered_dirs: Mutex::new(HashSet::new()),
        })
    }

    /// The process-wide instance, constructed on first access. Configuration
    /// is read from `chembridge.toml` if one is found.
    pub fn global() -> Arc<Self> {
        if let Some(registry) = GLOBAL.read().as_ref() {
            return registry.clone();
        }
        let _init = INIT_LOCK.lock();
        let mut slot = GLOBAL.write();
        if let Some(registry) = slot.as_ref() {
            return registry.clone();
        }
        let config = BridgeConfig::load_from_cwd().unwrap_or_default();
        let registry = Self::new(config);
        *slot = Some(registry.clone());
        registry
    }

    /// Tear down and discard the global instance, if any. A later
    /// [`NativeLibraryRegistry::global`] constructs a fresh one with a new
    /// generation.
    pub fn teardown_global() {
        let taken = GLOBAL.write().take();
        if let Some(registry) = taken {
            registry.teardown();
        }
    }

    /// This instance's generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False once [`NativeLibraryRegistry::teardown`] has run.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Configuration this registry was built with.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Hand the registry the embedded bytes for a component. Collaborator
    /// crates call this with their `include_bytes!` payloads before the first
    /// `load` of that component.
    pub fn register_payload(&self, component: &str, bytes: Vec<u8>) {
        self.payloads.lock().insert(component.to_string(), bytes);
    }

    /// Deterministic path a component resolves to: the configured library
    /// directory when overridden, otherwise the version- and
    /// platform-qualified extraction location.
    pub fn resolve_path(&self, component: &str) -> PathBuf {
        let filename = self.loader.library_filename(component);
        match self.config.library_dir() {
            Some(dir) => dir.join(filename),
            None => self
                .config
                .extraction_root()
                .join(format!("{}-{}", self.loader.os_tag(), std::env::consts::ARCH))
                .join(filename),
        }
    }

    /// Load a component, or bump its reference count if already loaded.
    ///
    /// The module table lock serializes concurrent loads, so the OS-level
    /// load runs once per component no matter how many callers race; each
    /// caller is still entitled to a matching `unload`.
    pub fn load(self: &Arc<Self>, component: &str) -> Result<Arc<NativeModule>> {
        if !self.is_alive() {
            return Err(BridgeError::load_failure(component, "registry is torn down"));
        }

        let mut modules = self.modules.lock();
        if let Some(entry) = modules.iter_mut().find(|e| e.component == component) {
            entry.refcount += 1;
            tracing::debug!(component, refcount = entry.refcount, "module reference added");
            return Ok(entry.module.clone());
        }

        let path = self.resolve_path(component);
        if self.config.library_dir().is_some() {
            if !path.exists() {
                return Err(BridgeError::load_failure(
                    component,
                    format!("not found at {}", path.display()),
                ));
            }
        } else {
            let payload = self
                .payloads
                .lock()
                .get(component)
                .cloned()
                .ok_or_else(|| {
                    BridgeError::load_failure(component, "no embedded payload registered")
                })?;
            extract::materialize(&path, &payload)
                .map_err(|e| BridgeError::load_failure(component, e))?;
        }

        if let Some(dir) = path.parent() {
            if self.registered_dirs.lock().insert(dir.to_path_buf()) {
                self.loader.register_search_dir(dir);
            }
        }

        let table = self.loader.open(&path)?;
        let bridge = Arc::new(ErrorBridge::new());
        table.install_error_handler(bridge.clone());

        let module = Arc::new(NativeModule {
            component: component.to_string(),
            path,
            table,
            bridge,
            generation: self.generation,
            registry: Arc::downgrade(self),
        });
        modules.push(ModuleEntry {
            component: component.to_string(),
            module: module.clone(),
            refcount: 1,
        });
        tracing::info!(component, path = %module.path.display(), "loaded native module");
        Ok(module)
    }

    /// Decrement a component's reference count by `times`; the registry's
    /// module reference is dropped when it reaches zero. Returns false when
    /// the component is not loaded, or when `times` exceeds the current
    /// count: over-unloading is a caller accounting bug and must not take
    /// other holders' references with it.
    pub fn unload(&self, component: &str, times: usize) -> bool {
        let mut modules = self.modules.lock();
        let Some(pos) = modules.iter().position(|e| e.component == component) else {
            return false;
        };
        let entry = &mut modules[pos];
        if times > entry.refcount {
            tracing::debug!(
                component,
                times,
                refcount = entry.refcount,
                "unload exceeds reference count"
            );
            return false;
        }
        entry.refcount -= times;
        if entry.refcount == 0 {
            tracing::debug!(component, "module unloaded");
            modules.remove(pos);
        } else {
            tracing::debug!(component, refcount = entry.refcount, "module reference dropped");
        }
        true
    }

    /// Whether a component is currently loaded.
    pub fn is_loaded(&self, component: &str) -> bool {
        self.modules.lock().iter().any(|e| e.component == component)
    }

    /// Current reference count for a component (0 when not loaded).
    pub fn refcount(&self, component: &str) -> usize {
        self.modules
            .lock()
            .iter()
            .find(|e| e.component == component)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    /// Loaded component names, in load order.
    pub fn loaded_components(&self) -> Vec<String> {
        self.modules.lock().iter().map(|e| e.component.clone()).collect()
    }

    /// Unload everything in reverse load order and best-effort clean the
    /// extraction location. Cleanup failures are logged and swallowed;
    /// teardown is not on the correctness-critical path.
    pub fn teardown(&self) {
        self.alive.store(false, Ordering::SeqCst);

        let entries: Vec<ModuleEntry> = self.modules.lock().drain(..).collect();
        let mut survivors = false;
        for entry in entries.into_iter().rev() {
            tracing::debug!(component = %entry.component, "unloading at teardown");
            if Arc::strong_count(&entry.module) > 1 {
                // A session still holds this module; the OS unload happens
                // when that holder drops.
                survivors = true;
            }
        }

        if self.config.library_dir().is_some() {
            return;
        }
        let root = self.config.extraction_root();
        if survivors {
            tracing::warn!(root = %root.display(), "extraction dir kept, modules still referenced");
            return;
        }
        if root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&root) {
                tracing::warn!(root = %root.display(), error = %e, "extraction cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::mock::CountingLoader;

    fn test_config(root: &Path) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.library.extraction_root = Some(root.to_path_buf());
        config
    }

    fn test_registry(root: &Path) -> (Arc<NativeLibraryRegistry>, CountingLoaderHandles) {
        let loader = CountingLoader::new();
        let handles = CountingLoaderHandles {
            opens: loader.opens.clone(),
            closes: loader.closes.clone(),
            closed_order: loader.closed_order.clone(),
        };
        let registry = NativeLibraryRegistry::with_loader(test_config(root), Box::new(loader));
        (registry, handles)
    }

    struct CountingLoaderHandles {
        opens: Arc<std::sync::atomic::AtomicUsize>,
        closes: Arc<std::sync::atomic::AtomicUsize>,
        closed_order: Arc<Mutex<Vec<String>>>,
    }

    #[test]
    fn test_load_is_reference_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, handles) = test_registry(dir.path());
        registry.register_payload("engine", b"bytes".to_vec());

        let a = registry.load("engine").unwrap();
        let b = registry.load("engine").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.refcount("engine"), 2);
        assert_eq!(handles.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_load_unload_symmetry() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, handles) = test_registry(dir.path());
        registry.register_payload("engine", b"bytes".to_vec());

        let n = 5;
        let mut held = Vec::new();
        for _ in 0..n {
            held.push(registry.load("engine").unwrap());
        }
        drop(held);
        for _ in 0..n {
            assert!(registry.unload("engine", 1));
        }

        assert!(!registry.is_loaded("engine"));
        assert_eq!(handles.opens.load(Ordering::SeqCst), 1);
        assert_eq!(handles.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unload_by_times() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _handles) = test_registry(dir.path());
        registry.register_payload("engine", b"bytes".to_vec());

        for _ in 0..3 {
            drop(registry.load("engine").unwrap());
        }
        assert!(registry.unload("engine", 3));
        assert!(!registry.is_loaded("engine"));
        assert!(!registry.unload("engine", 1));
    }

    #[test]
    fn test_unload_rejects_overcount() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, handles) = test_registry(dir.path());
        registry.register_payload("engine", b"bytes".to_vec());

        drop(registry.load("engine").unwrap());
        drop(registry.load("engine").unwrap());

        assert!(!registry.unload("engine", 3));
        assert!(registry.is_loaded("engine"));
        assert_eq!(registry.refcount("engine"), 2);
        assert_eq!(handles.closes.load(Ordering::SeqCst), 0);

        assert!(registry.unload("engine", 2));
        assert!(!registry.is_loaded("engine"));
    }

    #[test]
    fn test_load_without_payload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _handles) = test_registry(dir.path());

        match registry.load("missing") {
            Err(BridgeError::LoadFailure { component, .. }) => assert_eq!(component, "missing"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_load_opens_once() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, handles) = test_registry(dir.path());
        registry.register_payload("engine", b"bytes".to_vec());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.load("engine").map(|_| ()))
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }

        assert_eq!(handles.opens.load(Ordering::SeqCst), 1);
        assert_eq!(registry.refcount("engine"), 8);
    }

    #[test]
    fn test_teardown_unloads_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, handles) = test_registry(dir.path());
        registry.register_payload("engine", b"a".to_vec());
        registry.register_payload("render", b"b".to_vec());

        drop(registry.load("engine").unwrap());
        drop(registry.load("render").unwrap());
        registry.teardown();

        let order = handles.closed_order.lock().clone();
        assert_eq!(order, vec!["librender.mock".to_string(), "libengine.mock".to_string()]);
        assert!(!registry.is_alive());
    }

    #[test]
    fn test_teardown_removes_extraction_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("extract");
        let (registry, _handles) = test_registry(&root);
        registry.register_payload("engine", b"bytes".to_vec());
        drop(registry.load("engine").unwrap());

        registry.teardown();
        assert!(!root.exists());
    }

    #[test]
    fn test_teardown_keeps_root_while_module_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("extract");
        let (registry, _handles) = test_registry(&root);
        registry.register_payload("engine", b"bytes".to_vec());
        let held = registry.load("engine").unwrap();

        registry.teardown();
        assert!(root.exists());
        drop(held);
    }

    #[test]
    fn test_load_after_teardown_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _handles) = test_registry(dir.path());
        registry.register_payload("engine", b"bytes".to_vec());
        registry.teardown();

        assert!(matches!(
            registry.load("engine"),
            Err(BridgeError::LoadFailure { .. })
        ));
    }

    #[test]
    fn test_generation_increments_per_construction() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = test_registry(dir.path());
        let (second, _) = test_registry(dir.path());
        assert!(second.generation() > first.generation());
    }

    #[test]
    fn test_module_staleness_after_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _handles) = test_registry(dir.path());
        registry.register_payload("engine", b"bytes".to_vec());
        let module = registry.load("engine").unwrap();

        assert!(module.registry_is_current());
        registry.teardown();
        assert!(!module.registry_is_current());
    }

    #[test]
    fn test_resolve_path_prefers_library_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.library.dir = Some(PathBuf::from("/opt/engine"));
        let registry =
            NativeLibraryRegistry::with_loader(config, Box::new(CountingLoader::new()));

        assert_eq!(
            registry.resolve_path("engine"),
            PathBuf::from("/opt/engine/libengine.mock")
        );
    }

    #[test]
    fn test_resolve_path_is_platform_qualified() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _handles) = test_registry(dir.path());
        let path = registry.resolve_path("engine");

        let dir_name = path.parent().unwrap().file_name().unwrap().to_string_lossy();
        assert!(dir_name.starts_with("test-"));
        assert_eq!(path.file_name().unwrap(), "libengine.mock");
    }
}
