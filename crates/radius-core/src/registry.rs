//! Module registry (§4.1): loads module code by name, caches it by name for
//! the process lifetime, and enforces the ABI magic check.
//!
//! Grounded on the teacher's `BytecodeCache`: a `Mutex`-guarded collection
//! behind a lazily-initialized static, except keyed by name with no
//! eviction — module code is immutable and lives for the process, matching
//! "the cache owns each entry" in §4.1.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use libloading::Library;
use tracing::{debug, warn};

use crate::contract::{unpack_abi, ModuleCode, ModuleDriver, ModuleFlags, HOST_ABI};
use crate::error::{AbiMismatchKind, CoreError, CoreResult};

/// Prefix shared objects are named with, following the original's `rlm_`
/// convention for "RADIUS loadable module".
const MODULE_PREFIX: &str = "rlm";

/// Descriptor a dynamically-loaded module exports. Resolved via `libloading`
/// against a symbol whose name equals the library's stem (§4.1). This is a
/// same-toolchain-only mechanism (the `Arc<dyn ModuleDriver>` it carries is
/// not a stable ABI across Rust compiler versions) — the ABI magic check
/// below is the crate's only real defense, matching the original's own
/// {prefix,version,commit} triple check.
#[repr(C)]
pub struct RawModuleDescriptor {
    pub abi_magic: u64,
    pub flags: ModuleFlags,
    pub has_bootstrap: bool,
    pub has_instantiate: bool,
    pub driver: Arc<dyn ModuleDriver>,
}

type DescriptorSymbol = unsafe extern "C" fn() -> RawModuleDescriptor;

/// Environment override for the module search path (§6).
const LIBRARY_PATH_VAR: &str = "FR_LIBRARY_PATH";

pub struct ModuleRegistry {
    cache: Mutex<HashMap<String, Arc<ModuleCode>>>,
    /// Open dynamic libraries, kept alive for as long as the registry is —
    /// closing one while a `ModuleCode` built from it is still in the cache
    /// would be unsound, so they're tied to the same lifetime.
    open_libs: Mutex<Vec<Library>>,
    library_dir: PathBuf,
}

impl ModuleRegistry {
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        ModuleRegistry {
            cache: Mutex::new(HashMap::new()),
            open_libs: Mutex::new(Vec::new()),
            library_dir: library_dir.into(),
        }
    }

    /// Process-wide singleton, matching the shape of the teacher's
    /// `BytecodeCache::global()`.
    pub fn global() -> &'static ModuleRegistry {
        static INSTANCE: OnceLock<ModuleRegistry> = OnceLock::new();
        INSTANCE.get_or_init(|| ModuleRegistry::new("."))
    }

    /// Register a module whose descriptor is built from Rust directly rather
    /// than resolved via `dlopen` — the "host-embedded" path of §4.1, tried
    /// first on every [`load`](Self::load) call. `has_bootstrap`/`has_instantiate`
    /// mirror what a [`RawModuleDescriptor`] would declare for a dynamically
    /// loaded module: whether the driver overrides the corresponding
    /// [`ModuleDriver`] method rather than relying on its default, which
    /// `gated_for_hup` on [`crate::instance::ModuleInstance`] reads to decide
    /// HUP eligibility.
    pub fn register_builtin(
        &self,
        name: impl Into<String>,
        driver: Arc<dyn ModuleDriver>,
        flags: ModuleFlags,
        has_bootstrap: bool,
        has_instantiate: bool,
    ) {
        let name = name.into();
        let code = Arc::new(ModuleCode {
            name: name.clone(),
            abi_magic: HOST_ABI,
            flags,
            has_bootstrap,
            has_instantiate,
            driver,
        });
        self.cache.lock().expect("registry poisoned").insert(name, code);
    }

    /// Look up `name`, loading it on first use.
    pub fn load(&self, name: &str) -> CoreResult<Arc<ModuleCode>> {
        if let Some(code) = self.cache.lock().expect("registry poisoned").get(name) {
            return Ok(Arc::clone(code));
        }
        let code = self.load_dynamic(name)?;
        let mut cache = self.cache.lock().expect("registry poisoned");
        Ok(Arc::clone(cache.entry(name.to_string()).or_insert(code)))
    }

    fn search_dirs(&self) -> Vec<PathBuf> {
        match std::env::var(LIBRARY_PATH_VAR) {
            Ok(path) if !path.is_empty() => path.split(':').map(PathBuf::from).collect(),
            _ => vec![self.library_dir.clone()],
        }
    }

    fn load_dynamic(&self, name: &str) -> CoreResult<Arc<ModuleCode>> {
        let stem = format!("{MODULE_PREFIX}_{name}");
        let filename = libloading::library_filename(&stem);

        let mut candidates: Vec<PathBuf> = self
            .search_dirs()
            .into_iter()
            .map(|dir| dir.join(&filename))
            .collect();
        // OS loader fallback: bare filename, letting LD_LIBRARY_PATH etc. resolve it.
        candidates.push(PathBuf::from(&filename));

        let mut last_err = None;
        for path in &candidates {
            match self.try_load_one(path, &stem) {
                Ok(code) => return Ok(code),
                Err(e) => last_err = Some(e),
            }
        }
        warn!(module = name, ?candidates, "module library not found in any search location");
        Err(last_err.unwrap_or(CoreError::LibraryNotFound { name: name.to_string() }))
    }

    fn try_load_one(&self, path: &Path, stem: &str) -> CoreResult<Arc<ModuleCode>> {
        debug!(?path, "attempting module load");
        // SAFETY: loading and invoking a module shared object is inherently
        // unsafe — the ABI magic check immediately below is this crate's
        // mitigation, matching the original's own load-time ABI check.
        let lib = unsafe { Library::new(path) }.map_err(|source| CoreError::DlOpen {
            path: path.to_path_buf(),
            source,
        })?;

        let descriptor = unsafe {
            let sym: libloading::Symbol<DescriptorSymbol> =
                lib.get(stem.as_bytes()).map_err(|_| CoreError::SymbolNotFound {
                    library: path.display().to_string(),
                    symbol: stem.to_string(),
                })?;
            sym()
        };

        check_abi(stem, descriptor.abi_magic)?;

        let code = Arc::new(ModuleCode {
            name: stem.to_string(),
            abi_magic: descriptor.abi_magic,
            flags: descriptor.flags,
            has_bootstrap: descriptor.has_bootstrap,
            has_instantiate: descriptor.has_instantiate,
            driver: descriptor.driver,
        });

        self.open_libs.lock().expect("registry poisoned").push(lib);
        Ok(code)
    }

    /// Number of module codes currently cached (builtins + dynamically loaded).
    pub fn len(&self) -> usize {
        self.cache.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_abi(name: &str, module_magic: u64) -> CoreResult<()> {
    let (host_prefix, host_version, host_commit) = unpack_abi(HOST_ABI);
    let (prefix, version, commit) = unpack_abi(module_magic);
    if prefix != host_prefix {
        return Err(CoreError::AbiMismatch {
            name: name.to_string(),
            kind: AbiMismatchKind::Prefix,
            host: HOST_ABI,
            module: module_magic,
        });
    }
    if version != host_version {
        return Err(CoreError::AbiMismatch {
            name: name.to_string(),
            kind: AbiMismatchKind::Version,
            host: HOST_ABI,
            module: module_magic,
        });
    }
    if commit != host_commit {
        return Err(CoreError::AbiMismatch {
            name: name.to_string(),
            kind: AbiMismatchKind::Commit,
            host: HOST_ABI,
            module: module_magic,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::EchoModule;
    use crate::types::{Component, Rcode};

    #[test]
    fn register_builtin_then_load_hits_cache() {
        let registry = ModuleRegistry::new(".");
        registry.register_builtin(
            "echo",
            Arc::new(EchoModule),
            ModuleFlags { thread_unsafe: true, hup_safe: false },
            false,
            false,
        );
        let code = registry.load("echo").expect("builtin must resolve without dlopen");
        assert_eq!(code.name, "echo");
        assert!(code.flags.thread_unsafe);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn load_missing_dynamic_module_fails() {
        let registry = ModuleRegistry::new("/nonexistent/path/for/tests");
        let err = registry.load("definitely_not_a_real_module").unwrap_err();
        assert!(matches!(err, CoreError::LibraryNotFound { .. } | CoreError::DlOpen { .. }));
    }

    #[test]
    fn check_abi_detects_each_mismatch_kind() {
        let bad_prefix = crate::contract::pack_abi(99, 1, 0);
        assert!(matches!(
            check_abi("x", bad_prefix).unwrap_err(),
            CoreError::AbiMismatch { kind: AbiMismatchKind::Prefix, .. }
        ));

        let (host_prefix, _, host_commit) = unpack_abi(HOST_ABI);
        let bad_version = crate::contract::pack_abi(host_prefix, 99, host_commit);
        assert!(matches!(
            check_abi("x", bad_version).unwrap_err(),
            CoreError::AbiMismatch { kind: AbiMismatchKind::Version, .. }
        ));

        let (p, v, _) = unpack_abi(HOST_ABI);
        let bad_commit = crate::contract::pack_abi(p, v, 12345);
        assert!(matches!(
            check_abi("x", bad_commit).unwrap_err(),
            CoreError::AbiMismatch { kind: AbiMismatchKind::Commit, .. }
        ));
    }

    #[test]
    fn matching_abi_passes() {
        assert!(check_abi("x", HOST_ABI).is_ok());
    }

    #[test]
    fn builtin_driver_is_invocable_through_registry() {
        let registry = ModuleRegistry::new(".");
        registry.register_builtin(
            "echo",
            Arc::new(EchoModule),
            ModuleFlags { thread_unsafe: true, hup_safe: false },
            false,
            false,
        );
        let code = registry.load("echo").unwrap();
        let data = code.driver.bootstrap(&crate::confsection::ConfSection::new("echo", None)).unwrap();
        let mut req = crate::types::Request::new(1, "default", crate::types::PacketCode::AccessRequest);
        let rcode = code.driver.call(Component::Authorize, &data, &mut req);
        assert_eq!(rcode, Rcode::Ok);
    }
}
