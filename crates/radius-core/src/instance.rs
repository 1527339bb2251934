//! Module instances (§4.2): a (configuration-section, module-code) pair with
//! private data, an optional per-instance lock, and HUP history.
//!
//! The instance arena is a single `Mutex`/`RwLock`-guarded map, matching the
//! registry's own singleton shape (§9 design notes): it owns every instance,
//! and instances hold `Arc<ModuleCode>` so module code cannot be dropped out
//! from under a live instance even after the registry's own cache entry goes
//! away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use crate::confsection::{ConfSection, RESERVED_WORDS};
use crate::contract::{ModuleCode, ModuleData};
use crate::error::{CoreError, CoreResult};
use crate::types::{Component, Request, Rcode};

/// Minimum time between two HUPs of the same instance (§4.2).
const HUP_MIN_INTERVAL: Duration = Duration::from_secs(2);

/// How long a retired data buffer is kept reachable after a HUP (§4.2, §9).
pub const HUP_GRACE: Duration = Duration::from_secs(60);

/// A private-data buffer retired by a successful HUP, kept around long enough
/// for any worker that captured it before the swap to finish using it.
pub struct RetiredData {
    pub data: ModuleData,
    pub when: SystemTime,
}

pub struct ModuleInstance {
    pub name: String,
    pub code: std::sync::Arc<ModuleCode>,
    data: RwLock<ModuleData>,
    /// Present iff `code.flags.thread_unsafe`.
    lock: Option<Mutex<()>>,
    instantiated: AtomicBool,
    last_hup: Mutex<Instant>,
    hup_history: Mutex<Vec<RetiredData>>,
    cfg: Mutex<ConfSection>,
    /// Cycle-detection marker for sibling-section resolution (§4.2).
    resolving: AtomicBool,
}

impl ModuleInstance {
    /// Invoke this instance for `component` (§4.4): writes `request.module`,
    /// acquires the instance lock if thread-unsafe (held for the whole call,
    /// released on any return path including unwind via the guard's `Drop`),
    /// and calls into the driver with a snapshot of the current data.
    pub fn invoke(&self, component: Component, request: &mut Request) -> Rcode {
        request.module = Some(self.name.clone());
        let _guard = self.lock.as_ref().map(|m| m.lock().expect("instance mutex poisoned"));
        let data = self.data.read().expect("instance data poisoned").clone();
        self.code.driver.call(component, &data, request)
    }

    pub fn is_instantiated(&self) -> bool {
        self.instantiated.load(Ordering::Acquire)
    }

    pub fn history_len(&self, now: SystemTime) -> usize {
        self.hup_history
            .lock()
            .expect("hup history poisoned")
            .iter()
            .filter(|r| now.duration_since(r.when).map(|d| d < HUP_GRACE).unwrap_or(true))
            .count()
    }

    /// Drop history entries older than [`HUP_GRACE`]. Call periodically; the
    /// spec places this on "a periodic sweep", not on any particular caller.
    pub fn sweep_history(&self, now: SystemTime) {
        let mut history = self.hup_history.lock().expect("hup history poisoned");
        history.retain(|r| now.duration_since(r.when).map(|d| d < HUP_GRACE).unwrap_or(true));
    }

    fn gated_for_hup(&self) -> CoreResult<()> {
        if !self.code.flags.hup_safe || self.code.has_bootstrap || !self.code.has_instantiate {
            return Err(CoreError::Config {
                message: format!(
                    "instance {:?} is not eligible for HUP (hup_safe={}, has_bootstrap={}, has_instantiate={})",
                    self.name, self.code.flags.hup_safe, self.code.has_bootstrap, self.code.has_instantiate
                ),
            });
        }
        Ok(())
    }

    /// Reconfigure this instance live. Returns `Ok(true)` if the swap
    /// happened, `Ok(false)` if it was a no-op because the minimum interval
    /// hadn't elapsed (last_hup unchanged, per the round-trip property in
    /// §8), `Err` if `instantiate` rejected the new configuration (old data
    /// stays live).
    pub fn hup(&self, new_cfg: ConfSection, now: Instant, wall_now: SystemTime) -> CoreResult<bool> {
        self.gated_for_hup()?;

        let mut last_hup = self.last_hup.lock().expect("last_hup poisoned");
        if now.saturating_duration_since(*last_hup) < HUP_MIN_INTERVAL {
            return Ok(false);
        }

        let expanded = new_cfg.expand();
        let fresh = self
            .code
            .driver
            .bootstrap(&expanded)
            .map_err(|message| CoreError::BootstrapFailed { name: self.name.clone(), message })?;
        let new_data = match self.code.driver.instantiate(&expanded, &fresh) {
            Ok(d) => d,
            Err(message) => {
                warn!(instance = %self.name, %message, "HUP instantiate failed, keeping old data");
                return Err(CoreError::InstantiateFailed { name: self.name.clone(), message });
            }
        };

        let old_data = {
            let mut data = self.data.write().expect("instance data poisoned");
            std::mem::replace(&mut *data, new_data)
        };
        self.hup_history
            .lock()
            .expect("hup history poisoned")
            .push(RetiredData { data: old_data, when: wall_now });
        *self.cfg.lock().expect("cfg poisoned") = new_cfg;
        *last_hup = now;
        info!(instance = %self.name, "HUP applied");
        Ok(true)
    }
}

/// Process-wide arena owning every bootstrapped instance, keyed by instance
/// name (§9: "three process-wide singletons owned by a Core handle").
pub struct InstanceArena {
    instances: RwLock<HashMap<String, std::sync::Arc<ModuleInstance>>>,
}

impl InstanceArena {
    pub fn new() -> Self {
        InstanceArena { instances: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<ModuleInstance>> {
        self.instances.read().expect("instance arena poisoned").get(name).cloned()
    }

    /// Bootstrap (§4.2 steps 1-6): compute the instance name, reject reserved
    /// words and duplicates, allocate and pass-1-configure private data.
    pub fn bootstrap(
        &self,
        name2: Option<&str>,
        code: std::sync::Arc<ModuleCode>,
        cfg: ConfSection,
    ) -> CoreResult<std::sync::Arc<ModuleInstance>> {
        let name = name2.map(str::to_string).unwrap_or_else(|| code.name.clone());
        if RESERVED_WORDS.contains(&name.as_str()) {
            return Err(CoreError::ReservedName { name });
        }

        let mut instances = self.instances.write().expect("instance arena poisoned");
        if let Some(existing) = instances.get(&name) {
            return Err(CoreError::DuplicateInstance {
                name,
                first_location: existing.cfg.lock().expect("cfg poisoned").location.clone(),
            });
        }

        let data = code
            .driver
            .bootstrap(&cfg)
            .map_err(|message| CoreError::BootstrapFailed { name: name.clone(), message })?;

        let lock = if code.flags.thread_unsafe { Some(Mutex::new(())) } else { None };
        let instance = std::sync::Arc::new(ModuleInstance {
            name: name.clone(),
            code,
            data: RwLock::new(data),
            lock,
            instantiated: AtomicBool::new(false),
            // Far enough in the past that an immediate HUP attempt after
            // instantiate still honors the 2s minimum (instantiate resets this).
            last_hup: Mutex::new(Instant::now() - HUP_MIN_INTERVAL),
            hup_history: Mutex::new(Vec::new()),
            cfg: Mutex::new(cfg),
            resolving: AtomicBool::new(false),
        });
        instances.insert(name, std::sync::Arc::clone(&instance));
        Ok(instance)
    }

    /// Instantiate (§4.2 second pass): idempotent no-op if already done.
    pub fn instantiate(&self, inst: &std::sync::Arc<ModuleInstance>) -> CoreResult<()> {
        if inst.is_instantiated() {
            return Ok(());
        }
        let expanded = { inst.cfg.lock().expect("cfg poisoned").expand() };
        let bootstrapped = inst.data.read().expect("instance data poisoned").clone();
        let data = inst
            .code
            .driver
            .instantiate(&expanded, &bootstrapped)
            .map_err(|message| CoreError::InstantiateFailed { name: inst.name.clone(), message })?;
        *inst.data.write().expect("instance data poisoned") = data;
        *inst.last_hup.lock().expect("last_hup poisoned") = Instant::now();
        inst.instantiated.store(true, Ordering::Release);
        Ok(())
    }

    /// Resolve a sibling section reference, walking at most one hop (§4.2):
    /// if `section_name` exists locally on `originating`, return it; else, if
    /// another instance of the same name exists, trigger its instantiation
    /// and return its matching sub-section. Cycles are rejected.
    pub fn resolve_sibling_section(
        &self,
        originating: &ModuleInstance,
        section_name: &str,
    ) -> CoreResult<ConfSection> {
        if let Some(sub) = originating.cfg.lock().expect("cfg poisoned").sub_find(section_name) {
            return Ok(sub.clone());
        }

        if originating.resolving.swap(true, Ordering::AcqRel) {
            return Err(CoreError::SiblingCycle { section: section_name.to_string() });
        }
        let result = (|| {
            let sibling = self
                .get(section_name)
                .ok_or_else(|| CoreError::Config { message: format!("no sibling section named {section_name:?}") })?;
            self.instantiate(&sibling)?;
            sibling
                .cfg
                .lock()
                .expect("cfg poisoned")
                .sub_find(section_name)
                .cloned()
                .ok_or_else(|| CoreError::Config {
                    message: format!("sibling {section_name:?} has no matching sub-section"),
                })
        })();
        originating.resolving.store(false, Ordering::Release);
        result
    }

    pub fn len(&self) -> usize {
        self.instances.read().expect("instance arena poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InstanceArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{EchoModule, RejectEvenModule};
    use crate::contract::ModuleFlags;
    use crate::types::PacketCode;
    use std::sync::Arc;

    fn echo_code() -> Arc<ModuleCode> {
        Arc::new(ModuleCode {
            name: "echo".into(),
            abi_magic: crate::contract::HOST_ABI,
            flags: ModuleFlags { thread_unsafe: true, hup_safe: false },
            has_bootstrap: false,
            has_instantiate: false,
            driver: Arc::new(EchoModule),
        })
    }

    fn reject_even_code() -> Arc<ModuleCode> {
        Arc::new(ModuleCode {
            name: "reject_even".into(),
            abi_magic: crate::contract::HOST_ABI,
            flags: ModuleFlags { thread_unsafe: false, hup_safe: true },
            has_bootstrap: false,
            has_instantiate: true,
            driver: Arc::new(RejectEvenModule),
        })
    }

    #[test]
    fn bootstrap_rejects_duplicate_names() {
        let arena = InstanceArena::new();
        arena.bootstrap(None, echo_code(), ConfSection::new("echo", None)).unwrap();
        let err = arena.bootstrap(None, echo_code(), ConfSection::new("echo", None)).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateInstance { .. }));
    }

    #[test]
    fn bootstrap_rejects_reserved_words() {
        let arena = InstanceArena::new();
        let err = arena
            .bootstrap(Some("module"), echo_code(), ConfSection::new("echo", None))
            .unwrap_err();
        assert!(matches!(err, CoreError::ReservedName { .. }));
    }

    #[test]
    fn instantiate_is_idempotent() {
        let arena = InstanceArena::new();
        let inst = arena.bootstrap(None, reject_even_code(), ConfSection::new("reject_even", None)).unwrap();
        arena.instantiate(&inst).unwrap();
        assert!(inst.is_instantiated());
        let last_hup_before = *inst.last_hup.lock().unwrap();
        arena.instantiate(&inst).unwrap();
        assert_eq!(*inst.last_hup.lock().unwrap(), last_hup_before, "second instantiate must be a true no-op");
    }

    #[test]
    fn hup_twice_within_2s_is_noop_returning_success() {
        let arena = InstanceArena::new();
        let inst = arena.bootstrap(None, reject_even_code(), ConfSection::new("reject_even", None)).unwrap();
        arena.instantiate(&inst).unwrap();

        let now = Instant::now();
        let wall = SystemTime::now();
        let first = inst.hup(ConfSection::new("reject_even", None), now, wall).unwrap();
        assert!(first);
        let last_hup_after_first = *inst.last_hup.lock().unwrap();

        let second = inst.hup(ConfSection::new("reject_even", None), now + Duration::from_millis(500), wall).unwrap();
        assert!(!second, "second HUP within 2s must be a no-op, not an error");
        assert_eq!(*inst.last_hup.lock().unwrap(), last_hup_after_first);
    }

    #[test]
    fn hup_rejects_modules_that_are_not_hup_safe() {
        let arena = InstanceArena::new();
        let inst = arena.bootstrap(None, echo_code(), ConfSection::new("echo", None)).unwrap();
        arena.instantiate(&inst).unwrap();
        let err = inst.hup(ConfSection::new("echo", None), Instant::now(), SystemTime::now()).unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn successful_hup_retires_old_buffer_into_history() {
        let arena = InstanceArena::new();
        let inst = arena.bootstrap(None, reject_even_code(), ConfSection::new("reject_even", None)).unwrap();
        arena.instantiate(&inst).unwrap();

        let now = Instant::now() + Duration::from_secs(3);
        let wall = SystemTime::now();
        assert!(inst.hup(ConfSection::new("reject_even", None), now, wall).unwrap());
        assert_eq!(inst.history_len(wall), 1);
    }

    #[test]
    fn sweep_history_drops_entries_past_grace_period() {
        let arena = InstanceArena::new();
        let inst = arena.bootstrap(None, reject_even_code(), ConfSection::new("reject_even", None)).unwrap();
        arena.instantiate(&inst).unwrap();

        let now = Instant::now() + Duration::from_secs(3);
        let wall = SystemTime::now();
        inst.hup(ConfSection::new("reject_even", None), now, wall).unwrap();

        let far_future = wall + HUP_GRACE + Duration::from_secs(1);
        inst.sweep_history(far_future);
        assert_eq!(inst.history_len(far_future), 0);
    }

    #[test]
    fn invoke_sets_request_module_and_holds_lock_across_call() {
        let arena = InstanceArena::new();
        let inst = arena.bootstrap(None, echo_code(), ConfSection::new("echo", None)).unwrap();
        let mut req = Request::new(1, "default", PacketCode::AccessRequest);
        let rcode = inst.invoke(Component::Authorize, &mut req);
        assert_eq!(rcode, Rcode::Ok);
        assert_eq!(req.module.as_deref(), Some("echo"));
    }

    #[test]
    fn sibling_resolution_finds_local_subsection() {
        let arena = InstanceArena::new();
        let mut cfg = ConfSection::new("echo", None);
        cfg.add_subsection(ConfSection::new("pool", None));
        let inst = arena.bootstrap(None, echo_code(), cfg).unwrap();
        let resolved = arena.resolve_sibling_section(&inst, "pool").unwrap();
        assert_eq!(resolved.name1, "pool");
    }

    #[test]
    fn sibling_resolution_without_local_or_sibling_is_config_error() {
        let arena = InstanceArena::new();
        let inst = arena.bootstrap(None, echo_code(), ConfSection::new("echo", None)).unwrap();
        let err = arena.resolve_sibling_section(&inst, "nope").unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }
}
