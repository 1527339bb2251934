// radius-core: worker-pool, virtual-server dispatch, and module-lifecycle
// core for a RADIUS/AAA server.

pub mod builtin;
pub mod config;
pub mod confsection;
pub mod contract;
pub mod error;
pub mod instance;
pub mod pool;
pub mod pps;
pub mod queue;
pub mod reaper;
pub mod registry;
pub mod types;
pub mod vserver;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime};

use config::PoolConfig;
use confsection::ConfSection;
use contract::ModuleFlags;
use error::{CoreError, CoreResult};
use instance::InstanceArena;
use pool::{PoolStats, ProcessFn, WorkerPool};
use registry::ModuleRegistry;
use types::{Component, PacketCode, Request, Rcode};
use vserver::VirtualServer;

pub use types::{ChildState, MasterState, RequestOutcome};

/// Default entry-point component for a given packet type. A real daemon
/// walks multiple components per request (authorize, then authenticate,
/// then accounting, …); picking the single entry component here is this
/// crate's simplification of that pipeline — wiring up the full multi-stage
/// walk is a listener concern layered on top of `Core`, not a core contract.
fn entry_component(packet_code: PacketCode) -> Component {
    match packet_code {
        PacketCode::AccessRequest => Component::Authorize,
        PacketCode::AccountingRequest => Component::Accounting,
        PacketCode::CoaRequest | PacketCode::DisconnectRequest => Component::Authorize,
        PacketCode::Other(_) => Component::Authorize,
    }
}

/// The process-wide handle: owns the module registry, the instance arena,
/// the compiled virtual servers, and the worker pool (§9 design notes).
/// Construction order is registry → instances → servers → pool; teardown via
/// [`Core::shutdown`] reverses it (pool stops taking work first).
pub struct Core {
    registry: Arc<ModuleRegistry>,
    instances: Arc<InstanceArena>,
    servers: Arc<RwLock<HashMap<String, Arc<VirtualServer>>>>,
    pool: WorkerPool,
}

impl Core {
    pub fn new(config: PoolConfig) -> CoreResult<Self> {
        config.validate()?;
        let registry = Arc::new(ModuleRegistry::new("."));
        let instances = Arc::new(InstanceArena::new());
        let servers: Arc<RwLock<HashMap<String, Arc<VirtualServer>>>> = Arc::new(RwLock::new(HashMap::new()));

        let servers_for_process = Arc::clone(&servers);
        let instances_for_process = Arc::clone(&instances);
        let process: ProcessFn = Arc::new(move |request: &mut Request| -> Rcode {
            let component = entry_component(request.packet_code);
            let servers = servers_for_process.read().expect("servers poisoned");
            vserver::dispatch(&servers, &instances_for_process, component, 0, request)
        });

        let pool = WorkerPool::new(config, process);

        Ok(Core { registry, instances, servers, pool })
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn instances(&self) -> &Arc<InstanceArena> {
        &self.instances
    }

    /// Register a host-embedded module (§4.1), e.g. [`builtin::EchoModule`].
    /// `has_bootstrap`/`has_instantiate` declare whether `driver` overrides
    /// the corresponding [`contract::ModuleDriver`] method, the same
    /// information a dynamically loaded module would carry in its descriptor.
    pub fn register_builtin_module(
        &self,
        name: impl Into<String>,
        driver: Arc<dyn contract::ModuleDriver>,
        flags: ModuleFlags,
        has_bootstrap: bool,
        has_instantiate: bool,
    ) {
        self.registry.register_builtin(name, driver, flags, has_bootstrap, has_instantiate);
    }

    /// Bootstrap and instantiate a module instance (§4.2 steps 1-6, then the
    /// second pass) from an already-loaded or already-registered module name.
    pub fn add_instance(&self, module_name: &str, name2: Option<&str>, cfg: ConfSection) -> CoreResult<()> {
        let code = self.registry.load(module_name)?;
        let instance = self.instances.bootstrap(name2, code, cfg)?;
        self.instances.instantiate(&instance)
    }

    /// Reconfigure a live instance (§4.2 HUP).
    pub fn hup_instance(&self, name: &str, new_cfg: ConfSection) -> CoreResult<bool> {
        let instance = self
            .instances
            .get(name)
            .ok_or_else(|| CoreError::Config { message: format!("no such instance {name:?}") })?;
        instance.hup(new_cfg, Instant::now(), SystemTime::now())
    }

    /// Create (or fetch) a named virtual server to compile sections into.
    pub fn server(&self, name: &str) -> Arc<VirtualServer> {
        let mut servers = self.servers.write().expect("servers poisoned");
        Arc::clone(servers.entry(name.to_string()).or_insert_with(|| Arc::new(VirtualServer::new(name))))
    }

    /// `enqueue(Request) → bool` (§6).
    pub fn enqueue(&self, request: Request) -> bool {
        self.pool.enqueue(request)
    }

    /// `queue_stats()` (§6).
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::EchoModule;
    use crate::contract::LiteralCallTree;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn end_to_end_request_through_registered_server() {
        let core = Core::new(PoolConfig { start_servers: 1, min_spare_servers: 1, max_spare_servers: 1, ..PoolConfig::default() })
            .unwrap();
        core.register_builtin_module(
            "echo",
            Arc::new(EchoModule),
            ModuleFlags { thread_unsafe: true, hup_safe: false },
            false,
            false,
        );
        core.add_instance("echo", None, ConfSection::new("echo", None)).unwrap();

        let server = core.server("default");
        server.set_default(Component::Authorize, Arc::new(LiteralCallTree::leaf("echo")));

        std::thread::sleep(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        let req = Request::new(1, "default", PacketCode::AccessRequest).with_response(tx);
        assert!(core.enqueue(req));
        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome.rcode, Rcode::Ok);

        core.shutdown();
    }

    #[test]
    fn unknown_server_name_yields_fail() {
        let core = Core::new(PoolConfig { start_servers: 1, min_spare_servers: 1, max_spare_servers: 1, ..PoolConfig::default() })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel();
        let req = Request::new(1, "nonexistent", PacketCode::AccessRequest).with_response(tx);
        assert!(core.enqueue(req));
        let outcome = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome.rcode, Rcode::Fail);
        core.shutdown();
    }
}
