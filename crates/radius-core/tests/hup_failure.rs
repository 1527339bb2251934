// Scenario 5 (spec §8): HUP failure. `instantiate` rejects the new
// configuration; the new buffer is discarded, the original data stays live,
// and dispatch results are unchanged from before the attempted HUP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant, SystemTime};

use radius_core::config::PoolConfig;
use radius_core::confsection::ConfSection;
use radius_core::contract::{LiteralCallTree, ModuleData, ModuleDriver, ModuleFlags};
use radius_core::types::{Component, PacketCode, Rcode, Request};
use radius_core::Core;

/// Succeeds on its first `instantiate` call (the one `add_instance` makes at
/// bootstrap time); every call after that — i.e. the one a HUP triggers —
/// returns `Err`, standing in for a module whose reloaded configuration is
/// invalid.
struct RejectsReinstantiate(AtomicUsize);

impl ModuleDriver for RejectsReinstantiate {
    fn instantiate(&self, _cfg: &ConfSection, _bootstrapped: &ModuleData) -> Result<ModuleData, String> {
        let call_index = self.0.fetch_add(1, Ordering::AcqRel);
        if call_index == 0 {
            Ok(Arc::new(call_index) as ModuleData)
        } else {
            Err("reloaded configuration rejected".to_string())
        }
    }

    fn call(&self, _component: Component, _data: &ModuleData, _request: &mut Request) -> Rcode {
        Rcode::Ok
    }

    fn components(&self) -> &'static [Component] {
        &[Component::Authorize]
    }
}

fn dispatch_one(core: &Core, number: u64) -> Rcode {
    let (tx, rx) = mpsc::channel();
    let req = Request::new(number, "default", PacketCode::AccessRequest).with_response(tx);
    assert!(core.enqueue(req));
    rx.recv_timeout(Duration::from_secs(2)).unwrap().rcode
}

#[test]
fn failed_hup_keeps_old_data_live_and_dispatch_unchanged() {
    let core = Core::new(PoolConfig { start_servers: 1, min_spare_servers: 1, max_spare_servers: 1, ..PoolConfig::default() })
        .unwrap();
    core.register_builtin_module(
        "flaky",
        Arc::new(RejectsReinstantiate(AtomicUsize::new(0))),
        ModuleFlags { thread_unsafe: false, hup_safe: true },
        false,
        true,
    );
    core.add_instance("flaky", None, ConfSection::new("flaky", None)).unwrap();
    core.server("default").set_default(Component::Authorize, Arc::new(LiteralCallTree::leaf("flaky")));
    std::thread::sleep(Duration::from_millis(50));

    let before = dispatch_one(&core, 1);
    assert_eq!(before, Rcode::Ok);

    let instance = core.instances().get("flaky").unwrap();
    let now = Instant::now() + Duration::from_secs(3);
    let err = instance.hup(ConfSection::new("flaky", None), now, SystemTime::now()).unwrap_err();
    assert!(matches!(err, radius_core::error::CoreError::InstantiateFailed { .. }));
    assert_eq!(instance.history_len(SystemTime::now()), 0, "a failed HUP must not retire anything");

    let after = dispatch_one(&core, 2);
    assert_eq!(after, before, "dispatch results must be identical to pre-HUP after a failed HUP");

    core.shutdown();
}
