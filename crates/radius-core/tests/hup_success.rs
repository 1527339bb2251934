// Scenario 4 (spec §8): HUP success and grace. A HUP_SAFE instance is
// reconfigured live; 100 requests dispatched immediately afterward all see
// the new data; the retired buffer is present in history, then ages out
// after the 60s grace period.

use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant, SystemTime};

use radius_core::builtin::RejectEvenModule;
use radius_core::config::PoolConfig;
use radius_core::confsection::ConfSection;
use radius_core::contract::{LiteralCallTree, ModuleFlags};
use radius_core::instance::HUP_GRACE;
use radius_core::types::{Component, PacketCode, Rcode, Request};
use radius_core::Core;

fn dispatch_one(core: &Core, number: u64) -> Rcode {
    let (tx, rx) = mpsc::channel();
    let req = Request::new(number, "default", PacketCode::AccessRequest).with_response(tx);
    assert!(core.enqueue(req));
    rx.recv_timeout(Duration::from_secs(2)).unwrap().rcode
}

#[test]
fn hup_flips_behavior_for_every_subsequent_request_then_ages_out_of_history() {
    let core = Core::new(PoolConfig { start_servers: 2, min_spare_servers: 2, max_spare_servers: 2, ..PoolConfig::default() })
        .unwrap();
    core.register_builtin_module(
        "reject_even",
        Arc::new(RejectEvenModule),
        ModuleFlags { thread_unsafe: false, hup_safe: true },
        false,
        true,
    );
    core.add_instance("reject_even", None, ConfSection::new("reject_even", None)).unwrap();
    core.server("default").set_default(Component::Authorize, Arc::new(LiteralCallTree::leaf("reject_even")));
    std::thread::sleep(Duration::from_millis(100));

    // before HUP: default parity "even" rejects even numbers
    for n in 0..100u64 {
        let rcode = dispatch_one(&core, n);
        let expected = if n % 2 == 0 { Rcode::Reject } else { Rcode::Ok };
        assert_eq!(rcode, expected, "request {n} before HUP");
    }

    let instance = core.instances().get("reject_even").unwrap();
    let mut flipped_cfg = ConfSection::new("reject_even", None);
    flipped_cfg.set_pair("parity", "odd");
    let now = Instant::now() + Duration::from_secs(3);
    let wall = SystemTime::now();
    assert!(instance.hup(flipped_cfg, now, wall).unwrap(), "HUP with a valid config must succeed");
    assert_eq!(instance.history_len(wall), 1, "retired buffer must be visible in history right after HUP");

    // after HUP: parity "odd" rejects odd numbers instead
    for n in 100..200u64 {
        let rcode = dispatch_one(&core, n);
        let expected = if n % 2 != 0 { Rcode::Reject } else { Rcode::Ok };
        assert_eq!(rcode, expected, "request {n} after HUP must see the new data");
    }

    let far_future = wall + HUP_GRACE + Duration::from_secs(1);
    instance.sweep_history(far_future);
    assert_eq!(instance.history_len(far_future), 0, "61s later the retired buffer must have aged out");

    core.shutdown();
}
