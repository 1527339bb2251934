//! Two host-embedded demonstration modules, registered via
//! [`crate::registry::ModuleRegistry::register_builtin`] rather than loaded
//! from a shared object. They stand in for a flavor EAP method and for an
//! ordinary policy module: `echo` exercises the `THREAD_UNSAFE` per-instance
//! lock, `reject_even` exercises `HUP_SAFE` reconfiguration.

use std::any::Any;
use std::sync::Arc;

use crate::confsection::ConfSection;
use crate::contract::{ModuleData, ModuleDriver};
use crate::types::{Component, Request, Rcode};

/// Fixed `AT_ID` payload a EAP-SIM-flavor module would attach to an
/// identity request. The original assigns this byte-by-byte with what reads
/// as a copy-paste typo (`p[0] = 0; p[0] = 1;`, the second store shadowing
/// the first); absent a protocol test saying otherwise, the payload is taken
/// to be `{0x00, 0x01}` as actually executed, not as apparently intended.
pub const EAP_SIM_AT_ID: [u8; 2] = [0x00, 0x01];

const SUPPORTED_COMPONENTS: &[Component] = &[
    Component::Authorize,
    Component::Authenticate,
    Component::Accounting,
    Component::PostAuth,
];

/// `THREAD_UNSAFE`. Always returns `Ok`; never reads or writes private data
/// beyond the unit placeholder bootstrap gives it. Its only purpose is to
/// have a mutex an instance can be registered with.
pub struct EchoModule;

impl ModuleDriver for EchoModule {
    fn call(&self, _component: Component, _data: &ModuleData, _request: &mut Request) -> Rcode {
        Rcode::Ok
    }

    fn components(&self) -> &'static [Component] {
        SUPPORTED_COMPONENTS
    }
}

struct RejectEvenConfig {
    reject_even: bool,
}

/// `HUP_SAFE`. Rejects (`Rcode::Reject`) requests whose `number` matches the
/// configured parity, `Ok` otherwise. `instantiate` reads the `parity` pair
/// (`"even"` or `"odd"`, default `"even"`) so a HUP that flips it is
/// observable in tests.
pub struct RejectEvenModule;

impl ModuleDriver for RejectEvenModule {
    fn instantiate(&self, cfg: &ConfSection, _bootstrapped: &ModuleData) -> Result<ModuleData, String> {
        let reject_even = match cfg.pair_find("parity") {
            Some("odd") => false,
            Some("even") | None => true,
            Some(other) => return Err(format!("unknown parity {other:?}, expected \"even\" or \"odd\"")),
        };
        Ok(Arc::new(RejectEvenConfig { reject_even }) as Arc<dyn Any + Send + Sync>)
    }

    fn call(&self, _component: Component, data: &ModuleData, request: &mut Request) -> Rcode {
        let cfg = data
            .downcast_ref::<RejectEvenConfig>()
            .expect("reject_even instance data has unexpected type");
        let is_even = request.number % 2 == 0;
        if is_even == cfg.reject_even {
            Rcode::Reject
        } else {
            Rcode::Ok
        }
    }

    fn components(&self) -> &'static [Component] {
        SUPPORTED_COMPONENTS
    }
}
