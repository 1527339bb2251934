//! The module contract (§4.4) and the compiled call tree (§4.3) it is invoked
//! through.
//!
//! A module code is modeled as a `ModuleDriver` trait object rather than a
//! raw C function-pointer table, since the crate's own call sites are pure
//! Rust; a genuinely dynamically-loaded module still exports a C ABI symbol,
//! but [`crate::registry::ModuleRegistry`] wraps whatever it resolves in the
//! same trait object before the dispatcher ever sees it, so dynamic and
//! host-embedded modules are indistinguishable past the registry.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::confsection::ConfSection;
use crate::error::CoreError;
use crate::instance::InstanceArena;
use crate::types::{Component, Request, Rcode};

/// Opaque per-instance private data, snapshotted at call time (§4.4 point 3):
/// a racing HUP swap replaces the instance's pointer, never the `Arc` a
/// caller already captured, so one in-flight call always sees one buffer.
pub type ModuleData = Arc<dyn Any + Send + Sync>;

/// `THREAD_UNSAFE` / `HUP_SAFE` flag set from §4.1/§4.2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleFlags {
    pub thread_unsafe: bool,
    pub hup_safe: bool,
}

/// What a module code actually implements, standing in for the C side's
/// nullable function pointers.
pub trait ModuleDriver: Send + Sync {
    /// Pass-1 bootstrap: produce the instance's initial private data from
    /// unexpanded configuration. Returning `Err` is fatal for the instance.
    ///
    /// Default: no private data, always succeeds — the shape for modules
    /// that declare no `bootstrap` (`has_bootstrap` on [`ModuleCode`] tracks
    /// whether this default is actually in use, for HUP gating purposes).
    fn bootstrap(&self, _cfg: &ConfSection) -> Result<ModuleData, String> {
        Ok(Arc::new(()))
    }

    /// Pass-2 (xlat-expanded) instantiate. Called once at first instantiation
    /// and again, producing a fresh buffer, on every successful HUP.
    fn instantiate(&self, _cfg: &ConfSection, bootstrapped: &ModuleData) -> Result<ModuleData, String> {
        Ok(Arc::clone(bootstrapped))
    }

    /// Invoke the module for one component. `data` is the snapshot captured
    /// by the caller before this call began.
    fn call(&self, component: Component, data: &ModuleData, request: &mut Request) -> Rcode;

    /// Components this module actually registers a callback for. A call for
    /// any other component is a configuration error upstream of this trait.
    fn components(&self) -> &'static [Component];
}

/// Immutable descriptor for a loaded module, keyed by name in the registry.
pub struct ModuleCode {
    pub name: String,
    pub abi_magic: u64,
    pub flags: ModuleFlags,
    pub has_bootstrap: bool,
    pub has_instantiate: bool,
    pub driver: Arc<dyn ModuleDriver>,
}

impl fmt::Debug for ModuleCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCode")
            .field("name", &self.name)
            .field("abi_magic", &format_args!("{:#x}", self.abi_magic))
            .field("flags", &self.flags)
            .finish()
    }
}

/// `{prefix, version, commit}` packed as a 64-bit magic (§4.1).
pub fn pack_abi(prefix: u16, version: u16, commit: u32) -> u64 {
    ((prefix as u64) << 48) | ((version as u64) << 32) | (commit as u64)
}

pub fn unpack_abi(magic: u64) -> (u16, u16, u32) {
    let prefix = (magic >> 48) as u16;
    let version = (magic >> 32) as u16;
    let commit = magic as u32;
    (prefix, version, commit)
}

/// The host's own ABI magic, which every loaded module must match exactly.
pub const HOST_ABI: u64 = {
    // prefix=1 ("radius"), version=1, commit=0 for this crate's build.
    ((1u64) << 48) | ((1u64) << 32)
};

/// A compiled, executable invocation tree (§4.3's "ModCallable").
pub trait ModCallable: Send + Sync {
    fn execute(&self, component: Component, request: &mut Request, instances: &InstanceArena) -> Rcode;
}

/// The external collaborator that turns configuration text into a
/// [`ModCallable`] tree. `unlang` parsing is out of scope; this crate ships
/// one trivial implementation, [`LiteralCallTree`], built programmatically.
pub trait SectionCompiler {
    fn compile(&self, cs: &ConfSection) -> Result<Box<dyn ModCallable>, CoreError>;
}

/// A literal, in-memory description of an invocation tree: group / load-balance /
/// redundant / redundant-load-balance / conditional / leaf, built directly
/// rather than parsed from `unlang` text.
pub enum CallNode {
    /// Invoke one module instance by name for the current component.
    Leaf(String),
    /// Execute children in order; stop at the first terminal (non-`Ok`,
    /// non-`Noop`) rcode and return it. All-`Noop` returns `Noop`.
    Group(Vec<CallNode>),
    /// Pick one child by round-robin and execute only it.
    LoadBalance(Vec<CallNode>),
    /// Try children in order, skipping any that return `Fail`; return the
    /// first non-`Fail` result, or `Fail` if all children failed.
    Redundant(Vec<CallNode>),
    /// Round-robin starting point, then redundant semantics from there.
    RedundantLoadBalance(Vec<CallNode>),
    /// Execute `then_branch` if `predicate(request)` holds, else `else_branch`.
    Conditional {
        predicate: Arc<dyn Fn(&Request) -> bool + Send + Sync>,
        then_branch: Box<CallNode>,
        else_branch: Box<CallNode>,
    },
}

impl CallNode {
    fn execute(
        &self,
        component: Component,
        request: &mut Request,
        instances: &InstanceArena,
        lb_counter: &std::sync::atomic::AtomicUsize,
    ) -> Rcode {
        use std::sync::atomic::Ordering;
        match self {
            CallNode::Leaf(name) => match instances.get(name) {
                Some(inst) => inst.invoke(component, request),
                None => Rcode::NotFound,
            },
            CallNode::Group(children) => {
                let mut last = Rcode::Noop;
                for child in children {
                    last = child.execute(component, request, instances, lb_counter);
                    if !matches!(last, Rcode::Ok | Rcode::Noop) {
                        return last;
                    }
                }
                last
            }
            CallNode::LoadBalance(children) => {
                if children.is_empty() {
                    return Rcode::Noop;
                }
                let i = lb_counter.fetch_add(1, Ordering::Relaxed) % children.len();
                children[i].execute(component, request, instances, lb_counter)
            }
            CallNode::Redundant(children) => {
                let mut last = Rcode::Fail;
                for child in children {
                    last = child.execute(component, request, instances, lb_counter);
                    if last != Rcode::Fail {
                        return last;
                    }
                }
                last
            }
            CallNode::RedundantLoadBalance(children) => {
                if children.is_empty() {
                    return Rcode::Noop;
                }
                let start = lb_counter.fetch_add(1, Ordering::Relaxed) % children.len();
                let mut last = Rcode::Fail;
                for offset in 0..children.len() {
                    let child = &children[(start + offset) % children.len()];
                    last = child.execute(component, request, instances, lb_counter);
                    if last != Rcode::Fail {
                        return last;
                    }
                }
                last
            }
            CallNode::Conditional {
                predicate,
                then_branch,
                else_branch,
            } => {
                if predicate(request) {
                    then_branch.execute(component, request, instances, lb_counter)
                } else {
                    else_branch.execute(component, request, instances, lb_counter)
                }
            }
        }
    }
}

/// Wraps a literal [`CallNode`] as an executable [`ModCallable`].
pub struct LiteralCallTree {
    root: CallNode,
    lb_counter: std::sync::atomic::AtomicUsize,
}

impl LiteralCallTree {
    pub fn new(root: CallNode) -> Self {
        LiteralCallTree {
            root,
            lb_counter: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn leaf(instance: impl Into<String>) -> Self {
        Self::new(CallNode::Leaf(instance.into()))
    }
}

impl ModCallable for LiteralCallTree {
    fn execute(&self, component: Component, request: &mut Request, instances: &InstanceArena) -> Rcode {
        self.root.execute(component, request, instances, &self.lb_counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_pack_unpack_roundtrip() {
        let magic = pack_abi(7, 3, 99);
        assert_eq!(unpack_abi(magic), (7, 3, 99));
    }

    #[test]
    fn host_abi_has_prefix_one() {
        let (prefix, _, _) = unpack_abi(HOST_ABI);
        assert_eq!(prefix, 1);
    }
}
