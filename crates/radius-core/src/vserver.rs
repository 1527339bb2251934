//! Virtual server bundles and the dispatch entry point (§4.3).
//!
//! A server owns, per [`Component`], a default compiled tree (index 0) and
//! zero or more named sub-block trees keyed by a dictionary-assigned integer
//! value. The server itself is immutable after bootstrap; HUP replaces
//! module instance data, never this structure.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::confsection::Dictionary;
use crate::contract::ModCallable;
use crate::error::{CoreError, CoreResult};
use crate::instance::InstanceArena;
use crate::types::{Component, Request, Rcode};

pub struct VirtualServer {
    pub name: String,
    default_trees: RwLock<HashMap<Component, Arc<dyn ModCallable>>>,
    indexed_trees: RwLock<HashMap<(Component, u32), Arc<dyn ModCallable>>>,
    /// One subtype-name allocator per component (`Auth-Type`, `Autz-Type`, …
    /// are conceptually distinct dictionaries; scoping one per component here
    /// gets the same non-collision behavior without a global attribute table).
    dictionaries: RwLock<HashMap<Component, Arc<Dictionary>>>,
}

impl VirtualServer {
    pub fn new(name: impl Into<String>) -> Self {
        VirtualServer {
            name: name.into(),
            default_trees: RwLock::new(HashMap::new()),
            indexed_trees: RwLock::new(HashMap::new()),
            dictionaries: RwLock::new(HashMap::new()),
        }
    }

    fn dictionary_for(&self, component: Component) -> Arc<Dictionary> {
        if let Some(d) = self.dictionaries.read().expect("vserver poisoned").get(&component) {
            return Arc::clone(d);
        }
        let mut dicts = self.dictionaries.write().expect("vserver poisoned");
        Arc::clone(dicts.entry(component).or_insert_with(|| Arc::new(Dictionary::new())))
    }

    /// Register (or replace) the default (index-0) tree for `component`.
    /// Index 0 is idempotent by construction (§4.3): re-registering simply
    /// replaces the prior tree rather than erroring.
    pub fn set_default(&self, component: Component, tree: Arc<dyn ModCallable>) {
        self.default_trees.write().expect("vserver poisoned").insert(component, tree);
    }

    /// Reuse or allocate the integer value for a named sub-block without yet
    /// attaching a tree to it (useful for forward references during
    /// compilation). Idempotent (§8 round-trip property).
    pub fn subtype_value(&self, component: Component, subtype_name: &str) -> u32 {
        self.dictionary_for(component).value_for(subtype_name)
    }

    /// Register a named sub-block's compiled tree (`Auth-Type PAP { … }`).
    /// Errors if a tree already exists for the resolved index (§4.3: "attempts
    /// to create a non-default sub-block under an existing index are errors").
    pub fn add_subtype(&self, component: Component, subtype_name: &str, tree: Arc<dyn ModCallable>) -> CoreResult<u32> {
        let value = self.subtype_value(component, subtype_name);
        let mut trees = self.indexed_trees.write().expect("vserver poisoned");
        if trees.contains_key(&(component, value)) {
            return Err(CoreError::Config {
                message: format!(
                    "duplicate sub-block {subtype_name:?} (index {value}) for component {}",
                    component.name()
                ),
            });
        }
        trees.insert((component, value), tree);
        Ok(value)
    }

    /// `indexed_modcall(component, index, Request) → rcode` (§4.3).
    pub fn indexed_modcall(&self, component: Component, index: u32, request: &mut Request, instances: &InstanceArena) -> Rcode {
        let tree = if index == 0 {
            self.default_trees.read().expect("vserver poisoned").get(&component).cloned()
        } else {
            self.indexed_trees.read().expect("vserver poisoned").get(&(component, index)).cloned()
        };

        let tree = match tree {
            Some(t) => t,
            None => {
                debug!(server = %self.name, component = component.name(), index, "no compiled tree for section");
                return Rcode::Noop;
            }
        };

        request.component = Some(component.name());
        request.module = None;
        let rcode = tree.execute(component, request, instances);
        request.component = Some("<core>");
        rcode
    }
}

/// Resolve `request.server` to a [`VirtualServer`] and dispatch through it.
/// Missing server → `Rcode::Fail` (§4.3 step 1).
pub fn dispatch(
    servers: &HashMap<String, Arc<VirtualServer>>,
    instances: &InstanceArena,
    component: Component,
    index: u32,
    request: &mut Request,
) -> Rcode {
    match servers.get(&request.server) {
        Some(server) => server.indexed_modcall(component, index, request, instances),
        None => Rcode::Fail,
    }
}
