//! Configuration and dictionary collaborators (§6).
//!
//! The core never parses configuration files itself; it reads already-parsed
//! values through [`ConfSection`] and allocates subtype enum values through
//! [`Dictionary`]. Both are deliberately minimal in-memory types — a real
//! embedding would back `ConfSection` with an actual file-format parser and
//! `Dictionary` with the RADIUS dictionary loader, neither of which is in
//! scope here.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// A `CONF_SECTION`-like read-only view: named pairs and named sub-sections.
///
/// Constructed programmatically (there is no file-format parser in this
/// crate); `name1` is the directive keyword (e.g. `"module"`), `name2` is the
/// optional instance name that follows it.
#[derive(Debug, Clone, Default)]
pub struct ConfSection {
    pub name1: String,
    pub name2: Option<String>,
    pairs: HashMap<String, String>,
    subsections: HashMap<String, ConfSection>,
    /// Source location, for error messages only.
    pub location: String,
}

impl ConfSection {
    pub fn new(name1: impl Into<String>, name2: Option<String>) -> Self {
        ConfSection {
            name1: name1.into(),
            name2,
            pairs: HashMap::new(),
            subsections: HashMap::new(),
            location: String::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn set_pair(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    pub fn add_subsection(&mut self, section: ConfSection) -> &mut Self {
        let key = section.name2.clone().unwrap_or_else(|| section.name1.clone());
        self.subsections.insert(key, section);
        self
    }

    /// `section_name1`/`section_name2` from §6: the resolved instance name.
    pub fn instance_name(&self) -> &str {
        self.name2.as_deref().unwrap_or(&self.name1)
    }

    pub fn pair_find(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    pub fn sub_find(&self, key: &str) -> Option<&ConfSection> {
        self.subsections.get(key)
    }

    pub fn item_iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Pass-2 (`xlat`-expanded) view. This crate has no templating language,
    /// so pass 2 is the identity of pass 1 — expansion is a collaborator
    /// concern that genuinely lives outside the dispatch core.
    pub fn expand(&self) -> ConfSection {
        self.clone()
    }
}

/// Reserved words that cannot be used as an instance name (§4.2 bootstrap step 1).
pub const RESERVED_WORDS: &[&str] = &["module", "type", "method"];

/// Integer-enum allocator for section subtypes (`Auth-Type`, `Autz-Type`, …).
///
/// One [`Dictionary`] instance is scoped to one attribute name (e.g.
/// `"Auth-Type"`); the registry of which dictionary covers which attribute is
/// the caller's concern, not this type's.
pub struct Dictionary {
    next_value: Mutex<u32>,
    by_name: RwLock<HashMap<String, u32>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary {
            // 0 is reserved for the default section (§4.3).
            next_value: Mutex::new(1),
            by_name: RwLock::new(HashMap::new()),
        }
    }

    /// Reuse the existing value for `name`, or synthesize and register a new
    /// non-zero one. Idempotent: calling twice with the same name returns the
    /// same value (§8 round-trip property).
    pub fn value_for(&self, name: &str) -> u32 {
        if let Some(v) = self.by_name.read().expect("dictionary poisoned").get(name) {
            return *v;
        }
        let mut by_name = self.by_name.write().expect("dictionary poisoned");
        if let Some(v) = by_name.get(name) {
            return *v;
        }
        let mut next = self.next_value.lock().expect("dictionary poisoned");
        let v = *next;
        *next += 1;
        by_name.insert(name.to_string(), v);
        v
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}
