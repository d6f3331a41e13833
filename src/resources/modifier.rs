//! Mutually-exclusive extra capabilities leased to one task at a time.
//!
//! A modifier such as GPU passthrough is declared with a `match` map of
//! minimum resource quantities and the arguments it appends to the VM start
//! command. At most one task holds a modifier at a time; acquisition never
//! waits, it falls over to the next candidate instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceModifierConfig {
    #[serde(rename = "match")]
    pub match_resources: HashMap<String, f64>,
    pub append: Vec<String>,
}

#[derive(Debug)]
pub struct ResourceModifier {
    match_resources: HashMap<String, f64>,
    append_args: Vec<String>,
    held: AtomicBool,
}

impl ResourceModifier {
    pub fn new(config: ResourceModifierConfig) -> Self {
        Self {
            match_resources: config.match_resources,
            append_args: config.append,
            held: AtomicBool::new(false),
        }
    }

    /// Every threshold must be met by the request. A missing request entry
    /// counts as zero.
    pub fn matches(&self, requested: &Resources) -> bool {
        self.match_resources
            .iter()
            .all(|(name, minimum)| requested.get(name) >= *minimum)
    }

    pub fn append_args(&self) -> &[String] {
        &self.append_args
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// A held modifier. Dropping the lease makes the modifier acquirable again.
#[derive(Debug)]
pub struct ModifierLease {
    modifier: Arc<ResourceModifier>,
}

impl ModifierLease {
    pub fn append_args(&self) -> &[String] {
        self.modifier.append_args()
    }
}

impl Drop for ModifierLease {
    fn drop(&mut self) {
        self.modifier.unlock();
    }
}

/// Ordered set of modifiers configured on this worker.
#[derive(Debug, Default)]
pub struct ResourceModifierManager {
    modifiers: Vec<Arc<ResourceModifier>>,
}

impl ResourceModifierManager {
    pub fn new(configs: Vec<ResourceModifierConfig>) -> Self {
        Self {
            modifiers: configs
                .into_iter()
                .map(|config| Arc::new(ResourceModifier::new(config)))
                .collect(),
        }
    }

    /// Acquire the first declared modifier that matches `requested` and is
    /// currently free.
    ///
    /// Returns `None` when nothing matches or every match is held; modifiers
    /// are optional, so this is not an error.
    pub fn acquire(&self, requested: &Resources) -> Option<ModifierLease> {
        for modifier in &self.modifiers {
            if !modifier.matches(requested) {
                continue;
            }
            if modifier.try_lock() {
                tracing::debug!(args = ?modifier.append_args(), "Acquired resource modifier");
                return Some(ModifierLease {
                    modifier: modifier.clone(),
                });
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.modifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modifiers.is_empty()
    }
}
