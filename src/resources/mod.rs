//! Resource accounting for tasks running on this worker.
//!
//! Resources are an open-ended `name -> quantity` map (e.g.
//! `{"tart-vms": 1, "gpu": 0.5}`). The worker reports the sum held by its
//! running tasks and the standby reservation on every poll.

pub mod modifier;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use modifier::{ModifierLease, ResourceModifier, ResourceModifierConfig, ResourceModifierManager};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(HashMap<String, f64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, quantity: f64) -> Self {
        self.0.insert(name.into(), quantity);
        self
    }

    /// Quantity of `name`, a missing entry counting as zero.
    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn add(&mut self, other: &Resources) {
        for (name, quantity) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0.0) += quantity;
        }
    }

    /// Subtract `other` from the names this map tracks. Names it does not
    /// track stay unconstrained.
    pub fn subtract(&mut self, other: &Resources) {
        for (name, quantity) in &other.0 {
            if let Some(available) = self.0.get_mut(name) {
                *available -= quantity;
            }
        }
    }

    /// Whether `request` fits into these resources.
    ///
    /// Only names present in both maps are constrained; a request for a
    /// resource this map does not track is not limited by it.
    pub fn can_fit(&self, request: &Resources) -> bool {
        request
            .0
            .iter()
            .all(|(name, quantity)| match self.0.get(name) {
                Some(available) => available >= quantity,
                None => true,
            })
    }

    pub fn into_map(self) -> HashMap<String, f64> {
        self.0
    }
}

impl From<HashMap<String, f64>> for Resources {
    fn from(map: HashMap<String, f64>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, f64)> for Resources {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
