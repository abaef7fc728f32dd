//! Fact table
//!
//! Flat, immutable mapping of probe keys to string values. Built once at the
//! start of a run; extending it (custom rule script output) yields a new
//! table, the original stays untouched.

use crate::probe::{Fact, ProbeSource};
use serde::Serialize;
use std::collections::BTreeMap;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FactTable {
    facts: BTreeMap<String, String>,
}

impl FactTable {
    /// Probe every known fact.
    ///
    /// Probe errors and empty answers leave the fact absent; they are logged
    /// and never fail the build.
    pub fn build(probe: &dyn ProbeSource) -> Self {
        let mut facts = BTreeMap::new();
        for fact in Fact::iter() {
            match probe.probe(fact) {
                Ok(Some(value)) if !value.is_empty() => {
                    debug!("fact {} = {}", fact, value);
                    facts.insert(fact.key(), value);
                }
                Ok(_) => debug!("fact {} is absent", fact),
                Err(e) => warn!("Could not probe {}: {}", fact, e),
            }
        }
        info!("Probed {} facts", facts.len());
        Self { facts }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            facts: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Value of a fact; `None` when absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.facts.get(key).map(String::as_str)
    }

    /// A copy of this table with one more fact.
    pub fn with_fact(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut facts = self.facts.clone();
        facts.insert(key.into(), value.into());
        Self { facts }
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.facts.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
