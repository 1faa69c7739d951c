//! Long-term store boundary for background retrievals.
//!
//! Retrievals run on worker threads, so stores speak plain strings and must
//! be `Send + Sync`. The agent turns a result back into working memory at its
//! next input phase.

use std::collections::BTreeMap;

use dashmap::DashMap;

/// Attribute/value pairs of one stored record.
pub type Record = Vec<(String, String)>;

pub trait LongTermStore: Send + Sync {
    /// Find the record best matching `cue`.
    fn retrieve(&self, cue: &str) -> Option<Record>;

    /// Add an attribute to the record stored under `key`.
    fn store(&self, key: &str, attr: &str, value: &str);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory store keyed by name.
///
/// A cue matches the record with that key, else the lowest-keyed record
/// holding the cue as one of its values.
#[derive(Debug, Default)]
pub struct AssociativeStore {
    records: DashMap<String, Record>,
}

impl AssociativeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LongTermStore for AssociativeStore {
    fn retrieve(&self, cue: &str) -> Option<Record> {
        if let Some(r) = self.records.get(cue) {
            return Some(r.clone());
        }
        let matches: BTreeMap<String, Record> = self
            .records
            .iter()
            .filter(|e| e.value().iter().any(|(_, v)| v == cue))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        matches.into_values().next()
    }

    fn store(&self, key: &str, attr: &str, value: &str) {
        let mut record = self.records.entry(key.to_string()).or_default();
        let pair = (attr.to_string(), value.to_string());
        if !record.contains(&pair) {
            record.push(pair);
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
