//! Component registry: `(category, type)` to constructor lookup.
//!
//! Configuration-driven pipelines need a stable, string-keyed extension
//! point that is validated before any data is touched. The registry is a
//! table of constructor functions; each constructor deserializes its own
//! parameter struct (with unknown fields denied) and returns a classified
//! [`Component`]. Registration under an existing key replaces the entry.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::CdpError;
use crate::ops::Component;

/// Constructor signature for registered components.
pub type Constructor = fn(&Map<String, Value>) -> Result<Component, CdpError>;

struct Entry {
    constructor: Constructor,
    summary: &'static str,
}

/// Registry of pipeline components keyed by `(category, type)`.
#[derive(Default)]
pub struct Registry {
    entries: BTreeMap<(String, String), Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. Idempotent: re-registering the same key
    /// replaces the previous entry.
    pub fn register(
        &mut self,
        category: &str,
        kind: &str,
        summary: &'static str,
        constructor: Constructor,
    ) {
        self.entries.insert(
            (category.to_owned(), kind.to_owned()),
            Entry { constructor, summary },
        );
    }

    pub fn contains(&self, category: &str, kind: &str) -> bool {
        self.entries
            .contains_key(&(category.to_owned(), kind.to_owned()))
    }

    /// Validate `params` and construct the component, or fail with a
    /// configuration error naming the offending key.
    pub fn construct(
        &self,
        category: &str,
        kind: &str,
        params: &Map<String, Value>,
    ) -> Result<Component, CdpError> {
        let entry = self
            .entries
            .get(&(category.to_owned(), kind.to_owned()))
            .ok_or_else(|| {
                let available: Vec<&str> = self
                    .entries
                    .keys()
                    .filter(|(c, _)| c == category)
                    .map(|(_, k)| k.as_str())
                    .collect();
                CdpError::config(
                    format!("{category}.{kind}"),
                    if available.is_empty() {
                        format!("unknown category '{category}'")
                    } else {
                        format!("unknown type '{kind}'; available: {available:?}")
                    },
                )
            })?;
        (entry.constructor)(params)
    }

    /// Enumerate registered `(category, type)` keys, optionally filtered.
    pub fn list(&self, category: Option<&str>) -> Vec<(String, String)> {
        self.entries
            .keys()
            .filter(|(c, _)| category.map_or(true, |want| c == want))
            .cloned()
            .collect()
    }

    /// Registered category names, deduplicated and sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self.entries.keys().map(|(c, _)| c.clone()).collect();
        cats.dedup();
        cats
    }

    /// One-line summary for a registered component, if present.
    pub fn summary(&self, category: &str, kind: &str) -> Option<&'static str> {
        self.entries
            .get(&(category.to_owned(), kind.to_owned()))
            .map(|e| e.summary)
    }
}

/// Deserialize a component's parameter struct from its raw param map,
/// mapping serde failures to a configuration error at `category.kind`.
pub fn parse_params<T: DeserializeOwned>(
    category: &str,
    kind: &str,
    params: &Map<String, Value>,
) -> Result<T, CdpError> {
    serde_json::from_value(Value::Object(params.clone()))
        .map_err(|e| CdpError::config(format!("{category}.{kind}"), e.to_string()))
}
