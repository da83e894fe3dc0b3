//! Generic value and existence filters.

use std::cmp::Ordering;

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, FilterFn, Row};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    /// The configured value is contained in the row value
    Inl,
    /// The row value is contained in the configured value
    Inr,
    /// Negation of `inl`
    Ninl,
    /// Negation of `inr`
    Ninr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueFilterParams {
    #[serde(default = "default_name")]
    pub name: String,
    pub on: FieldPath,
    #[serde(default)]
    pub if_missing: bool,
    /// Value to compare against
    pub value: Value,
    #[serde(default = "default_comparator")]
    pub comparator: Comparator,
}

fn default_name() -> String {
    "value_filter".to_owned()
}

fn default_comparator() -> Comparator {
    Comparator::Eq
}

/// Compares a row field against a configured value.
pub struct ValueFilter {
    params: ValueFilterParams,
}

impl ValueFilter {
    pub fn new(params: ValueFilterParams) -> Self {
        Self { params }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Membership: is `needle` contained in `haystack`?
fn contained_in(needle: &Value, haystack: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.contains(needle),
        Value::String(s) => needle.as_str().map_or(false, |n| s.contains(n)),
        Value::Object(map) => needle.as_str().map_or(false, |n| map.contains_key(n)),
        _ => false,
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("filter", "value", "compare a field against a value", |p| {
        Ok(cdp_core::Component::Filter(Box::new(ValueFilter::new(
            parse_params("filter", "value", p)?,
        ))))
    });
    registry.register("filter", "exists", "keep rows where a field is present", |p| {
        Ok(cdp_core::Component::Filter(Box::new(ExistsFilter::new(
            parse_params("filter", "exists", p)?,
        ))))
    });
}

#[async_trait]
impl FilterFn for ValueFilter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn keep(&self, row: &Row) -> Result<bool, CdpError> {
        let Some(got) = self.params.on.get(row).filter(|v| !v.is_null()) else {
            return Ok(self.params.if_missing);
        };
        let want = &self.params.value;
        let result = match self.params.comparator {
            Comparator::Eq => got == want,
            Comparator::Neq => got != want,
            Comparator::Gt => compare(got, want) == Some(Ordering::Greater),
            Comparator::Lt => compare(got, want) == Some(Ordering::Less),
            Comparator::Gte => matches!(compare(got, want), Some(Ordering::Greater | Ordering::Equal)),
            Comparator::Lte => matches!(compare(got, want), Some(Ordering::Less | Ordering::Equal)),
            Comparator::Inl => contained_in(want, got),
            Comparator::Inr => contained_in(got, want),
            Comparator::Ninl => !contained_in(want, got),
            Comparator::Ninr => !contained_in(got, want),
        };
        Ok(result)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExistsFilterParams {
    #[serde(default = "default_exists_name")]
    pub name: String,
    pub on: FieldPath,
}

fn default_exists_name() -> String {
    "exists_filter".to_owned()
}

/// Keeps rows where the field exists and is not null.
pub struct ExistsFilter {
    params: ExistsFilterParams,
}

impl ExistsFilter {
    pub fn new(params: ExistsFilterParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FilterFn for ExistsFilter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn keep(&self, row: &Row) -> Result<bool, CdpError> {
        Ok(self.params.on.get(row).map_or(false, |v| !v.is_null()))
    }
}
