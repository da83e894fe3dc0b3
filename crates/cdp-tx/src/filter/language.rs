//! Language filter over detection results.

use std::collections::BTreeSet;

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, FilterFn, Row};
use serde::Deserialize;
use serde_json::Value;

/// A single language code or a list of codes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LanguageSet {
    One(String),
    Many(BTreeSet<String>),
}

impl LanguageSet {
    fn contains(&self, code: &str) -> bool {
        match self {
            Self::One(lang) => lang == code,
            Self::Many(langs) => langs.contains(code),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LanguageFilterParams {
    pub name: String,
    pub on: FieldPath,
    pub if_missing: bool,
    pub allowed_languages: LanguageSet,
    pub min_confidence: f64,
    /// Keep when any detected language matches (true) or require all of
    /// them to match (false)
    pub allow_partial_match: bool,
}

impl Default for LanguageFilterParams {
    fn default() -> Self {
        Self {
            name: "language_filter".to_owned(),
            on: FieldPath::new("metadata.language"),
            if_missing: false,
            allowed_languages: LanguageSet::One("en".to_owned()),
            min_confidence: 0.5,
            allow_partial_match: true,
        }
    }
}

/// Keeps rows whose detected languages match the allowed set with enough
/// confidence.
pub struct LanguageFilter {
    params: LanguageFilterParams,
}

impl LanguageFilter {
    pub fn new(params: LanguageFilterParams) -> Self {
        Self { params }
    }
}

fn as_string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

fn as_float_list(value: &Value) -> Vec<f64> {
    match value {
        Value::Number(n) => n.as_f64().into_iter().collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_f64).collect(),
        _ => Vec::new(),
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("filter", "language", "keep rows in allowed languages", |p| {
        Ok(cdp_core::Component::Filter(Box::new(LanguageFilter::new(
            parse_params("filter", "language", p)?,
        ))))
    });
}

#[async_trait]
impl FilterFn for LanguageFilter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn keep(&self, row: &Row) -> Result<bool, CdpError> {
        let Some(langs) = self.params.on.get(row).and_then(Value::as_object) else {
            return Ok(self.params.if_missing);
        };
        let names = langs.get("names").map(as_string_list).unwrap_or_default();
        let scores = langs.get("scores").map(as_float_list).unwrap_or_default();
        if names.is_empty() || scores.is_empty() {
            return Ok(self.params.if_missing);
        }
        let matches = names.iter().zip(&scores).map(|(name, score)| {
            self.params.allowed_languages.contains(name) && *score >= self.params.min_confidence
        });
        Ok(if self.params.allow_partial_match {
            matches.into_iter().any(|m| m)
        } else {
            matches.into_iter().all(|m| m)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Row {
        json!({
            "id": "0",
            "metadata": {"language": {"names": ["en", "de"], "scores": [0.9, 0.3]}}
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn filter(allow_partial_match: bool) -> LanguageFilter {
        LanguageFilter::new(LanguageFilterParams {
            allowed_languages: LanguageSet::Many(BTreeSet::from(["en".to_owned()])),
            min_confidence: 0.5,
            allow_partial_match,
            ..LanguageFilterParams::default()
        })
    }

    #[tokio::test]
    async fn partial_match_keeps_mixed_detection() {
        assert!(filter(true).keep(&row()).await.unwrap());
    }

    #[tokio::test]
    async fn full_match_drops_mixed_detection() {
        assert!(!filter(false).keep(&row()).await.unwrap());
    }

    #[tokio::test]
    async fn low_confidence_is_not_a_match() {
        let mut r = row();
        FieldPath::new("metadata.language.scores")
            .set(&mut r, json!([0.4, 0.3]))
            .unwrap();
        assert!(!filter(true).keep(&r).await.unwrap());
    }

    #[tokio::test]
    async fn missing_metadata_uses_if_missing() {
        let empty = Row::new();
        assert!(!filter(true).keep(&empty).await.unwrap());
        let permissive = LanguageFilter::new(LanguageFilterParams {
            if_missing: true,
            ..LanguageFilterParams::default()
        });
        assert!(permissive.keep(&empty).await.unwrap());
    }

    #[tokio::test]
    async fn scalar_name_and_score_accepted() {
        let r: Row = json!({
            "metadata": {"language": {"names": "en", "scores": 0.8}}
        })
        .as_object()
        .cloned()
        .unwrap();
        assert!(filter(true).keep(&r).await.unwrap());
    }
}
