//! Language detection tagger.
//!
//! Writes `{names: [...], scores: [...]}` to the target path. The trigram
//! detector is embedded and immutable, so unlike the model-backed taggers
//! there is nothing to load lazily. Codes are ISO 639-3 (`eng`, `deu`, ...).

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LanguageTaggerParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    /// Maximum number of characters fed to the detector
    pub max_chars: usize,
    /// Predictions below this confidence collapse to `unknown`
    pub confidence_threshold: f64,
}

impl Default for LanguageTaggerParams {
    fn default() -> Self {
        Self {
            name: "language_tagger".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("metadata.language"),
            max_chars: 4096,
            confidence_threshold: 0.0,
        }
    }
}

pub struct LanguageTagger {
    params: LanguageTaggerParams,
}

impl LanguageTagger {
    pub fn new(params: LanguageTaggerParams) -> Self {
        Self { params }
    }

    fn unknown() -> Value {
        json!({"names": ["unknown"], "scores": [0.0]})
    }

    fn detect(&self, text: &str) -> Value {
        // The detector expects a single line
        let flattened = text.replace('\n', " ");
        let flattened = flattened.trim();
        let truncated: String = flattened.chars().take(self.params.max_chars).collect();
        match whatlang::detect(&truncated) {
            Some(info) if info.confidence() >= self.params.confidence_threshold => {
                json!({
                    "names": [info.lang().code()],
                    "scores": [info.confidence()],
                })
            }
            _ => Self::unknown(),
        }
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("tag", "language", "language detection", |p| {
        Ok(cdp_core::Component::Map(Box::new(LanguageTagger::new(
            parse_params("tag", "language", p)?,
        ))))
    });
}

#[async_trait]
impl MapFn for LanguageTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let result = match self.params.on.get_str(row) {
            Some(text) if !text.trim().is_empty() => self.detect(text),
            _ => Self::unknown(),
        };
        self.params.to.set(row, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn tag(text: &str) -> Value {
        let tagger = LanguageTagger::new(LanguageTaggerParams::default());
        let mut row = Row::new();
        row.insert("text".into(), json!(text));
        tagger.apply(&mut row).await.unwrap();
        FieldPath::new("metadata.language").get(&row).cloned().unwrap()
    }

    #[tokio::test]
    async fn detects_english() {
        let result = tag(
            "The quick brown fox jumps over the lazy dog and keeps running \
             through the quiet English countryside until the evening comes.",
        )
        .await;
        assert_eq!(result["names"][0], json!("eng"));
        assert!(result["scores"][0].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn detects_german() {
        let result = tag(
            "Der schnelle braune Fuchs springt über den faulen Hund und läuft \
             weiter durch die ruhige deutsche Landschaft bis zum Abend.",
        )
        .await;
        assert_eq!(result["names"][0], json!("deu"));
    }

    #[tokio::test]
    async fn empty_text_is_unknown() {
        let result = tag("   \n ").await;
        assert_eq!(result, json!({"names": ["unknown"], "scores": [0.0]}));
    }

    #[tokio::test]
    async fn high_threshold_collapses_to_unknown() {
        let tagger = LanguageTagger::new(LanguageTaggerParams {
            confidence_threshold: 1.1, // impossible to satisfy
            ..LanguageTaggerParams::default()
        });
        let mut row = Row::new();
        row.insert("text".into(), json!("some ordinary english sentence"));
        tagger.apply(&mut row).await.unwrap();
        let result = FieldPath::new("metadata.language").get(&row).unwrap();
        assert_eq!(result["names"][0], json!("unknown"));
    }
}
