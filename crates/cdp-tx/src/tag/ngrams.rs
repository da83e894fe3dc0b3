//! N-gram count tagger.

use std::collections::HashMap;

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

// Split on runs of ASCII punctuation and whitespace
static TOKEN_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[[:punct:][:space:]]+").expect("static pattern"));

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NgramsTaggerParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    /// The gram size to count
    pub ngram_size: usize,
    /// Keep only the top k counts; null keeps all
    pub top_k: Option<usize>,
}

impl Default for NgramsTaggerParams {
    fn default() -> Self {
        Self {
            name: "ngram_tagger".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("metadata.ngrams"),
            ngram_size: 5,
            top_k: None,
        }
    }
}

/// Writes `[gram, count]` pairs ordered by descending count (ties by first
/// appearance) to the target path.
pub struct NgramsTagger {
    params: NgramsTaggerParams,
}

impl NgramsTagger {
    pub fn new(params: NgramsTaggerParams) -> Self {
        Self { params }
    }

    fn counts(&self, text: &str) -> Vec<(String, usize)> {
        let words: Vec<&str> = TOKEN_SPLIT.split(text).filter(|w| !w.is_empty()).collect();
        let n = self.params.ngram_size;
        if words.len() < n {
            return Vec::new();
        }
        let grams: Vec<String> = words.windows(n).map(|w| w.join(" ")).collect();
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for (index, gram) in grams.iter().enumerate() {
            let entry = counts.entry(gram.as_str()).or_insert((0, index));
            entry.0 += 1;
        }
        let mut ranked: Vec<(String, usize, usize)> = counts
            .into_iter()
            .map(|(gram, (count, first))| (gram.to_owned(), count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        let take = self.params.top_k.unwrap_or(ranked.len());
        ranked.into_iter().take(take).map(|(gram, count, _)| (gram, count)).collect()
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("tag", "ngrams", "n-gram counts", |p| {
        Ok(cdp_core::Component::Map(Box::new(NgramsTagger::new(
            parse_params("tag", "ngrams", p)?,
        ))))
    });
}

#[async_trait]
impl MapFn for NgramsTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let value = match self.params.on.get_str(row) {
            Some(text) if !text.trim().is_empty() => Value::Array(
                self.counts(text)
                    .into_iter()
                    .map(|(gram, count)| json!([gram, count]))
                    .collect(),
            ),
            _ => Value::Array(Vec::new()),
        };
        self.params.to.set(row, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagger(ngram_size: usize, top_k: Option<usize>) -> NgramsTagger {
        NgramsTagger::new(NgramsTaggerParams { ngram_size, top_k, ..NgramsTaggerParams::default() })
    }

    #[test]
    fn counts_bigrams_with_punctuation_split() {
        let counts = tagger(2, None).counts("red cat, red cat. blue dog");
        assert_eq!(counts[0], ("red cat".to_owned(), 2));
        assert!(counts.contains(&("cat red".to_owned(), 1)));
        assert!(counts.contains(&("blue dog".to_owned(), 1)));
    }

    #[test]
    fn top_k_limits_output() {
        let counts = tagger(1, Some(1)).counts("a a a b b c");
        assert_eq!(counts, vec![("a".to_owned(), 3)]);
    }

    #[test]
    fn short_text_yields_nothing() {
        assert!(tagger(5, None).counts("only four words here").is_empty());
    }

    #[tokio::test]
    async fn empty_text_writes_empty_list() {
        let t = tagger(2, None);
        let mut row = Row::new();
        row.insert("text".into(), json!(""));
        t.apply(&mut row).await.unwrap();
        assert_eq!(FieldPath::new("metadata.ngrams").get(&row), Some(&json!([])));
    }
}
