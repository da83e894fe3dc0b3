//! Token-count and length taggers.

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tiktoken_rs::CoreBPE;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TokenCountParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    /// BPE encoding id: cl100k_base, p50k_base, r50k_base or o200k_base
    pub encoding: String,
}

impl Default for TokenCountParams {
    fn default() -> Self {
        Self {
            name: "token_count_tagger".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("metadata.token_count"),
            encoding: "cl100k_base".to_owned(),
        }
    }
}

/// Counts subword tokens with a BPE encoding, initialized lazily on the
/// first row and shared read-only afterwards.
#[derive(Debug)]
pub struct TokenCountTagger {
    params: TokenCountParams,
    bpe: OnceCell<CoreBPE>,
}

impl TokenCountTagger {
    pub fn new(params: TokenCountParams) -> Result<Self, CdpError> {
        match params.encoding.as_str() {
            "cl100k_base" | "p50k_base" | "r50k_base" | "o200k_base" => {}
            other => {
                return Err(CdpError::config(
                    "tag.token_count",
                    format!("unknown encoding '{other}'"),
                ))
            }
        }
        Ok(Self { params, bpe: OnceCell::new() })
    }

    fn encoder(&self) -> Result<&CoreBPE, CdpError> {
        self.bpe.get_or_try_init(|| {
            let loaded = match self.params.encoding.as_str() {
                "cl100k_base" => tiktoken_rs::cl100k_base(),
                "p50k_base" => tiktoken_rs::p50k_base(),
                "r50k_base" => tiktoken_rs::r50k_base(),
                _ => tiktoken_rs::o200k_base(),
            };
            loaded.map_err(|e| CdpError::permanent("tokenizer", e.to_string()))
        })
    }
}

#[async_trait]
impl MapFn for TokenCountTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let count = match self.params.on.get_str(row) {
            None | Some("") => 0,
            Some(text) => self.encoder()?.encode_ordinary(text).len(),
        };
        self.params.to.set(row, json!(count))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LengthTaggerParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    pub count_characters: bool,
    pub count_words: bool,
    pub count_lines: bool,
    pub count_paragraphs: bool,
    pub word_delimiter: String,
}

impl Default for LengthTaggerParams {
    fn default() -> Self {
        Self {
            name: "length_tagger".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("metadata.length"),
            count_characters: true,
            count_words: true,
            count_lines: true,
            count_paragraphs: false,
            word_delimiter: " ".to_owned(),
        }
    }
}

/// Character, word, line and paragraph counts.
pub struct LengthTagger {
    params: LengthTaggerParams,
}

impl LengthTagger {
    pub fn new(params: LengthTaggerParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl MapFn for LengthTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let text = self.params.on.get_str(row).unwrap_or("");
        let mut stats = Map::new();
        if self.params.count_characters {
            stats.insert("char_count".into(), json!(text.chars().count()));
        }
        if self.params.count_words {
            let words = if text.is_empty() {
                0
            } else {
                text.split(self.params.word_delimiter.as_str())
                    .filter(|w| !w.trim().is_empty())
                    .count()
            };
            stats.insert("word_count".into(), json!(words));
        }
        if self.params.count_lines {
            let lines = if text.is_empty() { 0 } else { text.matches('\n').count() + 1 };
            stats.insert("line_count".into(), json!(lines));
        }
        if self.params.count_paragraphs {
            let paragraphs = text.split("\n\n").filter(|p| !p.trim().is_empty()).count();
            stats.insert("paragraph_count".into(), json!(paragraphs));
        }
        self.params.to.set(row, Value::Object(stats))
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("tag", "token_count", "subword token counts", |p| {
        Ok(cdp_core::Component::Map(Box::new(TokenCountTagger::new(
            parse_params("tag", "token_count", p)?,
        )?)))
    });
    registry.register("tag", "length", "character/word/line counts", |p| {
        Ok(cdp_core::Component::Map(Box::new(LengthTagger::new(
            parse_params("tag", "length", p)?,
        ))))
    });
}
