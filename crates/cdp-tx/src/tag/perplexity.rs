//! Perplexity tagger.
//!
//! Scores text against an ARPA-format backoff n-gram language model after a
//! cc_net-style normalization pass, optionally segmenting words with a
//! SentencePiece-style unigram vocabulary. Writes the normalized perplexity
//! `10^(-sum log10 P / N)` with `N = token count + 1` per line; any model or
//! tokenizer failure yields `-1`.
//!
//! Models are loaded lazily on the first row and shared read-only between
//! workers; fetching model files is out of scope, the paths point at local
//! artifacts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use once_cell::sync::{Lazy, OnceCell};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Unicode punctuation remapping applied before scoring.
static UNICODE_PUNCT: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ('，', ","),
        ('。', "."),
        ('、', ","),
        ('„', "\""),
        ('”', "\""),
        ('“', "\""),
        ('«', "\""),
        ('»', "\""),
        ('１', "\""),
        ('」', "\""),
        ('「', "\""),
        ('《', "\""),
        ('》', "\""),
        ('´', "'"),
        ('∶', ":"),
        ('：', ":"),
        ('？', "?"),
        ('！', "!"),
        ('（', "("),
        ('）', ")"),
        ('；', ";"),
        ('–', "-"),
        ('—', " - "),
        ('．', ". "),
        ('～', "~"),
        ('’', "'"),
        ('…', "..."),
        ('━', "-"),
        ('〈', "<"),
        ('〉', ">"),
        ('【', "["),
        ('】', "]"),
        ('％', "%"),
        ('►', "-"),
    ])
});

fn is_non_printing(c: char) -> bool {
    let code = c as u32;
    code < 32 || (127..=159).contains(&code)
}

/// Text normalization ahead of language-model scoring.
#[derive(Debug, Clone)]
pub struct Normalization {
    pub lower_case: bool,
    pub remove_accents: bool,
    pub normalize_numbers: bool,
    /// 0 = keep, 1 = remap unicode punctuation, 2 = strip it
    pub punctuation: u8,
}

impl Default for Normalization {
    fn default() -> Self {
        Self { lower_case: false, remove_accents: false, normalize_numbers: true, punctuation: 1 }
    }
}

impl Normalization {
    pub fn apply(&self, line: &str) -> String {
        let line = line.trim();
        if line.is_empty() {
            return String::new();
        }
        let mut text = line.to_owned();
        if self.lower_case {
            text = text.to_lowercase();
        }
        if self.remove_accents {
            text = text.nfd().filter(|c| !is_combining_mark(*c)).collect();
        }
        if self.normalize_numbers {
            text = text.chars().map(|c| if c.is_numeric() { '0' } else { c }).collect();
        }
        match self.punctuation {
            1 => {
                text = text
                    .chars()
                    .map(|c| UNICODE_PUNCT.get(&c).map(|s| (*s).to_owned()).unwrap_or_else(|| c.to_string()))
                    .collect();
            }
            2 => {
                text = text.chars().filter(|c| !UNICODE_PUNCT.contains_key(c)).collect();
            }
            _ => {}
        }
        text.chars().filter(|c| !is_non_printing(*c)).collect()
    }
}

/// Backoff n-gram language model parsed from a textual ARPA file.
///
/// Probabilities and backoff weights are log10, as in the file format.
pub struct ArpaModel {
    ngrams: HashMap<String, (f64, f64)>,
    order: usize,
}

const UNKNOWN_LOG10: f64 = -7.0;

impl ArpaModel {
    pub fn load(path: &str) -> Result<Self, CdpError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CdpError::permanent("arpa", format!("{path}: {e}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, CdpError> {
        let mut ngrams = HashMap::new();
        let mut order = 0usize;
        let mut current: Option<usize> = None;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line == "\\data\\" || line.starts_with("ngram ") {
                continue;
            }
            if line == "\\end\\" {
                break;
            }
            if let Some(rest) = line.strip_prefix('\\') {
                if let Some(n) = rest.strip_suffix("-grams:").and_then(|n| n.parse::<usize>().ok())
                {
                    current = Some(n);
                    order = order.max(n);
                    continue;
                }
            }
            let Some(n) = current else { continue };
            let mut fields = line.split('\t');
            let (Some(prob), Some(words)) = (fields.next(), fields.next()) else {
                return Err(CdpError::permanent("arpa", format!("malformed {n}-gram line: {line}")));
            };
            let prob: f64 = prob
                .parse()
                .map_err(|_| CdpError::permanent("arpa", format!("bad probability in: {line}")))?;
            let backoff: f64 = fields.next().and_then(|b| b.parse().ok()).unwrap_or(0.0);
            ngrams.insert(words.to_owned(), (prob, backoff));
        }
        if ngrams.is_empty() || order == 0 {
            return Err(CdpError::permanent("arpa", "no n-gram sections found"));
        }
        Ok(Self { ngrams, order })
    }

    fn backoff(&self, context: &[&str]) -> f64 {
        self.ngrams.get(&context.join(" ")).map(|(_, b)| *b).unwrap_or(0.0)
    }

    /// log10 P(word | context), backing off through shorter contexts.
    fn word_prob(&self, context: &[&str], word: &str) -> f64 {
        let mut key = context.join(" ");
        if !key.is_empty() {
            key.push(' ');
        }
        key.push_str(word);
        if let Some((prob, _)) = self.ngrams.get(&key) {
            return *prob;
        }
        if context.is_empty() {
            return self
                .ngrams
                .get("<unk>")
                .map(|(p, _)| *p)
                .unwrap_or(UNKNOWN_LOG10);
        }
        self.backoff(context) + self.word_prob(&context[1..], word)
    }

    /// Total log10 probability of a sentence with implicit `<s>`/`</s>`.
    pub fn score(&self, line: &str) -> f64 {
        let mut words: Vec<&str> = vec!["<s>"];
        words.extend(line.split_whitespace());
        words.push("</s>");
        let mut total = 0.0;
        for i in 1..words.len() {
            let start = i.saturating_sub(self.order - 1);
            total += self.word_prob(&words[start..i], words[i]);
        }
        total
    }
}

/// Greedy longest-match segmentation over a SentencePiece unigram vocab.
///
/// Words get the `▁` whitespace marker prepended; characters not covered by
/// any piece are emitted as single-character pieces.
pub struct SpVocab {
    pieces: HashSet<String>,
    max_piece_chars: usize,
}

impl SpVocab {
    pub fn load(path: &str) -> Result<Self, CdpError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CdpError::permanent("sp-vocab", format!("{path}: {e}")))?;
        let pieces: HashSet<String> = raw
            .lines()
            .filter_map(|l| l.split('\t').next())
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect();
        if pieces.is_empty() {
            return Err(CdpError::permanent("sp-vocab", format!("{path}: empty vocabulary")));
        }
        let max_piece_chars = pieces.iter().map(|p| p.chars().count()).max().unwrap_or(1);
        Ok(Self { pieces, max_piece_chars })
    }

    pub fn tokenize(&self, text: &str) -> String {
        let mut out: Vec<String> = Vec::new();
        for word in text.split_whitespace() {
            let marked: Vec<char> = format!("\u{2581}{word}").chars().collect();
            let mut pos = 0;
            while pos < marked.len() {
                let limit = (marked.len() - pos).min(self.max_piece_chars);
                let mut matched = None;
                for len in (1..=limit).rev() {
                    let candidate: String = marked[pos..pos + len].iter().collect();
                    if self.pieces.contains(&candidate) {
                        matched = Some((candidate, len));
                        break;
                    }
                }
                match matched {
                    Some((piece, len)) => {
                        out.push(piece);
                        pos += len;
                    }
                    None => {
                        out.push(marked[pos].to_string());
                        pos += 1;
                    }
                }
            }
        }
        out.join(" ")
    }
}

struct LoadedModel {
    model: ArpaModel,
    vocab: Option<SpVocab>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PerplexityParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    /// Local path to the ARPA model file
    pub model_path: Option<String>,
    /// Local path to the SentencePiece vocab (TSV piece/logprob); absent
    /// falls back to whitespace tokens
    pub vocab_path: Option<String>,
    /// Maximum characters scored per document
    pub max_chars: usize,
    pub lower_case: bool,
    pub remove_accents: bool,
    pub normalize_numbers: bool,
    pub punctuation: u8,
}

impl Default for PerplexityParams {
    fn default() -> Self {
        Self {
            name: "perplexity_tagger".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("perplexity"),
            model_path: None,
            vocab_path: None,
            max_chars: 1 << 16,
            lower_case: false,
            remove_accents: false,
            normalize_numbers: true,
            punctuation: 1,
        }
    }
}

pub struct PerplexityTagger {
    params: PerplexityParams,
    normalization: Normalization,
    loaded: OnceCell<Option<Arc<LoadedModel>>>,
}

impl PerplexityTagger {
    pub fn new(params: PerplexityParams) -> Self {
        let normalization = Normalization {
            lower_case: params.lower_case,
            remove_accents: params.remove_accents,
            normalize_numbers: params.normalize_numbers,
            punctuation: params.punctuation,
        };
        Self { params, normalization, loaded: OnceCell::new() }
    }

    fn model(&self) -> Option<&Arc<LoadedModel>> {
        self.loaded
            .get_or_init(|| {
                let path = self.params.model_path.as_deref()?;
                let model = match ArpaModel::load(path) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "perplexity model unavailable");
                        return None;
                    }
                };
                let vocab = match self.params.vocab_path.as_deref() {
                    None => None,
                    Some(vocab_path) => match SpVocab::load(vocab_path) {
                        Ok(v) => Some(v),
                        Err(e) => {
                            warn!(error = %e, "sentencepiece vocab unavailable");
                            return None;
                        }
                    },
                };
                Some(Arc::new(LoadedModel { model, vocab }))
            })
            .as_ref()
    }

    fn perplexity(&self, text: &str) -> Option<f64> {
        let loaded = self.model()?;
        let normalized = self.normalization.apply(text);
        let tokenized = match &loaded.vocab {
            Some(vocab) => vocab.tokenize(&normalized),
            None => normalized,
        };
        let mut log_score = 0.0;
        let mut length = 0.0;
        for line in tokenized.split('\n') {
            log_score += loaded.model.score(line);
            length += line.split_whitespace().count() as f64 + 1.0;
        }
        let perplexity = 10f64.powf(-log_score / length);
        Some((perplexity * 10.0).round() / 10.0)
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("tag", "perplexity", "language-model perplexity", |p| {
        Ok(cdp_core::Component::Map(Box::new(PerplexityTagger::new(
            parse_params("tag", "perplexity", p)?,
        ))))
    });
}

#[async_trait]
impl MapFn for PerplexityTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let text = self.params.on.get_str(row).unwrap_or("");
        // Strip control characters except tab and newline before scoring
        let cleaned: String = text
            .chars()
            .filter(|c| (*c as u32) >= 32 || matches!(c, '\t' | '\n'))
            .collect();
        let truncated: String = cleaned.chars().take(self.params.max_chars).collect();
        let score = self.perplexity(&truncated).unwrap_or(-1.0);
        self.params.to.set(row, json!(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TINY_ARPA: &str = "\\data\\\n\
ngram 1=5\n\
ngram 2=2\n\
\n\
\\1-grams:\n\
-1.0\t<s>\t-0.5\n\
-1.0\t</s>\n\
-2.0\t<unk>\n\
-1.0\thello\t-0.5\n\
-1.0\tworld\t-0.5\n\
\n\
\\2-grams:\n\
-0.5\t<s> hello\n\
-0.5\thello world\n\
\n\
\\end\\\n";

    fn write_model(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("tiny.arpa");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(TINY_ARPA.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn arpa_scoring_with_backoff() {
        let model = ArpaModel::parse(TINY_ARPA).unwrap();
        assert_eq!(model.order, 2);
        // P(hello|<s>) = -0.5, P(world|hello) = -0.5,
        // P(</s>|world) backs off: -0.5 + -1.0
        let score = model.score("hello world");
        assert!((score - (-2.5)).abs() < 1e-12);
        // OOV words hit <unk> through the unigram backoff
        assert!(model.score("xyzzy") < model.score("hello"));
    }

    #[test]
    fn normalization_digits_and_punct() {
        let norm = Normalization::default();
        assert_eq!(norm.apply("  room 42 … done  "), "room 00 ... done");
        let lower = Normalization { lower_case: true, ..Normalization::default() };
        assert_eq!(lower.apply("Hello World"), "hello world");
        let accents = Normalization { remove_accents: true, ..Normalization::default() };
        assert_eq!(accents.apply("café"), "cafe");
    }

    #[test]
    fn vocab_greedy_segmentation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.vocab");
        std::fs::write(&path, "\u{2581}hel\t-1.0\nlo\t-2.0\n\u{2581}world\t-1.5\n").unwrap();
        let vocab = SpVocab::load(&path.to_string_lossy()).unwrap();
        assert_eq!(vocab.tokenize("hello world"), "\u{2581}hel lo \u{2581}world");
    }

    #[tokio::test]
    async fn perplexity_of_in_model_text() {
        let dir = tempfile::tempdir().unwrap();
        let tagger = PerplexityTagger::new(PerplexityParams {
            model_path: Some(write_model(&dir)),
            ..PerplexityParams::default()
        });
        let mut row = Row::new();
        row.insert("text".into(), json!("hello world"));
        tagger.apply(&mut row).await.unwrap();
        // total log10 P = -2.5 over N = 3 -> 10^(2.5/3) rounded to 6.8
        let score = FieldPath::new("perplexity").get(&row).and_then(serde_json::Value::as_f64).unwrap();
        assert!((score - 6.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_model_emits_minus_one() {
        let tagger = PerplexityTagger::new(PerplexityParams {
            model_path: Some("/nope/definitely/missing.arpa".to_owned()),
            ..PerplexityParams::default()
        });
        let mut row = Row::new();
        row.insert("text".into(), json!("hello world"));
        tagger.apply(&mut row).await.unwrap();
        assert_eq!(FieldPath::new("perplexity").get(&row), Some(&json!(-1.0)));
    }

    #[tokio::test]
    async fn unconfigured_model_emits_minus_one() {
        let tagger = PerplexityTagger::new(PerplexityParams::default());
        let mut row = Row::new();
        row.insert("text".into(), json!("hello world"));
        tagger.apply(&mut row).await.unwrap();
        assert_eq!(FieldPath::new("perplexity").get(&row), Some(&json!(-1.0)));
    }
}
