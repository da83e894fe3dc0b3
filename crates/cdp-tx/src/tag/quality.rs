//! Gopher quality and repetition taggers.
//!
//! Both write a flat numeric record to their target path; a downstream
//! filter compares the fields against thresholds. Empty input produces a
//! zero-valued record, never a failure.

use std::collections::HashSet;

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};

static PARAGRAPH_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").expect("static pattern"));
static LINE_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").expect("static pattern"));

const STOP_WORDS_EN: &[&str] = &["the", "be", "to", "of", "and", "that", "have", "with"];

const STOP_WORDS_DE: &[&str] = &[
    // definite articles
    "der", "die", "das", "den", "dem", "des",
    // indefinite articles
    "ein", "eine", "einen", "einem", "einer",
    // conjunctions
    "und", "oder", "aber",
    // common verbs
    "ist", "sind", "hat", "haben", "wird", "werden",
    // prepositions
    "von", "zu", "mit", "in", "auf", "für", "bei", "nach", "vor", "über", "unter", "durch",
    "gegen", "ohne", "um",
    // pronouns
    "ich", "du", "er", "sie", "es", "wir", "ihr", "sich", "sein", "seine", "ihrer", "ihren",
    "mich", "dich",
    // adverbs
    "nicht", "auch", "nur", "noch", "schon",
    // subordinating conjunctions
    "dass", "wenn", "als", "wie",
    // contractions
    "an", "am", "im", "ins", "zum", "zur", "vom", "beim",
    // question words
    "was", "wer", "wo", "wann", "warum", "welche", "welcher",
    // quantifiers
    "alle", "viele", "einige", "andere", "jede", "jeden", "jeder",
    // modal verbs
    "kann", "könnte", "muss", "soll", "will", "würde",
    // temporal/spatial adverbs
    "hier", "dort", "da", "dann", "jetzt", "heute",
    // degree adverbs
    "sehr", "mehr", "weniger", "ganz", "gar", "etwa",
    // particles and discourse markers
    "ja", "nein", "doch", "so", "also", "nun", "mal",
];

/// Language for the stop-word set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    De,
}

impl Language {
    fn stop_words(self) -> &'static [&'static str] {
        match self {
            Self::En => STOP_WORDS_EN,
            Self::De => STOP_WORDS_DE,
        }
    }
}

fn chars(s: &str) -> usize {
    s.chars().count()
}

fn is_symbol_word(word: &str) -> bool {
    word.chars().all(|c| c.is_ascii_punctuation())
}

// ---------------------------------------------------------------------------
// GopherQualityTagger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GopherQualityParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    pub language: Language,
}

impl Default for GopherQualityParams {
    fn default() -> Self {
        Self {
            name: "gopher_quality".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("metadata.gopher_quality"),
            language: Language::De,
        }
    }
}

/// Word statistics, punctuation ratios and structural features from the
/// Gopher paper's quality heuristics.
pub struct GopherQualityTagger {
    params: GopherQualityParams,
    stop_words: HashSet<&'static str>,
}

impl GopherQualityTagger {
    pub fn new(params: GopherQualityParams) -> Self {
        let stop_words = params.language.stop_words().iter().copied().collect();
        Self { params, stop_words }
    }

    fn stats(&self, text: &str) -> Map<String, Value> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let n_words = words.len();
        let non_symbol: Vec<&str> = words.iter().copied().filter(|w| !is_symbol_word(w)).collect();
        let lines: Vec<&str> = text.lines().collect();
        let n_lines = lines.len();

        let avg_word_length = if non_symbol.is_empty() {
            0.0
        } else {
            non_symbol.iter().map(|w| chars(w)).sum::<usize>() as f64 / non_symbol.len() as f64
        };
        let bullet_lines = lines
            .iter()
            .filter(|l| {
                let lead = l.trim_start();
                lead.starts_with('•') || lead.starts_with('-')
            })
            .count();
        let ellipsis_lines = lines
            .iter()
            .filter(|l| {
                let tail = l.trim_end();
                tail.ends_with("...") || tail.ends_with('…')
            })
            .count();
        let distinct: HashSet<&str> = words.iter().copied().collect();
        let stop_word_count = distinct.iter().filter(|w| self.stop_words.contains(*w)).count();
        let alpha_words = words.iter().filter(|w| w.chars().any(char::is_alphabetic)).count();

        let mut stats = Map::new();
        stats.insert("word_count".into(), json!(non_symbol.len()));
        stats.insert("avg_word_length".into(), json!(avg_word_length));
        stats.insert(
            "hash_ratio".into(),
            json!(text.matches('#').count() as f64 / n_words.max(1) as f64),
        );
        stats.insert(
            "ellipsis_ratio".into(),
            json!((text.matches("...").count() + text.matches('…').count()) as f64 / n_words.max(1) as f64),
        );
        stats.insert(
            "bullet_line_ratio".into(),
            json!(if n_lines > 0 { bullet_lines as f64 / n_lines as f64 } else { 0.0 }),
        );
        stats.insert(
            "ellipsis_line_ratio".into(),
            json!(if n_lines > 0 { ellipsis_lines as f64 / n_lines as f64 } else { 0.0 }),
        );
        stats.insert("stop_word_count".into(), json!(stop_word_count));
        stats.insert(
            "alpha_word_ratio".into(),
            json!(if n_words > 0 { alpha_words as f64 / n_words as f64 } else { 0.0 }),
        );
        stats
    }

    fn empty_stats() -> Map<String, Value> {
        let mut stats = Map::new();
        stats.insert("word_count".into(), json!(0));
        stats.insert("avg_word_length".into(), json!(0.0));
        stats.insert("hash_ratio".into(), json!(0.0));
        stats.insert("ellipsis_ratio".into(), json!(0.0));
        stats.insert("bullet_line_ratio".into(), json!(0.0));
        stats.insert("ellipsis_line_ratio".into(), json!(0.0));
        stats.insert("stop_word_count".into(), json!(0));
        stats.insert("alpha_word_ratio".into(), json!(0.0));
        stats
    }
}

#[async_trait]
impl MapFn for GopherQualityTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let stats = match self.params.on.get_str(row) {
            None | Some("") => Self::empty_stats(),
            Some(text) => self.stats(text),
        };
        self.params.to.set(row, Value::Object(stats))
    }
}

// ---------------------------------------------------------------------------
// GopherRepetitionTagger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GopherRepetitionParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    /// N-gram sizes for the most-frequent-n-gram analysis
    pub top_n_grams: Vec<usize>,
    /// N-gram sizes for the duplicated-n-gram analysis
    pub dup_n_grams: Vec<usize>,
}

impl Default for GopherRepetitionParams {
    fn default() -> Self {
        Self {
            name: "gopher_repetition".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("metadata.gopher_repetition"),
            top_n_grams: vec![2, 3, 4],
            dup_n_grams: vec![5, 6, 7, 8, 9, 10],
        }
    }
}

/// Duplicate-paragraph, duplicate-line and n-gram repetition fractions.
pub struct GopherRepetitionTagger {
    params: GopherRepetitionParams,
}

impl GopherRepetitionTagger {
    pub fn new(params: GopherRepetitionParams) -> Self {
        Self { params }
    }

    /// Count elements and characters that re-occur; an element is a
    /// duplicate from its second occurrence onward in document order.
    fn find_duplicates<'a>(elements: impl Iterator<Item = &'a str>) -> (usize, usize) {
        let mut seen = HashSet::new();
        let mut duplicate_elements = 0;
        let mut duplicate_chars = 0;
        for element in elements {
            if !seen.insert(element) {
                duplicate_elements += 1;
                duplicate_chars += chars(element);
            }
        }
        (duplicate_elements, duplicate_chars)
    }

    /// Characters covered by the single most frequent n-gram; ties resolve
    /// to the earliest n-gram in document order.
    fn top_duplicate_chars(words: &[&str], n: usize) -> usize {
        if words.len() < n {
            return 0;
        }
        let grams: Vec<String> = words.windows(n).map(|w| w.join(" ")).collect();
        let mut counts: std::collections::HashMap<&str, (usize, usize)> =
            std::collections::HashMap::new();
        for (index, gram) in grams.iter().enumerate() {
            let entry = counts.entry(gram.as_str()).or_insert((0, index));
            entry.0 += 1;
        }
        let best = counts
            .iter()
            .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then(b.1 .1.cmp(&a.1 .1)))
            .map(|(gram, (count, _))| chars(gram) * count);
        best.unwrap_or(0)
    }

    /// Greedy non-overlapping scan: a re-occurring n-gram contributes its
    /// length and advances the cursor by n, a fresh one advances by 1.
    fn duplicated_ngram_chars(words: &[&str], n: usize) -> usize {
        let n_words = words.len();
        if n_words < n {
            return 0;
        }
        let mut seen: HashSet<String> = HashSet::new();
        let mut repeated_chars = 0;
        let mut idx = 0;
        while idx + n <= n_words {
            let gram = words[idx..idx + n].concat();
            if seen.contains(&gram) {
                repeated_chars += chars(&gram);
                idx += n;
            } else {
                seen.insert(gram);
                idx += 1;
            }
        }
        repeated_chars
    }

    fn stats(&self, text: &str) -> Map<String, Value> {
        let text_len = chars(text).max(1);
        let mut stats = Map::new();

        let trimmed = text.trim();
        let paragraphs: Vec<&str> = PARAGRAPH_SPLIT.split(trimmed).collect();
        let (para_dups, para_dup_chars) = Self::find_duplicates(paragraphs.iter().copied());
        stats.insert(
            "dup_para_frac".into(),
            json!(if paragraphs.is_empty() { 0.0 } else { para_dups as f64 / paragraphs.len() as f64 }),
        );
        stats.insert("dup_para_char_frac".into(), json!(para_dup_chars as f64 / text_len as f64));

        let lines: Vec<&str> = LINE_SPLIT.split(text).collect();
        let (line_dups, line_dup_chars) = Self::find_duplicates(lines.iter().copied());
        stats.insert(
            "dup_line_frac".into(),
            json!(if lines.is_empty() { 0.0 } else { line_dups as f64 / lines.len() as f64 }),
        );
        stats.insert("dup_line_char_frac".into(), json!(line_dup_chars as f64 / text_len as f64));

        let words: Vec<&str> = text.split_whitespace().collect();
        for &n in &self.params.top_n_grams {
            let top_chars = Self::top_duplicate_chars(&words, n);
            stats.insert(
                format!("top_{n}_gram_char_frac"),
                json!(top_chars as f64 / text_len as f64),
            );
        }
        for &n in &self.params.dup_n_grams {
            let dup_chars = Self::duplicated_ngram_chars(&words, n);
            stats.insert(
                format!("dup_{n}_gram_char_frac"),
                json!(dup_chars as f64 / text_len as f64),
            );
        }
        stats
    }

    fn empty_stats(&self) -> Map<String, Value> {
        let mut stats = Map::new();
        for key in ["dup_line_frac", "dup_para_frac", "dup_line_char_frac", "dup_para_char_frac"] {
            stats.insert(key.into(), json!(0.0));
        }
        for &n in &self.params.top_n_grams {
            stats.insert(format!("top_{n}_gram_char_frac"), json!(0.0));
        }
        for &n in &self.params.dup_n_grams {
            stats.insert(format!("dup_{n}_gram_char_frac"), json!(0.0));
        }
        stats
    }
}

#[async_trait]
impl MapFn for GopherRepetitionTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let stats = match self.params.on.get_str(row) {
            None | Some("") => self.empty_stats(),
            Some(text) => self.stats(text),
        };
        self.params.to.set(row, Value::Object(stats))
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("tag", "gopher_quality", "Gopher quality metrics", |p| {
        Ok(cdp_core::Component::Map(Box::new(GopherQualityTagger::new(
            parse_params("tag", "gopher_quality", p)?,
        ))))
    });
    registry.register("tag", "gopher_repetition", "Gopher repetition metrics", |p| {
        Ok(cdp_core::Component::Map(Box::new(GopherRepetitionTagger::new(
            parse_params("tag", "gopher_repetition", p)?,
        ))))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn quality(text: &str, language: Language) -> Map<String, Value> {
        let tagger = GopherQualityTagger::new(GopherQualityParams {
            language,
            ..GopherQualityParams::default()
        });
        let mut row = Row::new();
        row.insert("id".into(), json!("0"));
        row.insert("text".into(), json!(text));
        tagger.apply(&mut row).await.unwrap();
        FieldPath::new("metadata.gopher_quality")
            .get(&row)
            .and_then(Value::as_object)
            .cloned()
            .unwrap()
    }

    async fn repetition(text: &str) -> Map<String, Value> {
        let tagger = GopherRepetitionTagger::new(GopherRepetitionParams::default());
        let mut row = Row::new();
        row.insert("id".into(), json!("0"));
        row.insert("text".into(), json!(text));
        tagger.apply(&mut row).await.unwrap();
        FieldPath::new("metadata.gopher_repetition")
            .get(&row)
            .and_then(Value::as_object)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn quality_counts_words_and_stop_words() {
        let stats = quality("the cat sat with the hat", Language::En).await;
        assert_eq!(stats["word_count"], json!(6));
        // distinct stop words present: the, with
        assert_eq!(stats["stop_word_count"], json!(2));
        assert_eq!(stats["alpha_word_ratio"], json!(1.0));
        // (3+3+3+4+3+3)/6
        assert!((stats["avg_word_length"].as_f64().unwrap() - 19.0 / 6.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn quality_symbol_and_line_ratios() {
        let stats = quality("# heading\n- bullet one\n- bullet two\ntrailing...", Language::En).await;
        // 9 whitespace-separated words, one '#'
        assert!((stats["hash_ratio"].as_f64().unwrap() - 1.0 / 9.0).abs() < 1e-12);
        assert!((stats["bullet_line_ratio"].as_f64().unwrap() - 0.5).abs() < 1e-12);
        assert!((stats["ellipsis_line_ratio"].as_f64().unwrap() - 0.25).abs() < 1e-12);
        // "#" is a pure symbol token
        assert_eq!(stats["word_count"], json!(6));
    }

    #[tokio::test]
    async fn quality_empty_text_is_all_zeros() {
        let stats = quality("", Language::De).await;
        assert_eq!(stats["word_count"], json!(0));
        assert_eq!(stats["avg_word_length"], json!(0.0));
        assert_eq!(stats["stop_word_count"], json!(0));
    }

    #[tokio::test]
    async fn repetition_on_pure_duplicates() {
        // "A\n\nA\n\nA": three identical paragraphs, duplicates from the
        // second occurrence onward
        let stats = repetition("A\n\nA\n\nA").await;
        assert!((stats["dup_para_frac"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert!((stats["dup_line_frac"].as_f64().unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert!((stats["dup_para_char_frac"].as_f64().unwrap() - 2.0 / 5.0).abs() < 1e-12);
        assert!((stats["dup_line_char_frac"].as_f64().unwrap() - 2.0 / 5.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn repetition_top_ngram_fraction() {
        // "a b a b a b": top 2-gram "a b" occurs 3 times in the window list
        let stats = repetition("a b a b a b").await;
        let frac = stats["top_2_gram_char_frac"].as_f64().unwrap();
        // "a b" = 3 chars, 3 occurrences, text length 11
        assert!((frac - 9.0 / 11.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn repetition_dup_ngram_greedy_scan() {
        // Two disjoint occurrences of the same 5-gram
        let text = "one two three four five x one two three four five";
        let stats = repetition(text).await;
        let frac = stats["dup_5_gram_char_frac"].as_f64().unwrap();
        // second occurrence concatenated: "onetwothreefourfive" = 19 chars
        assert!((frac - 19.0 / chars(text) as f64).abs() < 1e-12);
    }

    #[tokio::test]
    async fn repetition_empty_text_contract() {
        let stats = repetition("").await;
        for (key, value) in &stats {
            assert_eq!(value, &json!(0.0), "{key} should be zero");
        }
        assert!(stats.contains_key("top_2_gram_char_frac"));
        assert!(stats.contains_key("dup_10_gram_char_frac"));
    }

    #[tokio::test]
    async fn distinct_text_has_no_repetition() {
        let stats = repetition("every word here appears exactly once in this line").await;
        assert_eq!(stats["dup_para_frac"], json!(0.0));
        assert_eq!(stats["dup_line_frac"], json!(0.0));
        assert_eq!(stats["dup_5_gram_char_frac"], json!(0.0));
    }
}
