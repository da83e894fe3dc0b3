//! OCR artefact tagger.
//!
//! Eleven numeric features capturing common OCR damage: spacing anomalies,
//! case anomalies, word fragments, line artefacts, special-character
//! density, repeated characters, digits embedded in words, and the word
//! length distribution. Every ratio is clipped to [0, 1].

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};

static MISSING_SPACES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z][A-Z]|[a-zA-Z]\d|\d[a-zA-Z]").expect("static pattern"));
static EXCESSIVE_SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r" {3,}").expect("static pattern"));
static SPACED_WORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-zA-Z] [a-zA-Z] [a-zA-Z]\b").expect("static pattern"));
static VERY_LONG_WORDS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w{25,}\b").expect("static pattern"));

static RANDOM_CAPS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-z]+[A-Z][a-z]*\b").expect("static pattern"));
static MIXED_CASE_WORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-zA-Z]*[a-z][A-Z][a-zA-Z]*\b").expect("static pattern"));

// Backreferences need the backtracking engine
static REPEATED_CHARS: Lazy<fancy_regex::Regex> =
    Lazy::new(|| fancy_regex::Regex::new(r"(.)\1{3,}").expect("static pattern"));
static REPEATED_SEQUENCES: Lazy<fancy_regex::Regex> =
    Lazy::new(|| fancy_regex::Regex::new(r"(.{2,5})\1{2,}").expect("static pattern"));

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w]").expect("static pattern"));
static SYMBOL_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\w\s]+$").expect("static pattern"));
static NUMERIC_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("static pattern"));
static PAGE_ARTEFACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\d+\s*$|^[IVX]+\s*$|^Page\s+\d+").expect("static pattern")
});

static EMBEDDED_DIGIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-zA-Z]\d|\d[a-zA-Z]").expect("static pattern"));
static ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+(st|nd|rd|th)$").expect("static pattern"));
static DIGIT_SANDWICH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[a-zA-Z][a-zA-Z]*\d").expect("static pattern"));

/// Unicode characters that frequently appear in broken OCR output.
const UNUSUAL_CHARS: &str = "«»‚„‹›¡¿¦§¨©ª¬®¯°±²³´µ¶·¸¹º¼½¾†‡•…‰€™";

/// Common English and German two-letter words; anything else of that length
/// counts as a fragment.
const TWO_LETTER_WORDS: &[&str] = &[
    "am", "an", "as", "at", "be", "by", "do", "go", "he", "if", "in", "is", "it", "me", "my",
    "no", "of", "on", "or", "so", "to", "up", "us", "we", // English
    "ab", "ad", "au", "da", "du", "eh", "ei", "er", "es", "ex", "im", "ja", "je", "la", "ob",
    "oh", "um", "wo", "zu", // German
];

fn clip(value: f64) -> f64 {
    value.min(1.0)
}

fn chars(s: &str) -> usize {
    s.chars().count()
}

fn is_unusual(c: char) -> bool {
    UNUSUAL_CHARS.contains(c)
        || ('\u{2000}'..='\u{206F}').contains(&c) // general punctuation
        || ('\u{2700}'..='\u{27BF}').contains(&c) // dingbats
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OcrQualityParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
}

impl Default for OcrQualityParams {
    fn default() -> Self {
        Self {
            name: "ocr_quality".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("metadata.ocr_quality"),
        }
    }
}

pub struct OcrQualityTagger {
    params: OcrQualityParams,
}

impl OcrQualityTagger {
    pub fn new(params: OcrQualityParams) -> Self {
        Self { params }
    }

    fn spacing_anomaly_ratio(text: &str) -> f64 {
        let n_words = text.split_whitespace().count();
        if n_words == 0 {
            return 0.0;
        }
        let anomalies = MISSING_SPACES.find_iter(text).count()
            + EXCESSIVE_SPACES.find_iter(text).count()
            + SPACED_WORDS.find_iter(text).count()
            + VERY_LONG_WORDS.find_iter(text).count();
        clip(anomalies as f64 / n_words as f64)
    }

    fn case_anomaly_ratio(text: &str) -> f64 {
        let n_alpha_words = text
            .split_whitespace()
            .filter(|w| !w.is_empty() && w.chars().all(char::is_alphabetic))
            .count();
        if n_alpha_words == 0 {
            return 0.0;
        }
        let anomalies =
            RANDOM_CAPS.find_iter(text).count() + MIXED_CASE_WORDS.find_iter(text).count();
        clip(anomalies as f64 / n_alpha_words as f64)
    }

    fn word_fragment_ratio(text: &str) -> f64 {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return 0.0;
        }
        let fragments = words
            .iter()
            .filter(|word| {
                let clean = NON_WORD.replace_all(word, "");
                let alpha = !clean.is_empty() && clean.chars().all(char::is_alphabetic);
                match chars(&clean) {
                    1 => alpha,
                    2 => alpha && !TWO_LETTER_WORDS.contains(&clean.to_lowercase().as_str()),
                    _ => false,
                }
            })
            .count();
        clip(fragments as f64 / words.len() as f64)
    }

    fn line_artifact_ratio(text: &str) -> f64 {
        let lines: Vec<&str> = text.lines().collect();
        if lines.is_empty() {
            return 0.0;
        }
        let artifacts = lines
            .iter()
            .map(|l| l.trim())
            .filter(|line| !line.is_empty())
            .filter(|line| {
                chars(line) <= 2
                    || SYMBOL_LINE.is_match(line)
                    || NUMERIC_LINE.is_match(line)
                    || PAGE_ARTEFACT.is_match(line)
            })
            .count();
        clip(artifacts as f64 / lines.len() as f64)
    }

    fn special_char_density(text: &str) -> f64 {
        let total = chars(text);
        if total == 0 {
            return 0.0;
        }
        let unusual = text.chars().filter(|c| is_unusual(*c)).count();
        clip(unusual as f64 / total as f64)
    }

    fn repeated_char_ratio(text: &str) -> f64 {
        let total = chars(text);
        if total == 0 {
            return 0.0;
        }
        let mut repeated = 0;
        for m in REPEATED_CHARS.find_iter(text).filter_map(Result::ok) {
            repeated += chars(m.as_str());
        }
        for m in REPEATED_SEQUENCES.find_iter(text).filter_map(Result::ok) {
            repeated += chars(m.as_str());
        }
        clip(repeated as f64 / total as f64)
    }

    fn numeric_context_errors(text: &str) -> f64 {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return 0.0;
        }
        let errors = words
            .iter()
            .filter(|word| {
                (EMBEDDED_DIGIT.is_match(word) && !ORDINAL.is_match(word))
                    || DIGIT_SANDWICH.is_match(word)
            })
            .count();
        clip(errors as f64 / words.len() as f64)
    }

    /// Mean/std of cleaned word lengths plus very-short and very-long
    /// ratios.
    fn length_features(text: &str) -> (f64, f64, f64, f64) {
        let lengths: Vec<usize> = text
            .split_whitespace()
            .map(|w| NON_WORD.replace_all(w, "").into_owned())
            .filter(|w| !w.is_empty())
            .map(|w| chars(&w))
            .collect();
        if lengths.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }
        let n = lengths.len() as f64;
        let mean = lengths.iter().sum::<usize>() as f64 / n;
        let std = if lengths.len() > 1 {
            let variance = lengths.iter().map(|&l| (l as f64 - mean).powi(2)).sum::<f64>() / n;
            variance.sqrt()
        } else {
            0.0
        };
        let very_short = lengths.iter().filter(|&&l| l <= 1).count() as f64 / n;
        let very_long = lengths.iter().filter(|&&l| l >= 15).count() as f64 / n;
        (mean, std, very_short, very_long)
    }

    fn stats(text: &str) -> Map<String, Value> {
        let (avg, std, short, long) = Self::length_features(text);
        let mut stats = Map::new();
        stats.insert("spacing_anomaly_ratio".into(), json!(Self::spacing_anomaly_ratio(text)));
        stats.insert("case_anomaly_ratio".into(), json!(Self::case_anomaly_ratio(text)));
        stats.insert("word_fragment_ratio".into(), json!(Self::word_fragment_ratio(text)));
        stats.insert("line_artifact_ratio".into(), json!(Self::line_artifact_ratio(text)));
        stats.insert("special_char_density".into(), json!(Self::special_char_density(text)));
        stats.insert("repeated_char_ratio".into(), json!(Self::repeated_char_ratio(text)));
        stats.insert("numeric_context_errors".into(), json!(Self::numeric_context_errors(text)));
        stats.insert("word_length_avg".into(), json!(avg));
        stats.insert("word_length_std".into(), json!(std));
        stats.insert("ratio_very_short_words".into(), json!(short));
        stats.insert("ratio_very_long_words".into(), json!(long));
        stats
    }

    fn empty_stats() -> Map<String, Value> {
        let mut stats = Map::new();
        for key in [
            "spacing_anomaly_ratio",
            "case_anomaly_ratio",
            "word_fragment_ratio",
            "line_artifact_ratio",
            "special_char_density",
            "repeated_char_ratio",
            "numeric_context_errors",
            "word_length_avg",
            "word_length_std",
            "ratio_very_short_words",
            "ratio_very_long_words",
        ] {
            stats.insert(key.into(), json!(0.0));
        }
        stats
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("tag", "ocr_quality", "OCR artefact metrics", |p| {
        Ok(cdp_core::Component::Map(Box::new(OcrQualityTagger::new(
            parse_params("tag", "ocr_quality", p)?,
        ))))
    });
}

#[async_trait]
impl MapFn for OcrQualityTagger {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let stats = match self.params.on.get_str(row) {
            Some(text) if !text.trim().is_empty() => Self::stats(text),
            _ => Self::empty_stats(),
        };
        self.params.to.set(row, Value::Object(stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_scores_low() {
        let text = "This is a perfectly normal sentence with reasonable words.";
        assert_eq!(OcrQualityTagger::spacing_anomaly_ratio(text), 0.0);
        assert_eq!(OcrQualityTagger::case_anomaly_ratio(text), 0.0);
        assert_eq!(OcrQualityTagger::repeated_char_ratio(text), 0.0);
        assert_eq!(OcrQualityTagger::numeric_context_errors(text), 0.0);
    }

    #[test]
    fn detects_spacing_and_case_damage() {
        assert!(OcrQualityTagger::spacing_anomaly_ratio("wordsRunTogether and s p aced") > 0.0);
        assert!(OcrQualityTagger::case_anomaly_ratio("norMal broKen caSing") > 0.0);
    }

    #[test]
    fn detects_repeated_characters() {
        let ratio = OcrQualityTagger::repeated_char_ratio("soooooo much nooooise");
        assert!(ratio > 0.0);
        assert!(ratio <= 1.0);
    }

    #[test]
    fn detects_line_artifacts() {
        // Of four non-empty lines, three are artifacts: a bare number, a
        // roman numeral and a page marker
        let text = "A real line of content here\n42\nIV\nPage 7";
        let ratio = OcrQualityTagger::line_artifact_ratio(text);
        assert!((ratio - 0.75).abs() < 1e-12);
    }

    #[test]
    fn detects_embedded_digits() {
        let ratio = OcrQualityTagger::numeric_context_errors("the w0rd looks damaged");
        assert!((ratio - 0.25).abs() < 1e-12);
        // Ordinals are fine
        assert_eq!(OcrQualityTagger::numeric_context_errors("the 2nd place"), 0.0);
    }

    #[test]
    fn fragment_ratio_respects_known_two_letter_words() {
        // "to" and "in" are real words; "qx" and lone "z" are fragments
        let ratio = OcrQualityTagger::word_fragment_ratio("to in qx z stable");
        assert!((ratio - 2.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn length_features_mean_and_extremes() {
        let (avg, std, short, long) = OcrQualityTagger::length_features("a bb ccc");
        assert!((avg - 2.0).abs() < 1e-12);
        assert!(std > 0.0);
        assert!((short - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(long, 0.0);
    }

    #[tokio::test]
    async fn empty_text_gets_zero_record() {
        let tagger = OcrQualityTagger::new(OcrQualityParams::default());
        let mut row = Row::new();
        row.insert("text".into(), json!("   "));
        tagger.apply(&mut row).await.unwrap();
        let stats = FieldPath::new("metadata.ocr_quality").get(&row).unwrap();
        assert_eq!(stats["word_length_avg"], json!(0.0));
        assert_eq!(stats["spacing_anomaly_ratio"], json!(0.0));
    }

    #[test]
    fn special_char_density_counts_unusual_ranges() {
        let density = OcrQualityTagger::special_char_density("text • with † artefacts ‰");
        assert!(density > 0.0);
        assert_eq!(OcrQualityTagger::special_char_density("plain ascii text"), 0.0);
    }
}
