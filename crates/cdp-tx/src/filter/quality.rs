//! Quality filters over the Gopher and OCR tagger records.

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, FilterFn, Row};
use serde::Deserialize;
use serde_json::{Map, Value};

fn stat(stats: &Map<String, Value>, key: &str, default: f64) -> f64 {
    stats.get(key).and_then(Value::as_f64).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// GopherQualityFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GopherQualityFilterParams {
    pub name: String,
    pub on: FieldPath,
    pub if_missing: bool,
    pub min_avg_word_length: f64,
    pub max_avg_word_length: f64,
    pub max_symbol_word_ratio: f64,
    pub max_bullet_line_ratio: f64,
    pub max_ellipsis_line_ratio: f64,
    pub max_non_alpha_words_ratio: f64,
    pub min_stop_words: u64,
}

impl Default for GopherQualityFilterParams {
    fn default() -> Self {
        Self {
            name: "gopher_quality".to_owned(),
            on: FieldPath::new("metadata.gopher_quality"),
            if_missing: true,
            min_avg_word_length: 4.8,
            max_avg_word_length: 7.3,
            max_symbol_word_ratio: 0.1,
            max_bullet_line_ratio: 0.7,
            max_ellipsis_line_ratio: 0.3,
            max_non_alpha_words_ratio: 0.99,
            min_stop_words: 6,
        }
    }
}

/// Drops rows failing any of the Gopher quality thresholds.
pub struct GopherQualityFilter {
    params: GopherQualityFilterParams,
}

impl GopherQualityFilter {
    pub fn new(params: GopherQualityFilterParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FilterFn for GopherQualityFilter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn keep(&self, row: &Row) -> Result<bool, CdpError> {
        let Some(stats) = self.params.on.get(row).and_then(Value::as_object).filter(|s| !s.is_empty())
        else {
            return Ok(self.params.if_missing);
        };
        let p = &self.params;
        Ok(!(stat(stats, "stop_word_count", 100_000.0) < p.min_stop_words as f64
            || stat(stats, "alpha_word_ratio", 0.0) > p.max_non_alpha_words_ratio
            || stat(stats, "ellipsis_line_ratio", 0.0) > p.max_ellipsis_line_ratio
            || stat(stats, "bullet_line_ratio", 0.0) > p.max_bullet_line_ratio
            || stat(stats, "avg_word_length", 0.0) > p.max_avg_word_length
            || stat(stats, "avg_word_length", 100.0) < p.min_avg_word_length
            || stat(stats, "ellipsis_ratio", 0.0) > p.max_symbol_word_ratio
            || stat(stats, "hash_ratio", 0.0) > p.max_symbol_word_ratio))
    }
}

// ---------------------------------------------------------------------------
// GopherRepetitionFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GopherRepetitionFilterParams {
    pub name: String,
    pub on: FieldPath,
    pub if_missing: bool,
    pub max_dup_line_frac: Option<f64>,
    pub max_dup_para_frac: Option<f64>,
    pub max_dup_line_char_frac: Option<f64>,
    pub max_dup_para_char_frac: Option<f64>,
    /// `(n, threshold)` pairs for the top-n-gram character fractions
    pub top_n_gram_thresholds: Vec<(u32, f64)>,
    /// `(n, threshold)` pairs for the duplicated-n-gram character fractions
    pub dup_n_gram_thresholds: Vec<(u32, f64)>,
}

impl Default for GopherRepetitionFilterParams {
    fn default() -> Self {
        Self {
            name: "gopher_repetition".to_owned(),
            on: FieldPath::new("metadata.gopher_repetition"),
            if_missing: true,
            max_dup_line_frac: Some(0.25),
            max_dup_para_frac: Some(0.3),
            max_dup_line_char_frac: Some(0.15),
            max_dup_para_char_frac: Some(0.2),
            top_n_gram_thresholds: vec![(2, 0.07), (3, 0.10), (4, 0.13)],
            dup_n_gram_thresholds: vec![(5, 0.39), (6, 0.39), (7, 0.38), (8, 0.38), (9, 0.37), (10, 0.37)],
        }
    }
}

/// Drops rows with excessive line/paragraph duplication, then applies the
/// combined n-gram rule: keep when every top-n-gram fraction exceeds its
/// threshold or every duplicated-n-gram fraction stays within its
/// threshold.
pub struct GopherRepetitionFilter {
    params: GopherRepetitionFilterParams,
}

impl GopherRepetitionFilter {
    pub fn new(params: GopherRepetitionFilterParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FilterFn for GopherRepetitionFilter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn keep(&self, row: &Row) -> Result<bool, CdpError> {
        let Some(stats) = self.params.on.get(row).and_then(Value::as_object).filter(|s| !s.is_empty())
        else {
            return Ok(self.params.if_missing);
        };
        let p = &self.params;
        if let Some(max) = p.max_dup_line_frac {
            if stat(stats, "dup_line_frac", 0.0) > max {
                return Ok(false);
            }
        }
        if let Some(max) = p.max_dup_line_char_frac {
            if stat(stats, "dup_line_char_frac", 0.0) > max {
                return Ok(false);
            }
        }
        if let Some(max) = p.max_dup_para_frac {
            if stat(stats, "dup_para_frac", 0.0) > max {
                return Ok(false);
            }
        }
        if let Some(max) = p.max_dup_para_char_frac {
            if stat(stats, "dup_para_char_frac", 0.0) > max {
                return Ok(false);
            }
        }

        let top = p
            .top_n_gram_thresholds
            .iter()
            .all(|(n, threshold)| stat(stats, &format!("top_{n}_gram_char_frac"), 0.0) > *threshold);
        let dup = p
            .dup_n_gram_thresholds
            .iter()
            .all(|(n, threshold)| stat(stats, &format!("dup_{n}_gram_char_frac"), 0.0) <= *threshold);
        Ok(top || dup)
    }
}

// ---------------------------------------------------------------------------
// OcrQualityFilter
// ---------------------------------------------------------------------------

/// How many thresholds must be violated before a row is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrFilterMode {
    /// Any violated threshold drops the row
    Any,
    /// At least half of the thresholds violated drops the row
    Maj,
    /// Only a row violating every threshold is dropped
    All,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OcrQualityFilterParams {
    pub name: String,
    pub on: FieldPath,
    pub if_missing: bool,
    pub max_spacing_anomaly_ratio: f64,
    pub max_case_anomaly_ratio: f64,
    pub max_word_fragment_ratio: f64,
    pub max_line_artifact_ratio: f64,
    pub max_special_char_density: f64,
    pub max_repeated_char_ratio: f64,
    pub max_numeric_context_errors: f64,
    pub max_avg_length: f64,
    pub min_avg_length: f64,
    pub max_std_length: f64,
    pub min_std_length: f64,
    pub max_ratio_short: f64,
    pub max_ratio_long: f64,
    pub filter_mode: OcrFilterMode,
}

impl Default for OcrQualityFilterParams {
    fn default() -> Self {
        Self {
            name: "ocr_quality".to_owned(),
            on: FieldPath::new("metadata.ocr_quality"),
            if_missing: true,
            max_spacing_anomaly_ratio: 0.15,
            max_case_anomaly_ratio: 0.10,
            max_word_fragment_ratio: 0.20,
            max_line_artifact_ratio: 0.25,
            max_special_char_density: 0.03,
            max_repeated_char_ratio: 0.05,
            max_numeric_context_errors: 0.08,
            max_avg_length: 9.0,
            min_avg_length: 5.0,
            max_std_length: 5.0,
            min_std_length: 1.0,
            max_ratio_short: 0.1,
            max_ratio_long: 0.1,
            filter_mode: OcrFilterMode::Any,
        }
    }
}

/// Drops rows whose OCR artefact metrics violate the thresholds, with the
/// strictness set by `filter_mode`.
pub struct OcrQualityFilter {
    params: OcrQualityFilterParams,
}

impl OcrQualityFilter {
    pub fn new(params: OcrQualityFilterParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl FilterFn for OcrQualityFilter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn keep(&self, row: &Row) -> Result<bool, CdpError> {
        let Some(stats) = self.params.on.get(row).and_then(Value::as_object).filter(|s| !s.is_empty())
        else {
            return Ok(self.params.if_missing);
        };
        let p = &self.params;
        let hits = [
            stat(stats, "spacing_anomaly_ratio", 0.0) > p.max_spacing_anomaly_ratio,
            stat(stats, "case_anomaly_ratio", 0.0) > p.max_case_anomaly_ratio,
            stat(stats, "word_fragment_ratio", 0.0) > p.max_word_fragment_ratio,
            stat(stats, "line_artifact_ratio", 0.0) > p.max_line_artifact_ratio,
            stat(stats, "special_char_density", 0.0) > p.max_special_char_density,
            stat(stats, "repeated_char_ratio", 0.0) > p.max_repeated_char_ratio,
            stat(stats, "numeric_context_errors", 0.0) > p.max_numeric_context_errors,
            stat(stats, "word_length_avg", 0.0) > p.max_avg_length,
            stat(stats, "word_length_avg", 0.0) < p.min_avg_length,
            stat(stats, "word_length_std", 0.0) > p.max_std_length,
            stat(stats, "word_length_std", 0.0) < p.min_std_length,
            stat(stats, "ratio_very_short_words", 0.0) > p.max_ratio_short,
            stat(stats, "ratio_very_long_words", 0.0) > p.max_ratio_long,
        ];
        let violations = hits.iter().filter(|h| **h).count();
        let drop = match p.filter_mode {
            OcrFilterMode::Any => violations > 0,
            OcrFilterMode::Maj => violations * 2 >= hits.len(),
            OcrFilterMode::All => violations == hits.len(),
        };
        Ok(!drop)
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("filter", "gopher_quality", "Gopher quality thresholds", |p| {
        Ok(cdp_core::Component::Filter(Box::new(GopherQualityFilter::new(
            parse_params("filter", "gopher_quality", p)?,
        ))))
    });
    registry.register("filter", "gopher_repetition", "Gopher repetition thresholds", |p| {
        Ok(cdp_core::Component::Filter(Box::new(GopherRepetitionFilter::new(
            parse_params("filter", "gopher_repetition", p)?,
        ))))
    });
    registry.register("filter", "ocr_quality", "OCR artefact thresholds", |p| {
        Ok(cdp_core::Component::Filter(Box::new(OcrQualityFilter::new(
            parse_params("filter", "ocr_quality", p)?,
        ))))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quality_row(stats: Value) -> Row {
        json!({"metadata": {"gopher_quality": stats}}).as_object().cloned().unwrap()
    }

    fn good_quality_stats() -> Value {
        json!({
            "word_count": 200,
            "avg_word_length": 5.2,
            "hash_ratio": 0.0,
            "ellipsis_ratio": 0.0,
            "bullet_line_ratio": 0.0,
            "ellipsis_line_ratio": 0.0,
            "stop_word_count": 8,
            "alpha_word_ratio": 0.97
        })
    }

    #[tokio::test]
    async fn quality_filter_keeps_good_text() {
        let filter = GopherQualityFilter::new(GopherQualityFilterParams::default());
        assert!(filter.keep(&quality_row(good_quality_stats())).await.unwrap());
    }

    #[tokio::test]
    async fn quality_filter_drops_threshold_violations() {
        let filter = GopherQualityFilter::new(GopherQualityFilterParams::default());
        for (key, value) in [
            ("stop_word_count", json!(2)),
            ("avg_word_length", json!(12.0)),
            ("avg_word_length", json!(2.0)),
            ("hash_ratio", json!(0.5)),
            ("bullet_line_ratio", json!(0.9)),
        ] {
            let mut stats = good_quality_stats();
            stats[key] = value;
            assert!(!filter.keep(&quality_row(stats)).await.unwrap(), "{key} should drop");
        }
    }

    #[tokio::test]
    async fn quality_filter_missing_stats() {
        let filter = GopherQualityFilter::new(GopherQualityFilterParams::default());
        assert!(filter.keep(&Row::new()).await.unwrap()); // if_missing = true
    }

    fn repetition_row(stats: Value) -> Row {
        json!({"metadata": {"gopher_repetition": stats}}).as_object().cloned().unwrap()
    }

    fn clean_repetition_stats() -> Value {
        json!({
            "dup_line_frac": 0.0,
            "dup_para_frac": 0.0,
            "dup_line_char_frac": 0.0,
            "dup_para_char_frac": 0.0,
            "top_2_gram_char_frac": 0.01,
            "top_3_gram_char_frac": 0.01,
            "top_4_gram_char_frac": 0.01,
            "dup_5_gram_char_frac": 0.0,
            "dup_6_gram_char_frac": 0.0,
            "dup_7_gram_char_frac": 0.0,
            "dup_8_gram_char_frac": 0.0,
            "dup_9_gram_char_frac": 0.0,
            "dup_10_gram_char_frac": 0.0
        })
    }

    #[tokio::test]
    async fn repetition_filter_keeps_clean_text() {
        let filter = GopherRepetitionFilter::new(GopherRepetitionFilterParams::default());
        assert!(filter.keep(&repetition_row(clean_repetition_stats())).await.unwrap());
    }

    #[tokio::test]
    async fn repetition_filter_drops_duplicate_lines() {
        let filter = GopherRepetitionFilter::new(GopherRepetitionFilterParams::default());
        let mut stats = clean_repetition_stats();
        stats["dup_line_frac"] = json!(0.6);
        assert!(!filter.keep(&repetition_row(stats)).await.unwrap());
    }

    #[tokio::test]
    async fn repetition_filter_dup_ngram_excess_drops() {
        let filter = GopherRepetitionFilter::new(GopherRepetitionFilterParams::default());
        let mut stats = clean_repetition_stats();
        // One duplicated-n-gram fraction above its threshold breaks the
        // `dup` conjunct, and the top fractions do not all exceed theirs
        stats["dup_5_gram_char_frac"] = json!(0.8);
        assert!(!filter.keep(&repetition_row(stats)).await.unwrap());
    }

    fn ocr_row(stats: Value) -> Row {
        json!({"metadata": {"ocr_quality": stats}}).as_object().cloned().unwrap()
    }

    fn clean_ocr_stats() -> Value {
        json!({
            "spacing_anomaly_ratio": 0.0,
            "case_anomaly_ratio": 0.0,
            "word_fragment_ratio": 0.0,
            "line_artifact_ratio": 0.0,
            "special_char_density": 0.0,
            "repeated_char_ratio": 0.0,
            "numeric_context_errors": 0.0,
            "word_length_avg": 6.0,
            "word_length_std": 2.0,
            "ratio_very_short_words": 0.0,
            "ratio_very_long_words": 0.0
        })
    }

    #[tokio::test]
    async fn ocr_filter_any_mode() {
        let filter = OcrQualityFilter::new(OcrQualityFilterParams::default());
        assert!(filter.keep(&ocr_row(clean_ocr_stats())).await.unwrap());
        let mut stats = clean_ocr_stats();
        stats["repeated_char_ratio"] = json!(0.5);
        assert!(!filter.keep(&ocr_row(stats)).await.unwrap());
    }

    #[tokio::test]
    async fn ocr_filter_all_mode_is_lenient() {
        let filter = OcrQualityFilter::new(OcrQualityFilterParams {
            filter_mode: OcrFilterMode::All,
            ..OcrQualityFilterParams::default()
        });
        let mut stats = clean_ocr_stats();
        stats["repeated_char_ratio"] = json!(0.5);
        assert!(filter.keep(&ocr_row(stats)).await.unwrap());
    }

    #[test]
    fn ocr_filter_mode_rejects_unknown_values() {
        let params: Result<OcrQualityFilterParams, _> =
            serde_json::from_value(json!({"filter_mode": "strict"}));
        assert!(params.is_err());
    }
}
