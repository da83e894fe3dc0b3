//! Spacing fixes for OCR-damaged text.

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

static MULTI_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t]+").expect("static pattern"));
static MULTI_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\n\n+").expect("static pattern"));
static HYPHEN_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w)-\s*\n\s*(\w)").expect("static pattern"));
// Lone line breaks inside a paragraph need lookaround
static PARAGRAPH_BREAK: Lazy<fancy_regex::Regex> =
    Lazy::new(|| fancy_regex::Regex::new(r"(?<!\n)\n(?!\n)").expect("static pattern"));
static EXTRA_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"  +").expect("static pattern"));

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SpaceFormatterParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    /// Rejoin words hyphenated across line breaks
    pub fix_hyphenation: bool,
    /// Collapse runs of spaces and tabs
    pub normalize_whitespace: bool,
    /// Reduce runs of blank lines to one paragraph break
    pub normalize_line_breaks: bool,
    /// Collapse single line breaks inside paragraphs to spaces
    pub collapse_paragraph_breaks: bool,
}

impl Default for SpaceFormatterParams {
    fn default() -> Self {
        Self {
            name: "space_formatter".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("text"),
            fix_hyphenation: true,
            normalize_whitespace: true,
            normalize_line_breaks: true,
            collapse_paragraph_breaks: true,
        }
    }
}

/// Formatter that fixes common spacing damage: runs of spaces, excess blank
/// lines, end-of-line hyphenation, hard-wrapped paragraphs.
pub struct SpaceFormatter {
    params: SpaceFormatterParams,
}

impl SpaceFormatter {
    pub fn new(params: SpaceFormatterParams) -> Self {
        Self { params }
    }

    fn format(&self, text: &str) -> String {
        let mut text = text.to_owned();
        if self.params.normalize_whitespace {
            text = MULTI_SPACE.replace_all(&text, " ").into_owned();
        }
        if self.params.normalize_line_breaks {
            text = MULTI_BREAK.replace_all(&text, "\n\n").into_owned();
        }
        if self.params.fix_hyphenation {
            text = HYPHEN_BREAK.replace_all(&text, "$1$2").into_owned();
        }
        if self.params.collapse_paragraph_breaks {
            text = PARAGRAPH_BREAK.replace_all(&text, " ").into_owned();
        }
        EXTRA_SPACE.replace_all(&text, " ").into_owned()
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("format", "spacing", "whitespace and hyphenation repair", |p| {
        Ok(cdp_core::Component::Map(Box::new(SpaceFormatter::new(
            parse_params("format", "spacing", p)?,
        ))))
    });
}

#[async_trait]
impl MapFn for SpaceFormatter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let Some(text) = self.params.on.get_str(row) else {
            return Ok(());
        };
        if text.is_empty() {
            return Ok(());
        }
        let fixed = self.format(text);
        self.params.to.set(row, Value::String(fixed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(text: &str) -> String {
        SpaceFormatter::new(SpaceFormatterParams::default()).format(text)
    }

    #[test]
    fn collapses_spaces_and_blank_lines() {
        assert_eq!(fix("too   many\t\tspaces"), "too many spaces");
        assert_eq!(fix("para one\n\n\n\npara two"), "para one\n\npara two");
    }

    #[test]
    fn repairs_hyphenation_across_breaks() {
        assert_eq!(fix("hyphen-\nated word"), "hyphenated word");
        assert_eq!(fix("hyphen- \n ated"), "hyphenated");
    }

    #[test]
    fn collapses_hard_wrapped_paragraphs() {
        assert_eq!(fix("one line\nwrapped here\n\nnew paragraph"), "one line wrapped here\n\nnew paragraph");
    }

    #[test]
    fn toggles_disable_individual_fixes() {
        let formatter = SpaceFormatter::new(SpaceFormatterParams {
            collapse_paragraph_breaks: false,
            ..SpaceFormatterParams::default()
        });
        assert_eq!(formatter.format("a\nb"), "a\nb");
    }
}
