//! Regex-based PII detection and masking.
//!
//! Detected entities are either redacted (removed) or replaced with
//! well-known test values for the configured language: RFC 5737 addresses,
//! the Visa test card number, blackhole domains. Pattern tables are
//! process-wide and immutable after initialization.

use std::collections::BTreeSet;

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Per-country IBAN shapes (spacing-tolerant).
const IBAN_PATTERNS: &[&str] = &[
    r"AD\d{2}\s?\d{4}\s?\d{4}\s?[a-zA-Z0-9]{12}",
    r"AE\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"AL\d{2}\s?\d{4}\s?\d{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"AT\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"AZ\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"BA\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"BE\d{2}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"BG\d{2}\s?[A-Z]{4}\s?\d{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"BH\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{2}",
    r"BI\d{2}\s?\d{5}\s?\d{5}\s?\d{11}\s?\d{2}",
    r"BR\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}[A-Z]\s?[a-zA-Z0-9]",
    r"BY\d{2}\s?[a-zA-Z0-9]{4}\s?\d{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"CH\d{2}\s?\d{4}\s?\d[a-zA-Z0-9]{3}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]",
    r"CR\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"CY\d{2}\s?\d{4}\s?\d{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"CZ\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"DE\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"DJ\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"DK\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"DO\d{2}\s?[a-zA-Z0-9]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"EE\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"EG\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d",
    r"ES\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"FI\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"FK\d{2}\s?[A-Z]{2}\d{2}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"FO\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"FR\d{2}\s?\d{4}\s?\d{4}\s?\d{2}[a-zA-Z0-9]{2}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]\d{2}",
    r"GB\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"GE\d{2}\s?[A-Z]{2}\s?\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"GI\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{3}",
    r"GL\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"GR\d{2}\s?\d{4}\s?\d{3}[a-zA-Z0-9]\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{3}",
    r"GT\d{2}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"HR\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d",
    r"HU\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"IE\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"IL\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"IQ\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"IS\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"IT\d{2}\s?[A-Z]\d{3}\s?\d{4}\s?\d{3}[a-zA-Z0-9]\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{3}",
    r"JO\d{2}\s?[A-Z]{4}\s?\d{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{2}",
    r"KW\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{2}",
    r"KZ\d{2}\s?\d{3}[a-zA-Z0-9]\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"LB\d{2}\s?\d{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"LC\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"LI\d{2}\s?\d{4}\s?\d[a-zA-Z0-9]{3}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]",
    r"LT\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"LU\d{2}\s?\d{3}[a-zA-Z0-9]\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"LV\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]",
    r"LY\d{2}\s?\d{3}\s?\d{3}\s?\d{15}",
    r"MC\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?[a-zA-Z0-9]\d{2}",
    r"MD\d{2}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"ME\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"MK\d{2}\s?\d{3}[a-zA-Z0-9]\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{3}",
    r"MN\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"MR\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"MT\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d[a-zA-Z0-9]{3}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{3}",
    r"MU\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}[A-Z]\s?[A-Z]{2}",
    r"NI\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"NL\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"NO\d{2}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"OM\d{2}\s?\d{3}[a-zA-Z0-9]\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{3}",
    r"PL\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"PS\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]",
    r"PT\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d",
    r"QA\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]",
    r"RO\d{2}\s?[A-Z]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"RS\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"RU\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}[a-zA-Z0-9]{2}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]",
    r"SA\d{2}\s?\d{2}[a-zA-Z0-9]{2}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}",
    r"SC\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?[A-Z]{3}",
    r"SD\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{2}",
    r"SE\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"SI\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"SK\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"SM\d{2}\s?[A-Z]\d{3}\s?\d{4}\s?\d{3}[a-zA-Z0-9]\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{3}",
    r"SO\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"ST\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d",
    r"SV\s?\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"TL\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"TN\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"TR\d{2}\s?\d{4}\s?\d{2}[a-zA-Z0-9]{2}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{2}",
    r"UA\d{2}\s?\d{4}\s?\d{2}[a-zA-Z0-9]{2}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]{4}\s?[a-zA-Z0-9]",
    r"VA\d{2}\s?\d{3}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{3}",
    r"VG\d{2}\s?[A-Z]{4}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
    r"XK\d{2}\s?\d{4}\s?\d{4}\s?\d{4}\s?\d{4}",
];

static CREDIT_CARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").expect("static pattern"));
static IBAN_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&IBAN_PATTERNS.join("|")).expect("static pattern"));
static EMAIL_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[.\s@,?!;:)(]*([^\s@]+@[^\s@,?!;:)(]+?)[.\s@,?!;:)(]?[\s\n\r]").expect("static pattern")
});
static PHONE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\s+\(?(\d{3})\)?[-\. ]*(\d{3})[-. ]?(\d{4})").expect("static pattern")
});
static IP_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)")
        .expect("static pattern")
});
static URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b((?:https?://|www\d{0,3}[.]|[a-z0-9.\-]+[.][a-z]{2,4}/)(?:[^\s()<>]+|\(([^\s()<>]+|(\([^\s()<>]+\)))*\))+(?:\(([^\s()<>]+|(\([^\s()<>]+\)))*\)|[^\s`!()\[\]{};:'".,<>?«»“”‘’]))"#,
    )
    .expect("static pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum EntityType {
    #[serde(rename = "CREDIT_CARD")]
    CreditCard,
    #[serde(rename = "EMAIL_ADDRESS")]
    EmailAddress,
    #[serde(rename = "IBAN_CODE")]
    IbanCode,
    #[serde(rename = "IP_ADDRESS")]
    IpAddress,
    #[serde(rename = "PHONE_NUMBER")]
    PhoneNumber,
    #[serde(rename = "URL")]
    Url,
}

impl EntityType {
    fn pattern(self) -> &'static Regex {
        match self {
            Self::CreditCard => &CREDIT_CARD,
            Self::EmailAddress => &EMAIL_ADDRESS,
            Self::IbanCode => &IBAN_CODE,
            Self::IpAddress => &IP_ADDRESS,
            Self::PhoneNumber => &PHONE_NUMBER,
            Self::Url => &URL,
        }
    }

    /// Replacement values: test card numbers, RFC 5737 addresses, blackhole
    /// domains, invalid-but-well-formed phone numbers.
    fn replacement(self, language: PiiLanguage) -> &'static str {
        match (self, language) {
            (Self::CreditCard, _) => "4242 4242 4242 4242",
            (Self::IpAddress, _) => "192.0.2.255",
            (Self::EmailAddress, PiiLanguage::En) => "name@example.com",
            (Self::EmailAddress, PiiLanguage::De) => "name@beispiel.de",
            (Self::PhoneNumber, PiiLanguage::En) => "+1 123 456 7890",
            (Self::PhoneNumber, PiiLanguage::De) => "+49 123 45678910",
            (Self::IbanCode, PiiLanguage::En) => "GB29 NWBK60 1613 3192 6819",
            (Self::IbanCode, PiiLanguage::De) => "DE02 1203 0000 0000 2020 51",
            (Self::Url, PiiLanguage::En) => "https://www.example.com",
            (Self::Url, PiiLanguage::De) => "https://www.beispiel.de",
        }
    }
}

fn all_entity_types() -> BTreeSet<EntityType> {
    BTreeSet::from([
        EntityType::CreditCard,
        EntityType::EmailAddress,
        EntityType::IbanCode,
        EntityType::IpAddress,
        EntityType::PhoneNumber,
        EntityType::Url,
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiLanguage {
    En,
    De,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymizationMethod {
    /// Remove the match entirely
    Redact,
    /// Substitute the language-specific test value
    Replace,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegexPiiParams {
    pub name: String,
    pub on: FieldPath,
    pub to: FieldPath,
    pub entity_types: BTreeSet<EntityType>,
    pub language: PiiLanguage,
    pub anonymization_method: AnonymizationMethod,
    /// Optional column receiving a boolean flag when PII was found
    pub flag: Option<FieldPath>,
}

impl Default for RegexPiiParams {
    fn default() -> Self {
        Self {
            name: "pii_formatter".to_owned(),
            on: FieldPath::new("text"),
            to: FieldPath::new("text"),
            entity_types: all_entity_types(),
            language: PiiLanguage::De,
            anonymization_method: AnonymizationMethod::Replace,
            flag: None,
        }
    }
}

/// Removes personal identifiable information from text with the static
/// pattern tables.
pub struct RegexPiiFormatter {
    params: RegexPiiParams,
}

impl RegexPiiFormatter {
    pub fn new(params: RegexPiiParams) -> Self {
        Self { params }
    }

    fn process(&self, text: &str) -> String {
        let mut processed = text.to_owned();
        for entity in &self.params.entity_types {
            let pattern = entity.pattern();
            processed = match self.params.anonymization_method {
                AnonymizationMethod::Redact => pattern.replace_all(&processed, "").into_owned(),
                AnonymizationMethod::Replace => pattern
                    .replace_all(&processed, entity.replacement(self.params.language))
                    .into_owned(),
            };
        }
        processed
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("format", "pii_regex", "regex PII detection and masking", |p| {
        Ok(cdp_core::Component::Map(Box::new(RegexPiiFormatter::new(
            parse_params("format", "pii_regex", p)?,
        ))))
    });
}

#[async_trait]
impl MapFn for RegexPiiFormatter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let Some(text) = self.params.on.get_str(row).map(str::to_owned) else {
            return Ok(());
        };
        if text.is_empty() {
            return Ok(());
        }
        let processed = self.process(&text);
        if let Some(flag) = &self.params.flag {
            flag.set(row, Value::Bool(processed != text))?;
        }
        self.params.to.set(row, Value::String(processed))
    }
}
