//! # CDP Transformations - Corpus Processing Operators
//!
//! The processor and aggregation implementations for CDP pipelines,
//! organized the way pipelines use them:
//!
//! - **ingest**: conform arbitrary column layouts to the corpus row schema
//! - **tag**: annotate rows with quality, repetition, OCR, language,
//!   token-count, length and n-gram signals
//! - **filter**: drop rows based on tagged signals or raw field values
//! - **format**: rewrite the text payload (deduplication, PII masking,
//!   spacing fixes)
//! - **aggregations**: dataset-level reductions over the processed stream
//!
//! Every component registers under a `(category, type)` key via
//! [`register`]; stage parameters are plain YAML/JSON maps validated at
//! pipeline compile time.

use cdp_core::registry::Registry;

pub mod aggregations;
pub mod filter;
pub mod format;
pub mod ingest;
pub mod tag;

/// Register all built-in processors and aggregations.
pub fn register(registry: &mut Registry) {
    ingest::register(registry);
    tag::register(registry);
    filter::register(registry);
    format::register(registry);
    aggregations::register(registry);
}
