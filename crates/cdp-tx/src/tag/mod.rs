//! Taggers: map stages that annotate rows with computed signals.

use cdp_core::registry::Registry;

pub mod language;
pub mod ngrams;
pub mod ocr;
pub mod perplexity;
pub mod quality;
pub mod tokens;

pub fn register(registry: &mut Registry) {
    quality::register(registry);
    ocr::register(registry);
    language::register(registry);
    tokens::register(registry);
    ngrams::register(registry);
    perplexity::register(registry);
}
