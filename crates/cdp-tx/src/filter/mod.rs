//! Filters: stages that decide whether a row survives.

use cdp_core::registry::Registry;

pub mod language;
pub mod quality;
pub mod tokens;
pub mod value;

pub fn register(registry: &mut Registry) {
    language::register(registry);
    quality::register(registry);
    tokens::register(registry);
    value::register(registry);
}
