//! Formatters: stages that rewrite the text payload.

use cdp_core::registry::Registry;

pub mod dedup;
pub mod fixes;
pub mod pii;

pub use dedup::{BandedBloomFilter, DedupCoordinator, DeduplicationFormatter, SignatureScheme};

pub fn register(registry: &mut Registry) {
    dedup::register(registry);
    fixes::register(registry);
    pii::register(registry);
}
