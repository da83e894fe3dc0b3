//! # CDP I/O - Reader and Writer Implementations
//!
//! Concrete partition producers and consumers for CDP pipelines: parquet,
//! JSONL, CSV and plain-text readers, and parquet/JSONL/CSV writers, over
//! local files or S3-compatible object storage.
//!
//! Readers honor the executor's partitioning hints (target partition bytes,
//! optional partition-count override) and never mutate rows; writers are the
//! only components that touch the output filesystem.

use cdp_core::registry::{parse_params, Registry};
use cdp_core::Component;

pub mod convert;
pub mod fs;
mod partition;

/// Parquet file source with eager corpus-schema projection
pub mod source_parquet;

/// JSON-lines file source
pub mod source_jsonl;

/// CSV file source with schema inference
pub mod source_csv;

/// Plain-text (line per row) source
pub mod source_text;

/// Parquet file sink
pub mod sink_parquet;

/// JSON-lines file sink
pub mod sink_jsonl;

/// CSV file sink
pub mod sink_csv;

/// Register all built-in readers and writers.
pub fn register(registry: &mut Registry) {
    registry.register("reader", "parquet", "parquet files (projected to the corpus schema)", |p| {
        Ok(Component::Reader(Box::new(source_parquet::ParquetSource::new(
            parse_params("reader", "parquet", p)?,
        ))))
    });
    registry.register("reader", "jsonl", "JSON-lines files", |p| {
        Ok(Component::Reader(Box::new(source_jsonl::JsonlSource::new(
            parse_params("reader", "jsonl", p)?,
        ))))
    });
    registry.register("reader", "csv", "CSV files with schema inference", |p| {
        Ok(Component::Reader(Box::new(source_csv::CsvSource::new(
            parse_params("reader", "csv", p)?,
        ))))
    });
    registry.register("reader", "text", "plain text files, one row per line", |p| {
        Ok(Component::Reader(Box::new(source_text::TextSource::new(
            parse_params("reader", "text", p)?,
        ))))
    });
    registry.register("writer", "parquet", "parquet files", |p| {
        Ok(Component::Writer(Box::new(sink_parquet::ParquetSink::new(
            parse_params("writer", "parquet", p)?,
        )?)))
    });
    registry.register("writer", "jsonl", "JSON-lines files", |p| {
        Ok(Component::Writer(Box::new(sink_jsonl::JsonlSink::new(
            parse_params("writer", "jsonl", p)?,
        ))))
    });
    registry.register("writer", "csv", "CSV files", |p| {
        Ok(Component::Writer(Box::new(sink_csv::CsvSink::new(
            parse_params("writer", "csv", p)?,
        ))))
    });
}
