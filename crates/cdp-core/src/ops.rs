//! Operator traits for pipeline components.
//!
//! Every stage implements exactly one of the three processing traits:
//! [`MapFn`] mutates a row in place, [`FilterFn`] decides whether a row is
//! kept, [`ReduceFn`] folds partitions into a mergeable accumulator.
//! [`Reader`] and [`Writer`] are the boundary contracts: readers emit
//! partition streams, writers are the only components allowed to touch the
//! output filesystem.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::PathArg;
use crate::error::CdpError;
use crate::row::Row;
use crate::{PartitionRx, PartitionTx};

/// An ordered batch of rows; the unit of parallel work.
pub type Partition = Vec<Row>;

/// Partitioning hints handed to readers by the executor.
#[derive(Debug, Clone)]
pub struct ReadHints {
    /// Target partition size in bytes
    pub target_partition_bytes: u64,
    /// Override for the partition count; readers derive an effective byte
    /// target from total input size when set
    pub override_partition_count: Option<usize>,
}

impl Default for ReadHints {
    fn default() -> Self {
        Self { target_partition_bytes: 128 * 1024 * 1024, override_partition_count: None }
    }
}

impl ReadHints {
    /// Effective per-partition byte target given the total input size.
    pub fn effective_target_bytes(&self, total_input_bytes: u64) -> u64 {
        match self.override_partition_count {
            Some(n) if n > 0 => (total_input_bytes / n as u64).max(1),
            _ => self.target_partition_bytes.max(1),
        }
    }
}

/// Output sizing hints handed to writers by the executor.
#[derive(Debug, Clone, Default)]
pub struct WriteHints {
    /// Minimum rows per output file; a file is flushed once it holds at
    /// least this many rows. `None` writes a single file per stream.
    pub min_rows_per_file: Option<usize>,
}

/// Trait for partition-producing data sources
///
/// Readers never mutate; they only emit. Emission is gated by the bounded
/// partition channel, which provides backpressure against the worker pool.
#[async_trait]
pub trait Reader: Send + Sync {
    fn name(&self) -> &str;

    /// Read `path` and push partitions into `tx` until exhausted or cancelled.
    async fn read(
        &self,
        path: &PathArg,
        hints: &ReadHints,
        tx: PartitionTx,
        cancel: CancellationToken,
    ) -> Result<(), CdpError>;
}

/// Trait for partition-consuming data sinks
///
/// A writer failure during flush is permanent and aborts the pipeline.
#[async_trait]
pub trait Writer: Send + Sync {
    fn name(&self) -> &str;

    /// Drain `rx` and write the stream as one or more files under `path`.
    /// Returns the number of rows written.
    async fn write(
        &self,
        rx: PartitionRx,
        path: &str,
        hints: &WriteHints,
        cancel: CancellationToken,
    ) -> Result<u64, CdpError>;
}

/// Trait for map stages: pure per-row transformations writing to a target path.
///
/// `apply` is async because some stages suspend on coordinator RPCs (the
/// deduplication stage); in-memory transforms simply never await.
#[async_trait]
pub trait MapFn: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError>;
}

/// Trait for filter stages: decide whether a row survives.
#[async_trait]
pub trait FilterFn: Send + Sync {
    fn name(&self) -> &str;

    async fn keep(&self, row: &Row) -> Result<bool, CdpError>;
}

/// Trait for aggregation reducers.
///
/// `accumulate` must be pure on its input partition, and `combine` must be
/// associative and commutative: the runtime folds partitions on several
/// tasks concurrently and merges their local accumulators in arbitrary
/// order. Accumulators are JSON values so they stay mergeable and
/// serializable across tasks; each reducer owns its accumulator shape.
pub trait ReduceFn: Send + Sync {
    fn name(&self) -> &str;

    fn init(&self) -> Value;

    fn accumulate(&self, acc: Value, rows: &[Row]) -> Result<Value, CdpError>;

    fn combine(&self, a: Value, b: Value) -> Result<Value, CdpError>;

    fn finalize(&self, acc: Value) -> Result<Value, CdpError>;
}

/// A constructed pipeline component.
///
/// The registry classifies every component by capability; the executor
/// rejects at compile time any stage whose capability does not fit the
/// pipeline section it was declared in.
pub enum Component {
    Reader(Box<dyn Reader>),
    Writer(Box<dyn Writer>),
    Map(Box<dyn MapFn>),
    Filter(Box<dyn FilterFn>),
    Reduce(Box<dyn ReduceFn>),
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Component").field(&self.capability()).finish()
    }
}

impl Component {
    pub fn capability(&self) -> &'static str {
        match self {
            Self::Reader(_) => "reader",
            Self::Writer(_) => "writer",
            Self::Map(_) => "map",
            Self::Filter(_) => "filter",
            Self::Reduce(_) => "reduce",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_target_honors_override() {
        let hints = ReadHints { target_partition_bytes: 1024, override_partition_count: Some(4) };
        assert_eq!(hints.effective_target_bytes(4096), 1024);
        assert_eq!(hints.effective_target_bytes(400), 100);
        // Never zero, even for tiny inputs
        assert_eq!(hints.effective_target_bytes(2), 1);
    }

    #[test]
    fn effective_target_defaults_to_byte_target() {
        let hints = ReadHints { target_partition_bytes: 2048, override_partition_count: None };
        assert_eq!(hints.effective_target_bytes(1 << 30), 2048);
    }
}
