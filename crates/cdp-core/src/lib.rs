//! # CDP Core - Corpus Data Pipeline Core Library
//!
//! Foundational types and abstractions for CDP processing pipelines: the row
//! model with dotted-path field access, the operator traits (map, filter,
//! reduce, reader, writer), the component registry, the pipeline
//! configuration, and the partition-parallel executor that drives them.
//!
//! ## Key Components
//!
//! - **Row model**: nested JSON-shaped records with dotted-path get/set
//! - **Operator traits**: `MapFn`, `FilterFn`, `ReduceFn`, `Reader`, `Writer`
//! - **Registry**: string-keyed `(category, type)` component lookup with
//!   validated parameters
//! - **Executor**: read -> process -> write/aggregate over partitions with a
//!   bounded worker pool
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cdp_core::{config::PipelineSpec, pipeline::DataPipeline, registry::Registry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), cdp_core::CdpError> {
//! let spec = PipelineSpec::from_yaml_file("pipeline.yml")?;
//! let registry = Registry::new(); // populate with cdp_io::register / cdp_tx::register
//! let report = DataPipeline::new(spec)
//!     .run(&registry, CancellationToken::new())
//!     .await?;
//! println!("kept {} of {} rows", report.rows_out, report.rows_in);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod ops;
pub mod pipeline;
pub mod registry;
pub mod row;

pub use error::{CdpError, MAX_RETRIES};
pub use ops::{Component, FilterFn, MapFn, Partition, ReadHints, Reader, ReduceFn, WriteHints, Writer};
pub use row::{FieldPath, Row};

/// Type alias for the sender side of a partition channel between pipeline tasks
pub type PartitionTx = flume::Sender<Partition>;

/// Type alias for the receiver side of a partition channel between pipeline tasks
pub type PartitionRx = flume::Receiver<Partition>;
