//! Pipeline configuration loaded from YAML.
//!
//! The top-level [`PipelineSpec`] mirrors the external interface: `name`,
//! `input`, `processors`, optional `output`, optional `aggregations`, and the
//! `runtime` resource record. Unknown keys anywhere in the tree are rejected
//! at load time.
//!
//! # Example YAML Configuration
//!
//! ```yaml
//! name: "web-corpus-v2"
//! description: "Dedup + quality filtering for the web crawl subset"
//! input:
//!   path: "s3://corpus/raw/web/*.parquet"
//!   format: parquet
//! processors:
//!   - category: tag
//!     type: gopher_quality
//!     params: { language: en }
//!   - category: filter
//!     type: gopher_quality
//!   - category: format
//!     type: deduplication
//!     params: { lsh_threshold: 0.8, split_char: "\n" }
//! output:
//!   path: "s3://corpus/clean/web"
//!   format: parquet
//! aggregations:
//!   - category: aggregation
//!     type: counter
//!     params: { name: sources, on: source, top_k: 20 }
//! runtime:
//!   concurrency: 16
//!   target_partition_size_mb: 128
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CdpError;
use crate::row::FieldPath;

/// Complete pipeline specification loaded from YAML configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineSpec {
    /// Human-readable name of the pipeline
    pub name: String,

    /// Description of what this pipeline does
    #[serde(default)]
    pub description: Option<String>,

    /// Input data source
    pub input: ConnectorSpec,

    /// Ordered processing steps applied to every row
    #[serde(default)]
    pub processors: Vec<ProcessorSpec>,

    /// Extra per-processor execution hints. Accepted for config
    /// compatibility; the in-process scheduler has no use for them.
    #[serde(default)]
    pub process_kwargs: Map<String, Value>,

    /// Output destination; omit to run a compute-only pipeline
    #[serde(default)]
    pub output: Option<ConnectorSpec>,

    /// Dataset-level aggregations computed over the processed stream
    #[serde(default)]
    pub aggregations: Option<Vec<ProcessorSpec>>,

    /// Aggregation options: grouping columns and result destination
    #[serde(default)]
    pub aggregation_kwargs: AggregationOptions,

    /// Execution resource configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl PipelineSpec {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CdpError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CdpError::config(path.display().to_string(), e.to_string()))?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self, CdpError> {
        serde_yaml::from_str(raw).map_err(|e| CdpError::config("pipeline", e.to_string()))
    }
}

/// Configuration for data connectors (readers/writers)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectorSpec {
    /// Path(s) to the data source or output destination
    pub path: PathArg,

    /// Data format: `parquet`, `jsonl`, `csv` or `text`
    pub format: String,

    /// Format-specific parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// A single URI, or a list of URIs.
///
/// A single local path may contain a wildcard glob; wildcards are rejected
/// for non-local schemes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathArg {
    One(String),
    Many(Vec<String>),
}

impl PathArg {
    pub fn first(&self) -> &str {
        match self {
            Self::One(p) => p,
            Self::Many(ps) => ps.first().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            Self::One(p) => std::slice::from_ref(p),
            Self::Many(ps) => ps,
        };
        slice.iter().map(String::as_str)
    }
}

impl From<&str> for PathArg {
    fn from(p: &str) -> Self {
        Self::One(p.to_owned())
    }
}

/// Configuration for a single processor or aggregation stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorSpec {
    /// Component category (`ingest`, `tag`, `filter`, `format`, `aggregation`, ...)
    pub category: String,

    /// Type identifier within the category
    #[serde(rename = "type")]
    pub kind: String,

    /// Component-specific parameters, validated at compile time
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Whether this stage is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProcessorSpec {
    /// The `category.type` key used in error messages and drop counters.
    pub fn key(&self) -> String {
        format!("{}.{}", self.category, self.kind)
    }
}

/// Options applied to the aggregation phase as a whole.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregationOptions {
    /// Columns to group by (dotted paths); absent means one global record
    #[serde(default, alias = "groupby")]
    pub group_by: Option<Vec<String>>,

    /// Destination URI for the finalized JSON report; absent returns it in-memory
    #[serde(default)]
    pub output_path: Option<String>,

    /// Keep partial aggregation results when the pipeline is cancelled
    /// (default: discard)
    #[serde(default)]
    pub partial_on_cancel: bool,
}

impl AggregationOptions {
    pub fn group_paths(&self) -> Vec<FieldPath> {
        self.group_by
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(FieldPath::new)
            .collect()
    }
}

/// Configuration for the execution environment and resource management.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuntimeConfig {
    /// Target partition size in MB; readers chunk their input to roughly
    /// this many bytes per partition
    pub target_partition_size_mb: u64,

    /// Override the number of partitions; readers derive an effective byte
    /// target from the total input size instead
    pub override_partition_count: Option<usize>,

    /// Maximum number of partitions processed concurrently; defaults to the
    /// host's available parallelism
    pub concurrency: Option<usize>,

    /// Minimum rows per output file
    pub min_rows_per_file: Option<usize>,

    /// Buffer size for the partition channels between pipeline tasks
    ///
    /// Higher values improve throughput but use more memory; lower values
    /// reduce memory usage at the cost of backpressure.
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            target_partition_size_mb: 128,
            override_partition_count: None,
            concurrency: None,
            min_rows_per_file: None,
            channel_capacity: 8,
        }
    }
}

impl RuntimeConfig {
    /// Number of worker tasks in the processing pool.
    pub fn worker_count(&self) -> usize {
        self.concurrency
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(4)
            .max(1)
    }

    pub fn target_partition_bytes(&self) -> u64 {
        self.target_partition_size_mb.max(1) * 1024 * 1024
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: test-pipeline
input:
  path: data/*.jsonl
  format: jsonl
"#;

    #[test]
    fn minimal_config_parses() {
        let spec = PipelineSpec::from_yaml(MINIMAL).unwrap();
        assert_eq!(spec.name, "test-pipeline");
        assert_eq!(spec.input.format, "jsonl");
        assert!(spec.processors.is_empty());
        assert!(spec.output.is_none());
        assert!(spec.aggregations.is_none());
        assert_eq!(spec.runtime.target_partition_size_mb, 128);
    }

    #[test]
    fn unknown_top_level_key_rejected() {
        let yaml = format!("{MINIMAL}\nsurprise: 1\n");
        assert!(matches!(
            PipelineSpec::from_yaml(&yaml),
            Err(CdpError::Config { .. })
        ));
    }

    #[test]
    fn unknown_processor_key_rejected() {
        let yaml = r#"
name: p
input: { path: x.jsonl, format: jsonl }
processors:
  - category: tag
    type: length
    prams: {}
"#;
        assert!(PipelineSpec::from_yaml(yaml).is_err());
    }

    #[test]
    fn processor_defaults() {
        let yaml = r#"
name: p
input: { path: x.jsonl, format: jsonl }
processors:
  - category: filter
    type: exists
    params: { on: text }
"#;
        let spec = PipelineSpec::from_yaml(yaml).unwrap();
        assert!(spec.processors[0].enabled);
        assert_eq!(spec.processors[0].key(), "filter.exists");
    }

    #[test]
    fn path_list_and_on_key_parse() {
        // `on` must stay a string key under YAML 1.2, not a boolean
        let yaml = r#"
name: p
input:
  path: [a.jsonl, b.jsonl]
  format: jsonl
processors:
  - category: tag
    type: length
    params: { on: text, to: metadata.length }
"#;
        let spec = PipelineSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.input.path.iter().count(), 2);
        assert_eq!(
            spec.processors[0].params.get("on"),
            Some(&Value::String("text".into()))
        );
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yml");
        std::fs::write(&path, MINIMAL).unwrap();
        let spec = PipelineSpec::from_yaml_file(&path).unwrap();
        assert_eq!(spec.name, "test-pipeline");
        assert!(matches!(
            PipelineSpec::from_yaml_file(dir.path().join("missing.yml")),
            Err(CdpError::Config { .. })
        ));
    }

    #[test]
    fn aggregation_options_parse() {
        let yaml = r#"
name: p
input: { path: x.jsonl, format: jsonl }
aggregations:
  - category: aggregation
    type: sum
    params: { name: total, on: metadata.token_count }
aggregation_kwargs:
  groupby: [metadata.language]
  output_path: stats.json
"#;
        let spec = PipelineSpec::from_yaml(yaml).unwrap();
        let opts = spec.aggregation_kwargs;
        assert_eq!(opts.group_by.as_deref(), Some(&["metadata.language".to_string()][..]));
        assert_eq!(opts.output_path.as_deref(), Some("stats.json"));
        assert!(!opts.partial_on_cancel);
    }
}
