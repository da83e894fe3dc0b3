//! Parquet source.
//!
//! Reads one or more parquet files into row partitions. For the LLM-corpus
//! schema a projection of `{id, subset, source, text, license, num_tokens}`
//! is applied eagerly; the `columns` parameter overrides it. Columns absent
//! from a file's schema are skipped rather than failing the read.

use async_trait::async_trait;
use bytes::Bytes;
use cdp_core::config::PathArg;
use cdp_core::{CdpError, PartitionTx, ReadHints, Reader};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::convert::batches_to_rows;
use crate::fs;
use crate::partition::PartitionBuffer;

/// Default projection for the LLM-corpus parquet schema.
pub const CORPUS_PROJECTION: [&str; 6] = ["id", "subset", "source", "text", "license", "num_tokens"];

const DEFAULT_BATCH_ROWS: usize = 8192;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParquetSourceParams {
    /// Columns to read; defaults to the corpus projection
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    /// Rows per decoded record batch
    #[serde(default)]
    pub batch_size: Option<usize>,
}

pub struct ParquetSource {
    params: ParquetSourceParams,
}

impl ParquetSource {
    pub fn new(params: ParquetSourceParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Reader for ParquetSource {
    fn name(&self) -> &str {
        "parquet_source"
    }

    async fn read(
        &self,
        path: &PathArg,
        hints: &ReadHints,
        tx: PartitionTx,
        cancel: CancellationToken,
    ) -> Result<(), CdpError> {
        let files = fs::resolve_inputs(path).await?;
        let total_bytes: u64 = files.iter().map(|f| f.size).sum();
        let target = hints.effective_target_bytes(total_bytes);
        let desired: Vec<&str> = match &self.params.columns {
            Some(cols) => cols.iter().map(String::as_str).collect(),
            None => CORPUS_PROJECTION.to_vec(),
        };

        let mut buffer = PartitionBuffer::new(target, tx);
        for file in &files {
            if cancel.is_cancelled() {
                break;
            }
            debug!(file = %file.location.display(), "reading parquet file");
            let data = Bytes::from(fs::read_bytes(&file.location).await?);
            let mut builder = ParquetRecordBatchReaderBuilder::try_new(data)
                .map_err(|e| CdpError::permanent("parquet", e.to_string()))?;

            let roots: Vec<usize> = builder
                .schema()
                .fields()
                .iter()
                .enumerate()
                .filter(|(_, field)| desired.contains(&field.name().as_str()))
                .map(|(i, _)| i)
                .collect();
            if self.params.columns.is_some() && roots.is_empty() {
                return Err(CdpError::config(
                    "reader.parquet",
                    format!("none of the requested columns exist in {}", file.location.display()),
                ));
            }
            if !roots.is_empty() {
                let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
                builder = builder.with_projection(mask);
            }

            let reader = builder
                .with_batch_size(self.params.batch_size.unwrap_or(DEFAULT_BATCH_ROWS))
                .build()
                .map_err(|e| CdpError::permanent("parquet", e.to_string()))?;

            for batch in reader {
                if cancel.is_cancelled() {
                    break;
                }
                let batch = batch.map_err(|e| CdpError::permanent("parquet", e.to_string()))?;
                let approx = batch.get_array_memory_size() as u64;
                let rows = batches_to_rows(&[batch])?;
                buffer.push_rows(rows, approx).await?;
            }
        }
        buffer.finish().await?;
        info!(files = files.len(), "parquet read finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_core::Row;
    use parquet::arrow::ArrowWriter;
    use serde_json::json;

    fn write_fixture(path: &std::path::Path, rows: &[Row]) {
        let batch = crate::convert::rows_to_batch(rows).unwrap();
        let file = std::fs::File::create(path).unwrap();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    fn row(v: serde_json::Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn projects_corpus_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.parquet");
        write_fixture(
            &path,
            &[
                row(json!({"id": "0", "text": "a", "source": "web", "extra": 1})),
                row(json!({"id": "1", "text": "b", "source": "web", "extra": 2})),
            ],
        );

        let source = ParquetSource::new(ParquetSourceParams { columns: None, batch_size: None });
        let (tx, rx) = flume::unbounded();
        source
            .read(
                &PathArg::from(path.to_string_lossy().as_ref()),
                &ReadHints::default(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let rows: Vec<Row> = rx.drain().flatten().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("text"), Some(&json!("a")));
        // Non-projected column dropped eagerly
        assert!(rows[0].get("extra").is_none());
    }

    #[tokio::test]
    async fn explicit_columns_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.parquet");
        write_fixture(&path, &[row(json!({"id": "0", "text": "a", "extra": 7}))]);

        let source = ParquetSource::new(ParquetSourceParams {
            columns: Some(vec!["extra".into()]),
            batch_size: None,
        });
        let (tx, rx) = flume::unbounded();
        source
            .read(
                &PathArg::from(path.to_string_lossy().as_ref()),
                &ReadHints::default(),
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let rows: Vec<Row> = rx.drain().flatten().collect();
        assert_eq!(rows[0].get("extra"), Some(&json!(7)));
        assert!(rows[0].get("text").is_none());
    }
}
