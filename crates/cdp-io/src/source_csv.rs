//! CSV source.
//!
//! Schema is inferred from the first file and applied to the rest, the same
//! way the pipeline treats a multi-file input as one dataset.

use std::io::Cursor;
use std::sync::Arc;

use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::Schema;
use async_trait::async_trait;
use cdp_core::config::PathArg;
use cdp_core::{CdpError, PartitionTx, ReadHints, Reader};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::convert::batches_to_rows;
use crate::fs::{self, InputFile, Location};
use crate::partition::PartitionBuffer;

const DEFAULT_BATCH_ROWS: usize = 8192;
const INFER_MAX_RECORDS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CsvSourceParams {
    /// Whether files carry a header row
    pub has_header: bool,
    /// Field delimiter (single ASCII character)
    pub delimiter: char,
    /// Rows per decoded record batch
    pub batch_size: usize,
}

impl Default for CsvSourceParams {
    fn default() -> Self {
        Self { has_header: true, delimiter: ',', batch_size: DEFAULT_BATCH_ROWS }
    }
}

pub struct CsvSource {
    params: CsvSourceParams,
}

impl CsvSource {
    pub fn new(params: CsvSourceParams) -> Self {
        Self { params }
    }

    fn format(&self) -> Format {
        Format::default()
            .with_header(self.params.has_header)
            .with_delimiter(self.params.delimiter as u8)
    }

    async fn load(&self, file: &InputFile) -> Result<Vec<u8>, CdpError> {
        match &file.location {
            Location::Local(p) => std::fs::read(p)
                .map_err(|e| CdpError::permanent("read", format!("{}: {e}", p.display()))),
            Location::S3 { .. } => fs::read_bytes(&file.location).await,
        }
    }
}

#[async_trait]
impl Reader for CsvSource {
    fn name(&self) -> &str {
        "csv_source"
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

        let mut schema: Option<Arc<Schema>> = None;
        let mut buffer = PartitionBuffer::new(target, tx);
        for file in &files {
            if cancel.is_cancelled() {
                break;
            }
            debug!(file = %file.location.display(), "reading csv file");
            let data = self.load(file).await?;

            let file_schema = match &schema {
                Some(s) => Arc::clone(s),
                None => {
                    let (inferred, _) = self
                        .format()
                        .infer_schema(Cursor::new(&data), Some(INFER_MAX_RECORDS))
                        .map_err(|e| CdpError::permanent("csv", e.to_string()))?;
                    Arc::new(inferred)
                }
            };
            if schema.is_none() {
                schema = Some(Arc::clone(&file_schema));
            }

            let reader = ReaderBuilder::new(file_schema)
                .with_header(self.params.has_header)
                .with_delimiter(self.params.delimiter as u8)
                .with_batch_size(self.params.batch_size)
                .build(Cursor::new(&data))
                .map_err(|e| CdpError::permanent("csv", e.to_string()))?;

            for batch in reader {
                if cancel.is_cancelled() {
                    break;
                }
                let batch = batch.map_err(|e| CdpError::permanent("csv", e.to_string()))?;
                let approx = batch.get_array_memory_size() as u64;
                let rows = batches_to_rows(&[batch])?;
                buffer.push_rows(rows, approx).await?;
            }
        }
        buffer.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_core::Row;
    use serde_json::json;

    #[tokio::test]
    async fn reads_with_inferred_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, "id,text,score\n0,hello,1.5\n1,world,2.5\n").unwrap();

        let source = CsvSource::new(CsvSourceParams::default());
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
        assert_eq!(rows[0].get("text"), Some(&json!("hello")));
        assert_eq!(rows[1].get("score"), Some(&json!(2.5)));
    }

    #[tokio::test]
    async fn honors_delimiter_and_headerless_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.csv");
        std::fs::write(&path, "0;hello\n1;world\n").unwrap();

        let source = CsvSource::new(CsvSourceParams {
            has_header: false,
            delimiter: ';',
            batch_size: 16,
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
        assert_eq!(rows.len(), 2);
    }
}
