//! CSV sink.

use arrow::csv::WriterBuilder;
use async_trait::async_trait;
use cdp_core::{CdpError, PartitionRx, Row, WriteHints, Writer};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::convert::rows_to_batch;
use crate::fs;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CsvSinkParams {
    pub include_header: bool,
    pub delimiter: char,
}

impl Default for CsvSinkParams {
    fn default() -> Self {
        Self { include_header: true, delimiter: ',' }
    }
}

pub struct CsvSink {
    params: CsvSinkParams,
}

impl CsvSink {
    pub fn new(params: CsvSinkParams) -> Self {
        Self { params }
    }

    async fn flush(&self, path: &str, part: usize, rows: &[Row]) -> Result<(), CdpError> {
        let batch = rows_to_batch(rows)?;
        let mut data = Vec::new();
        {
            let mut writer = WriterBuilder::new()
                .with_header(self.params.include_header)
                .with_delimiter(self.params.delimiter as u8)
                .build(&mut data);
            writer
                .write(&batch)
                .map_err(|e| CdpError::permanent("csv write", e.to_string()))?;
        }
        let target = fs::join_output(path, &format!("part-{part:05}.csv"));
        fs::write_bytes(&target, data).await
    }
}

#[async_trait]
impl Writer for CsvSink {
    fn name(&self) -> &str {
        "csv_sink"
    }

    async fn write(
        &self,
        rx: PartitionRx,
        path: &str,
        hints: &WriteHints,
        _cancel: CancellationToken,
    ) -> Result<u64, CdpError> {
        let mut pending: Vec<Row> = Vec::new();
        let mut part = 0usize;
        let mut written = 0u64;
        while let Ok(partition) = rx.recv_async().await {
            pending.extend(partition);
            if let Some(min) = hints.min_rows_per_file {
                if pending.len() >= min.max(1) {
                    self.flush(path, part, &pending).await?;
                    written += pending.len() as u64;
                    pending.clear();
                    part += 1;
                }
            }
        }
        if !pending.is_empty() {
            self.flush(path, part, &pending).await?;
            written += pending.len() as u64;
        }
        info!(rows = written, "csv write finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").to_string_lossy().into_owned();
        let (tx, rx) = flume::unbounded();
        let mut r = Row::new();
        r.insert("id".into(), json!("0"));
        r.insert("text".into(), json!("hello"));
        tx.send(vec![r]).unwrap();
        drop(tx);

        let sink = CsvSink::new(CsvSinkParams::default());
        let written = sink
            .write(rx, &out, &WriteHints::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 1);
        let text = std::fs::read_to_string(dir.path().join("out/part-00000.csv")).unwrap();
        assert!(text.starts_with("id,text"));
        assert!(text.contains("0,hello"));
    }
}
