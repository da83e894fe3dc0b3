//! Parquet sink.
//!
//! Buffers rows to the minimum-rows-per-file hint, converts each chunk to a
//! record batch with an inferred schema, and writes snappy-compressed files
//! by default.

use async_trait::async_trait;
use cdp_core::{CdpError, PartitionRx, Row, WriteHints, Writer};
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::convert::rows_to_batch;
use crate::fs;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ParquetSinkParams {
    /// Compression codec: snappy (default), zstd, gzip or none
    pub compression: String,
    /// Maximum rows per row group
    pub row_group_size: Option<usize>,
}

impl Default for ParquetSinkParams {
    fn default() -> Self {
        Self { compression: "snappy".to_owned(), row_group_size: None }
    }
}

#[derive(Debug)]
pub struct ParquetSink {
    compression: Compression,
    row_group_size: Option<usize>,
}

impl ParquetSink {
    pub fn new(params: ParquetSinkParams) -> Result<Self, CdpError> {
        let compression = match params.compression.as_str() {
            "snappy" => Compression::SNAPPY,
            "zstd" => Compression::ZSTD(ZstdLevel::default()),
            "gzip" => Compression::GZIP(GzipLevel::default()),
            "none" | "uncompressed" => Compression::UNCOMPRESSED,
            other => {
                return Err(CdpError::config(
                    "writer.parquet",
                    format!("unsupported compression '{other}'"),
                ))
            }
        };
        Ok(Self { compression, row_group_size: params.row_group_size })
    }

    async fn flush(&self, path: &str, part: usize, rows: &[Row]) -> Result<(), CdpError> {
        let batch = rows_to_batch(rows)?;
        let mut props = WriterProperties::builder().set_compression(self.compression);
        if let Some(n) = self.row_group_size {
            props = props.set_max_row_group_size(n);
        }
        let mut data = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut data, batch.schema(), Some(props.build()))
            .map_err(|e| CdpError::permanent("parquet write", e.to_string()))?;
        writer
            .write(&batch)
            .map_err(|e| CdpError::permanent("parquet write", e.to_string()))?;
        writer
            .close()
            .map_err(|e| CdpError::permanent("parquet write", e.to_string()))?;
        let target = fs::join_output(path, &format!("part-{part:05}.parquet"));
        fs::write_bytes(&target, data).await
    }
}

#[async_trait]
impl Writer for ParquetSink {
    fn name(&self) -> &str {
        "parquet_sink"
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
        info!(rows = written, "parquet write finished");
        Ok(written)
    }
}
