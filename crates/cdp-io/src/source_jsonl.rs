//! JSON-lines source: one JSON object per line, one row per object.

use std::io::{BufRead, BufReader};

use async_trait::async_trait;
use cdp_core::config::PathArg;
use cdp_core::{CdpError, PartitionTx, ReadHints, Reader, Row};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fs::{self, Location};
use crate::partition::PartitionBuffer;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonlSourceParams {}

pub struct JsonlSource {
    #[allow(dead_code)]
    params: JsonlSourceParams,
}

impl JsonlSource {
    pub fn new(params: JsonlSourceParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Reader for JsonlSource {
    fn name(&self) -> &str {
        "jsonl_source"
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

        let mut buffer = PartitionBuffer::new(target, tx);
        for file in &files {
            if cancel.is_cancelled() {
                break;
            }
            debug!(file = %file.location.display(), "reading jsonl file");
            match &file.location {
                Location::Local(p) => {
                    let handle = std::fs::File::open(p).map_err(|e| {
                        CdpError::permanent("read", format!("{}: {e}", p.display()))
                    })?;
                    for line in BufReader::new(handle).split(b'\n') {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let line = line.map_err(|e| {
                            CdpError::permanent("read", format!("{}: {e}", p.display()))
                        })?;
                        push_line(&mut buffer, &line).await?;
                    }
                }
                Location::S3 { .. } => {
                    let data = fs::read_bytes(&file.location).await?;
                    for line in data.split(|b| *b == b'\n') {
                        if cancel.is_cancelled() {
                            break;
                        }
                        push_line(&mut buffer, line).await?;
                    }
                }
            }
        }
        buffer.finish().await
    }
}

async fn push_line(buffer: &mut PartitionBuffer, line: &[u8]) -> Result<(), CdpError> {
    let trimmed = line.strip_suffix(b"\r").unwrap_or(line);
    if trimmed.is_empty() {
        return Ok(());
    }
    match serde_json::from_slice::<Row>(trimmed) {
        Ok(row) => buffer.push_row(row, trimmed.len() as u64).await,
        Err(e) => {
            warn!(error = %e, "skipping malformed jsonl line");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reads_rows_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"0\",\"text\":\"a\"}\nnot json\n{\"id\":\"1\",\"text\":\"b\"}\n",
        )
        .unwrap();

        let source = JsonlSource::new(JsonlSourceParams::default());
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
        assert_eq!(rows[1].get("text"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn partition_count_override_splits_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        let mut data = String::new();
        for i in 0..100 {
            data.push_str(&format!("{{\"id\":\"{i}\",\"text\":\"abcdefghij\"}}\n"));
        }
        std::fs::write(&path, &data).unwrap();

        let source = JsonlSource::new(JsonlSourceParams::default());
        let (tx, rx) = flume::unbounded();
        let hints = ReadHints {
            target_partition_bytes: u64::MAX,
            override_partition_count: Some(4),
        };
        source
            .read(
                &PathArg::from(path.to_string_lossy().as_ref()),
                &hints,
                tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let partitions: Vec<_> = rx.drain().collect();
        assert!(partitions.len() >= 3, "expected ~4 partitions, got {}", partitions.len());
        assert_eq!(partitions.iter().map(Vec::len).sum::<usize>(), 100);
    }
}
