//! JSON-lines sink.

use async_trait::async_trait;
use cdp_core::{CdpError, PartitionRx, Row, WriteHints, Writer};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::fs;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonlSinkParams {}

pub struct JsonlSink {
    #[allow(dead_code)]
    params: JsonlSinkParams,
}

impl JsonlSink {
    pub fn new(params: JsonlSinkParams) -> Self {
        Self { params }
    }

    async fn flush(path: &str, part: usize, rows: &[Row]) -> Result<(), CdpError> {
        let mut data = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut data, row)
                .map_err(|e| CdpError::permanent("write", e.to_string()))?;
            data.push(b'\n');
        }
        let target = fs::join_output(path, &format!("part-{part:05}.jsonl"));
        fs::write_bytes(&target, data).await
    }
}

#[async_trait]
impl Writer for JsonlSink {
    fn name(&self) -> &str {
        "jsonl_sink"
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
                    Self::flush(path, part, &pending).await?;
                    written += pending.len() as u64;
                    pending.clear();
                    part += 1;
                }
            }
        }
        if !pending.is_empty() {
            Self::flush(path, part, &pending).await?;
            written += pending.len() as u64;
        }
        info!(rows = written, "jsonl write finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(i: usize) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), json!(i.to_string()));
        r.insert("text".into(), json!("t"));
        r
    }

    #[tokio::test]
    async fn rolls_files_at_min_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").to_string_lossy().into_owned();
        let (tx, rx) = flume::unbounded();
        for chunk in [vec![row(0), row(1)], vec![row(2)], vec![row(3), row(4)]] {
            tx.send(chunk).unwrap();
        }
        drop(tx);

        let sink = JsonlSink::new(JsonlSinkParams::default());
        let written = sink
            .write(rx, &out, &WriteHints { min_rows_per_file: Some(2) }, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 5);

        // Flushes happen once the buffer reaches two rows: [r0, r1] then
        // [r2, r3, r4]
        let mut parts: Vec<_> = std::fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        parts.sort();
        assert_eq!(parts, vec!["part-00000.jsonl", "part-00001.jsonl"]);
        let first = std::fs::read_to_string(dir.path().join("out/part-00000.jsonl")).unwrap();
        assert_eq!(first.lines().count(), 2);
        let second = std::fs::read_to_string(dir.path().join("out/part-00001.jsonl")).unwrap();
        assert_eq!(second.lines().count(), 3);
    }

    #[tokio::test]
    async fn single_file_without_min_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out").to_string_lossy().into_owned();
        let (tx, rx) = flume::unbounded();
        tx.send(vec![row(0), row(1), row(2)]).unwrap();
        drop(tx);

        let sink = JsonlSink::new(JsonlSinkParams::default());
        let written = sink
            .write(rx, &out, &WriteHints::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 3);
        let text = std::fs::read_to_string(dir.path().join("out/part-00000.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
