//! Plain-text source: one row per line, text under the `text` key.
//!
//! Identifiers are not synthesized here; an `ingest` stage assigns them when
//! conforming the rows to the corpus schema.

use async_trait::async_trait;
use cdp_core::config::PathArg;
use cdp_core::{CdpError, PartitionTx, ReadHints, Reader, Row};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fs;
use crate::partition::PartitionBuffer;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TextSourceParams {
    /// Keep empty lines as empty-text rows (default: skip them)
    #[serde(default)]
    pub keep_empty_lines: bool,
}

pub struct TextSource {
    params: TextSourceParams,
}

impl TextSource {
    pub fn new(params: TextSourceParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Reader for TextSource {
    fn name(&self) -> &str {
        "text_source"
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
            debug!(file = %file.location.display(), "reading text file");
            let data = fs::read_bytes(&file.location).await?;
            let text = String::from_utf8_lossy(&data);
            for line in text.lines() {
                if cancel.is_cancelled() {
                    break;
                }
                if line.is_empty() && !self.params.keep_empty_lines {
                    continue;
                }
                let mut row = Row::new();
                row.insert("text".to_owned(), Value::String(line.to_owned()));
                buffer.push_row(row, line.len() as u64 + 1).await?;
            }
        }
        buffer.finish().await
    }
}
