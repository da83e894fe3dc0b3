//! Byte-target partition batching shared by the readers.

use cdp_core::{CdpError, PartitionTx, Row};

/// Accumulates rows until the partition byte target is reached, then emits
/// the partition downstream. Emission blocks on the bounded channel, which
/// is what gates reader progress against the worker pool.
pub(crate) struct PartitionBuffer {
    target_bytes: u64,
    rows: Vec<Row>,
    bytes: u64,
    tx: PartitionTx,
}

impl PartitionBuffer {
    pub(crate) fn new(target_bytes: u64, tx: PartitionTx) -> Self {
        Self { target_bytes: target_bytes.max(1), rows: Vec::new(), bytes: 0, tx }
    }

    pub(crate) async fn push_row(&mut self, row: Row, approx_bytes: u64) -> Result<(), CdpError> {
        self.rows.push(row);
        self.bytes += approx_bytes;
        self.maybe_emit().await
    }

    pub(crate) async fn push_rows(
        &mut self,
        rows: Vec<Row>,
        approx_bytes: u64,
    ) -> Result<(), CdpError> {
        self.rows.extend(rows);
        self.bytes += approx_bytes;
        self.maybe_emit().await
    }

    async fn maybe_emit(&mut self) -> Result<(), CdpError> {
        if self.bytes >= self.target_bytes && !self.rows.is_empty() {
            self.emit().await?;
        }
        Ok(())
    }

    async fn emit(&mut self) -> Result<(), CdpError> {
        let partition = std::mem::take(&mut self.rows);
        self.bytes = 0;
        self.tx
            .send_async(partition)
            .await
            .map_err(|_| CdpError::ChannelClosed("partitions"))
    }

    /// Emit any buffered remainder.
    pub(crate) async fn finish(mut self) -> Result<(), CdpError> {
        if !self.rows.is_empty() {
            self.emit().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(i: u64) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), json!(i.to_string()));
        r
    }

    #[tokio::test]
    async fn emits_on_byte_target_and_flushes_remainder() {
        let (tx, rx) = flume::unbounded();
        let mut buf = PartitionBuffer::new(100, tx);
        for i in 0..5 {
            buf.push_row(row(i), 40).await.unwrap();
        }
        buf.finish().await.unwrap();
        let partitions: Vec<_> = rx.drain().collect();
        // 3 rows reach 120 bytes, then the 2-row remainder
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].len(), 3);
        assert_eq!(partitions[1].len(), 2);
    }

    #[tokio::test]
    async fn empty_buffer_emits_nothing() {
        let (tx, rx) = flume::unbounded();
        let buf = PartitionBuffer::new(100, tx);
        buf.finish().await.unwrap();
        assert!(rx.drain().next().is_none());
    }
}
