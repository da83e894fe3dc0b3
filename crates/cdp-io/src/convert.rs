//! Arrow <-> row conversions shared by the columnar readers and writers.

use std::sync::Arc;

use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::{ArrayWriter, ReaderBuilder};
use arrow::record_batch::RecordBatch;
use cdp_core::{CdpError, Row};
use serde_json::Value;

/// Convert record batches into rows.
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>, CdpError> {
    let mut writer = ArrayWriter::new(Vec::new());
    for batch in batches {
        writer
            .write(batch)
            .map_err(|e| CdpError::permanent("arrow-to-rows", e.to_string()))?;
    }
    writer
        .finish()
        .map_err(|e| CdpError::permanent("arrow-to-rows", e.to_string()))?;
    let data = writer.into_inner();
    if data.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&data).map_err(|e| CdpError::permanent("arrow-to-rows", e.to_string()))
}

/// Convert rows into a single record batch, inferring the schema from the
/// rows themselves.
pub fn rows_to_batch(rows: &[Row]) -> Result<RecordBatch, CdpError> {
    if rows.is_empty() {
        return Err(CdpError::permanent("rows-to-arrow", "cannot build a batch from zero rows"));
    }
    let schema = infer_json_schema_from_iterator(
        rows.iter().map(|r| Ok(Value::Object(r.clone()))),
    )
    .map_err(|e| CdpError::permanent("rows-to-arrow", e.to_string()))?;
    let mut decoder = ReaderBuilder::new(Arc::new(schema))
        .build_decoder()
        .map_err(|e| CdpError::permanent("rows-to-arrow", e.to_string()))?;
    decoder
        .serialize(rows)
        .map_err(|e| CdpError::permanent("rows-to-arrow", e.to_string()))?;
    decoder
        .flush()
        .map_err(|e| CdpError::permanent("rows-to-arrow", e.to_string()))?
        .ok_or_else(|| CdpError::permanent("rows-to-arrow", "decoder produced no batch"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn rows_round_trip_through_arrow() {
        let rows = vec![
            row(json!({"id": "0", "text": "hello", "num_tokens": 2})),
            row(json!({"id": "1", "text": "world", "num_tokens": 3})),
        ];
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let back = batches_to_rows(&[batch]).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].get("text"), Some(&json!("hello")));
        assert_eq!(back[1].get("num_tokens"), Some(&json!(3)));
    }

    #[test]
    fn nested_metadata_survives() {
        let rows = vec![row(json!({
            "id": "0",
            "text": "t",
            "metadata": {"language": {"names": ["en"], "scores": [0.9]}}
        }))];
        let batch = rows_to_batch(&rows).unwrap();
        let back = batches_to_rows(&[batch]).unwrap();
        assert_eq!(
            back[0]["metadata"]["language"]["names"],
            json!(["en"])
        );
    }

    #[test]
    fn empty_batch_list_yields_no_rows() {
        assert!(batches_to_rows(&[]).unwrap().is_empty());
        assert!(rows_to_batch(&[]).is_err());
    }
}
