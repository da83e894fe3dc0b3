//! Ingestors: conform foreign column layouts to the corpus row schema
//! `{id, text, source, metadata}`.

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, MapFn, Row};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseIngestorParams {
    #[serde(default = "default_name")]
    pub name: String,
    /// Column to read the identifier from; missing values get a random UUID
    pub id_column: String,
    /// Column to read the raw text from; missing values become empty text
    pub text_column: String,
    /// Column to read source information from, or a literal source name
    pub source_name_or_column: String,
    /// Column or literal for the subset, stored under `metadata.subset`
    #[serde(default)]
    pub subset_name_or_column: Option<String>,
    /// Column or literal for the license, stored under `metadata.license`
    #[serde(default)]
    pub license_name_or_column: Option<String>,
    /// Additional columns carried over unchanged
    #[serde(default)]
    pub other: Option<Vec<String>>,
}

fn default_name() -> String {
    "base_ingestor".to_owned()
}

/// Rebuilds each row in the corpus schema, resolving every
/// name-or-column parameter against the row first and falling back to the
/// literal value.
pub struct BaseIngestor {
    params: BaseIngestorParams,
}

impl BaseIngestor {
    pub fn new(params: BaseIngestorParams) -> Self {
        Self { params }
    }

    fn value_to_string(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    fn name_or_column(row: &Row, name_or_column: &str) -> Value {
        FieldPath::new(name_or_column)
            .get(row)
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| Value::String(name_or_column.to_owned()))
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("ingest", "base", "conform rows to the corpus schema", |p| {
        Ok(cdp_core::Component::Map(Box::new(BaseIngestor::new(
            parse_params("ingest", "base", p)?,
        ))))
    });
}

#[async_trait]
impl MapFn for BaseIngestor {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn apply(&self, row: &mut Row) -> Result<(), CdpError> {
        let id = FieldPath::new(&self.params.id_column)
            .get(row)
            .and_then(Self::value_to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let text = FieldPath::new(&self.params.text_column)
            .get(row)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        let source = Self::name_or_column(row, &self.params.source_name_or_column);

        let mut metadata = Map::new();
        if let Some(subset) = &self.params.subset_name_or_column {
            metadata.insert("subset".to_owned(), Self::name_or_column(row, subset));
        }
        if let Some(license) = &self.params.license_name_or_column {
            metadata.insert("license".to_owned(), Self::name_or_column(row, license));
        }

        let mut updated = Row::new();
        if let Some(other) = &self.params.other {
            for column in other {
                let value = FieldPath::new(column).get(row).cloned().unwrap_or(Value::Null);
                updated.insert(column.clone(), value);
            }
        }
        updated.insert("id".to_owned(), Value::String(id));
        updated.insert("text".to_owned(), Value::String(text));
        updated.insert("source".to_owned(), source);
        updated.insert("metadata".to_owned(), Value::Object(metadata));

        *row = updated;
        Ok(())
    }
}
