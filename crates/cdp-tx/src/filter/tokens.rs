//! Token-count filter.

use async_trait::async_trait;
use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, FilterFn, Row};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TokenCountFilterParams {
    pub name: String,
    pub on: FieldPath,
    pub if_missing: bool,
    pub min_tokens: u64,
    pub max_tokens: Option<u64>,
}

impl Default for TokenCountFilterParams {
    fn default() -> Self {
        Self {
            name: "token_count_filter".to_owned(),
            on: FieldPath::new("metadata.token_count"),
            if_missing: false,
            min_tokens: 10,
            max_tokens: None,
        }
    }
}

/// Keeps rows whose token count lies within the configured range. A zero
/// count is treated like a missing value.
pub struct TokenCountFilter {
    params: TokenCountFilterParams,
}

impl TokenCountFilter {
    pub fn new(params: TokenCountFilterParams) -> Self {
        Self { params }
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("filter", "token_count", "keep rows within a token budget", |p| {
        Ok(cdp_core::Component::Filter(Box::new(TokenCountFilter::new(
            parse_params("filter", "token_count", p)?,
        ))))
    });
}

#[async_trait]
impl FilterFn for TokenCountFilter {
    fn name(&self) -> &str {
        &self.params.name
    }

    async fn keep(&self, row: &Row) -> Result<bool, CdpError> {
        let count = self.params.on.get_f64(row);
        let Some(count) = count.filter(|c| *c != 0.0) else {
            return Ok(self.params.if_missing);
        };
        let too_few = count < self.params.min_tokens as f64;
        let too_many = self
            .params
            .max_tokens
            .map_or(false, |max| count > max as f64);
        Ok(!(too_few || too_many))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(count: serde_json::Value) -> Row {
        json!({"metadata": {"token_count": count}}).as_object().cloned().unwrap()
    }

    fn filter(min: u64, max: Option<u64>) -> TokenCountFilter {
        TokenCountFilter::new(TokenCountFilterParams {
            min_tokens: min,
            max_tokens: max,
            ..TokenCountFilterParams::default()
        })
    }

    #[tokio::test]
    async fn keeps_within_range() {
        assert!(filter(10, Some(100)).keep(&row(json!(50))).await.unwrap());
        assert!(!filter(10, Some(100)).keep(&row(json!(5))).await.unwrap());
        assert!(!filter(10, Some(100)).keep(&row(json!(500))).await.unwrap());
    }

    #[tokio::test]
    async fn no_upper_bound() {
        assert!(filter(10, None).keep(&row(json!(1_000_000))).await.unwrap());
    }

    #[tokio::test]
    async fn zero_and_missing_use_if_missing() {
        assert!(!filter(10, None).keep(&row(json!(0))).await.unwrap());
        assert!(!filter(10, None).keep(&Row::new()).await.unwrap());
    }
}
