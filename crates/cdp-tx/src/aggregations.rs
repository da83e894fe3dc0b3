//! Dataset-level aggregations.
//!
//! Each reducer folds partitions into a JSON accumulator and merges
//! accumulators produced on different tasks; `combine` is associative and
//! commutative so the runtime may tree-reduce in any order.

use cdp_core::registry::parse_params;
use cdp_core::{CdpError, FieldPath, ReduceFn, Row};
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterParams {
    /// Output key for the finalized result
    pub name: String,
    /// Column whose values are counted
    pub on: FieldPath,
    /// Keep only the top-k counts; null keeps all
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// Multiset of stringified column values; finalizes to `[value, count]`
/// pairs ordered by descending count.
pub struct CounterAggregation {
    params: CounterParams,
}

impl CounterAggregation {
    pub fn new(params: CounterParams) -> Self {
        Self { params }
    }

    fn key_of(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

impl ReduceFn for CounterAggregation {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn init(&self) -> Value {
        Value::Object(Map::new())
    }

    fn accumulate(&self, acc: Value, rows: &[Row]) -> Result<Value, CdpError> {
        let mut counts = acc.as_object().cloned().unwrap_or_default();
        for row in rows {
            let Some(key) = self.params.on.get(row).and_then(Self::key_of) else {
                continue;
            };
            let entry = counts.entry(key).or_insert(json!(0));
            *entry = json!(entry.as_u64().unwrap_or(0) + 1);
        }
        Ok(Value::Object(counts))
    }

    fn combine(&self, a: Value, b: Value) -> Result<Value, CdpError> {
        let mut merged = a.as_object().cloned().unwrap_or_default();
        for (key, count) in b.as_object().cloned().unwrap_or_default() {
            let entry = merged.entry(key).or_insert(json!(0));
            *entry = json!(entry.as_u64().unwrap_or(0) + count.as_u64().unwrap_or(0));
        }
        Ok(Value::Object(merged))
    }

    fn finalize(&self, acc: Value) -> Result<Value, CdpError> {
        let counts = acc.as_object().cloned().unwrap_or_default();
        let mut ranked: Vec<(String, u64)> = counts
            .into_iter()
            .map(|(key, count)| (key, count.as_u64().unwrap_or(0)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let take = self.params.top_k.unwrap_or(ranked.len());
        Ok(Value::Array(
            ranked.into_iter().take(take).map(|(key, count)| json!([key, count])).collect(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalarOp {
    Sum,
    Count,
    Mean,
    Min,
    Max,
    Std,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalarParams {
    pub name: String,
    pub on: FieldPath,
    /// Degrees-of-freedom correction for `std`
    #[serde(default = "default_ddof")]
    pub ddof: u64,
}

fn default_ddof() -> u64 {
    1
}

/// The standard arithmetic reducers. Missing and null values are skipped.
pub struct ScalarAggregation {
    params: ScalarParams,
    op: ScalarOp,
}

impl ScalarAggregation {
    fn values<'a>(&'a self, rows: &'a [Row]) -> impl Iterator<Item = f64> + 'a {
        rows.iter().filter_map(|row| self.params.on.get_f64(row))
    }
}

impl ReduceFn for ScalarAggregation {
    fn name(&self) -> &str {
        &self.params.name
    }

    fn init(&self) -> Value {
        match self.op {
            ScalarOp::Sum | ScalarOp::Min | ScalarOp::Max => Value::Null,
            ScalarOp::Count => json!(0),
            ScalarOp::Mean => json!([0.0, 0]),
            // Welford state: [count, mean, m2]
            ScalarOp::Std => json!([0, 0.0, 0.0]),
        }
    }

    fn accumulate(&self, acc: Value, rows: &[Row]) -> Result<Value, CdpError> {
        let folded = match self.op {
            ScalarOp::Sum => {
                let mut total = acc.as_f64();
                for v in self.values(rows) {
                    total = Some(total.unwrap_or(0.0) + v);
                }
                total.map(|t| json!(t)).unwrap_or(Value::Null)
            }
            ScalarOp::Count => {
                json!(acc.as_u64().unwrap_or(0) + self.values(rows).count() as u64)
            }
            ScalarOp::Mean => {
                let (mut sum, mut count) = (acc[0].as_f64().unwrap_or(0.0), acc[1].as_u64().unwrap_or(0));
                for v in self.values(rows) {
                    sum += v;
                    count += 1;
                }
                json!([sum, count])
            }
            ScalarOp::Min => {
                let mut best = acc.as_f64();
                for v in self.values(rows) {
                    best = Some(best.map_or(v, |b| b.min(v)));
                }
                best.map(|b| json!(b)).unwrap_or(Value::Null)
            }
            ScalarOp::Max => {
                let mut best = acc.as_f64();
                for v in self.values(rows) {
                    best = Some(best.map_or(v, |b| b.max(v)));
                }
                best.map(|b| json!(b)).unwrap_or(Value::Null)
            }
            ScalarOp::Std => {
                let (mut n, mut mean, mut m2) = (
                    acc[0].as_u64().unwrap_or(0),
                    acc[1].as_f64().unwrap_or(0.0),
                    acc[2].as_f64().unwrap_or(0.0),
                );
                for v in self.values(rows) {
                    n += 1;
                    let delta = v - mean;
                    mean += delta / n as f64;
                    m2 += delta * (v - mean);
                }
                json!([n, mean, m2])
            }
        };
        Ok(folded)
    }

    fn combine(&self, a: Value, b: Value) -> Result<Value, CdpError> {
        let merged = match self.op {
            ScalarOp::Sum => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => json!(x + y),
                (Some(x), None) | (None, Some(x)) => json!(x),
                (None, None) => Value::Null,
            },
            ScalarOp::Count => json!(a.as_u64().unwrap_or(0) + b.as_u64().unwrap_or(0)),
            ScalarOp::Mean => json!([
                a[0].as_f64().unwrap_or(0.0) + b[0].as_f64().unwrap_or(0.0),
                a[1].as_u64().unwrap_or(0) + b[1].as_u64().unwrap_or(0),
            ]),
            ScalarOp::Min => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => json!(x.min(y)),
                (Some(x), None) | (None, Some(x)) => json!(x),
                (None, None) => Value::Null,
            },
            ScalarOp::Max => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => json!(x.max(y)),
                (Some(x), None) | (None, Some(x)) => json!(x),
                (None, None) => Value::Null,
            },
            ScalarOp::Std => {
                let (na, ma, m2a) = (
                    a[0].as_u64().unwrap_or(0),
                    a[1].as_f64().unwrap_or(0.0),
                    a[2].as_f64().unwrap_or(0.0),
                );
                let (nb, mb, m2b) = (
                    b[0].as_u64().unwrap_or(0),
                    b[1].as_f64().unwrap_or(0.0),
                    b[2].as_f64().unwrap_or(0.0),
                );
                let n = na + nb;
                if n == 0 {
                    json!([0, 0.0, 0.0])
                } else {
                    let delta = mb - ma;
                    let mean = ma + delta * nb as f64 / n as f64;
                    let m2 = m2a + m2b + delta * delta * (na as f64 * nb as f64) / n as f64;
                    json!([n, mean, m2])
                }
            }
        };
        Ok(merged)
    }

    fn finalize(&self, acc: Value) -> Result<Value, CdpError> {
        let out = match self.op {
            ScalarOp::Sum | ScalarOp::Min | ScalarOp::Max | ScalarOp::Count => acc,
            ScalarOp::Mean => {
                let (sum, count) = (acc[0].as_f64().unwrap_or(0.0), acc[1].as_u64().unwrap_or(0));
                if count == 0 {
                    Value::Null
                } else {
                    json!(sum / count as f64)
                }
            }
            ScalarOp::Std => {
                let (n, m2) = (acc[0].as_u64().unwrap_or(0), acc[2].as_f64().unwrap_or(0.0));
                if n <= self.params.ddof {
                    Value::Null
                } else {
                    json!((m2 / (n - self.params.ddof) as f64).sqrt())
                }
            }
        };
        Ok(out)
    }
}

pub fn register(registry: &mut cdp_core::registry::Registry) {
    registry.register("aggregation", "counter", "top-k value counts", |p| {
        Ok(cdp_core::Component::Reduce(Box::new(CounterAggregation::new(
            parse_params("aggregation", "counter", p)?,
        ))))
    });
    registry.register("aggregation", "sum", "sum over a column", |p| scalar("sum", ScalarOp::Sum, p));
    registry.register("aggregation", "count", "count of non-null values", |p| {
        scalar("count", ScalarOp::Count, p)
    });
    registry.register("aggregation", "mean", "mean over a column", |p| scalar("mean", ScalarOp::Mean, p));
    registry.register("aggregation", "min", "minimum over a column", |p| scalar("min", ScalarOp::Min, p));
    registry.register("aggregation", "max", "maximum over a column", |p| scalar("max", ScalarOp::Max, p));
    registry.register("aggregation", "std", "standard deviation over a column", |p| {
        scalar("std", ScalarOp::Std, p)
    });
}

fn scalar(
    kind: &str,
    op: ScalarOp,
    params: &Map<String, Value>,
) -> Result<cdp_core::Component, CdpError> {
    let params: ScalarParams = parse_params("aggregation", kind, params)?;
    Ok(cdp_core::Component::Reduce(Box::new(ScalarAggregation { params, op })))
}
