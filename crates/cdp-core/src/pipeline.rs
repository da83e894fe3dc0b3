//! Pipeline compilation and execution.
//!
//! A validated [`PipelineSpec`] compiles into a reader, an ordered list of
//! map/filter stages, an optional writer and an optional list of reducers.
//! Execution runs the phases read -> process -> write?/aggregate?: the reader
//! pushes partitions into a bounded channel, a pool of worker tasks pulls
//! partitions and applies the full stage graph row by row, and processed
//! partitions fan out to the writer and the aggregation tasks. The writer
//! and the aggregators consume the same processed stream; nothing upstream
//! is ever re-run.
//!
//! Ordering guarantees: stages apply in declared order within a row, row
//! order is preserved within a partition, and partitions are unordered with
//! respect to each other.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineSpec;
use crate::error::{backoff_delay, CdpError, MAX_RETRIES};
use crate::ops::{Component, FilterFn, MapFn, Partition, ReadHints, Reader, ReduceFn, WriteHints, Writer};
use crate::registry::Registry;
use crate::row::{row_id, FieldPath, Row};

/// A compiled processing stage: map or filter.
pub enum Stage {
    Map(Box<dyn MapFn>),
    Filter(Box<dyn FilterFn>),
}

struct Compiled {
    reader: Box<dyn Reader>,
    stages: Vec<(String, Stage)>,
    writer: Option<Box<dyn Writer>>,
    reducers: Vec<Box<dyn ReduceFn>>,
}

/// Outcome of a pipeline run.
#[derive(Debug, Default, Serialize)]
pub struct PipelineReport {
    pub rows_in: u64,
    pub rows_out: u64,
    pub rows_dropped_by_stage: BTreeMap<String, u64>,
    pub rows_written: Option<u64>,
    pub aggregations: Option<Value>,
}

struct Counters {
    rows_in: AtomicU64,
    rows_out: AtomicU64,
    dropped: Vec<AtomicU64>,
}

impl Counters {
    fn new(stage_count: usize) -> Self {
        Self {
            rows_in: AtomicU64::new(0),
            rows_out: AtomicU64::new(0),
            dropped: (0..stage_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

/// Orchestrates the execution of a data processing workflow from a
/// validated [`PipelineSpec`].
pub struct DataPipeline {
    spec: PipelineSpec,
}

impl DataPipeline {
    pub fn new(spec: PipelineSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    /// Compile every declared component, rejecting unknown types and invalid
    /// parameters before any data is touched.
    fn compile(&self, registry: &Registry) -> Result<Compiled, CdpError> {
        let input = &self.spec.input;
        let reader = match registry.construct("reader", &input.format, &input.params)? {
            Component::Reader(r) => r,
            other => {
                return Err(CdpError::config(
                    format!("input.{}", input.format),
                    format!("expected a reader, got a {} component", other.capability()),
                ))
            }
        };

        let mut stages = Vec::new();
        for processor in &self.spec.processors {
            if !processor.enabled {
                debug!(stage = %processor.key(), "stage disabled, skipping");
                continue;
            }
            match registry.construct(&processor.category, &processor.kind, &processor.params)? {
                Component::Map(m) => stages.push((processor.key(), Stage::Map(m))),
                Component::Filter(f) => stages.push((processor.key(), Stage::Filter(f))),
                other => {
                    return Err(CdpError::config(
                        processor.key(),
                        format!(
                            "processors must be map or filter stages, got a {} component",
                            other.capability()
                        ),
                    ))
                }
            }
        }

        let writer = match &self.spec.output {
            None => None,
            Some(output) => {
                if output.path.iter().count() > 1 {
                    return Err(CdpError::config(
                        "output.path",
                        "output takes a single destination path",
                    ));
                }
                match registry.construct("writer", &output.format, &output.params)? {
                    Component::Writer(w) => Some(w),
                    other => {
                        return Err(CdpError::config(
                            format!("output.{}", output.format),
                            format!("expected a writer, got a {} component", other.capability()),
                        ))
                    }
                }
            }
        };

        let mut reducers = Vec::new();
        for agg in self.spec.aggregations.iter().flatten() {
            if !agg.enabled {
                continue;
            }
            match registry.construct(&agg.category, &agg.kind, &agg.params)? {
                Component::Reduce(r) => reducers.push(r),
                other => {
                    return Err(CdpError::config(
                        agg.key(),
                        format!("aggregations must be reduce components, got a {}", other.capability()),
                    ))
                }
            }
        }

        if !self.spec.process_kwargs.is_empty() {
            debug!(keys = ?self.spec.process_kwargs.keys().collect::<Vec<_>>(),
                   "ignoring process_kwargs scheduler hints");
        }

        Ok(Compiled { reader, stages, writer, reducers })
    }

    /// Validate the configuration without running anything.
    pub fn validate(&self, registry: &Registry) -> Result<(), CdpError> {
        self.compile(registry).map(|_| ())
    }

    /// Execute the pipeline to completion (or cancellation).
    pub async fn run(
        &self,
        registry: &Registry,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, CdpError> {
        let compiled = self.compile(registry)?;
        let runtime = &self.spec.runtime;
        let workers = runtime.worker_count();
        let capacity = runtime.channel_capacity.max(1);

        info!(
            pipeline = %self.spec.name,
            workers,
            stages = compiled.stages.len(),
            "starting pipeline"
        );

        let counters = Arc::new(Counters::new(compiled.stages.len()));
        let stage_keys: Vec<String> = compiled.stages.iter().map(|(k, _)| k.clone()).collect();
        let stages = Arc::new(compiled.stages);

        // Reader -> workers. The bounded channel gates reader emission by the
        // number of in-flight partitions.
        let (part_tx, part_rx) = flume::bounded::<Partition>(capacity);
        let read_hints = ReadHints {
            target_partition_bytes: runtime.target_partition_bytes(),
            override_partition_count: runtime.override_partition_count,
        };
        let reader = compiled.reader;
        let input_path = self.spec.input.path.clone();
        let reader_cancel = cancel.child_token();
        let reader_handle = tokio::spawn(async move {
            reader.read(&input_path, &read_hints, part_tx, reader_cancel).await
        });

        // Workers -> writer.
        let (writer_tx, writer_handle) = match compiled.writer {
            None => (None, None),
            Some(writer) => {
                let (tx, rx) = flume::bounded::<Partition>(capacity);
                let path = self.spec.output.as_ref().map(|o| o.path.first().to_owned()).unwrap_or_default();
                let hints = WriteHints { min_rows_per_file: runtime.min_rows_per_file };
                let writer_cancel = cancel.child_token();
                let handle = tokio::spawn(async move {
                    writer.write(rx, &path, &hints, writer_cancel).await
                });
                (Some(tx), Some(handle))
            }
        };

        // Workers -> aggregation tasks. Accumulation runs in parallel with
        // the writer on its own task pool; local accumulators are merged
        // once all partitions are consumed.
        let reducers = Arc::new(compiled.reducers);
        let group_paths = Arc::new(self.spec.aggregation_kwargs.group_paths());
        let (agg_tx, mut agg_handles) = if reducers.is_empty() {
            (None, Vec::new())
        } else {
            let (tx, rx) = flume::bounded::<Partition>(capacity);
            let mut handles = Vec::with_capacity(workers);
            for _ in 0..workers {
                let rx = rx.clone();
                let reducers = Arc::clone(&reducers);
                let group_paths = Arc::clone(&group_paths);
                handles.push(tokio::spawn(async move {
                    let mut local = AggAccumulator::new();
                    while let Ok(partition) = rx.recv_async().await {
                        local.accumulate(&reducers, &group_paths, &partition)?;
                    }
                    Ok::<AggAccumulator, CdpError>(local)
                }));
            }
            (Some(tx), handles)
        };

        // Worker pool: each worker pulls a partition, applies the full stage
        // graph to it, and fans the result into the writer and aggregators.
        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let part_rx = part_rx.clone();
            let stages = Arc::clone(&stages);
            let counters = Arc::clone(&counters);
            let writer_tx = writer_tx.clone();
            let agg_tx = agg_tx.clone();
            let worker_cancel = cancel.child_token();
            let cancel_all = cancel.clone();
            worker_handles.push(tokio::spawn(async move {
                while let Ok(mut partition) = part_rx.recv_async().await {
                    if worker_cancel.is_cancelled() {
                        break;
                    }
                    let mut kept: Partition = Vec::with_capacity(partition.len());
                    'rows: for mut row in partition.drain(..) {
                        counters.rows_in.fetch_add(1, Ordering::Relaxed);
                        for (idx, (key, stage)) in stages.iter().enumerate() {
                            match apply_with_retries(stage, &mut row).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    counters.dropped[idx].fetch_add(1, Ordering::Relaxed);
                                    continue 'rows;
                                }
                                Err(e) if e.is_fatal() => {
                                    cancel_all.cancel();
                                    return Err(e);
                                }
                                Err(e) => {
                                    // Default policy: demote to a row-scoped
                                    // failure, log with the row id, continue.
                                    counters.dropped[idx].fetch_add(1, Ordering::Relaxed);
                                    warn!(stage = %key, row = %row_id(&row), error = %e, "row dropped");
                                    continue 'rows;
                                }
                            }
                        }
                        counters.rows_out.fetch_add(1, Ordering::Relaxed);
                        kept.push(row);
                    }
                    if kept.is_empty() {
                        continue;
                    }
                    match (&writer_tx, &agg_tx) {
                        (Some(w), Some(a)) => {
                            if w.send_async(kept.clone()).await.is_err() {
                                return Err(CdpError::ChannelClosed("writer"));
                            }
                            if a.send_async(kept).await.is_err() {
                                return Err(CdpError::ChannelClosed("aggregation"));
                            }
                        }
                        (Some(w), None) => {
                            if w.send_async(kept).await.is_err() {
                                return Err(CdpError::ChannelClosed("writer"));
                            }
                        }
                        (None, Some(a)) => {
                            if a.send_async(kept).await.is_err() {
                                return Err(CdpError::ChannelClosed("aggregation"));
                            }
                        }
                        (None, None) => {}
                    }
                }
                Ok(())
            }));
        }
        // The spawned tasks hold their own clones.
        drop(part_rx);
        drop(writer_tx);
        drop(agg_tx);

        let mut errors: Vec<CdpError> = Vec::new();

        match reader_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(CdpError::Other(e.into())),
        }
        for handle in worker_handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(CdpError::Other(e.into())),
            }
        }
        let rows_written = match writer_handle {
            None => None,
            Some(handle) => match handle.await {
                Ok(Ok(n)) => Some(n),
                Ok(Err(e)) => {
                    errors.push(e);
                    None
                }
                Err(e) => {
                    errors.push(CdpError::Other(e.into()));
                    None
                }
            },
        };
        let mut merged = AggAccumulator::new();
        for handle in agg_handles.drain(..) {
            match handle.await {
                Ok(Ok(local)) => {
                    if let Err(e) = merged.merge(&reducers, local) {
                        errors.push(e);
                    }
                }
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(CdpError::Other(e.into())),
            }
        }

        // Surface the originating failure rather than a knock-on closed
        // channel from a neighbouring task.
        if let Some(primary) = {
            let mut primary = None;
            for (i, e) in errors.iter().enumerate() {
                if !matches!(e, CdpError::ChannelClosed(_)) {
                    primary = Some(i);
                    break;
                }
            }
            primary.or(if errors.is_empty() { None } else { Some(0) })
        } {
            return Err(errors.swap_remove(primary));
        }

        let aggregations = if reducers.is_empty() {
            None
        } else if cancel.is_cancelled() && !self.spec.aggregation_kwargs.partial_on_cancel {
            debug!("pipeline cancelled; discarding partial aggregation state");
            None
        } else {
            Some(merged.finalize(&reducers, &group_paths)?)
        };

        let mut rows_dropped_by_stage = BTreeMap::new();
        for (key, counter) in stage_keys.iter().zip(counters.dropped.iter()) {
            *rows_dropped_by_stage.entry(key.clone()).or_insert(0) += counter.load(Ordering::Relaxed);
        }
        let report = PipelineReport {
            rows_in: counters.rows_in.load(Ordering::Relaxed),
            rows_out: counters.rows_out.load(Ordering::Relaxed),
            rows_dropped_by_stage,
            rows_written,
            aggregations,
        };
        info!(
            pipeline = %self.spec.name,
            rows_in = report.rows_in,
            rows_out = report.rows_out,
            dropped = ?report.rows_dropped_by_stage,
            "pipeline finished"
        );
        Ok(report)
    }
}

/// Apply one stage to one row, retrying transient failures with bounded
/// exponential backoff. Returns whether the row survives.
async fn apply_with_retries(stage: &Stage, row: &mut Row) -> Result<bool, CdpError> {
    let mut attempt = 0u32;
    loop {
        let result = match stage {
            Stage::Map(m) => m.apply(row).await.map(|()| true),
            Stage::Filter(f) => f.keep(row).await,
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(error = %e, attempt, "transient stage failure, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-task aggregation state: one accumulator per reducer, optionally keyed
/// by the projected group columns.
struct AggAccumulator {
    plain: Option<Vec<Value>>,
    groups: BTreeMap<String, GroupAcc>,
}

struct GroupAcc {
    keys: Vec<Value>,
    accs: Vec<Value>,
}

impl AggAccumulator {
    fn new() -> Self {
        Self { plain: None, groups: BTreeMap::new() }
    }

    fn accumulate(
        &mut self,
        reducers: &[Box<dyn ReduceFn>],
        group_paths: &[FieldPath],
        partition: &[Row],
    ) -> Result<(), CdpError> {
        if group_paths.is_empty() {
            let accs = self
                .plain
                .get_or_insert_with(|| reducers.iter().map(|r| r.init()).collect());
            for (reducer, acc) in reducers.iter().zip(accs.iter_mut()) {
                let current = std::mem::take(acc);
                *acc = reducer.accumulate(current, partition)?;
            }
            return Ok(());
        }

        // Project the group columns and bucket rows by group key first, so
        // each reducer still sees whole (sub-)partitions.
        let mut buckets: BTreeMap<String, (Vec<Value>, Vec<Row>)> = BTreeMap::new();
        for row in partition {
            let keys: Vec<Value> = group_paths
                .iter()
                .map(|p| p.get(row).cloned().unwrap_or(Value::Null))
                .collect();
            let key = serde_json::to_string(&keys)
                .map_err(|e| CdpError::row(row_id(row), e.to_string()))?;
            buckets.entry(key).or_insert_with(|| (keys, Vec::new())).1.push(row.clone());
        }
        for (key, (keys, rows)) in buckets {
            let group = self.groups.entry(key).or_insert_with(|| GroupAcc {
                keys,
                accs: reducers.iter().map(|r| r.init()).collect(),
            });
            for (reducer, acc) in reducers.iter().zip(group.accs.iter_mut()) {
                let current = std::mem::take(acc);
                *acc = reducer.accumulate(current, &rows)?;
            }
        }
        Ok(())
    }

    fn merge(&mut self, reducers: &[Box<dyn ReduceFn>], other: AggAccumulator) -> Result<(), CdpError> {
        if let Some(other_accs) = other.plain {
            match &mut self.plain {
                None => self.plain = Some(other_accs),
                Some(accs) => {
                    for ((reducer, acc), theirs) in
                        reducers.iter().zip(accs.iter_mut()).zip(other_accs)
                    {
                        let current = std::mem::take(acc);
                        *acc = reducer.combine(current, theirs)?;
                    }
                }
            }
        }
        for (key, theirs) in other.groups {
            match self.groups.get_mut(&key) {
                None => {
                    self.groups.insert(key, theirs);
                }
                Some(group) => {
                    for ((reducer, acc), their_acc) in
                        reducers.iter().zip(group.accs.iter_mut()).zip(theirs.accs)
                    {
                        let current = std::mem::take(acc);
                        *acc = reducer.combine(current, their_acc)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn finalize(
        self,
        reducers: &[Box<dyn ReduceFn>],
        group_paths: &[FieldPath],
    ) -> Result<Value, CdpError> {
        if group_paths.is_empty() {
            let accs = self
                .plain
                .unwrap_or_else(|| reducers.iter().map(|r| r.init()).collect());
            let mut out = Map::new();
            for (reducer, acc) in reducers.iter().zip(accs) {
                out.insert(reducer.name().to_owned(), reducer.finalize(acc)?);
            }
            return Ok(Value::Object(out));
        }
        let mut records = Vec::with_capacity(self.groups.len());
        for (_, group) in self.groups {
            let mut record = Map::new();
            for (path, key) in group_paths.iter().zip(group.keys) {
                record.insert(path.as_str().to_owned(), key);
            }
            for (reducer, acc) in reducers.iter().zip(group.accs) {
                record.insert(reducer.name().to_owned(), reducer.finalize(acc)?);
            }
            records.push(Value::Object(record));
        }
        Ok(Value::Array(records))
    }
}
