//! Volcano-style iterator executor.
//!
//! Every operator implements open/next/close. Rows are pulled one at a time
//! by the caller; the only intra-query parallelism is the connector scan
//! tasks, which prefetch batches concurrently while the tree is driven
//! synchronously. Materialising operators (sort buffer, hash tables,
//! nested-loop buffer) observe the intermediate-result cap: on overflow
//! they stop pulling, mark the query truncated and keep serving what they
//! hold. The cancellation token is checked at row boundaries and before
//! every connector call.

use crate::connector::{CancelToken, Connector, Pushdown, RowBatchStream, ScanRequest};
use crate::error::{EngineError, EngineResult};
use crate::expr::{AggregateExpr, AggregateFunction, ScalarExpr};
use crate::logical::{JoinType, SortKey};
use crate::physical::{BuildSide, PhysicalPlan, ScanExec};
use crate::types::{Row, Value};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Shared per-query execution context.
#[derive(Clone)]
pub struct ExecContext {
    pub query_id: u64,
    pub cancel: CancelToken,
    pub max_intermediate_rows: usize,
    pub batch_size: usize,
    truncated: Arc<AtomicBool>,
    warnings: Arc<Mutex<Vec<String>>>,
}

impl ExecContext {
    pub fn new(
        query_id: u64,
        cancel: CancelToken,
        max_intermediate_rows: usize,
        batch_size: usize,
    ) -> Self {
        ExecContext {
            query_id,
            cancel,
            max_intermediate_rows,
            batch_size,
            truncated: Arc::new(AtomicBool::new(false)),
            warnings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Record that a materialising operator hit the cap. The query keeps
    /// running and finishes as a success with a warning.
    pub fn mark_truncated(&self, operator: &str) {
        self.truncated
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let warning = format!(
            "intermediate result cap of {} rows reached in {operator}; results are truncated",
            self.max_intermediate_rows
        );
        debug!(query_id = self.query_id, operator, "query truncated at cap");
        let mut warnings = self
            .warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !warnings.contains(&warning) {
            warnings.push(warning);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorState {
    Created,
    Open,
    Closed,
}

/// The three-method iterator contract.
#[async_trait]
pub trait Operator: Send {
    /// Acquire resources and open children, in order. Re-opening is a bug
    /// and fails loudly.
    async fn open(&mut self) -> EngineResult<()>;

    /// Produce the next row; `None` at end of input.
    async fn next(&mut self) -> EngineResult<Option<Row>>;

    /// Release resources and close children. Safe after any outcome of
    /// open/next, and runs each child exactly once.
    async fn close(&mut self) -> EngineResult<()>;
}

type ConnectorMap = HashMap<String, Arc<dyn Connector>>;

/// Build the operator tree for a physical plan.
pub fn build_operator(
    plan: &PhysicalPlan,
    connectors: &ConnectorMap,
    ctx: &ExecContext,
) -> EngineResult<Box<dyn Operator>> {
    Ok(match plan {
        PhysicalPlan::SourceScan { exec, .. } => {
            let connector = connectors
                .get(&exec.scan.table.source)
                .cloned()
                .ok_or_else(|| EngineError::SourceUnavailable {
                    source: exec.scan.table.source.clone(),
                    reason: "no connector registered".to_string(),
                })?;
            Box::new(TableScanOp::new(exec.clone(), connector, ctx.clone()))
        }
        PhysicalPlan::Filter {
            input, predicate, ..
        } => Box::new(FilterOp {
            child: build_operator(input, connectors, ctx)?,
            predicate: predicate.clone(),
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::Project { input, exprs, .. } => Box::new(ProjectOp {
            child: build_operator(input, connectors, ctx)?,
            exprs: exprs.clone(),
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::Sort { input, keys, .. } => Box::new(SortOp {
            child: build_operator(input, connectors, ctx)?,
            keys: keys.clone(),
            buffer: VecDeque::new(),
            loaded: false,
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::Aggregate {
            input,
            group_by,
            aggregates,
            schema,
            ..
        } => Box::new(AggregateOp {
            child: build_operator(input, connectors, ctx)?,
            group_by: group_by.clone(),
            aggregates: aggregates.clone(),
            output_width: schema.len(),
            groups: Vec::new(),
            index: HashMap::new(),
            emit_from: 0,
            loaded: false,
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::HashJoin {
            left,
            right,
            join_type,
            on,
            filter,
            build_side,
            ..
        } => Box::new(HashJoinOp {
            left: build_operator(left, connectors, ctx)?,
            right: build_operator(right, connectors, ctx)?,
            left_width: left.schema().len(),
            right_width: right.schema().len(),
            join_type: *join_type,
            on: on.clone(),
            filter: filter.clone(),
            build_side: *build_side,
            table: HashMap::new(),
            build_rows: Vec::new(),
            matched: Vec::new(),
            built: false,
            probe_done: false,
            pending: VecDeque::new(),
            drain_index: 0,
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::NestedLoopJoin {
            left,
            right,
            join_type,
            filter,
            ..
        } => Box::new(NestedLoopJoinOp {
            left: build_operator(left, connectors, ctx)?,
            right: build_operator(right, connectors, ctx)?,
            left_width: left.schema().len(),
            right_width: right.schema().len(),
            join_type: *join_type,
            filter: filter.clone(),
            right_rows: Vec::new(),
            right_matched: Vec::new(),
            right_loaded: false,
            current_left: None,
            right_pos: 0,
            current_matched: false,
            pending: VecDeque::new(),
            drain_index: 0,
            left_done: false,
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::Limit {
            input,
            limit,
            offset,
            ..
        } => Box::new(LimitOp {
            child: build_operator(input, connectors, ctx)?,
            limit: *limit,
            offset: *offset,
            skipped: 0,
            emitted: 0,
            child_closed: false,
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::Union { inputs, .. } => Box::new(UnionOp {
            children: inputs
                .iter()
                .map(|i| build_operator(i, connectors, ctx))
                .collect::<EngineResult<Vec<_>>>()?,
            current: 0,
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
        PhysicalPlan::Values { rows_data, .. } => Box::new(ValuesOp {
            rows: rows_data.clone(),
            position: 0,
            ctx: ctx.clone(),
            state: OperatorState::Created,
        }),
    })
}

fn already_open(name: &str) -> EngineError {
    EngineError::Internal(format!("{name} opened twice"))
}

// ---------------------------------------------------------------------------
// TableScan
// ---------------------------------------------------------------------------

struct TableScanOp {
    exec: ScanExec,
    connector: Arc<dyn Connector>,
    stream: Option<Box<dyn RowBatchStream>>,
    batch: VecDeque<Row>,
    ctx: ExecContext,
    state: OperatorState,
}

impl TableScanOp {
    fn new(exec: ScanExec, connector: Arc<dyn Connector>, ctx: ExecContext) -> Self {
        TableScanOp {
            exec,
            connector,
            stream: None,
            batch: VecDeque::new(),
            ctx,
            state: OperatorState::Created,
        }
    }

    fn request(&self) -> ScanRequest {
        let pushdown = Pushdown {
            filter: self.exec.pushed_filter.clone(),
            projection: if self.exec.scan.aggregate.is_some() {
                None
            } else {
                Some(self.exec.fetch.clone())
            },
            limit: self.exec.scan.limit,
            sort: self.exec.pushed_sort.clone(),
            aggregate: self.exec.scan.aggregate.clone(),
        };
        ScanRequest {
            table: self.exec.scan.table.clone(),
            pushdown,
            query_id: self.ctx.query_id,
            batch_size: self.ctx.batch_size,
        }
    }
}

#[async_trait]
impl Operator for TableScanOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("TableScan"));
        }
        self.ctx.check_cancelled()?;
        let stream = self
            .connector
            .scan(self.request(), self.ctx.cancel.clone())
            .await?;
        self.stream = Some(stream);
        self.state = OperatorState::Open;
        Ok(())
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        loop {
            self.ctx.check_cancelled()?;
            if let Some(row) = self.batch.pop_front() {
                if let Some(residual) = &self.exec.residual {
                    if !residual.evaluate(&row)?.is_true() {
                        continue;
                    }
                }
                if self.exec.scan.aggregate.is_some() {
                    return Ok(Some(row));
                }
                let projected = self
                    .exec
                    .output
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                    .collect();
                return Ok(Some(projected));
            }
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            match stream.next_batch().await? {
                Some(rows) => self.batch.extend(rows),
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        if let Some(mut stream) = self.stream.take() {
            stream.cancel().await;
        }
        self.batch.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Filter / Project
// ---------------------------------------------------------------------------

struct FilterOp {
    child: Box<dyn Operator>,
    predicate: ScalarExpr,
    ctx: ExecContext,
    state: OperatorState,
}

#[async_trait]
impl Operator for FilterOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("Filter"));
        }
        self.state = OperatorState::Open;
        self.child.open().await
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        loop {
            self.ctx.check_cancelled()?;
            match self.child.next().await? {
                Some(row) => {
                    if self.predicate.evaluate(&row)?.is_true() {
                        return Ok(Some(row));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        self.child.close().await
    }
}

struct ProjectOp {
    child: Box<dyn Operator>,
    exprs: Vec<(ScalarExpr, String)>,
    ctx: ExecContext,
    state: OperatorState,
}

#[async_trait]
impl Operator for ProjectOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("Project"));
        }
        self.state = OperatorState::Open;
        self.child.open().await
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        self.ctx.check_cancelled()?;
        match self.child.next().await? {
            Some(row) => {
                let mut out = Vec::with_capacity(self.exprs.len());
                for (expr, _) in &self.exprs {
                    out.push(expr.evaluate(&row)?);
                }
                Ok(Some(out))
            }
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        self.child.close().await
    }
}

// ---------------------------------------------------------------------------
// Sort
// ---------------------------------------------------------------------------

struct SortOp {
    child: Box<dyn Operator>,
    keys: Vec<SortKey>,
    buffer: VecDeque<Row>,
    loaded: bool,
    ctx: ExecContext,
    state: OperatorState,
}

pub(crate) fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let left = key.expr.evaluate(a).unwrap_or(Value::Null);
        let right = key.expr.evaluate(b).unwrap_or(Value::Null);
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if key.nulls_first {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, true) => {
                if key.nulls_first {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, false) => left.compare(&right).unwrap_or(Ordering::Equal),
        };
        let ordering = if key.ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[async_trait]
impl Operator for SortOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("Sort"));
        }
        self.state = OperatorState::Open;
        self.child.open().await
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        if !self.loaded {
            let mut rows: Vec<Row> = Vec::new();
            loop {
                self.ctx.check_cancelled()?;
                if rows.len() >= self.ctx.max_intermediate_rows {
                    self.ctx.mark_truncated("Sort buffer");
                    break;
                }
                match self.child.next().await? {
                    Some(row) => rows.push(row),
                    None => break,
                }
            }
            rows.sort_by(|a, b| compare_rows(a, b, &self.keys));
            self.buffer = rows.into();
            self.loaded = true;
        }
        self.ctx.check_cancelled()?;
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        self.buffer.clear();
        self.child.close().await
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Accumulator {
    Count(i64),
    Sum(Option<Value>),
    Min(Option<Value>),
    Max(Option<Value>),
    Avg { sum: f64, count: i64 },
    /// Distinct values seen, keyed by their group key.
    Distinct(HashMap<String, Value>, AggregateFunction),
}

impl Accumulator {
    fn new(agg: &AggregateExpr) -> Self {
        if agg.distinct {
            return Accumulator::Distinct(HashMap::new(), agg.func);
        }
        match agg.func {
            AggregateFunction::Count => Accumulator::Count(0),
            AggregateFunction::Sum => Accumulator::Sum(None),
            AggregateFunction::Min => Accumulator::Min(None),
            AggregateFunction::Max => Accumulator::Max(None),
            AggregateFunction::Avg => Accumulator::Avg { sum: 0.0, count: 0 },
        }
    }

    fn update(&mut self, value: Option<Value>) -> EngineResult<()> {
        match self {
            Accumulator::Count(n) => {
                // COUNT(*) counts rows; COUNT(x) counts non-null x.
                match value {
                    None => *n += 1,
                    Some(v) if !v.is_null() => *n += 1,
                    Some(_) => {}
                }
            }
            Accumulator::Sum(acc) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        *acc = Some(match acc.take() {
                            None => v,
                            Some(current) => add_values(&current, &v)?,
                        });
                    }
                }
            }
            Accumulator::Min(acc) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let replace = match acc {
                            None => true,
                            Some(current) => {
                                v.compare(current) == Some(Ordering::Less)
                            }
                        };
                        if replace {
                            *acc = Some(v);
                        }
                    }
                }
            }
            Accumulator::Max(acc) => {
                if let Some(v) = value {
                    if !v.is_null() {
                        let replace = match acc {
                            None => true,
                            Some(current) => {
                                v.compare(current) == Some(Ordering::Greater)
                            }
                        };
                        if replace {
                            *acc = Some(v);
                        }
                    }
                }
            }
            Accumulator::Avg { sum, count } => {
                if let Some(v) = value {
                    if !v.is_null() {
                        if let Value::Float64(f) = v.cast(crate::types::LogicalType::Float64)? {
                            *sum += f;
                            *count += 1;
                        }
                    }
                }
            }
            Accumulator::Distinct(seen, _) => {
                if let Some(v) = value {
                    if let Some(key) = v.group_key() {
                        seen.entry(key).or_insert(v);
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> EngineResult<Value> {
        Ok(match self {
            Accumulator::Count(n) => Value::Int64(n),
            Accumulator::Sum(acc) => acc.unwrap_or(Value::Null),
            Accumulator::Min(acc) | Accumulator::Max(acc) => acc.unwrap_or(Value::Null),
            Accumulator::Avg { sum, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::Float64(sum / count as f64)
                }
            }
            Accumulator::Distinct(seen, func) => match func {
                AggregateFunction::Count => Value::Int64(seen.len() as i64),
                AggregateFunction::Sum => {
                    let mut acc: Option<Value> = None;
                    for v in seen.into_values() {
                        acc = Some(match acc {
                            None => v,
                            Some(current) => add_values(&current, &v)?,
                        });
                    }
                    acc.unwrap_or(Value::Null)
                }
                AggregateFunction::Min | AggregateFunction::Max | AggregateFunction::Avg => {
                    return Err(EngineError::Unsupported(
                        "DISTINCT with this aggregate".to_string(),
                    ))
                }
            },
        })
    }
}

fn add_values(a: &Value, b: &Value) -> EngineResult<Value> {
    use crate::types::LogicalType;
    match (a, b) {
        (Value::Int32(x), Value::Int32(y)) => Ok(Value::Int64(*x as i64 + *y as i64)),
        (Value::Int64(x), Value::Int64(y)) => x
            .checked_add(*y)
            .map(Value::Int64)
            .ok_or_else(|| EngineError::Validation {
                node: "SUM".to_string(),
                column: None,
                reason: "numeric overflow".to_string(),
            }),
        (Value::Float64(x), Value::Float64(y)) => Ok(Value::Float64(x + y)),
        (Value::Decimal(x), Value::Decimal(y)) => x
            .checked_add(*y)
            .map(Value::Decimal)
            .ok_or_else(|| EngineError::Validation {
                node: "SUM".to_string(),
                column: None,
                reason: "numeric overflow".to_string(),
            }),
        _ => {
            let common = a
                .logical_type()
                .zip(b.logical_type())
                .and_then(|(l, r)| l.comparison_type(r))
                .unwrap_or(LogicalType::Float64);
            add_values(&a.cast(common)?, &b.cast(common)?)
        }
    }
}

struct AggregateOp {
    child: Box<dyn Operator>,
    group_by: Vec<ScalarExpr>,
    aggregates: Vec<AggregateExpr>,
    output_width: usize,
    /// Group key values plus accumulators, in first-seen order.
    groups: Vec<(Vec<Value>, Vec<Accumulator>)>,
    index: HashMap<String, usize>,
    emit_from: usize,
    loaded: bool,
    ctx: ExecContext,
    state: OperatorState,
}

impl AggregateOp {
    fn group_key(&self, values: &[Value]) -> String {
        // NULL is a legal grouping value; it forms its own group.
        values
            .iter()
            .map(|v| v.group_key().unwrap_or_else(|| "\u{0}null".to_string()))
            .collect::<Vec<_>>()
            .join("\u{1}")
    }
}

#[async_trait]
impl Operator for AggregateOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("Aggregate"));
        }
        self.state = OperatorState::Open;
        self.child.open().await
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        if !self.loaded {
            loop {
                self.ctx.check_cancelled()?;
                let Some(row) = self.child.next().await? else {
                    break;
                };
                let key_values: Vec<Value> = self
                    .group_by
                    .iter()
                    .map(|g| g.evaluate(&row))
                    .collect::<EngineResult<_>>()?;
                let key = self.group_key(&key_values);
                let slot = match self.index.get(&key) {
                    Some(&slot) => slot,
                    None => {
                        if self.groups.len() >= self.ctx.max_intermediate_rows {
                            self.ctx.mark_truncated("Aggregate hash table");
                            break;
                        }
                        let accumulators =
                            self.aggregates.iter().map(Accumulator::new).collect();
                        self.groups.push((key_values, accumulators));
                        self.index.insert(key, self.groups.len() - 1);
                        self.groups.len() - 1
                    }
                };
                let (_, accumulators) = &mut self.groups[slot];
                for (agg, acc) in self.aggregates.iter().zip(accumulators.iter_mut()) {
                    let value = match &agg.arg {
                        Some(expr) => Some(expr.evaluate(&row)?),
                        None => None,
                    };
                    acc.update(value)?;
                }
            }
            // A global aggregate with no input still emits one row.
            if self.groups.is_empty() && self.group_by.is_empty() {
                let accumulators: Vec<Accumulator> =
                    self.aggregates.iter().map(Accumulator::new).collect();
                self.groups.push((Vec::new(), accumulators));
            }
            self.loaded = true;
        }

        self.ctx.check_cancelled()?;
        if self.emit_from >= self.groups.len() {
            return Ok(None);
        }
        let (key_values, accumulators) =
            std::mem::replace(&mut self.groups[self.emit_from], (Vec::new(), Vec::new()));
        self.emit_from += 1;
        let mut out = Vec::with_capacity(self.output_width);
        out.extend(key_values);
        for acc in accumulators {
            out.push(acc.finish()?);
        }
        Ok(Some(out))
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        self.groups.clear();
        self.index.clear();
        self.child.close().await
    }
}

// ---------------------------------------------------------------------------
// HashJoin
// ---------------------------------------------------------------------------

struct HashJoinOp {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    left_width: usize,
    right_width: usize,
    join_type: JoinType,
    on: Vec<(ScalarExpr, ScalarExpr)>,
    filter: Option<ScalarExpr>,
    build_side: BuildSide,
    table: HashMap<String, Vec<usize>>,
    build_rows: Vec<Row>,
    matched: Vec<bool>,
    built: bool,
    probe_done: bool,
    pending: VecDeque<Row>,
    drain_index: usize,
    ctx: ExecContext,
    state: OperatorState,
}

impl HashJoinOp {
    fn build_keys(&self) -> Vec<&ScalarExpr> {
        match self.build_side {
            BuildSide::Left => self.on.iter().map(|(l, _)| l).collect(),
            BuildSide::Right => self.on.iter().map(|(_, r)| r).collect(),
        }
    }

    fn probe_keys(&self) -> Vec<&ScalarExpr> {
        match self.build_side {
            BuildSide::Left => self.on.iter().map(|(_, r)| r).collect(),
            BuildSide::Right => self.on.iter().map(|(l, _)| l).collect(),
        }
    }

    /// Join key for one row; `None` when any key is NULL (never matches).
    fn key_of(row: &Row, exprs: &[&ScalarExpr]) -> EngineResult<Option<String>> {
        let mut parts = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr.evaluate(row)?.group_key() {
                Some(part) => parts.push(part),
                None => return Ok(None),
            }
        }
        Ok(Some(parts.join("\u{1}")))
    }

    fn combine(&self, build: &Row, probe: &Row) -> Row {
        let (left, right) = match self.build_side {
            BuildSide::Left => (build, probe),
            BuildSide::Right => (probe, build),
        };
        match self.join_type {
            JoinType::Semi => left.clone(),
            _ => {
                let mut out = Vec::with_capacity(self.left_width + self.right_width);
                out.extend(left.iter().cloned());
                out.extend(right.iter().cloned());
                out
            }
        }
    }

    fn null_extended(&self, row: &Row, row_is_left: bool) -> Row {
        match self.join_type {
            JoinType::Semi => row.clone(),
            _ => {
                let mut out = Vec::with_capacity(self.left_width + self.right_width);
                if row_is_left {
                    out.extend(row.iter().cloned());
                    out.extend(std::iter::repeat(Value::Null).take(self.right_width));
                } else {
                    out.extend(std::iter::repeat(Value::Null).take(self.left_width));
                    out.extend(row.iter().cloned());
                }
                out
            }
        }
    }

    fn passes_filter(&self, combined: &Row) -> EngineResult<bool> {
        match &self.filter {
            Some(filter) => {
                // Semi joins evaluate the residual over the virtual
                // combined row, not the emitted left-only row.
                Ok(filter.evaluate(combined)?.is_true())
            }
            None => Ok(true),
        }
    }

    fn combined_for_filter(&self, build: &Row, probe: &Row) -> Row {
        let (left, right) = match self.build_side {
            BuildSide::Left => (build, probe),
            BuildSide::Right => (probe, build),
        };
        let mut out = Vec::with_capacity(self.left_width + self.right_width);
        out.extend(left.iter().cloned());
        out.extend(right.iter().cloned());
        out
    }

    /// The probe side preserves unmatched rows for these join types.
    fn probe_preserves(&self) -> bool {
        matches!(
            (self.build_side, self.join_type),
            (BuildSide::Right, JoinType::Left)
                | (BuildSide::Right, JoinType::Full)
                | (BuildSide::Left, JoinType::Right)
                | (BuildSide::Left, JoinType::Full)
        )
    }

    /// Unmatched build rows are emitted at the end for these join types.
    fn build_preserves(&self) -> bool {
        matches!(
            (self.build_side, self.join_type),
            (BuildSide::Left, JoinType::Left)
                | (BuildSide::Left, JoinType::Full)
                | (BuildSide::Right, JoinType::Right)
                | (BuildSide::Right, JoinType::Full)
        )
    }

    async fn build(&mut self) -> EngineResult<()> {
        let key_exprs: Vec<ScalarExpr> = self.build_keys().into_iter().cloned().collect();
        loop {
            self.ctx.check_cancelled()?;
            if self.build_rows.len() >= self.ctx.max_intermediate_rows {
                self.ctx.mark_truncated("HashJoin build side");
                break;
            }
            let side = match self.build_side {
                BuildSide::Left => &mut self.left,
                BuildSide::Right => &mut self.right,
            };
            let Some(row) = side.next().await? else {
                break;
            };
            let key_refs: Vec<&ScalarExpr> = key_exprs.iter().collect();
            let key = Self::key_of(&row, &key_refs)?;
            let slot = self.build_rows.len();
            self.build_rows.push(row);
            self.matched.push(false);
            if let Some(key) = key {
                self.table.entry(key).or_default().push(slot);
            }
        }
        self.built = true;
        debug!(
            query_id = self.ctx.query_id,
            rows = self.build_rows.len(),
            "hash join build side materialised"
        );
        Ok(())
    }

    async fn probe_step(&mut self) -> EngineResult<bool> {
        let probe_exprs: Vec<ScalarExpr> = self.probe_keys().into_iter().cloned().collect();
        let side = match self.build_side {
            BuildSide::Left => &mut self.right,
            BuildSide::Right => &mut self.left,
        };
        let Some(probe_row) = side.next().await? else {
            self.probe_done = true;
            return Ok(false);
        };

        let key_refs: Vec<&ScalarExpr> = probe_exprs.iter().collect();
        let key = Self::key_of(&probe_row, &key_refs)?;
        let mut matched_any = false;
        if let Some(key) = key {
            if let Some(slots) = self.table.get(&key).cloned() {
                for slot in slots {
                    let build_row = self.build_rows[slot].clone();
                    let combined = self.combined_for_filter(&build_row, &probe_row);
                    if !self.passes_filter(&combined)? {
                        continue;
                    }
                    matched_any = true;
                    self.matched[slot] = true;
                    match (self.join_type, self.build_side) {
                        // Semi with the outer side built: marking is enough,
                        // matched build rows drain at the end.
                        (JoinType::Semi, BuildSide::Left) => {}
                        // Semi probing the outer side: one emission per
                        // probe row.
                        (JoinType::Semi, BuildSide::Right) => {
                            self.pending.push_back(self.combine(&build_row, &probe_row));
                            break;
                        }
                        _ => {
                            self.pending.push_back(self.combine(&build_row, &probe_row));
                        }
                    }
                }
            }
        }
        if !matched_any && self.probe_preserves() {
            let probe_is_left = self.build_side == BuildSide::Right;
            self.pending
                .push_back(self.null_extended(&probe_row, probe_is_left));
        }
        Ok(true)
    }

    fn drain_step(&mut self) -> Option<Row> {
        // Build-side preservation (outer joins) and build-side semi output.
        loop {
            if self.drain_index >= self.build_rows.len() {
                return None;
            }
            let slot = self.drain_index;
            self.drain_index += 1;
            let emit = if self.join_type == JoinType::Semi {
                self.build_side == BuildSide::Left && self.matched[slot]
            } else {
                self.build_preserves() && !self.matched[slot]
            };
            if emit {
                let row = self.build_rows[slot].clone();
                let build_is_left = self.build_side == BuildSide::Left;
                return Some(if self.join_type == JoinType::Semi {
                    row
                } else {
                    self.null_extended(&row, build_is_left)
                });
            }
        }
    }
}

#[async_trait]
impl Operator for HashJoinOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("HashJoin"));
        }
        self.state = OperatorState::Open;
        self.left.open().await?;
        self.right.open().await?;
        Ok(())
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        if !self.built {
            self.build().await?;
        }
        loop {
            self.ctx.check_cancelled()?;
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            if self.probe_done {
                return Ok(self.drain_step());
            }
            if !self.probe_step().await? {
                continue;
            }
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        self.table.clear();
        self.build_rows.clear();
        self.pending.clear();
        let left_result = self.left.close().await;
        let right_result = self.right.close().await;
        left_result.and(right_result)
    }
}

// ---------------------------------------------------------------------------
// NestedLoopJoin
// ---------------------------------------------------------------------------

struct NestedLoopJoinOp {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    left_width: usize,
    right_width: usize,
    join_type: JoinType,
    filter: Option<ScalarExpr>,
    right_rows: Vec<Row>,
    right_matched: Vec<bool>,
    right_loaded: bool,
    current_left: Option<Row>,
    right_pos: usize,
    current_matched: bool,
    pending: VecDeque<Row>,
    drain_index: usize,
    left_done: bool,
    ctx: ExecContext,
    state: OperatorState,
}

impl NestedLoopJoinOp {
    fn combined(&self, left: &Row, right: &Row) -> Row {
        let mut out = Vec::with_capacity(self.left_width + self.right_width);
        out.extend(left.iter().cloned());
        out.extend(right.iter().cloned());
        out
    }

    fn emit_shape(&self, left: &Row, right: &Row) -> Row {
        match self.join_type {
            JoinType::Semi => left.clone(),
            _ => self.combined(left, right),
        }
    }
}

#[async_trait]
impl Operator for NestedLoopJoinOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("NestedLoopJoin"));
        }
        self.state = OperatorState::Open;
        self.left.open().await?;
        self.right.open().await?;
        Ok(())
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        if !self.right_loaded {
            loop {
                self.ctx.check_cancelled()?;
                if self.right_rows.len() >= self.ctx.max_intermediate_rows {
                    self.ctx.mark_truncated("NestedLoopJoin buffer");
                    break;
                }
                match self.right.next().await? {
                    Some(row) => {
                        self.right_rows.push(row);
                        self.right_matched.push(false);
                    }
                    None => break,
                }
            }
            self.right_loaded = true;
        }

        loop {
            self.ctx.check_cancelled()?;
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }

            if self.left_done {
                // Right/full joins emit unmatched buffered rows at the end.
                if matches!(self.join_type, JoinType::Right | JoinType::Full) {
                    while self.drain_index < self.right_rows.len() {
                        let slot = self.drain_index;
                        self.drain_index += 1;
                        if !self.right_matched[slot] {
                            let nulls = vec![Value::Null; self.left_width];
                            return Ok(Some(self.combined(&nulls, &self.right_rows[slot])));
                        }
                    }
                }
                return Ok(None);
            }

            if self.current_left.is_none() {
                match self.left.next().await? {
                    Some(row) => {
                        self.current_left = Some(row);
                        self.right_pos = 0;
                        self.current_matched = false;
                    }
                    None => {
                        self.left_done = true;
                        continue;
                    }
                }
            }

            let left_row = self.current_left.clone().expect("set above");
            while self.right_pos < self.right_rows.len() {
                let right_row = self.right_rows[self.right_pos].clone();
                let slot = self.right_pos;
                self.right_pos += 1;
                let combined = self.combined(&left_row, &right_row);
                let passes = match &self.filter {
                    Some(filter) => filter.evaluate(&combined)?.is_true(),
                    None => true,
                };
                if passes {
                    self.current_matched = true;
                    self.right_matched[slot] = true;
                    if self.join_type == JoinType::Semi {
                        self.right_pos = self.right_rows.len();
                        self.pending.push_back(left_row.clone());
                        break;
                    }
                    self.pending.push_back(self.emit_shape(&left_row, &right_row));
                }
            }

            if self.right_pos >= self.right_rows.len() {
                if !self.current_matched
                    && matches!(self.join_type, JoinType::Left | JoinType::Full)
                {
                    let nulls = vec![Value::Null; self.right_width];
                    self.pending.push_back(self.combined(&left_row, &nulls));
                }
                self.current_left = None;
            }
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        self.right_rows.clear();
        self.pending.clear();
        let left_result = self.left.close().await;
        let right_result = self.right.close().await;
        left_result.and(right_result)
    }
}

// ---------------------------------------------------------------------------
// Limit / Union / Values
// ---------------------------------------------------------------------------

struct LimitOp {
    child: Box<dyn Operator>,
    limit: Option<u64>,
    offset: u64,
    skipped: u64,
    emitted: u64,
    child_closed: bool,
    ctx: ExecContext,
    state: OperatorState,
}

#[async_trait]
impl Operator for LimitOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("Limit"));
        }
        self.state = OperatorState::Open;
        self.child.open().await
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        loop {
            self.ctx.check_cancelled()?;
            if let Some(limit) = self.limit {
                if self.emitted >= limit {
                    // The limit stops the upstream pull outright.
                    if !self.child_closed {
                        self.child_closed = true;
                        self.child.close().await?;
                    }
                    return Ok(None);
                }
            }
            if self.child_closed {
                return Ok(None);
            }
            match self.child.next().await? {
                Some(row) => {
                    if self.skipped < self.offset {
                        self.skipped += 1;
                        continue;
                    }
                    self.emitted += 1;
                    return Ok(Some(row));
                }
                None => return Ok(None),
            }
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        if self.child_closed {
            return Ok(());
        }
        self.child_closed = true;
        self.child.close().await
    }
}

struct UnionOp {
    children: Vec<Box<dyn Operator>>,
    current: usize,
    ctx: ExecContext,
    state: OperatorState,
}

#[async_trait]
impl Operator for UnionOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("Union"));
        }
        self.state = OperatorState::Open;
        for child in &mut self.children {
            child.open().await?;
        }
        Ok(())
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        loop {
            self.ctx.check_cancelled()?;
            if self.current >= self.children.len() {
                return Ok(None);
            }
            match self.children[self.current].next().await? {
                Some(row) => return Ok(Some(row)),
                None => self.current += 1,
            }
        }
    }

    async fn close(&mut self) -> EngineResult<()> {
        if self.state == OperatorState::Closed {
            return Ok(());
        }
        self.state = OperatorState::Closed;
        let mut result = Ok(());
        for child in &mut self.children {
            if let Err(err) = child.close().await {
                result = Err(err);
            }
        }
        result
    }
}

struct ValuesOp {
    rows: Vec<Vec<ScalarExpr>>,
    position: usize,
    ctx: ExecContext,
    state: OperatorState,
}

#[async_trait]
impl Operator for ValuesOp {
    async fn open(&mut self) -> EngineResult<()> {
        if self.state != OperatorState::Created {
            return Err(already_open("Values"));
        }
        self.state = OperatorState::Open;
        Ok(())
    }

    async fn next(&mut self) -> EngineResult<Option<Row>> {
        self.ctx.check_cancelled()?;
        let Some(exprs) = self.rows.get(self.position) else {
            return Ok(None);
        };
        self.position += 1;
        let empty: Row = Vec::new();
        let row = exprs
            .iter()
            .map(|e| e.evaluate(&empty))
            .collect::<EngineResult<Row>>()?;
        Ok(Some(row))
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.state = OperatorState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{Binder, BoundStatement};
    use crate::catalog::test_fixtures::federated_catalog;
    use crate::catalog::SourceType;
    use crate::cost::CostWeights;
    use crate::optimizer::Optimizer;
    use crate::parser::parse;
    use crate::physical::PhysicalPlanner;
    use crate::test_support::{
        access_log_rows, orders_rows, single_connector_map, MemoryConnector,
    };

    fn ctx(cap: usize) -> ExecContext {
        ExecContext::new(1, CancelToken::new(), cap, 1000)
    }

    fn connectors() -> HashMap<String, Arc<dyn Connector>> {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let logs = catalog
            .resolve_table(&["es_logs".into(), "access_logs".into()])
            .unwrap();
        let mysql = MemoryConnector::new(
            "mysql_db",
            SourceType::MySql,
            vec![orders.as_ref().clone()],
        )
        .with_rows("orders", orders_rows(20));
        let es = MemoryConnector::new(
            "es_logs",
            SourceType::ElasticSearch,
            vec![logs.as_ref().clone()],
        )
        .with_rows("access_logs", access_log_rows(10));
        let mut map = single_connector_map(mysql);
        map.extend(single_connector_map(es));
        map
    }

    async fn run(sql: &str, cap: usize) -> (Vec<Row>, ExecContext) {
        let catalog = federated_catalog();
        let parsed = parse(sql, None).unwrap();
        let BoundStatement::Select(plan) =
            Binder::new(&catalog).bind_statement(parsed).unwrap()
        else {
            panic!("expected select");
        };
        let optimized = Optimizer::new().optimize(plan).unwrap();
        let physical = PhysicalPlanner::new(CostWeights::default())
            .plan(&optimized)
            .unwrap();
        let ctx = ctx(cap);
        let mut root = build_operator(&physical, &connectors(), &ctx).unwrap();
        root.open().await.unwrap();
        let mut rows = Vec::new();
        while let Some(row) = root.next().await.unwrap() {
            rows.push(row);
        }
        root.close().await.unwrap();
        (rows, ctx)
    }

    #[tokio::test]
    async fn scan_filter_project_pipeline() {
        let (rows, ctx) = run(
            "SELECT id, customer FROM mysql_db.orders WHERE status = 'completed'",
            100_000,
        )
        .await;
        assert_eq!(rows.len(), 10);
        assert!(!ctx.is_truncated());
        assert_eq!(rows[0].len(), 2);
    }

    #[tokio::test]
    async fn federated_hash_join_end_to_end() {
        let (rows, _) = run(
            "SELECT o.id, o.customer, l.access_time \
             FROM mysql_db.orders o JOIN es_logs.access_logs l ON o.id = l.order_id \
             WHERE o.status = 'completed'",
            100_000,
        )
        .await;
        // Orders 0..20 even ids are completed; logs cover order_ids 0..10.
        // Matching completed ids: 0, 2, 4, 6, 8.
        assert_eq!(rows.len(), 5);
        for row in &rows {
            assert_eq!(row.len(), 3);
            assert!(!row[2].is_null());
        }
    }

    #[tokio::test]
    async fn left_join_null_extends() {
        let (rows, _) = run(
            "SELECT o.id, l.access_time \
             FROM mysql_db.orders o LEFT JOIN es_logs.access_logs l ON o.id = l.order_id",
            100_000,
        )
        .await;
        assert_eq!(rows.len(), 20);
        let unmatched = rows.iter().filter(|r| r[1].is_null()).count();
        assert_eq!(unmatched, 10);
    }

    #[tokio::test]
    async fn aggregate_groups_once_per_key() {
        let (rows, _) = run(
            "SELECT o.status, COUNT(*) \
             FROM mysql_db.orders o JOIN es_logs.access_logs l ON o.id = l.order_id \
             GROUP BY o.status",
            100_000,
        )
        .await;
        // Joined rows: ids 0..10 -> statuses alternate completed/pending.
        assert_eq!(rows.len(), 2);
        let total: i64 = rows
            .iter()
            .map(|r| match r[1] {
                Value::Int64(n) => n,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn sort_and_limit() {
        let (rows, _) = run(
            "SELECT o.id FROM mysql_db.orders o JOIN es_logs.access_logs l \
             ON o.id = l.order_id ORDER BY o.id DESC LIMIT 3",
            100_000,
        )
        .await;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0], Value::Int32(9));
        assert_eq!(rows[1][0], Value::Int32(8));
    }

    #[tokio::test]
    async fn hash_join_build_cap_truncates_not_fails() {
        let (rows, ctx) = run(
            "SELECT o.id, l.access_time \
             FROM mysql_db.orders o JOIN es_logs.access_logs l ON o.id = l.order_id",
            4,
        )
        .await;
        assert!(ctx.is_truncated());
        assert!(!ctx.warnings().is_empty());
        assert!(
            ctx.warnings()[0].contains("cap of 4"),
            "{:?}",
            ctx.warnings()
        );
        // The join still returns what the partial build produced.
        assert!(rows.len() <= 10);
    }

    #[tokio::test]
    async fn null_join_keys_never_match() {
        use crate::logical::JoinType;
        let ctx = ctx(1000);
        let left_rows = vec![
            vec![Value::Int64(1)],
            vec![Value::Null],
        ];
        let right_rows = vec![vec![Value::Int64(1)], vec![Value::Null]];
        let mut join = HashJoinOp {
            left: Box::new(StaticOp::new(left_rows)),
            right: Box::new(StaticOp::new(right_rows)),
            left_width: 1,
            right_width: 1,
            join_type: JoinType::Inner,
            on: vec![(
                ScalarExpr::column(0, "a"),
                ScalarExpr::column(0, "b"),
            )],
            filter: None,
            build_side: BuildSide::Left,
            table: HashMap::new(),
            build_rows: Vec::new(),
            matched: Vec::new(),
            built: false,
            probe_done: false,
            pending: VecDeque::new(),
            drain_index: 0,
            ctx,
            state: OperatorState::Created,
        };
        join.open().await.unwrap();
        let mut count = 0;
        while join.next().await.unwrap().is_some() {
            count += 1;
        }
        join.close().await.unwrap();
        assert_eq!(count, 1, "only the non-null keys pair up");
    }

    #[tokio::test]
    async fn double_open_fails_loudly() {
        let mut op = StaticOp::new(vec![vec![Value::Int64(1)]]);
        op.open().await.unwrap();
        let err = op.open().await.unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_connections() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let connector = MemoryConnector::new(
            "mysql_db",
            SourceType::MySql,
            vec![orders.as_ref().clone()],
        )
        .with_rows("orders", orders_rows(5));
        let state = connector.state.clone();
        let map = single_connector_map(connector);

        let parsed = parse("SELECT id FROM mysql_db.orders", None).unwrap();
        let BoundStatement::Select(plan) =
            Binder::new(&catalog).bind_statement(parsed).unwrap()
        else {
            panic!("expected select");
        };
        let optimized = Optimizer::new().optimize(plan).unwrap();
        let physical = PhysicalPlanner::new(CostWeights::default())
            .plan(&optimized)
            .unwrap();
        let ctx = ctx(1000);
        let mut root = build_operator(&physical, &map, &ctx).unwrap();
        root.open().await.unwrap();
        let _ = root.next().await.unwrap();
        root.close().await.unwrap();
        root.close().await.unwrap();
        root.close().await.unwrap();
        assert_eq!(
            state.checked_out.load(std::sync::atomic::Ordering::SeqCst),
            0,
            "no connection stays checked out after repeated close"
        );
    }

    #[tokio::test]
    async fn cancellation_surfaces_between_rows() {
        let cancel = CancelToken::new();
        let ctx = ExecContext::new(1, cancel.clone(), 1000, 1000);
        let mut filter = FilterOp {
            child: Box::new(StaticOp::new(orders_rows(100))),
            predicate: ScalarExpr::literal(Value::Boolean(true)),
            ctx,
            state: OperatorState::Created,
        };
        filter.open().await.unwrap();
        assert!(filter.next().await.unwrap().is_some());
        cancel.cancel();
        let err = filter.next().await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        filter.close().await.unwrap();
    }

    #[tokio::test]
    async fn limit_closes_child_at_cap() {
        let ctx = ctx(1000);
        let mut limit = LimitOp {
            child: Box::new(StaticOp::new(orders_rows(100))),
            limit: Some(3),
            offset: 0,
            skipped: 0,
            emitted: 0,
            child_closed: false,
            ctx,
            state: OperatorState::Created,
        };
        limit.open().await.unwrap();
        let mut rows = Vec::new();
        while let Some(row) = limit.next().await.unwrap() {
            rows.push(row);
        }
        assert_eq!(rows.len(), 3);
        limit.close().await.unwrap();
    }

    #[tokio::test]
    async fn offset_skips_rows() {
        let ctx = ctx(1000);
        let mut limit = LimitOp {
            child: Box::new(StaticOp::new(orders_rows(10))),
            limit: Some(2),
            offset: 5,
            skipped: 0,
            emitted: 0,
            child_closed: false,
            ctx,
            state: OperatorState::Created,
        };
        limit.open().await.unwrap();
        let first = limit.next().await.unwrap().unwrap();
        assert_eq!(first[0], Value::Int32(5));
        limit.close().await.unwrap();
    }

    #[tokio::test]
    async fn sort_orders_nulls_last_by_default() {
        let ctx = ctx(1000);
        let mut sort = SortOp {
            child: Box::new(StaticOp::new(vec![
                vec![Value::Null],
                vec![Value::Int64(2)],
                vec![Value::Int64(1)],
            ])),
            keys: vec![SortKey {
                expr: ScalarExpr::column(0, "v"),
                ascending: true,
                nulls_first: false,
            }],
            buffer: VecDeque::new(),
            loaded: false,
            ctx,
            state: OperatorState::Created,
        };
        sort.open().await.unwrap();
        let mut rows = Vec::new();
        while let Some(row) = sort.next().await.unwrap() {
            rows.push(row);
        }
        sort.close().await.unwrap();
        assert_eq!(rows[0][0], Value::Int64(1));
        assert_eq!(rows[1][0], Value::Int64(2));
        assert!(rows[2][0].is_null());
    }

    #[tokio::test]
    async fn global_aggregate_over_empty_input_emits_one_row() {
        let ctx = ctx(1000);
        let mut agg = AggregateOp {
            child: Box::new(StaticOp::new(Vec::new())),
            group_by: Vec::new(),
            aggregates: vec![AggregateExpr {
                func: AggregateFunction::Count,
                arg: None,
                distinct: false,
                output_name: "COUNT(*)".into(),
            }],
            output_width: 1,
            groups: Vec::new(),
            index: HashMap::new(),
            emit_from: 0,
            loaded: false,
            ctx,
            state: OperatorState::Created,
        };
        agg.open().await.unwrap();
        let row = agg.next().await.unwrap().unwrap();
        assert_eq!(row[0], Value::Int64(0));
        assert!(agg.next().await.unwrap().is_none());
        agg.close().await.unwrap();
    }

    /// Static in-memory operator used to exercise single operators.
    struct StaticOp {
        rows: Vec<Row>,
        position: usize,
        state: OperatorState,
    }

    impl StaticOp {
        fn new(rows: Vec<Row>) -> Self {
            StaticOp {
                rows,
                position: 0,
                state: OperatorState::Created,
            }
        }
    }

    #[async_trait]
    impl Operator for StaticOp {
        async fn open(&mut self) -> EngineResult<()> {
            if self.state != OperatorState::Created {
                return Err(already_open("Static"));
            }
            self.state = OperatorState::Open;
            Ok(())
        }

        async fn next(&mut self) -> EngineResult<Option<Row>> {
            let row = self.rows.get(self.position).cloned();
            self.position += 1;
            Ok(row)
        }

        async fn close(&mut self) -> EngineResult<()> {
            self.state = OperatorState::Closed;
            Ok(())
        }
    }
}
