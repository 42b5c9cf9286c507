//! Connector abstraction.
//!
//! One connector per source kind: pooled connections, schema discovery,
//! scans with pushdown, a health probe and cancellation. A connector must
//! honour every pushdown element it accepts; anything it cannot express is
//! split off at plan time and re-applied by the executor, never silently
//! dropped.

use crate::catalog::{ColumnMeta, SourceType, TableMeta};
use crate::dialect::{DialectConverter, PaginationForm};
use crate::error::{EngineError, EngineResult};
use crate::expr::{BinaryOp, ScalarExpr, ScalarFunction};
use crate::logical::{ScanAggregate, SortKey};
use crate::types::{Row, Value};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Cooperative cancellation flag, shared between the processor, every
/// operator and every in-flight scan of one query.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Pool sizing knobs, straight from the data-source configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: u32,
    pub min_idle: u32,
    pub connect_timeout: std::time::Duration,
    pub idle_timeout: std::time::Duration,
    pub max_lifetime: std::time::Duration,
}

/// The elements of a scan the optimiser chose to delegate.
#[derive(Debug, Clone, Default)]
pub struct Pushdown {
    /// Predicate over base-table ordinals.
    pub filter: Option<ScalarExpr>,
    /// Base-table ordinals to fetch, in output order.
    pub projection: Option<Vec<usize>>,
    pub limit: Option<u64>,
    pub sort: Vec<SortKey>,
    pub aggregate: Option<ScanAggregate>,
}

/// One scan request against a connector.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub table: Arc<TableMeta>,
    pub pushdown: Pushdown,
    pub query_id: u64,
    pub batch_size: usize,
}

/// Forward-only stream of row batches from a source.
#[async_trait]
pub trait RowBatchStream: Send {
    /// Next batch; `None` at end of stream.
    async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>>;

    /// Stop the in-flight scan and release server-side resources.
    async fn cancel(&mut self);
}

/// Capability surface of one data source.
#[async_trait]
pub trait Connector: Send + Sync {
    fn source_id(&self) -> &str;

    fn source_type(&self) -> SourceType;

    /// One-shot structure discovery, run at startup and on refresh.
    async fn discover_schema(&self) -> EngineResult<Vec<TableMeta>>;

    /// Refresh row-count statistics for one table.
    async fn table_statistics(&self, table: &TableMeta) -> EngineResult<u64>;

    /// Start a lazy scan honouring the accepted pushdown.
    async fn scan(
        &self,
        request: ScanRequest,
        cancel: CancelToken,
    ) -> EngineResult<Box<dyn RowBatchStream>>;

    /// Execute a source-local statement (single-source DML passthrough).
    async fn execute_raw(&self, sql: &str) -> EngineResult<u64>;

    /// Cheap liveness check, bounded by the caller's timeout.
    async fn health_probe(&self) -> EngineResult<()>;

    /// Drain and release all connections.
    async fn close(&self);
}

/// Whether a source can execute one filter conjunct on its side.
///
/// Relational sources take any engine expression (it renders back to SQL);
/// the document index takes the comparison shapes its query DSL covers.
pub fn source_accepts_conjunct(source_type: SourceType, conjunct: &ScalarExpr) -> bool {
    if contains_subquery(conjunct) {
        return false;
    }
    match source_type {
        SourceType::MySql | SourceType::PostgreSql => true,
        SourceType::ElasticSearch => es_expressible(conjunct),
    }
}

fn contains_subquery(expr: &ScalarExpr) -> bool {
    match expr {
        ScalarExpr::Exists { .. }
        | ScalarExpr::InSubquery { .. }
        | ScalarExpr::ScalarSubquery(_)
        | ScalarExpr::OuterColumn { .. } => true,
        ScalarExpr::Binary { left, right, .. } => {
            contains_subquery(left) || contains_subquery(right)
        }
        ScalarExpr::Not(e) | ScalarExpr::Negate(e) => contains_subquery(e),
        ScalarExpr::IsNull { expr, .. } => contains_subquery(expr),
        ScalarExpr::Like { expr, pattern, .. } => {
            contains_subquery(expr) || contains_subquery(pattern)
        }
        ScalarExpr::InList { expr, list, .. } => {
            contains_subquery(expr) || list.iter().any(contains_subquery)
        }
        ScalarExpr::Cast { expr, .. } => contains_subquery(expr),
        ScalarExpr::Function { args, .. } => args.iter().any(contains_subquery),
        ScalarExpr::Case {
            branches,
            else_expr,
        } => {
            branches
                .iter()
                .any(|(w, t)| contains_subquery(w) || contains_subquery(t))
                || else_expr.as_deref().map(contains_subquery).unwrap_or(false)
        }
        ScalarExpr::Column { .. } | ScalarExpr::Literal(_) => false,
    }
}

/// Query-DSL-expressible shapes: column-vs-literal comparisons, IN lists of
/// literals, IS [NOT] NULL, and conjunctions thereof.
fn es_expressible(expr: &ScalarExpr) -> bool {
    match expr {
        ScalarExpr::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => es_expressible(left) && es_expressible(right),
        ScalarExpr::Binary { left, op, right } if op.is_comparison() => {
            matches!(
                (left.as_ref(), right.as_ref()),
                (ScalarExpr::Column { .. }, ScalarExpr::Literal(_))
                    | (ScalarExpr::Literal(_), ScalarExpr::Column { .. })
            )
        }
        ScalarExpr::InList { expr, list, .. } => {
            matches!(expr.as_ref(), ScalarExpr::Column { .. })
                && list.iter().all(|e| matches!(e, ScalarExpr::Literal(_)))
        }
        ScalarExpr::IsNull { expr, .. } => matches!(expr.as_ref(), ScalarExpr::Column { .. }),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// SQL rendering for relational pushdown
// ---------------------------------------------------------------------------

/// Render the source-side SQL for a relational scan.
pub fn render_scan_sql(request: &ScanRequest) -> EngineResult<String> {
    let table = &request.table;
    let dialect = table.source_type.sql_dialect().ok_or_else(|| {
        EngineError::Internal(format!(
            "pushdown SQL requested for document-index source '{}'",
            table.source
        ))
    })?;
    let converter = dialect.converter();
    let qualify = |name: &str| converter.quote_identifier(name);
    let columns = &table.columns;

    let select_list = match &request.pushdown.aggregate {
        Some(aggregate) => {
            let mut items = Vec::new();
            for &g in &aggregate.group_by {
                let column = columns.get(g).ok_or_else(|| bad_ordinal(g))?;
                items.push(qualify(&column.name));
            }
            for agg in &aggregate.aggregates {
                let arg = match &agg.arg {
                    Some(expr) => render_expr(expr, columns, converter)?,
                    None => "*".to_string(),
                };
                let distinct = if agg.distinct { "DISTINCT " } else { "" };
                items.push(format!("{}({distinct}{arg})", agg.func));
            }
            items.join(", ")
        }
        None => match &request.pushdown.projection {
            Some(ordinals) if !ordinals.is_empty() => ordinals
                .iter()
                .map(|&o| {
                    columns
                        .get(o)
                        .map(|c| qualify(&c.name))
                        .ok_or_else(|| bad_ordinal(o))
                })
                .collect::<EngineResult<Vec<_>>>()?
                .join(", "),
            _ => "*".to_string(),
        },
    };

    let mut sql = format!(
        "SELECT {select_list} FROM {}.{}",
        qualify(&table.schema),
        qualify(&table.name)
    );

    if let Some(filter) = &request.pushdown.filter {
        sql.push_str(" WHERE ");
        sql.push_str(&render_expr(filter, columns, converter)?);
    }

    if let Some(aggregate) = &request.pushdown.aggregate {
        if !aggregate.group_by.is_empty() {
            let groups = aggregate
                .group_by
                .iter()
                .map(|&g| {
                    columns
                        .get(g)
                        .map(|c| qualify(&c.name))
                        .ok_or_else(|| bad_ordinal(g))
                })
                .collect::<EngineResult<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }
    }

    if !request.pushdown.sort.is_empty() {
        let keys = request
            .pushdown
            .sort
            .iter()
            .map(|k| {
                Ok(format!(
                    "{} {}",
                    render_expr(&k.expr, columns, converter)?,
                    if k.ascending { "ASC" } else { "DESC" }
                ))
            })
            .collect::<EngineResult<Vec<_>>>()?;
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    if let Some(limit) = request.pushdown.limit {
        match converter.pagination(Some(limit), None) {
            Some(PaginationForm::Trailing(clause)) => {
                sql.push(' ');
                sql.push_str(&clause);
            }
            Some(PaginationForm::SelectTop(_)) | Some(PaginationForm::RownumWrapper { .. }) => {
                // MySQL and PostgreSQL both take the trailing form; other
                // shapes cannot appear for the two relational source kinds.
            }
            None => {}
        }
    }

    Ok(sql)
}

fn bad_ordinal(ordinal: usize) -> EngineError {
    EngineError::Internal(format!("pushdown references unknown column ordinal {ordinal}"))
}

/// Render an engine expression over base-table ordinals as source SQL.
pub fn render_expr(
    expr: &ScalarExpr,
    columns: &[ColumnMeta],
    converter: &dyn DialectConverter,
) -> EngineResult<String> {
    let rec = |e: &ScalarExpr| render_expr(e, columns, converter);
    match expr {
        ScalarExpr::Column { index, name } => columns
            .get(*index)
            .map(|c| converter.quote_identifier(&c.name))
            .ok_or_else(|| {
                EngineError::Internal(format!("column {name} ordinal {index} out of range"))
            }),
        ScalarExpr::Literal(value) => Ok(render_literal(value)),
        ScalarExpr::Binary { left, op, right } => {
            Ok(format!("({} {op} {})", rec(left)?, rec(right)?))
        }
        ScalarExpr::Not(e) => Ok(format!("(NOT {})", rec(e)?)),
        ScalarExpr::Negate(e) => Ok(format!("(-{})", rec(e)?)),
        ScalarExpr::IsNull { expr, negated } => Ok(format!(
            "({} IS {}NULL)",
            rec(expr)?,
            if *negated { "NOT " } else { "" }
        )),
        ScalarExpr::Like {
            expr,
            pattern,
            negated,
        } => Ok(format!(
            "({} {}LIKE {})",
            rec(expr)?,
            if *negated { "NOT " } else { "" },
            rec(pattern)?
        )),
        ScalarExpr::InList {
            expr,
            list,
            negated,
        } => {
            let items = list.iter().map(rec).collect::<EngineResult<Vec<_>>>()?;
            Ok(format!(
                "({} {}IN ({}))",
                rec(expr)?,
                if *negated { "NOT " } else { "" },
                items.join(", ")
            ))
        }
        ScalarExpr::Cast { expr, target } => Ok(converter.unparse_cast(&rec(expr)?, *target)),
        ScalarExpr::Function { func, args } => {
            let rendered = args.iter().map(rec).collect::<EngineResult<Vec<_>>>()?;
            Ok(match func {
                ScalarFunction::Now => converter.now_function().to_string(),
                ScalarFunction::Coalesce if rendered.len() == 2 => format!(
                    "{}({})",
                    converter.coalesce_function(),
                    rendered.join(", ")
                ),
                ScalarFunction::Coalesce => format!("COALESCE({})", rendered.join(", ")),
                other => format!("{other}({})", rendered.join(", ")),
            })
        }
        ScalarExpr::Case {
            branches,
            else_expr,
        } => {
            let mut sql = String::from("CASE");
            for (when, then) in branches {
                sql.push_str(&format!(" WHEN {} THEN {}", rec(when)?, rec(then)?));
            }
            if let Some(e) = else_expr {
                sql.push_str(&format!(" ELSE {}", rec(e)?));
            }
            sql.push_str(" END");
            Ok(sql)
        }
        ScalarExpr::OuterColumn { .. }
        | ScalarExpr::Exists { .. }
        | ScalarExpr::InSubquery { .. }
        | ScalarExpr::ScalarSubquery(_) => Err(EngineError::Internal(
            "subquery expression reached connector rendering".to_string(),
        )),
    }
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Boolean(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Date(d) => format!("'{}'", d.format("%Y-%m-%d")),
        Value::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S")),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Channel-backed scan stream
// ---------------------------------------------------------------------------

/// Scan stream fed by a background task over a bounded channel.
///
/// The producing task owns the connection; dropping or cancelling the
/// stream aborts the task, which releases the connection back to its pool.
pub struct ChannelScanStream {
    receiver: mpsc::Receiver<EngineResult<Vec<Row>>>,
    task: Option<JoinHandle<()>>,
    cancel: CancelToken,
    done: bool,
}

impl ChannelScanStream {
    pub fn new(
        receiver: mpsc::Receiver<EngineResult<Vec<Row>>>,
        task: JoinHandle<()>,
        cancel: CancelToken,
    ) -> Self {
        ChannelScanStream {
            receiver,
            task: Some(task),
            cancel,
            done: false,
        }
    }
}

#[async_trait]
impl RowBatchStream for ChannelScanStream {
    async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.cancel().await;
            return Err(EngineError::Cancelled);
        }
        match self.receiver.recv().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn cancel(&mut self) {
        self.done = true;
        self.cancel.cancel();
        self.receiver.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ChannelScanStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::federated_catalog;
    use rstest::rstest;

    fn orders_request(pushdown: Pushdown) -> ScanRequest {
        let catalog = federated_catalog();
        let table = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        ScanRequest {
            table,
            pushdown,
            query_id: 1,
            batch_size: 1000,
        }
    }

    #[test]
    fn scan_sql_with_filter_projection_limit() {
        let pushdown = Pushdown {
            filter: Some(ScalarExpr::binary(
                ScalarExpr::column(2, "status"),
                BinaryOp::Eq,
                ScalarExpr::literal(Value::String("completed".into())),
            )),
            projection: Some(vec![0, 1]),
            limit: Some(100),
            sort: Vec::new(),
            aggregate: None,
        };
        let sql = render_scan_sql(&orders_request(pushdown)).unwrap();
        assert_eq!(
            sql,
            "SELECT `id`, `customer` FROM `shop`.`orders` \
             WHERE (`status` = 'completed') LIMIT 100"
        );
    }

    #[test]
    fn scan_sql_with_sort() {
        let pushdown = Pushdown {
            projection: Some(vec![0]),
            sort: vec![SortKey {
                expr: ScalarExpr::column(0, "id"),
                ascending: false,
                nulls_first: false,
            }],
            ..Default::default()
        };
        let sql = render_scan_sql(&orders_request(pushdown)).unwrap();
        assert_eq!(
            sql,
            "SELECT `id` FROM `shop`.`orders` ORDER BY `id` DESC"
        );
    }

    #[test]
    fn scan_sql_with_aggregate() {
        use crate::expr::{AggregateExpr, AggregateFunction};
        use crate::types::{Field, LogicalType, Schema};
        let aggregate = ScanAggregate {
            group_by: vec![2],
            aggregates: vec![AggregateExpr {
                func: AggregateFunction::Count,
                arg: None,
                distinct: false,
                output_name: "COUNT(*)".into(),
            }],
            schema: Schema::new(vec![
                Field::new("status", LogicalType::String, true),
                Field::new("COUNT(*)", LogicalType::Int64, true),
            ]),
        };
        let pushdown = Pushdown {
            aggregate: Some(aggregate),
            ..Default::default()
        };
        let sql = render_scan_sql(&orders_request(pushdown)).unwrap();
        assert_eq!(
            sql,
            "SELECT `status`, COUNT(*) FROM `shop`.`orders` GROUP BY `status`"
        );
    }

    #[rstest]
    #[case(Value::String("o'brien".into()), "'o''brien'")]
    #[case(Value::Int64(42), "42")]
    #[case(Value::Null, "NULL")]
    #[case(Value::Boolean(true), "TRUE")]
    fn literal_rendering(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(render_literal(&value), expected);
    }

    #[rstest]
    #[case("col = lit", true)]
    #[case("in list", true)]
    #[case("is null", true)]
    #[case("function", false)]
    fn es_expressibility(#[case] shape: &str, #[case] expected: bool) {
        let expr = match shape {
            "col = lit" => ScalarExpr::binary(
                ScalarExpr::column(0, "order_id"),
                BinaryOp::Eq,
                ScalarExpr::literal(Value::Int64(5)),
            ),
            "in list" => ScalarExpr::InList {
                expr: Box::new(ScalarExpr::column(0, "order_id")),
                list: vec![ScalarExpr::literal(Value::Int64(1))],
                negated: false,
            },
            "is null" => ScalarExpr::IsNull {
                expr: Box::new(ScalarExpr::column(0, "order_id")),
                negated: false,
            },
            _ => ScalarExpr::Function {
                func: ScalarFunction::Length,
                args: vec![ScalarExpr::column(0, "order_id")],
            },
        };
        assert_eq!(
            source_accepts_conjunct(SourceType::ElasticSearch, &expr),
            expected
        );
        assert!(source_accepts_conjunct(SourceType::MySql, &expr));
    }

    #[tokio::test]
    async fn channel_stream_delivers_then_ends() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let _ = tx.send(Ok(vec![vec![Value::Int64(1)]])).await;
        });
        let mut stream = ChannelScanStream::new(rx, task, CancelToken::new());
        let first = stream.next_batch().await.unwrap();
        assert_eq!(first.unwrap().len(), 1);
        assert!(stream.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_stream_reports_cancellation() {
        let (tx, rx) = mpsc::channel::<EngineResult<Vec<Row>>>(1);
        let task = tokio::spawn(async move {
            // Producer that never finishes on its own.
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            drop(tx);
        });
        let cancel = CancelToken::new();
        let mut stream = ChannelScanStream::new(rx, task, cancel.clone());
        cancel.cancel();
        let err = stream.next_batch().await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
