//! Query processor.
//!
//! Owns the end-to-end pipeline: assign a query id, route (translate-only,
//! EXPLAIN, DML passthrough or execute), run parse, validate, optimise and
//! execute, and frame the output. Each query gets a tracing span keyed by
//! its id, a cancellation token, a timeout that fires that token, and a
//! slot under the global concurrent-query bound. State transitions are
//! one-way: pending, running, then exactly one of completed, truncated,
//! failed or cancelled.

use crate::binder::{Binder, BoundStatement};
use crate::catalog::SharedCatalog;
use crate::config::EngineProps;
use crate::connector::CancelToken;
use crate::datasource::DataSourceManager;
use crate::dialect::Dialect;
use crate::error::{EngineError, EngineResult};
use crate::executor::{build_operator, ExecContext, Operator};
use crate::parser::{parse, ParsedStatement};
use crate::physical::PhysicalPlanner;
use crate::types::{Frame, Schema};
use crate::unparse::{translate, Translation};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Truncated,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryState::Pending | QueryState::Running)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryTimings {
    pub parse: Duration,
    pub optimize: Duration,
    pub execute: Duration,
}

/// Observable record of one query's lifetime.
#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub id: u64,
    pub sql: String,
    pub state: QueryState,
    pub timings: QueryTimings,
    pub row_count: u64,
    pub error: Option<String>,
}

struct QueryEntry {
    record: Mutex<QueryRecord>,
    cancel: CancelToken,
}

impl QueryEntry {
    /// Transitions are one-way; a terminal state never changes again.
    fn transition(&self, next: QueryState) {
        let mut record = self
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if record.state.is_terminal() {
            return;
        }
        record.state = next;
    }
}

pub struct QueryProcessor {
    catalog: SharedCatalog,
    manager: Arc<DataSourceManager>,
    props: EngineProps,
    next_id: AtomicU64,
    slots: Arc<Semaphore>,
    registry: Arc<Mutex<HashMap<u64, Arc<QueryEntry>>>>,
}

/// What an executed statement produced.
pub enum Execution {
    /// Streaming result; pull frames until `done`.
    Rows {
        query_id: u64,
        schema: Schema,
        stream: FrameStream,
    },
    /// Single-source DML passthrough.
    UpdateCount { query_id: u64, count: u64 },
    /// EXPLAIN rendering of the chosen physical plan.
    Explain { query_id: u64, plan: String },
}

impl QueryProcessor {
    pub fn new(
        catalog: SharedCatalog,
        manager: Arc<DataSourceManager>,
        props: EngineProps,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(props.max_concurrent_queries));
        QueryProcessor {
            catalog,
            manager,
            props,
            next_id: AtomicU64::new(1),
            slots,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Translate-only route; nothing executes.
    pub fn translate(
        &self,
        sql: &str,
        from: Dialect,
        to: Dialect,
        online: bool,
    ) -> EngineResult<Translation> {
        let snapshot = self.catalog.snapshot();
        let catalog = if online { Some(snapshot.as_ref()) } else { None };
        translate(sql, from, to, catalog)
    }

    /// Full execute route.
    pub async fn execute(
        &self,
        sql: &str,
        source_dialect: Option<Dialect>,
    ) -> EngineResult<Execution> {
        let query_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let span = info_span!("query", id = query_id);
        if self.props.enable_query_logging {
            span.in_scope(|| {
                info!(query_id, sql = %crate::sanitize::sanitize_text(sql), "query received");
            });
        }

        let entry = Arc::new(QueryEntry {
            record: Mutex::new(QueryRecord {
                id: query_id,
                sql: sql.to_string(),
                state: QueryState::Pending,
                timings: QueryTimings::default(),
                row_count: 0,
                error: None,
            }),
            cancel: CancelToken::new(),
        });
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(query_id, entry.clone());

        match self
            .run(sql, source_dialect, query_id, &entry)
            .instrument(span)
            .await
        {
            Ok(execution) => Ok(execution),
            Err(err) => {
                let state = if matches!(err, EngineError::Cancelled) {
                    QueryState::Cancelled
                } else {
                    QueryState::Failed
                };
                {
                    let mut record = entry
                        .record
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    record.error = Some(err.to_string());
                }
                entry.transition(state);
                warn!(query_id, error = %err, "query failed");
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        sql: &str,
        source_dialect: Option<Dialect>,
        query_id: u64,
        entry: &Arc<QueryEntry>,
    ) -> EngineResult<Execution> {
        // Hold a concurrency slot for the query's whole lifetime.
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Internal("engine is shutting down".to_string()))?;

        let catalog = self.catalog.snapshot();
        let parse_started = Instant::now();
        let parsed = parse(sql, source_dialect)?;
        let bound = Binder::new(&catalog).bind_statement(parsed)?;
        let parse_elapsed = parse_started.elapsed();
        entry
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .timings
            .parse = parse_elapsed;

        match bound {
            BoundStatement::Dml { source, sql } => {
                self.manager.ensure_available(&source)?;
                entry.transition(QueryState::Running);
                let connector = self.manager.connector(&source)?;
                let count = self
                    .manager
                    .retry_transient(&source, || {
                        let connector = connector.clone();
                        let sql = sql.clone();
                        async move { connector.execute_raw(&sql).await }
                    })
                    .await?;
                entry.transition(QueryState::Completed);
                info!(query_id, source, rows = count, "dml completed");
                drop(permit);
                Ok(Execution::UpdateCount { query_id, count })
            }
            BoundStatement::Explain(plan) => {
                let optimize_started = Instant::now();
                let optimized = crate::optimizer::Optimizer::new().optimize(plan)?;
                let physical =
                    PhysicalPlanner::new(self.props.cost_weights).plan(&optimized)?;
                entry
                    .record
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .timings
                    .optimize = optimize_started.elapsed();
                let mut rendered = physical.to_string();
                if physical.used_default_statistics() {
                    rendered.push_str(
                        "note: statistic defaults (rows=10000, selectivity=0.1) drove this plan\n",
                    );
                }
                entry.transition(QueryState::Completed);
                drop(permit);
                Ok(Execution::Explain {
                    query_id,
                    plan: rendered,
                })
            }
            BoundStatement::Select(plan) => {
                let optimize_started = Instant::now();
                let optimized = crate::optimizer::Optimizer::new().optimize(plan)?;

                // Fail fast when any referenced source is unhealthy.
                for source in optimized.sources() {
                    self.manager.ensure_available(&source)?;
                }

                let physical =
                    PhysicalPlanner::new(self.props.cost_weights).plan(&optimized)?;
                entry
                    .record
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .timings
                    .optimize = optimize_started.elapsed();
                debug!(query_id, plan = %physical, "physical plan selected");

                let schema = physical.schema();
                let ctx = ExecContext::new(
                    query_id,
                    entry.cancel.clone(),
                    self.props.max_intermediate_rows,
                    self.props.default_fetch_size,
                );
                let connectors = self.manager.connector_map();
                let mut root = build_operator(&physical, &connectors, &ctx)?;

                entry.transition(QueryState::Running);
                let execute_started = Instant::now();
                if let Err(err) = root.open().await {
                    let _ = root.close().await;
                    return Err(err);
                }

                // The timeout fires the shared cancellation token.
                let timeout_cancel = entry.cancel.clone();
                let timeout = Duration::from_secs(self.props.query_timeout_seconds);
                let timeout_task = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    timeout_cancel.cancel();
                });

                let stream = FrameStream {
                    root: Some(root),
                    ctx,
                    entry: entry.clone(),
                    fetch_size: self.props.default_fetch_size,
                    offset: 0,
                    finished: false,
                    execute_started,
                    timed_out_after: timeout,
                    timeout_task: Some(timeout_task),
                    _permit: permit,
                };
                Ok(Execution::Rows {
                    query_id,
                    schema,
                    stream,
                })
            }
        }
    }

    /// Cooperative cancel; propagates to every in-flight scan.
    pub fn cancel(&self, query_id: u64) {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = registry.get(&query_id) {
            info!(query_id, "cancellation requested");
            entry.cancel.cancel();
        }
    }

    /// Snapshot of a query's observable record.
    pub fn query_record(&self, query_id: u64) -> Option<QueryRecord> {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.get(&query_id).map(|entry| {
            entry
                .record
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        })
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }
}

/// Pull-driven frame source over an opened operator tree.
///
/// Dropping the stream without draining it closes the tree and counts as a
/// cancellation.
pub struct FrameStream {
    root: Option<Box<dyn Operator>>,
    ctx: ExecContext,
    entry: Arc<QueryEntry>,
    fetch_size: usize,
    offset: u64,
    finished: bool,
    execute_started: Instant,
    timed_out_after: Duration,
    timeout_task: Option<JoinHandle<()>>,
    _permit: OwnedSemaphorePermit,
}

impl FrameStream {
    /// Next batch of up to `max_rows` rows (0 means the default fetch
    /// size). The final frame has `done = true` and carries any truncation
    /// warning.
    pub async fn next_frame(&mut self, max_rows: usize) -> EngineResult<Frame> {
        if self.finished {
            return Ok(Frame {
                offset: self.offset,
                done: true,
                rows: Vec::new(),
                warning: None,
            });
        }
        let target = if max_rows == 0 { self.fetch_size } else { max_rows };
        let mut rows = Vec::with_capacity(target.min(4096));
        let root = self
            .root
            .as_mut()
            .ok_or_else(|| EngineError::Internal("frame stream already closed".to_string()))?;

        let mut done = false;
        while rows.len() < target {
            match root.next().await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {
                    done = true;
                    break;
                }
                Err(err) => {
                    self.finish(if matches!(err, EngineError::Cancelled) {
                        // A timeout fires the same token; report it as the
                        // timeout it was.
                        if self.execute_started.elapsed() >= self.timed_out_after {
                            QueryState::Failed
                        } else {
                            QueryState::Cancelled
                        }
                    } else {
                        QueryState::Failed
                    })
                    .await;
                    if matches!(err, EngineError::Cancelled)
                        && self.execute_started.elapsed() >= self.timed_out_after
                    {
                        return Err(EngineError::QueryTimeout {
                            seconds: self.timed_out_after.as_secs(),
                        });
                    }
                    return Err(err);
                }
            }
        }

        let frame_offset = self.offset;
        self.offset += rows.len() as u64;
        {
            let mut record = self
                .entry
                .record
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            record.row_count = self.offset;
        }

        if done {
            let state = if self.ctx.is_truncated() {
                QueryState::Truncated
            } else {
                QueryState::Completed
            };
            self.finish(state).await;
            let warning = self.ctx.warnings().join("; ");
            return Ok(Frame {
                offset: frame_offset,
                done: true,
                rows,
                warning: if warning.is_empty() {
                    None
                } else {
                    Some(warning)
                },
            });
        }

        Ok(Frame {
            offset: frame_offset,
            done: false,
            rows,
            warning: None,
        })
    }

    /// Close before exhaustion; the query records as cancelled.
    pub async fn close(&mut self) {
        if !self.finished {
            self.entry.cancel.cancel();
            self.finish(QueryState::Cancelled).await;
        }
    }

    async fn finish(&mut self, state: QueryState) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if let Some(mut root) = self.root.take() {
            if let Err(err) = root.close().await {
                warn!(query_id = self.ctx.query_id, error = %err, "operator close failed");
            }
        }
        {
            let mut record = self
                .entry
                .record
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            record.timings.execute = self.execute_started.elapsed();
        }
        self.entry.transition(state);
        info!(
            query_id = self.ctx.query_id,
            state = ?state,
            rows = self.offset,
            "query finished"
        );
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        if !self.finished {
            // Cooperative: the scan tasks observe the token and abort.
            self.entry.cancel.cancel();
            self.entry.transition(QueryState::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::federated_catalog;
    use crate::catalog::SourceType;
    use crate::datasource::HealthPolicy;
    use crate::test_support::{access_log_rows, orders_rows, MemoryConnector};
    use crate::types::Value;
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn processor_with(
        orders_count: usize,
        logs_count: usize,
        props: EngineProps,
    ) -> (QueryProcessor, Arc<crate::test_support::MemoryConnectorState>) {
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
        .with_rows("orders", orders_rows(orders_count));
        let state = mysql.state.clone();
        let es = MemoryConnector::new(
            "es_logs",
            SourceType::ElasticSearch,
            vec![logs.as_ref().clone()],
        )
        .with_rows("access_logs", access_log_rows(logs_count));

        let manager = Arc::new(DataSourceManager::with_connectors(vec![
            (Arc::new(mysql), HealthPolicy::default()),
            (Arc::new(es), HealthPolicy::default()),
        ]));
        (
            QueryProcessor::new(SharedCatalog::new(federated_catalog()), manager, props),
            state,
        )
    }

    async fn drain(stream: &mut FrameStream) -> (Vec<crate::types::Row>, Option<String>) {
        let mut rows = Vec::new();
        let mut warning = None;
        loop {
            let frame = stream.next_frame(0).await.unwrap();
            rows.extend(frame.rows);
            if frame.done {
                warning = frame.warning;
                break;
            }
        }
        (rows, warning)
    }

    #[tokio::test]
    async fn select_completes_with_timings_and_counts() {
        let (processor, _) = processor_with(20, 10, EngineProps::default());
        let execution = processor
            .execute(
                "SELECT id, customer FROM mysql_db.orders WHERE status = 'completed'",
                None,
            )
            .await
            .unwrap();
        let Execution::Rows {
            query_id,
            schema,
            mut stream,
        } = execution
        else {
            panic!("expected rows");
        };
        assert_eq!(schema.len(), 2);
        let (rows, warning) = drain(&mut stream).await;
        assert_eq!(rows.len(), 10);
        assert!(warning.is_none());

        let record = processor.query_record(query_id).unwrap();
        assert_eq!(record.state, QueryState::Completed);
        assert_eq!(record.row_count, 10);
        assert!(record.timings.execute >= Duration::ZERO);
    }

    #[tokio::test]
    async fn federated_join_streams_frames() {
        let (processor, _) = processor_with(20, 10, EngineProps::default());
        let execution = processor
            .execute(
                "SELECT o.id, o.customer, l.access_time \
                 FROM mysql_db.orders o JOIN es_logs.access_logs l ON o.id = l.order_id \
                 WHERE o.status = 'completed'",
                None,
            )
            .await
            .unwrap();
        let Execution::Rows { mut stream, .. } = execution else {
            panic!("expected rows");
        };
        let (rows, _) = drain(&mut stream).await;
        assert_eq!(rows.len(), 5);
    }

    #[tokio::test]
    async fn truncation_is_success_with_warning() {
        let props = EngineProps {
            max_intermediate_rows: 6,
            ..Default::default()
        };
        let (processor, _) = processor_with(20, 10, props);
        let execution = processor
            .execute(
                "SELECT o.id, l.access_time \
                 FROM mysql_db.orders o JOIN es_logs.access_logs l ON o.id = l.order_id",
                None,
            )
            .await
            .unwrap();
        let Execution::Rows {
            query_id,
            mut stream,
            ..
        } = execution
        else {
            panic!("expected rows");
        };
        let (rows, warning) = drain(&mut stream).await;
        // The build side stopped at the cap; every buffered row still joins.
        assert_eq!(rows.len(), 6);
        let warning = warning.expect("truncation warning present");
        assert!(warning.contains("cap of 6"), "{warning}");
        assert!(warning.contains("HashJoin"), "{warning}");
        assert_eq!(
            processor.query_record(query_id).unwrap().state,
            QueryState::Truncated
        );
    }

    #[tokio::test]
    async fn cancel_mid_stream_reaches_connectors() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let mysql = MemoryConnector::new(
            "mysql_db",
            SourceType::MySql,
            vec![orders.as_ref().clone()],
        )
        .with_rows("orders", orders_rows(10_000))
        .with_batch_delay(Duration::from_millis(20));
        let state = mysql.state.clone();
        let manager = Arc::new(DataSourceManager::with_connectors(vec![(
            Arc::new(mysql),
            HealthPolicy::default(),
        )]));
        let props = EngineProps {
            default_fetch_size: 10,
            ..Default::default()
        };
        let processor = Arc::new(QueryProcessor::new(
            SharedCatalog::new(federated_catalog()),
            manager,
            props,
        ));

        let execution = processor
            .execute("SELECT id FROM mysql_db.orders", None)
            .await
            .unwrap();
        let Execution::Rows {
            query_id,
            mut stream,
            ..
        } = execution
        else {
            panic!("expected rows");
        };

        let first = stream.next_frame(5).await.unwrap();
        assert!(!first.done);

        processor.cancel(query_id);
        let err = loop {
            match stream.next_frame(5).await {
                Ok(frame) if !frame.done => continue,
                Ok(_) => panic!("expected cancellation"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(
            processor.query_record(query_id).unwrap().state,
            QueryState::Cancelled
        );
        // The in-flight scan observed the cancel and released itself.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.checked_out.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_fires_cancellation_and_reports_timeout() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let mysql = MemoryConnector::new(
            "mysql_db",
            SourceType::MySql,
            vec![orders.as_ref().clone()],
        )
        .with_rows("orders", orders_rows(10_000))
        .with_batch_delay(Duration::from_millis(400));
        let manager = Arc::new(DataSourceManager::with_connectors(vec![(
            Arc::new(mysql),
            HealthPolicy::default(),
        )]));
        let props = EngineProps {
            query_timeout_seconds: 1,
            default_fetch_size: 10,
            ..Default::default()
        };
        let processor = QueryProcessor::new(
            SharedCatalog::new(federated_catalog()),
            manager,
            props,
        );

        let execution = processor
            .execute("SELECT id FROM mysql_db.orders", None)
            .await
            .unwrap();
        let Execution::Rows { mut stream, .. } = execution else {
            panic!("expected rows");
        };
        let mut saw_timeout = false;
        for _ in 0..200 {
            match stream.next_frame(1).await {
                Ok(frame) if frame.done => break,
                Ok(_) => continue,
                Err(EngineError::QueryTimeout { .. }) => {
                    saw_timeout = true;
                    break;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert!(saw_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_source_fails_fast_without_scans() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        let mysql = MemoryConnector::new(
            "mysql_db",
            SourceType::MySql,
            vec![orders.as_ref().clone()],
        )
        .with_rows("orders", orders_rows(5));
        let state = mysql.state.clone();
        state.probe_fails.store(true, AtomicOrdering::SeqCst);
        let manager = Arc::new(DataSourceManager::with_connectors(vec![(
            Arc::new(mysql),
            HealthPolicy {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(1),
                failure_threshold: 3,
            },
        )]));
        manager.start_health_checks();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let processor = QueryProcessor::new(
            SharedCatalog::new(federated_catalog()),
            manager,
            EngineProps::default(),
        );
        let err = processor
            .execute("SELECT id FROM mysql_db.orders", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable { .. }));
        assert_eq!(state.scan_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn show_tables_runs_through_values() {
        let (processor, _) = processor_with(5, 5, EngineProps::default());
        let execution = processor
            .execute("SHOW TABLES FROM mysql_db", None)
            .await
            .unwrap();
        let Execution::Rows { mut stream, .. } = execution else {
            panic!("expected rows");
        };
        let (rows, _) = drain(&mut stream).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::String("orders".into()));
    }

    #[tokio::test]
    async fn explain_renders_physical_plan() {
        let (processor, _) = processor_with(5, 5, EngineProps::default());
        let execution = processor
            .execute(
                "EXPLAIN SELECT o.id FROM mysql_db.orders o \
                 JOIN es_logs.access_logs l ON o.id = l.order_id",
                None,
            )
            .await
            .unwrap();
        let Execution::Explain { plan, .. } = execution else {
            panic!("expected explain");
        };
        assert!(plan.contains("HashJoin"), "{plan}");
        assert!(plan.contains("SourceScan"), "{plan}");
    }

    #[tokio::test]
    async fn dml_passthrough_returns_update_count() {
        let (processor, _) = processor_with(5, 5, EngineProps::default());
        let execution = processor
            .execute("DELETE FROM mysql_db.orders WHERE id = 1", None)
            .await
            .unwrap();
        let Execution::UpdateCount { query_id, count } = execution else {
            panic!("expected update count");
        };
        assert_eq!(count, 1);
        assert_eq!(
            processor.query_record(query_id).unwrap().state,
            QueryState::Completed
        );
    }

    #[tokio::test]
    async fn syntax_error_records_failed_state() {
        let (processor, _) = processor_with(5, 5, EngineProps::default());
        let err = processor
            .execute("SELECT FROM WHERE", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Syntax { .. }));
    }

    #[tokio::test]
    async fn translate_route_never_executes() {
        let (processor, state) = processor_with(5, 5, EngineProps::default());
        let translation = processor
            .translate(
                "SELECT * FROM users LIMIT 10 OFFSET 5",
                Dialect::MySql,
                Dialect::PostgreSql,
                false,
            )
            .unwrap();
        assert_eq!(
            translation.sql,
            "SELECT * FROM \"users\" LIMIT 10 OFFSET 5"
        );
        assert_eq!(state.scan_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_queries_do_not_interfere() {
        let (processor, _) = processor_with(100, 50, EngineProps::default());
        let processor = Arc::new(processor);
        let mut handles = Vec::new();
        for i in 0..20u64 {
            let processor = processor.clone();
            handles.push(tokio::spawn(async move {
                let execution = processor
                    .execute("SELECT id, customer FROM mysql_db.orders", None)
                    .await
                    .unwrap();
                let Execution::Rows {
                    query_id,
                    mut stream,
                    ..
                } = execution
                else {
                    panic!("expected rows");
                };
                let mut rows = Vec::new();
                loop {
                    let frame = stream.next_frame(7).await.unwrap();
                    rows.extend(frame.rows);
                    if frame.done {
                        break;
                    }
                }
                (i, query_id, rows.len())
            }));
        }
        let mut seen_ids = std::collections::HashSet::new();
        for handle in handles {
            let (_, query_id, count) = handle.await.unwrap();
            assert_eq!(count, 100);
            assert!(seen_ids.insert(query_id), "query ids are unique");
            assert_eq!(
                processor.query_record(query_id).unwrap().state,
                QueryState::Completed
            );
        }
    }

    #[tokio::test]
    async fn query_ids_are_monotonic() {
        let (processor, _) = processor_with(2, 2, EngineProps::default());
        let a = processor
            .execute("SELECT id FROM mysql_db.orders", None)
            .await
            .unwrap();
        let b = processor
            .execute("SELECT id FROM mysql_db.orders", None)
            .await
            .unwrap();
        let id_of = |e: &Execution| match e {
            Execution::Rows { query_id, .. } => *query_id,
            Execution::UpdateCount { query_id, .. } => *query_id,
            Execution::Explain { query_id, .. } => *query_id,
        };
        assert!(id_of(&b) > id_of(&a));
        // Drain so the slots release.
        if let Execution::Rows { mut stream, .. } = a {
            let _ = drain(&mut stream).await;
        }
        if let Execution::Rows { mut stream, .. } = b {
            let _ = drain(&mut stream).await;
        }
    }
}
