//! In-memory connector double for the executor, manager and processor
//! suites. Behaviour knobs (failing probes, transient scan errors, slow
//! streams) are flipped at runtime through atomics.

use crate::catalog::{SourceType, TableMeta};
use crate::connector::{
    CancelToken, Connector, PoolSettings, Pushdown, RowBatchStream, ScanRequest,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{Row, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn default_pool_settings() -> PoolSettings {
    PoolSettings {
        max_size: 4,
        min_idle: 1,
        connect_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(60),
        max_lifetime: Duration::from_secs(300),
    }
}

#[derive(Default)]
pub struct MemoryConnectorState {
    pub probe_calls: AtomicUsize,
    pub probe_fails: AtomicBool,
    pub probe_hangs: AtomicBool,
    pub scan_calls: AtomicUsize,
    pub cancel_calls: AtomicUsize,
    /// Fail the first N scan attempts with a transient error.
    pub transient_failures: AtomicUsize,
    pub checked_out: AtomicUsize,
}

pub struct MemoryConnector {
    source_id: String,
    source_type: SourceType,
    tables: Vec<TableMeta>,
    rows: HashMap<String, Vec<Row>>,
    /// Delay injected between batches, for cancellation tests.
    pub batch_delay: Duration,
    pub state: Arc<MemoryConnectorState>,
}

impl MemoryConnector {
    pub fn new(source_id: &str, source_type: SourceType, tables: Vec<TableMeta>) -> Self {
        MemoryConnector {
            source_id: source_id.to_string(),
            source_type,
            tables,
            rows: HashMap::new(),
            batch_delay: Duration::ZERO,
            state: Arc::new(MemoryConnectorState::default()),
        }
    }

    pub fn with_rows(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.rows.insert(table.to_string(), rows);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

struct MemoryStream {
    batches: Vec<Vec<Row>>,
    position: usize,
    delay: Duration,
    cancel: CancelToken,
    state: Arc<MemoryConnectorState>,
    open: bool,
}

#[async_trait]
impl RowBatchStream for MemoryStream {
    async fn next_batch(&mut self) -> EngineResult<Option<Vec<Row>>> {
        if self.cancel.is_cancelled() {
            self.cancel().await;
            return Err(EngineError::Cancelled);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.position >= self.batches.len() {
            if self.open {
                self.open = false;
                self.state.checked_out.fetch_sub(1, Ordering::SeqCst);
            }
            return Ok(None);
        }
        let batch = self.batches[self.position].clone();
        self.position += 1;
        Ok(Some(batch))
    }

    async fn cancel(&mut self) {
        if self.open {
            self.open = false;
            self.state.checked_out.fetch_sub(1, Ordering::SeqCst);
            self.state.cancel_calls.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            self.state.checked_out.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Apply the pushdown the way a real source would: filter first, then
/// projection, sort, and limit.
fn apply_pushdown(rows: &[Row], pushdown: &Pushdown) -> EngineResult<Vec<Row>> {
    let mut out: Vec<Row> = Vec::new();
    for row in rows {
        if let Some(filter) = &pushdown.filter {
            if !filter.evaluate(row)?.is_true() {
                continue;
            }
        }
        out.push(row.clone());
    }
    if !pushdown.sort.is_empty() {
        out.sort_by(|a, b| {
            for key in &pushdown.sort {
                let left = key.expr.evaluate(a).unwrap_or(Value::Null);
                let right = key.expr.evaluate(b).unwrap_or(Value::Null);
                let ordering = match (left.is_null(), right.is_null()) {
                    (true, true) => std::cmp::Ordering::Equal,
                    (true, false) => {
                        if key.nulls_first {
                            std::cmp::Ordering::Less
                        } else {
                            std::cmp::Ordering::Greater
                        }
                    }
                    (false, true) => {
                        if key.nulls_first {
                            std::cmp::Ordering::Greater
                        } else {
                            std::cmp::Ordering::Less
                        }
                    }
                    (false, false) => left
                        .compare(&right)
                        .unwrap_or(std::cmp::Ordering::Equal),
                };
                let ordering = if key.ascending {
                    ordering
                } else {
                    ordering.reverse()
                };
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
    }
    if let Some(projection) = &pushdown.projection {
        out = out
            .into_iter()
            .map(|row| {
                projection
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
    }
    if let Some(limit) = pushdown.limit {
        out.truncate(limit as usize);
    }
    Ok(out)
}

#[async_trait]
impl Connector for MemoryConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> SourceType {
        self.source_type
    }

    async fn discover_schema(&self) -> EngineResult<Vec<TableMeta>> {
        Ok(self.tables.clone())
    }

    async fn table_statistics(&self, table: &TableMeta) -> EngineResult<u64> {
        Ok(self
            .rows
            .get(&table.name)
            .map(|r| r.len() as u64)
            .unwrap_or(0))
    }

    async fn scan(
        &self,
        request: ScanRequest,
        cancel: CancelToken,
    ) -> EngineResult<Box<dyn RowBatchStream>> {
        self.state.scan_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state
                .transient_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::ConnectTimeout {
                source: self.source_id.clone(),
                reason: "injected transient failure".to_string(),
            });
        }
        if request.pushdown.aggregate.is_some() {
            return Err(EngineError::Internal(
                "memory connector does not execute pushed aggregates".to_string(),
            ));
        }

        let rows = self
            .rows
            .get(&request.table.name)
            .cloned()
            .unwrap_or_default();
        let rows = apply_pushdown(&rows, &request.pushdown)?;
        let batch_size = request.batch_size.max(1);
        let batches: Vec<Vec<Row>> = rows
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        self.state.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStream {
            batches,
            position: 0,
            delay: self.batch_delay,
            cancel,
            state: self.state.clone(),
            open: true,
        }))
    }

    async fn execute_raw(&self, _sql: &str) -> EngineResult<u64> {
        Ok(1)
    }

    async fn health_probe(&self) -> EngineResult<()> {
        self.state.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.probe_hangs.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.state.probe_fails.load(Ordering::SeqCst) {
            return Err(EngineError::SourceUnavailable {
                source: self.source_id.clone(),
                reason: "injected probe failure".to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) {}
}

/// Rows for the orders fixture: (id, customer, status).
pub fn orders_rows(count: usize) -> Vec<Row> {
    (0..count)
        .map(|i| {
            vec![
                Value::Int32(i as i32),
                Value::String(format!("customer-{i}")),
                Value::String(if i % 2 == 0 { "completed" } else { "pending" }.to_string()),
            ]
        })
        .collect()
}

/// Rows for the access_logs fixture: (order_id, access_time).
pub fn access_log_rows(count: usize) -> Vec<Row> {
    let base = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    (0..count)
        .map(|i| {
            vec![
                Value::Int64(i as i64),
                Value::Timestamp(base + chrono::Duration::seconds(i as i64)),
            ]
        })
        .collect()
}

/// Shared registry handed to the executor in tests.
pub type ConnectorMap = HashMap<String, Arc<dyn Connector>>;

pub fn single_connector_map(connector: MemoryConnector) -> ConnectorMap {
    let mut map: ConnectorMap = HashMap::new();
    map.insert(
        connector.source_id().to_string(),
        Arc::new(connector) as Arc<dyn Connector>,
    );
    map
}
