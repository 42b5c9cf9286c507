//! MySQL connector.

use crate::catalog::{ColumnMeta, IndexMeta, SourceType, TableKind, TableMeta, TableStatistics};
use crate::connector::{
    render_scan_sql, CancelToken, ChannelScanStream, Connector, PoolSettings, RowBatchStream,
    ScanRequest,
};
use crate::error::{EngineError, EngineResult};
use crate::sanitize::sanitize_url;
use crate::types::{LogicalType, Row, Value};
use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column as _, Row as _};
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MySqlConnector {
    source_id: String,
    database: String,
    pool: MySqlPool,
}

impl MySqlConnector {
    pub async fn connect(
        source_id: &str,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
        settings: &PoolSettings,
    ) -> EngineResult<Self> {
        let mut options = MySqlConnectOptions::from_str(url).map_err(|e| {
            EngineError::SourceUnavailable {
                source_name: source_id.to_string(),
                reason: format!("bad url {}: {e}", sanitize_url(url)),
            }
        })?;
        if let Some(user) = username {
            options = options.username(user);
        }
        if let Some(pass) = password {
            options = options.password(pass);
        }
        let database = options.get_database().unwrap_or("").to_string();
        if database.is_empty() {
            return Err(EngineError::SourceUnavailable {
                source_name: source_id.to_string(),
                reason: "url does not name a database".to_string(),
            });
        }

        debug!(source = source_id, url = %sanitize_url(url), "opening mysql pool");
        let pool = MySqlPoolOptions::new()
            .max_connections(settings.max_size)
            .min_connections(settings.min_idle)
            .acquire_timeout(settings.connect_timeout)
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(settings.max_lifetime)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::SourceUnavailable {
                source_name: source_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(MySqlConnector {
            source_id: source_id.to_string(),
            database,
            pool,
        })
    }

    fn map_type(&self, data_type: &str, column: &str) -> EngineResult<LogicalType> {
        let mapped = match data_type {
            "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum"
            | "set" => LogicalType::String,
            "tinyint" | "smallint" | "mediumint" | "int" => LogicalType::Int32,
            "bigint" => LogicalType::Int64,
            "float" | "double" => LogicalType::Float64,
            "decimal" | "numeric" => LogicalType::Decimal,
            "date" => LogicalType::Date,
            "datetime" | "timestamp" => LogicalType::Timestamp,
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
                LogicalType::Binary
            }
            "json" => LogicalType::Json,
            other => {
                return Err(EngineError::TypeNotSupported {
                    source_name: format!("{}.{column}", self.source_id),
                    native_type: other.to_string(),
                })
            }
        };
        Ok(mapped)
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::MySql
    }

    async fn discover_schema(&self) -> EngineResult<Vec<TableMeta>> {
        debug!(source = self.source_id, database = self.database, "discovering schema");

        let table_rows = sqlx::query(
            r#"
            SELECT TABLE_NAME, TABLE_TYPE, TABLE_ROWS
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ?
              AND TABLE_TYPE IN ('BASE TABLE', 'VIEW')
            ORDER BY TABLE_NAME
            "#,
        )
        .bind(&self.database)
        .fetch_all(&self.pool)
        .await?;

        let column_rows = sqlx::query(
            r#"
            SELECT TABLE_NAME, COLUMN_NAME, ORDINAL_POSITION, DATA_TYPE,
                   IS_NULLABLE, NUMERIC_PRECISION, NUMERIC_SCALE
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ?
            ORDER BY TABLE_NAME, ORDINAL_POSITION
            "#,
        )
        .bind(&self.database)
        .fetch_all(&self.pool)
        .await?;

        let index_rows = sqlx::query(
            r#"
            SELECT TABLE_NAME, INDEX_NAME, COLUMN_NAME, NON_UNIQUE, SEQ_IN_INDEX
            FROM INFORMATION_SCHEMA.STATISTICS
            WHERE TABLE_SCHEMA = ?
            ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX
            "#,
        )
        .bind(&self.database)
        .fetch_all(&self.pool)
        .await?;

        let mut columns_by_table: BTreeMap<String, Vec<ColumnMeta>> = BTreeMap::new();
        for row in &column_rows {
            let table: String = row.try_get("TABLE_NAME")?;
            let name: String = row.try_get("COLUMN_NAME")?;
            let ordinal: u64 = row.try_get::<u32, _>("ORDINAL_POSITION").map(u64::from)?;
            let data_type: String = row.try_get("DATA_TYPE")?;
            let nullable: String = row.try_get("IS_NULLABLE")?;
            let precision: Option<u64> = row.try_get("NUMERIC_PRECISION").ok();
            let scale: Option<u64> = row.try_get("NUMERIC_SCALE").ok();
            columns_by_table.entry(table).or_default().push(ColumnMeta {
                name: name.clone(),
                ordinal: ordinal.saturating_sub(1) as usize,
                data_type: self.map_type(&data_type, &name)?,
                nullable: nullable.eq_ignore_ascii_case("YES"),
                precision: precision.map(|p| p as u32),
                scale: scale.map(|s| s as u32),
            });
        }

        let mut indexes_by_table: BTreeMap<String, BTreeMap<String, IndexMeta>> = BTreeMap::new();
        for row in &index_rows {
            let table: String = row.try_get("TABLE_NAME")?;
            let index: String = row.try_get("INDEX_NAME")?;
            let column: String = row.try_get("COLUMN_NAME")?;
            let non_unique: i64 = row.try_get::<i64, _>("NON_UNIQUE").unwrap_or(1);
            indexes_by_table
                .entry(table)
                .or_default()
                .entry(index.clone())
                .or_insert_with(|| IndexMeta {
                    name: index,
                    columns: Vec::new(),
                    unique: non_unique == 0,
                })
                .columns
                .push(column);
        }

        let mut tables = Vec::with_capacity(table_rows.len());
        for row in &table_rows {
            let name: String = row.try_get("TABLE_NAME")?;
            let table_type: String = row.try_get("TABLE_TYPE")?;
            let row_count: Option<u64> = row
                .try_get::<Option<u64>, _>("TABLE_ROWS")
                .ok()
                .flatten();
            let columns = columns_by_table.remove(&name).unwrap_or_default();
            if columns.is_empty() {
                warn!(source = self.source_id, table = name, "table without columns skipped");
                continue;
            }
            tables.push(TableMeta {
                source: self.source_id.clone(),
                source_type: SourceType::MySql,
                schema: self.database.clone(),
                name: name.clone(),
                kind: if table_type.contains("VIEW") {
                    TableKind::View
                } else {
                    TableKind::Base
                },
                columns,
                indexes: indexes_by_table
                    .remove(&name)
                    .map(|m| m.into_values().collect())
                    .unwrap_or_default(),
                statistics: match row_count {
                    Some(rows) => TableStatistics::gathered(rows),
                    None => TableStatistics::assumed(),
                },
            });
        }
        debug!(source = self.source_id, tables = tables.len(), "discovery complete");
        Ok(tables)
    }

    async fn table_statistics(&self, table: &TableMeta) -> EngineResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT TABLE_ROWS
            FROM INFORMATION_SCHEMA.TABLES
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row
            .try_get::<Option<u64>, _>("TABLE_ROWS")
            .ok()
            .flatten()
            .unwrap_or(0))
    }

    async fn scan(
        &self,
        request: ScanRequest,
        cancel: CancelToken,
    ) -> EngineResult<Box<dyn RowBatchStream>> {
        let sql = render_scan_sql(&request)?;
        debug!(
            query_id = request.query_id,
            source = self.source_id,
            sql,
            "starting mysql scan"
        );

        let expected = expected_types(&request);
        let pool = self.pool.clone();
        let batch_size = request.batch_size.max(1);
        let task_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel(2);

        let task = tokio::spawn(async move {
            let mut stream = sqlx::query(&sql).fetch(&pool);
            let mut batch: Vec<Row> = Vec::with_capacity(batch_size);
            while let Some(next) = stream.next().await {
                if task_cancel.is_cancelled() {
                    return;
                }
                match next {
                    Ok(row) => match decode_row(&row, &expected) {
                        Ok(decoded) => {
                            batch.push(decoded);
                            if batch.len() >= batch_size
                                && tx.send(Ok(std::mem::take(&mut batch))).await.is_err()
                            {
                                return;
                            }
                        }
                        Err(err) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                    },
                    Err(err) => {
                        let _ = tx.send(Err(EngineError::from(err))).await;
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx.send(Ok(batch)).await;
            }
        });

        Ok(Box::new(ChannelScanStream::new(rx, task, cancel)))
    }

    async fn execute_raw(&self, sql: &str) -> EngineResult<u64> {
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn health_probe(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Output column types of a scan, in wire order.
fn expected_types(request: &ScanRequest) -> Vec<LogicalType> {
    if let Some(aggregate) = &request.pushdown.aggregate {
        return aggregate.schema.fields.iter().map(|f| f.data_type).collect();
    }
    match &request.pushdown.projection {
        Some(ordinals) if !ordinals.is_empty() => ordinals
            .iter()
            .filter_map(|&o| request.table.columns.get(o))
            .map(|c| c.data_type)
            .collect(),
        _ => request.table.columns.iter().map(|c| c.data_type).collect(),
    }
}

fn decode_row(row: &MySqlRow, expected: &[LogicalType]) -> EngineResult<Row> {
    let mut out = Vec::with_capacity(expected.len());
    for (i, ty) in expected.iter().enumerate() {
        out.push(decode_value(row, i, *ty)?);
    }
    Ok(out)
}

/// Decode one column, tolerating the width changes MySQL applies to
/// aggregate results (SUM over integers comes back as DECIMAL).
fn decode_value(row: &MySqlRow, index: usize, ty: LogicalType) -> EngineResult<Value> {
    let type_error = |e: sqlx::Error| {
        EngineError::Internal(format!(
            "column {index} ({}) failed to decode as {ty}: {e}",
            row.columns()
                .get(index)
                .map(|c| c.name())
                .unwrap_or("?")
        ))
    };
    let value = match ty {
        LogicalType::String => row
            .try_get::<Option<String>, _>(index)
            .map(|v| v.map(Value::String)),
        LogicalType::Boolean => row
            .try_get::<Option<bool>, _>(index)
            .map(|v| v.map(Value::Boolean)),
        LogicalType::Int32 => row
            .try_get::<Option<i32>, _>(index)
            .map(|v| v.map(Value::Int32)),
        LogicalType::Int64 => match row.try_get::<Option<i64>, _>(index) {
            Ok(v) => Ok(v.map(Value::Int64)),
            Err(_) => row
                .try_get::<Option<sqlx::types::Decimal>, _>(index)
                .map(|v| v.map(Value::Decimal)),
        },
        LogicalType::Float64 => row
            .try_get::<Option<f64>, _>(index)
            .map(|v| v.map(Value::Float64)),
        LogicalType::Decimal => row
            .try_get::<Option<sqlx::types::Decimal>, _>(index)
            .map(|v| v.map(Value::Decimal)),
        LogicalType::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)
            .map(|v| v.map(Value::Date)),
        LogicalType::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map(|v| v.map(Value::Timestamp)),
        LogicalType::Binary => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .map(|v| v.map(Value::Binary)),
        LogicalType::Json | LogicalType::Array => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .map(|v| v.map(Value::Json)),
    };
    value.map(|v| v.unwrap_or(Value::Null)).map_err(type_error)
}
