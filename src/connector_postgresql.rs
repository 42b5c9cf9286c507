//! PostgreSQL connector.

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
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as _, Row as _};
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct PostgreSqlConnector {
    source_id: String,
    pool: PgPool,
}

impl PostgreSqlConnector {
    pub async fn connect(
        source_id: &str,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
        settings: &PoolSettings,
    ) -> EngineResult<Self> {
        let mut options = PgConnectOptions::from_str(url).map_err(|e| {
            EngineError::SourceUnavailable {
                source: source_id.to_string(),
                reason: format!("bad url {}: {e}", sanitize_url(url)),
            }
        })?;
        if let Some(user) = username {
            options = options.username(user);
        }
        if let Some(pass) = password {
            options = options.password(pass);
        }

        debug!(source = source_id, url = %sanitize_url(url), "opening postgres pool");
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_size)
            .min_connections(settings.min_idle)
            .acquire_timeout(settings.connect_timeout)
            .idle_timeout(settings.idle_timeout)
            .max_lifetime(settings.max_lifetime)
            .connect_with(options)
            .await
            .map_err(|e| EngineError::SourceUnavailable {
                source: source_id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(PostgreSqlConnector {
            source_id: source_id.to_string(),
            pool,
        })
    }

    fn map_type(&self, data_type: &str, column: &str) -> EngineResult<LogicalType> {
        let mapped = match data_type {
            "character varying" | "character" | "text" | "name" | "citext" => LogicalType::String,
            "boolean" => LogicalType::Boolean,
            "smallint" | "integer" => LogicalType::Int32,
            "bigint" => LogicalType::Int64,
            "real" | "double precision" => LogicalType::Float64,
            "numeric" => LogicalType::Decimal,
            "date" => LogicalType::Date,
            "timestamp without time zone" | "timestamp with time zone" => LogicalType::Timestamp,
            "bytea" => LogicalType::Binary,
            "json" | "jsonb" => LogicalType::Json,
            "ARRAY" => LogicalType::Array,
            other => {
                return Err(EngineError::TypeNotSupported {
                    source: format!("{}.{column}", self.source_id),
                    native_type: other.to_string(),
                })
            }
        };
        Ok(mapped)
    }
}

#[async_trait]
impl Connector for PostgreSqlConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::PostgreSql
    }

    async fn discover_schema(&self) -> EngineResult<Vec<TableMeta>> {
        debug!(source = self.source_id, "discovering schema");

        let table_rows = sqlx::query(
            r#"
            SELECT t.table_schema::text AS table_schema,
                   t.table_name::text AS table_name,
                   t.table_type::text AS table_type,
                   COALESCE(c.reltuples, 0)::bigint AS row_estimate
            FROM information_schema.tables t
            LEFT JOIN pg_catalog.pg_namespace n ON n.nspname = t.table_schema::text
            LEFT JOIN pg_catalog.pg_class c
              ON c.relname = t.table_name::text AND c.relnamespace = n.oid
            WHERE t.table_schema NOT IN ('pg_catalog', 'information_schema')
              AND t.table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY t.table_schema, t.table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let column_rows = sqlx::query(
            r#"
            SELECT table_schema::text AS table_schema,
                   table_name::text AS table_name,
                   column_name::text AS column_name,
                   ordinal_position::int AS ordinal_position,
                   data_type::text AS data_type,
                   is_nullable::text AS is_nullable,
                   numeric_precision::int AS numeric_precision,
                   numeric_scale::int AS numeric_scale
            FROM information_schema.columns
            WHERE table_schema NOT IN ('pg_catalog', 'information_schema')
            ORDER BY table_schema, table_name, ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let index_rows = sqlx::query(
            r#"
            SELECT n.nspname::text AS table_schema,
                   t.relname::text AS table_name,
                   i.relname::text AS index_name,
                   a.attname::text AS column_name,
                   ix.indisunique AS is_unique,
                   k.ordinality AS seq
            FROM pg_catalog.pg_index ix
            JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid
            JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
            JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
            JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ordinality) ON true
            JOIN pg_catalog.pg_attribute a
              ON a.attrelid = t.oid AND a.attnum = k.attnum
            WHERE n.nspname NOT IN ('pg_catalog', 'information_schema')
            ORDER BY table_schema, table_name, index_name, seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut columns_by_table: BTreeMap<(String, String), Vec<ColumnMeta>> = BTreeMap::new();
        for row in &column_rows {
            let schema: String = row.try_get("table_schema")?;
            let table: String = row.try_get("table_name")?;
            let name: String = row.try_get("column_name")?;
            let ordinal: i32 = row.try_get("ordinal_position")?;
            let data_type: String = row.try_get("data_type")?;
            let nullable: String = row.try_get("is_nullable")?;
            let precision: Option<i32> = row.try_get("numeric_precision").ok();
            let scale: Option<i32> = row.try_get("numeric_scale").ok();
            columns_by_table
                .entry((schema, table))
                .or_default()
                .push(ColumnMeta {
                    name: name.clone(),
                    ordinal: ordinal.saturating_sub(1) as usize,
                    data_type: self.map_type(&data_type, &name)?,
                    nullable: nullable.eq_ignore_ascii_case("YES"),
                    precision: precision.map(|p| p as u32),
                    scale: scale.map(|s| s as u32),
                });
        }

        let mut indexes_by_table: BTreeMap<(String, String), BTreeMap<String, IndexMeta>> =
            BTreeMap::new();
        for row in &index_rows {
            let schema: String = row.try_get("table_schema")?;
            let table: String = row.try_get("table_name")?;
            let index: String = row.try_get("index_name")?;
            let column: String = row.try_get("column_name")?;
            let unique: bool = row.try_get("is_unique").unwrap_or(false);
            indexes_by_table
                .entry((schema, table))
                .or_default()
                .entry(index.clone())
                .or_insert_with(|| IndexMeta {
                    name: index,
                    columns: Vec::new(),
                    unique,
                })
                .columns
                .push(column);
        }

        let mut tables = Vec::with_capacity(table_rows.len());
        for row in &table_rows {
            let schema: String = row.try_get("table_schema")?;
            let name: String = row.try_get("table_name")?;
            let table_type: String = row.try_get("table_type")?;
            let row_estimate: i64 = row.try_get("row_estimate").unwrap_or(0);
            let key = (schema.clone(), name.clone());
            let columns = columns_by_table.remove(&key).unwrap_or_default();
            if columns.is_empty() {
                warn!(source = self.source_id, table = name, "table without columns skipped");
                continue;
            }
            tables.push(TableMeta {
                source: self.source_id.clone(),
                source_type: SourceType::PostgreSql,
                schema,
                name,
                kind: if table_type.contains("VIEW") {
                    TableKind::View
                } else {
                    TableKind::Base
                },
                columns,
                indexes: indexes_by_table
                    .remove(&key)
                    .map(|m| m.into_values().collect())
                    .unwrap_or_default(),
                statistics: if row_estimate > 0 {
                    TableStatistics::gathered(row_estimate as u64)
                } else {
                    TableStatistics::assumed()
                },
            });
        }
        debug!(source = self.source_id, tables = tables.len(), "discovery complete");
        Ok(tables)
    }

    async fn table_statistics(&self, table: &TableMeta) -> EngineResult<u64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(c.reltuples, 0)::bigint AS row_estimate
            FROM pg_catalog.pg_class c
            JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
            WHERE n.nspname = $1 AND c.relname = $2
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name)
        .fetch_one(&self.pool)
        .await?;
        let estimate: i64 = row.try_get("row_estimate").unwrap_or(0);
        Ok(estimate.max(0) as u64)
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
            "starting postgres scan"
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

fn decode_row(row: &PgRow, expected: &[LogicalType]) -> EngineResult<Row> {
    let mut out = Vec::with_capacity(expected.len());
    for (i, ty) in expected.iter().enumerate() {
        out.push(decode_value(row, i, *ty)?);
    }
    Ok(out)
}

/// Decode one column, tolerating aggregate result widening (COUNT is
/// bigint, SUM over integers is numeric).
fn decode_value(row: &PgRow, index: usize, ty: LogicalType) -> EngineResult<Value> {
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
        LogicalType::Int32 => match row.try_get::<Option<i32>, _>(index) {
            Ok(v) => Ok(v.map(Value::Int32)),
            Err(_) => row
                .try_get::<Option<i64>, _>(index)
                .map(|v| v.map(Value::Int64)),
        },
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
