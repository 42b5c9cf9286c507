//! Elasticsearch connector.
//!
//! Indices appear as external-index tables under the `default` schema.
//! Pushdown renders to query DSL: term/range/terms/exists clauses inside a
//! bool filter, `_source` includes for projection, `size` for limits.
//! Anything the DSL cannot express stays with the executor as residual.

use crate::catalog::{ColumnMeta, SourceType, TableKind, TableMeta, TableStatistics};
use crate::connector::{
    CancelToken, ChannelScanStream, Connector, PoolSettings, RowBatchStream, ScanRequest,
};
use crate::error::{EngineError, EngineResult};
use crate::expr::{BinaryOp, ScalarExpr, split_conjunction};
use crate::sanitize::sanitize_url;
use crate::types::{LogicalType, Row, Value};
use async_trait::async_trait;
use elasticsearch::{
    auth::Credentials,
    cat::CatIndicesParts,
    http::{
        transport::{SingleNodeConnectionPool, TransportBuilder},
        Url,
    },
    indices::IndicesGetMappingParts,
    ClearScrollParts, CountParts, Elasticsearch, ScrollParts, SearchParts,
};
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SCROLL_KEEPALIVE: &str = "1m";

pub struct ElasticsearchConnector {
    source_id: String,
    client: Elasticsearch,
}

impl ElasticsearchConnector {
    pub fn connect(
        source_id: &str,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
        _settings: &PoolSettings,
    ) -> EngineResult<Self> {
        let parsed = Url::parse(url).map_err(|e| EngineError::SourceUnavailable {
            source_name: source_id.to_string(),
            reason: format!("bad url {}: {e}", sanitize_url(url)),
        })?;
        let mut builder = TransportBuilder::new(SingleNodeConnectionPool::new(parsed));
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.auth(Credentials::Basic(user.to_string(), pass.to_string()));
        }
        let transport = builder
            .build()
            .map_err(|e| EngineError::SourceUnavailable {
                source_name: source_id.to_string(),
                reason: e.to_string(),
            })?;
        debug!(source = source_id, url = %sanitize_url(url), "opened elasticsearch transport");
        Ok(ElasticsearchConnector {
            source_id: source_id.to_string(),
            client: Elasticsearch::new(transport),
        })
    }

    fn map_type(&self, field_type: &str, field: &str) -> EngineResult<LogicalType> {
        let mapped = match field_type {
            "keyword" | "text" | "ip" | "wildcard" | "constant_keyword" => LogicalType::String,
            "long" | "unsigned_long" => LogicalType::Int64,
            "integer" | "short" | "byte" => LogicalType::Int32,
            "double" | "float" | "half_float" | "scaled_float" => LogicalType::Float64,
            "boolean" => LogicalType::Boolean,
            "date" | "date_nanos" => LogicalType::Timestamp,
            "binary" => LogicalType::Binary,
            "nested" | "object" | "flattened" => LogicalType::Json,
            other => {
                return Err(EngineError::TypeNotSupported {
                    source_name: format!("{}.{field}", self.source_id),
                    native_type: other.to_string(),
                })
            }
        };
        Ok(mapped)
    }

    async fn doc_count(&self, index: &str) -> EngineResult<u64> {
        let response = self
            .client
            .count(CountParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body: Json = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;
        Ok(body.get("count").and_then(|c| c.as_u64()).unwrap_or(0))
    }

    fn transport_error(&self, err: elasticsearch::Error) -> EngineError {
        let text = err.to_string();
        if text.contains("timed out") || text.contains("timeout") {
            EngineError::ConnectTimeout {
                source_name: self.source_id.clone(),
                reason: text,
            }
        } else {
            EngineError::SourceUnavailable {
                source_name: self.source_id.clone(),
                reason: text,
            }
        }
    }
}

#[async_trait]
impl Connector for ElasticsearchConnector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> SourceType {
        SourceType::ElasticSearch
    }

    async fn discover_schema(&self) -> EngineResult<Vec<TableMeta>> {
        debug!(source = self.source_id, "discovering indices");

        let response = self
            .client
            .cat()
            .indices(CatIndicesParts::None)
            .format("json")
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let listing: Json = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        let mut index_rows: Vec<(String, u64)> = Vec::new();
        if let Some(entries) = listing.as_array() {
            for entry in entries {
                let Some(index) = entry.get("index").and_then(|v| v.as_str()) else {
                    continue;
                };
                if index.starts_with('.') {
                    continue;
                }
                let docs = entry
                    .get("docs.count")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                index_rows.push((index.to_string(), docs));
            }
        }

        let mapping_response = self
            .client
            .indices()
            .get_mapping(IndicesGetMappingParts::None)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let mappings: Json = mapping_response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        let mut tables = Vec::with_capacity(index_rows.len());
        for (index, docs) in index_rows {
            let Some(properties) = mappings
                .get(&index)
                .and_then(|m| m.get("mappings"))
                .and_then(|m| m.get("properties"))
                .and_then(|p| p.as_object())
            else {
                warn!(source = self.source_id, index, "index without mapping skipped");
                continue;
            };

            let mut columns = Vec::with_capacity(properties.len());
            for (ordinal, (field, definition)) in properties.iter().enumerate() {
                let field_type = definition
                    .get("type")
                    .and_then(|t| t.as_str())
                    // A sub-object without a type is an object field.
                    .unwrap_or("object");
                columns.push(ColumnMeta {
                    name: field.clone(),
                    ordinal,
                    data_type: self.map_type(field_type, field)?,
                    nullable: true,
                    precision: None,
                    scale: None,
                });
            }
            if columns.is_empty() {
                continue;
            }
            tables.push(TableMeta {
                source: self.source_id.clone(),
                source_type: SourceType::ElasticSearch,
                schema: "default".to_string(),
                name: index,
                kind: TableKind::ExternalIndex,
                columns,
                indexes: Vec::new(),
                statistics: TableStatistics::gathered(docs),
            });
        }
        debug!(source = self.source_id, indices = tables.len(), "discovery complete");
        Ok(tables)
    }

    async fn table_statistics(&self, table: &TableMeta) -> EngineResult<u64> {
        self.doc_count(&table.name).await
    }

    async fn scan(
        &self,
        request: ScanRequest,
        cancel: CancelToken,
    ) -> EngineResult<Box<dyn RowBatchStream>> {
        if request.pushdown.aggregate.is_some() {
            return Err(EngineError::Internal(
                "aggregate pushdown is not expressible against a document index".to_string(),
            ));
        }

        let body = build_search_body(&request)?;
        debug!(
            query_id = request.query_id,
            source = self.source_id,
            index = request.table.name,
            body = %body,
            "starting elasticsearch scan"
        );

        let fields: Vec<(String, LogicalType)> = fetch_fields(&request);
        let client = self.client.clone();
        let index = request.table.name.clone();
        let limit = request.pushdown.limit;
        let batch_size = request.batch_size.max(1);
        let task_cancel = cancel.clone();
        let source_id = self.source_id.clone();
        let (tx, rx) = mpsc::channel(2);

        let task = tokio::spawn(async move {
            let mut emitted: u64 = 0;
            let mut scroll_id: Option<String> = None;

            let first = client
                .search(SearchParts::Index(&[index.as_str()]))
                .scroll(SCROLL_KEEPALIVE)
                .size(batch_size as i64)
                .body(body)
                .send()
                .await;

            let mut response = match first {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx
                        .send(Err(EngineError::SourceUnavailable {
                            source_name: source_id,
                            reason: e.to_string(),
                        }))
                        .await;
                    return;
                }
            };

            loop {
                if task_cancel.is_cancelled() {
                    break;
                }
                let payload: Json = match response.json().await {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::SourceUnavailable {
                                source_name: source_id.clone(),
                                reason: e.to_string(),
                            }))
                            .await;
                        break;
                    }
                };
                scroll_id = payload
                    .get("_scroll_id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .or(scroll_id);

                let hits = payload
                    .get("hits")
                    .and_then(|h| h.get("hits"))
                    .and_then(|h| h.as_array())
                    .cloned()
                    .unwrap_or_default();
                if hits.is_empty() {
                    break;
                }

                let mut batch: Vec<Row> = Vec::with_capacity(hits.len());
                for hit in &hits {
                    if let Some(cap) = limit {
                        if emitted >= cap {
                            break;
                        }
                    }
                    let source = hit.get("_source");
                    batch.push(decode_hit(source, &fields));
                    emitted += 1;
                }
                let reached_cap = limit.map(|cap| emitted >= cap).unwrap_or(false);
                if !batch.is_empty() && tx.send(Ok(batch)).await.is_err() {
                    break;
                }
                if reached_cap {
                    break;
                }

                let Some(id) = scroll_id.clone() else {
                    break;
                };
                match client
                    .scroll(ScrollParts::ScrollId(&id))
                    .scroll(SCROLL_KEEPALIVE)
                    .send()
                    .await
                {
                    Ok(r) => response = r,
                    Err(e) => {
                        let _ = tx
                            .send(Err(EngineError::SourceUnavailable {
                                source_name: source_id.clone(),
                                reason: e.to_string(),
                            }))
                            .await;
                        break;
                    }
                }
            }

            if let Some(id) = scroll_id {
                let _ = client
                    .clear_scroll(ClearScrollParts::ScrollId(&[id.as_str()]))
                    .send()
                    .await;
            }
        });

        Ok(Box::new(ChannelScanStream::new(rx, task, cancel)))
    }

    async fn execute_raw(&self, _sql: &str) -> EngineResult<u64> {
        Err(EngineError::Unsupported(
            "DML against a document index".to_string(),
        ))
    }

    async fn health_probe(&self) -> EngineResult<()> {
        let response = self
            .client
            .ping()
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if response.status_code().is_success() {
            Ok(())
        } else {
            Err(EngineError::SourceUnavailable {
                source_name: self.source_id.clone(),
                reason: format!("ping returned {}", response.status_code()),
            })
        }
    }

    async fn close(&self) {
        // The transport holds no pooled server-side state to drain.
    }
}

/// Fields fetched from `_source`, in output order.
fn fetch_fields(request: &ScanRequest) -> Vec<(String, LogicalType)> {
    let columns = &request.table.columns;
    match &request.pushdown.projection {
        Some(ordinals) if !ordinals.is_empty() => ordinals
            .iter()
            .filter_map(|&o| columns.get(o))
            .map(|c| (c.name.clone(), c.data_type))
            .collect(),
        _ => columns
            .iter()
            .map(|c| (c.name.clone(), c.data_type))
            .collect(),
    }
}

fn build_search_body(request: &ScanRequest) -> EngineResult<Json> {
    let columns = &request.table.columns;

    let query = match &request.pushdown.filter {
        Some(filter) => {
            let mut must = Vec::new();
            let mut must_not = Vec::new();
            for conjunct in split_conjunction(filter) {
                let (negated, clause) = conjunct_to_dsl(&conjunct, columns)?;
                if negated {
                    must_not.push(clause);
                } else {
                    must.push(clause);
                }
            }
            json!({ "bool": { "filter": must, "must_not": must_not } })
        }
        None => json!({ "match_all": {} }),
    };

    let mut body = json!({ "query": query });

    let includes: Vec<String> = fetch_fields(request).into_iter().map(|(n, _)| n).collect();
    body["_source"] = json!(includes);

    if !request.pushdown.sort.is_empty() {
        let mut sort = Vec::new();
        for key in &request.pushdown.sort {
            let ScalarExpr::Column { index, .. } = &key.expr else {
                return Err(EngineError::Internal(
                    "non-column sort key pushed to document index".to_string(),
                ));
            };
            let field = columns
                .get(*index)
                .ok_or_else(|| EngineError::Internal("sort ordinal out of range".to_string()))?;
            sort.push(json!({
                field.name.clone(): { "order": if key.ascending { "asc" } else { "desc" } }
            }));
        }
        body["sort"] = json!(sort);
    }

    Ok(body)
}

/// One accepted conjunct as a query-DSL clause; the flag marks must_not.
fn conjunct_to_dsl(
    conjunct: &ScalarExpr,
    columns: &[ColumnMeta],
) -> EngineResult<(bool, Json)> {
    let field_name = |index: usize| -> EngineResult<String> {
        columns
            .get(index)
            .map(|c| c.name.clone())
            .ok_or_else(|| EngineError::Internal("pushdown ordinal out of range".to_string()))
    };
    let unexpressible = || {
        EngineError::Internal(
            "unexpressible predicate accepted for document-index pushdown".to_string(),
        )
    };

    match conjunct {
        ScalarExpr::Binary { left, op, right } if op.is_comparison() => {
            let (index, literal, op) = match (left.as_ref(), right.as_ref()) {
                (ScalarExpr::Column { index, .. }, ScalarExpr::Literal(v)) => (*index, v, *op),
                (ScalarExpr::Literal(v), ScalarExpr::Column { index, .. }) => {
                    (*index, v, mirror(*op))
                }
                _ => return Err(unexpressible()),
            };
            let field = field_name(index)?;
            let value = literal_json(literal);
            let clause = match op {
                BinaryOp::Eq => (false, json!({ "term": { field: value } })),
                BinaryOp::NotEq => (true, json!({ "term": { field: value } })),
                BinaryOp::Gt => (false, json!({ "range": { field: { "gt": value } } })),
                BinaryOp::GtEq => (false, json!({ "range": { field: { "gte": value } } })),
                BinaryOp::Lt => (false, json!({ "range": { field: { "lt": value } } })),
                BinaryOp::LtEq => (false, json!({ "range": { field: { "lte": value } } })),
                _ => return Err(unexpressible()),
            };
            Ok(clause)
        }
        ScalarExpr::InList {
            expr,
            list,
            negated,
        } => {
            let ScalarExpr::Column { index, .. } = expr.as_ref() else {
                return Err(unexpressible());
            };
            let field = field_name(*index)?;
            let values: Vec<Json> = list
                .iter()
                .map(|item| match item {
                    ScalarExpr::Literal(v) => Ok(literal_json(v)),
                    _ => Err(unexpressible()),
                })
                .collect::<EngineResult<_>>()?;
            Ok((*negated, json!({ "terms": { field: values } })))
        }
        ScalarExpr::IsNull { expr, negated } => {
            let ScalarExpr::Column { index, .. } = expr.as_ref() else {
                return Err(unexpressible());
            };
            let field = field_name(*index)?;
            // IS NULL = the field does not exist; IS NOT NULL = it does.
            Ok((!negated, json!({ "exists": { "field": field } })))
        }
        _ => Err(unexpressible()),
    }
}

fn mirror(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::LtEq => BinaryOp::GtEq,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::GtEq => BinaryOp::LtEq,
        other => other,
    }
}

fn literal_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::String(s) => json!(s),
        Value::Boolean(b) => json!(b),
        Value::Int32(i) => json!(i),
        Value::Int64(i) => json!(i),
        Value::Float64(f) => json!(f),
        Value::Decimal(d) => json!(d.to_string()),
        Value::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(ts) => json!(ts.format("%Y-%m-%dT%H:%M:%S").to_string()),
        other => json!(other.to_string()),
    }
}

fn decode_hit(source: Option<&Json>, fields: &[(String, LogicalType)]) -> Row {
    let mut row = Vec::with_capacity(fields.len());
    for (name, ty) in fields {
        let value = source
            .and_then(|s| s.get(name))
            .map(|v| decode_json_value(v, *ty))
            .unwrap_or(Value::Null);
        row.push(value);
    }
    row
}

fn decode_json_value(value: &Json, ty: LogicalType) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match ty {
        LogicalType::String => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or_else(|| Value::String(value.to_string())),
        LogicalType::Boolean => value.as_bool().map(Value::Boolean).unwrap_or(Value::Null),
        LogicalType::Int32 => value
            .as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .map(Value::Int32)
            .unwrap_or(Value::Null),
        LogicalType::Int64 => value.as_i64().map(Value::Int64).unwrap_or(Value::Null),
        LogicalType::Float64 => value.as_f64().map(Value::Float64).unwrap_or(Value::Null),
        LogicalType::Decimal => value
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| value.as_f64().and_then(|f| rust_decimal::Decimal::try_from(f).ok()))
            .map(Value::Decimal)
            .unwrap_or(Value::Null),
        LogicalType::Date => value
            .as_str()
            .and_then(|s| chrono::NaiveDate::parse_from_str(&s[..s.len().min(10)], "%Y-%m-%d").ok())
            .map(Value::Date)
            .unwrap_or(Value::Null),
        LogicalType::Timestamp => decode_timestamp(value),
        LogicalType::Binary => value
            .as_str()
            .map(|s| Value::Binary(s.as_bytes().to_vec()))
            .unwrap_or(Value::Null),
        LogicalType::Array => match value.as_array() {
            Some(items) => Value::Array(
                items
                    .iter()
                    .map(|v| decode_json_value(v, LogicalType::Json))
                    .collect(),
            ),
            None => Value::Json(value.clone()),
        },
        LogicalType::Json => Value::Json(value.clone()),
    }
}

fn decode_timestamp(value: &Json) -> Value {
    if let Some(millis) = value.as_i64() {
        return chrono::DateTime::from_timestamp_millis(millis)
            .map(|dt| Value::Timestamp(dt.naive_utc()))
            .unwrap_or(Value::Null);
    }
    let Some(text) = value.as_str() else {
        return Value::Null;
    };
    chrono::DateTime::parse_from_rfc3339(text)
        .map(|dt| Value::Timestamp(dt.naive_utc()))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").map(Value::Timestamp)
        })
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|d| Value::Timestamp(d.and_hms_opt(0, 0, 0).unwrap_or_default()))
        })
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::federated_catalog;
    use crate::connector::Pushdown;
    use rstest::rstest;

    fn logs_request(pushdown: Pushdown) -> ScanRequest {
        let catalog = federated_catalog();
        let table = catalog
            .resolve_table(&["es_logs".into(), "access_logs".into()])
            .unwrap();
        ScanRequest {
            table,
            pushdown,
            query_id: 1,
            batch_size: 1000,
        }
    }

    #[test]
    fn equality_renders_as_term_filter() {
        let pushdown = Pushdown {
            filter: Some(ScalarExpr::binary(
                ScalarExpr::column(0, "order_id"),
                BinaryOp::Eq,
                ScalarExpr::literal(Value::Int64(7)),
            )),
            projection: Some(vec![0, 1]),
            ..Default::default()
        };
        let body = build_search_body(&logs_request(pushdown)).unwrap();
        assert_eq!(
            body["query"]["bool"]["filter"][0],
            json!({ "term": { "order_id": 7 } })
        );
        assert_eq!(body["_source"], json!(["order_id", "access_time"]));
    }

    #[rstest]
    #[case(BinaryOp::Gt, "gt")]
    #[case(BinaryOp::GtEq, "gte")]
    #[case(BinaryOp::Lt, "lt")]
    #[case(BinaryOp::LtEq, "lte")]
    fn ranges_render(#[case] op: BinaryOp, #[case] key: &str) {
        let pushdown = Pushdown {
            filter: Some(ScalarExpr::binary(
                ScalarExpr::column(0, "order_id"),
                op,
                ScalarExpr::literal(Value::Int64(5)),
            )),
            ..Default::default()
        };
        let body = build_search_body(&logs_request(pushdown)).unwrap();
        assert_eq!(
            body["query"]["bool"]["filter"][0],
            json!({ "range": { "order_id": { key: 5 } } })
        );
    }

    #[test]
    fn flipped_literal_comparison_mirrors() {
        // 5 < order_id is order_id > 5.
        let pushdown = Pushdown {
            filter: Some(ScalarExpr::binary(
                ScalarExpr::literal(Value::Int64(5)),
                BinaryOp::Lt,
                ScalarExpr::column(0, "order_id"),
            )),
            ..Default::default()
        };
        let body = build_search_body(&logs_request(pushdown)).unwrap();
        assert_eq!(
            body["query"]["bool"]["filter"][0],
            json!({ "range": { "order_id": { "gt": 5 } } })
        );
    }

    #[test]
    fn is_null_renders_as_missing_field() {
        let pushdown = Pushdown {
            filter: Some(ScalarExpr::IsNull {
                expr: Box::new(ScalarExpr::column(1, "access_time")),
                negated: false,
            }),
            ..Default::default()
        };
        let body = build_search_body(&logs_request(pushdown)).unwrap();
        assert_eq!(
            body["query"]["bool"]["must_not"][0],
            json!({ "exists": { "field": "access_time" } })
        );
    }

    #[test]
    fn hit_decoding_follows_mapping_types() {
        let source = json!({
            "order_id": 42,
            "access_time": "2024-03-01T10:30:00Z"
        });
        let fields = vec![
            ("order_id".to_string(), LogicalType::Int64),
            ("access_time".to_string(), LogicalType::Timestamp),
        ];
        let row = decode_hit(Some(&source), &fields);
        assert_eq!(row[0], Value::Int64(42));
        assert!(matches!(row[1], Value::Timestamp(_)));
    }

    #[test]
    fn missing_fields_decode_as_null() {
        let source = json!({ "order_id": 1 });
        let fields = vec![
            ("order_id".to_string(), LogicalType::Int64),
            ("access_time".to_string(), LogicalType::Timestamp),
        ];
        let row = decode_hit(Some(&source), &fields);
        assert_eq!(row[1], Value::Null);
    }

    #[test]
    fn epoch_millis_timestamps_decode() {
        let decoded = decode_timestamp(&json!(1_709_287_800_000i64));
        assert!(matches!(decoded, Value::Timestamp(_)));
    }
}
