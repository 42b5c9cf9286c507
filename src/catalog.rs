//! In-memory metadata catalog.
//!
//! One immutable snapshot holds every source, schema, table and column the
//! engine knows about, keyed by fully qualified table name. Readers clone an
//! `Arc` of the current snapshot; a rebuild swaps the whole snapshot in one
//! store, so no reader ever observes a half-updated catalog.

use crate::error::{EngineError, EngineResult};
use crate::types::{Field, LogicalType, Schema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use strum::{Display, EnumString};

/// What family of store a source is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    RelationalRow,
    DocumentIndex,
}

/// Concrete source backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[strum(serialize = "mysql")]
    MySql,
    #[strum(serialize = "postgresql", serialize = "postgres")]
    PostgreSql,
    #[strum(serialize = "elastic_search", serialize = "elasticsearch")]
    ElasticSearch,
}

impl SourceType {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceType::MySql | SourceType::PostgreSql => SourceKind::RelationalRow,
            SourceType::ElasticSearch => SourceKind::DocumentIndex,
        }
    }

    /// Whether a whole aggregate can be delegated to the source.
    pub fn supports_aggregate_pushdown(&self) -> bool {
        matches!(self.kind(), SourceKind::RelationalRow)
    }

    /// The dialect for rendering pushdown SQL against this source; `None`
    /// for document indexes, whose pushdown is query DSL.
    pub fn sql_dialect(&self) -> Option<crate::dialect::Dialect> {
        match self {
            SourceType::MySql => Some(crate::dialect::Dialect::MySql),
            SourceType::PostgreSql => Some(crate::dialect::Dialect::PostgreSql),
            SourceType::ElasticSearch => None,
        }
    }
}

/// Table kind within a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Base,
    View,
    ExternalIndex,
}

/// One column of a catalogued table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    pub ordinal: usize,
    pub data_type: LogicalType,
    pub nullable: bool,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

/// Secondary index over one or more columns.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Optimiser statistics for one table.
///
/// `assumed` marks statistics synthesised from the documented defaults
/// (10 000 rows, distinct = rows / 10, selectivity 0.1) rather than gathered
/// from the source; plan output surfaces the flag so operators can see when
/// defaults drove a choice.
#[derive(Debug, Clone, PartialEq)]
pub struct TableStatistics {
    pub row_count: u64,
    pub distinct_counts: HashMap<String, u64>,
    pub default_selectivity: f64,
    pub assumed: bool,
}

pub const DEFAULT_ROW_COUNT: u64 = 10_000;
pub const DEFAULT_SELECTIVITY: f64 = 0.1;

impl TableStatistics {
    pub fn assumed() -> Self {
        TableStatistics {
            row_count: DEFAULT_ROW_COUNT,
            distinct_counts: HashMap::new(),
            default_selectivity: DEFAULT_SELECTIVITY,
            assumed: true,
        }
    }

    pub fn gathered(row_count: u64) -> Self {
        TableStatistics {
            row_count,
            distinct_counts: HashMap::new(),
            default_selectivity: DEFAULT_SELECTIVITY,
            assumed: false,
        }
    }

    /// Distinct-count estimate for a column, defaulting to rows / 10.
    pub fn distinct_count(&self, column: &str) -> u64 {
        self.distinct_counts
            .get(column)
            .copied()
            .unwrap_or_else(|| (self.row_count / 10).max(1))
    }
}

impl Default for TableStatistics {
    fn default() -> Self {
        Self::assumed()
    }
}

/// Fully qualified table entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    pub source: String,
    pub source_type: SourceType,
    pub schema: String,
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnMeta>,
    pub indexes: Vec<IndexMeta>,
    pub statistics: TableStatistics,
}

impl TableMeta {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.source, self.schema, self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Output row type of a full scan.
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| {
                    Field::new(c.name.clone(), c.data_type, c.nullable)
                        .with_qualifier(self.name.clone())
                })
                .collect(),
        )
    }

    pub fn has_index_on(&self, column: &str) -> bool {
        self.indexes
            .iter()
            .any(|ix| ix.columns.first().map(|c| c.eq_ignore_ascii_case(column)) == Some(true))
    }
}

/// Descriptor of a registered source.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub id: String,
    pub source_type: SourceType,
}

/// Immutable catalog snapshot.
#[derive(Debug, Default)]
pub struct Catalog {
    sources: BTreeMap<String, SourceMeta>,
    /// Keyed by lowercase `source.schema.table`.
    tables: HashMap<String, Arc<TableMeta>>,
    /// `source` -> schema -> ordered table names.
    schemas: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    pub fn source(&self, id: &str) -> Option<&SourceMeta> {
        self.sources.get(id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceMeta> {
        self.sources.values()
    }

    /// All `source.schema` namespaces, ordered, for SHOW SCHEMAS.
    pub fn schema_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (source, schemas) in &self.schemas {
            for schema in schemas.keys() {
                out.push(format!("{source}.{schema}"));
            }
        }
        out
    }

    /// Ordered table names under a source (optionally one schema of it).
    pub fn table_names(&self, source: &str, schema: Option<&str>) -> EngineResult<Vec<String>> {
        let schemas = self
            .schemas
            .get(source)
            .ok_or_else(|| EngineError::UnknownSchema(source.to_string()))?;
        match schema {
            Some(s) => schemas
                .get(s)
                .cloned()
                .ok_or_else(|| EngineError::UnknownSchema(format!("{source}.{s}"))),
            None => Ok(schemas.values().flatten().cloned().collect()),
        }
    }

    fn lookup(&self, source: &str, schema: &str, table: &str) -> Option<Arc<TableMeta>> {
        self.tables
            .get(&format!("{source}.{schema}.{table}").to_lowercase())
            .cloned()
    }

    /// Resolve a possibly-partial qualified name to exactly one table.
    ///
    /// Accepted shapes: `source.schema.table`, `source.table` (schema
    /// defaulted per source), and bare `table` (searched across every
    /// source; more than one match is ambiguous).
    pub fn resolve_table(&self, parts: &[String]) -> EngineResult<Arc<TableMeta>> {
        match parts.len() {
            3 => {
                let (source, schema, table) = (&parts[0], &parts[1], &parts[2]);
                if !self.sources.contains_key(source.as_str()) {
                    return Err(EngineError::UnknownSchema(source.clone()));
                }
                self.lookup(source, schema, table)
                    .ok_or_else(|| EngineError::UnknownTable(parts.join(".")))
            }
            2 => {
                let (source, table) = (&parts[0], &parts[1]);
                if let Some(schemas) = self.schemas.get(source.as_str()) {
                    let matches: Vec<Arc<TableMeta>> = schemas
                        .keys()
                        .filter_map(|schema| self.lookup(source, schema, table))
                        .collect();
                    return match matches.len() {
                        0 => Err(EngineError::UnknownTable(parts.join("."))),
                        1 => Ok(matches.into_iter().next().expect("len checked")),
                        _ => Err(EngineError::AmbiguousColumn(parts.join("."))),
                    };
                }
                // Not a source id; try `schema.table` within every source.
                let matches: Vec<Arc<TableMeta>> = self
                    .sources
                    .keys()
                    .filter_map(|src| self.lookup(src, source, table))
                    .collect();
                match matches.len() {
                    0 => Err(EngineError::UnknownSchema(source.clone())),
                    1 => Ok(matches.into_iter().next().expect("len checked")),
                    _ => Err(EngineError::AmbiguousColumn(parts.join("."))),
                }
            }
            1 => {
                let table = &parts[0];
                let matches: Vec<Arc<TableMeta>> = self
                    .tables
                    .values()
                    .filter(|t| t.name.eq_ignore_ascii_case(table))
                    .cloned()
                    .collect();
                match matches.len() {
                    0 => Err(EngineError::UnknownTable(table.clone())),
                    1 => Ok(matches.into_iter().next().expect("len checked")),
                    _ => Err(EngineError::AmbiguousColumn(table.clone())),
                }
            }
            _ => Err(EngineError::Validation {
                node: "table reference".to_string(),
                column: None,
                reason: format!("unsupported name shape '{}'", parts.join(".")),
            }),
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

#[derive(Default)]
pub struct CatalogBuilder {
    sources: BTreeMap<String, SourceMeta>,
    tables: Vec<TableMeta>,
}

impl CatalogBuilder {
    pub fn source(mut self, id: impl Into<String>, source_type: SourceType) -> Self {
        let id = id.into();
        self.sources.insert(
            id.clone(),
            SourceMeta {
                id,
                source_type,
            },
        );
        self
    }

    pub fn table(mut self, table: TableMeta) -> Self {
        self.tables.push(table);
        self
    }

    pub fn build(self) -> Catalog {
        let mut catalog = Catalog {
            sources: self.sources,
            ..Default::default()
        };
        for table in self.tables {
            let key = table.qualified_name().to_lowercase();
            catalog
                .schemas
                .entry(table.source.clone())
                .or_default()
                .entry(table.schema.clone())
                .or_default()
                .push(table.name.clone());
            catalog.tables.insert(key, Arc::new(table));
        }
        for schemas in catalog.schemas.values_mut() {
            for names in schemas.values_mut() {
                names.sort();
            }
        }
        catalog
    }
}

/// Concurrently readable catalog handle with atomic snapshot replacement.
#[derive(Clone, Default)]
pub struct SharedCatalog {
    inner: Arc<RwLock<Arc<Catalog>>>,
}

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        SharedCatalog {
            inner: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// Current snapshot; cheap to call per query.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the snapshot atomically. In-flight readers keep the old one.
    pub fn replace(&self, catalog: Catalog) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(catalog);
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// Two-source catalog matching the federated join scenario: a MySQL
    /// `orders` table and an Elasticsearch `access_logs` index.
    pub fn federated_catalog() -> Catalog {
        Catalog::builder()
            .source("mysql_db", SourceType::MySql)
            .source("es_logs", SourceType::ElasticSearch)
            .table(TableMeta {
                source: "mysql_db".into(),
                source_type: SourceType::MySql,
                schema: "shop".into(),
                name: "orders".into(),
                kind: TableKind::Base,
                columns: vec![
                    ColumnMeta {
                        name: "id".into(),
                        ordinal: 0,
                        data_type: LogicalType::Int32,
                        nullable: false,
                        precision: None,
                        scale: None,
                    },
                    ColumnMeta {
                        name: "customer".into(),
                        ordinal: 1,
                        data_type: LogicalType::String,
                        nullable: true,
                        precision: None,
                        scale: None,
                    },
                    ColumnMeta {
                        name: "status".into(),
                        ordinal: 2,
                        data_type: LogicalType::String,
                        nullable: true,
                        precision: None,
                        scale: None,
                    },
                ],
                indexes: vec![IndexMeta {
                    name: "pk_orders".into(),
                    columns: vec!["id".into()],
                    unique: true,
                }],
                statistics: TableStatistics::gathered(50_000),
            })
            .table(TableMeta {
                source: "es_logs".into(),
                source_type: SourceType::ElasticSearch,
                schema: "default".into(),
                name: "access_logs".into(),
                kind: TableKind::ExternalIndex,
                columns: vec![
                    ColumnMeta {
                        name: "order_id".into(),
                        ordinal: 0,
                        data_type: LogicalType::Int64,
                        nullable: true,
                        precision: None,
                        scale: None,
                    },
                    ColumnMeta {
                        name: "access_time".into(),
                        ordinal: 1,
                        data_type: LogicalType::Timestamp,
                        nullable: true,
                        precision: None,
                        scale: None,
                    },
                ],
                indexes: Vec::new(),
                statistics: TableStatistics::gathered(8_000),
            })
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::federated_catalog;
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec!["mysql_db", "shop", "orders"], "mysql_db.shop.orders")]
    #[case(vec!["mysql_db", "orders"], "mysql_db.shop.orders")]
    #[case(vec!["orders"], "mysql_db.shop.orders")]
    #[case(vec!["es_logs", "access_logs"], "es_logs.default.access_logs")]
    fn name_resolution(#[case] parts: Vec<&str>, #[case] expected: &str) {
        let catalog = federated_catalog();
        let parts: Vec<String> = parts.into_iter().map(String::from).collect();
        let table = catalog.resolve_table(&parts).unwrap();
        assert_eq!(table.qualified_name(), expected);
    }

    #[test]
    fn unknown_names_fail_with_their_kind() {
        let catalog = federated_catalog();
        assert!(matches!(
            catalog.resolve_table(&["nope".into(), "x".into(), "y".into()]),
            Err(EngineError::UnknownSchema(_))
        ));
        assert!(matches!(
            catalog.resolve_table(&["mysql_db".into(), "missing".into()]),
            Err(EngineError::UnknownTable(_))
        ));
    }

    #[test]
    fn table_names_resolve_case_insensitively() {
        let catalog = federated_catalog();
        let table = catalog
            .resolve_table(&["mysql_db".into(), "ORDERS".into()])
            .unwrap();
        assert_eq!(table.name, "orders");
    }

    #[test]
    fn schema_listing_is_ordered() {
        let catalog = federated_catalog();
        assert_eq!(
            catalog.schema_names(),
            vec!["es_logs.default".to_string(), "mysql_db.shop".to_string()]
        );
        assert_eq!(
            catalog.table_names("mysql_db", None).unwrap(),
            vec!["orders".to_string()]
        );
    }

    #[test]
    fn assumed_statistics_defaults() {
        let stats = TableStatistics::assumed();
        assert!(stats.assumed);
        assert_eq!(stats.row_count, DEFAULT_ROW_COUNT);
        assert_eq!(stats.distinct_count("anything"), DEFAULT_ROW_COUNT / 10);
        assert_eq!(stats.default_selectivity, DEFAULT_SELECTIVITY);
    }

    #[test]
    fn snapshot_swap_is_atomic_for_readers() {
        let shared = SharedCatalog::new(federated_catalog());
        let before = shared.snapshot();
        shared.replace(Catalog::builder().source("only", SourceType::MySql).build());
        let after = shared.snapshot();
        // The old snapshot stays intact for readers that captured it.
        assert_eq!(before.table_count(), 2);
        assert_eq!(after.table_count(), 0);
        assert!(after.source("only").is_some());
    }

    #[test]
    fn index_lookup_by_leading_column() {
        let catalog = federated_catalog();
        let orders = catalog
            .resolve_table(&["mysql_db".into(), "orders".into()])
            .unwrap();
        assert!(orders.has_index_on("id"));
        assert!(!orders.has_index_on("status"));
    }
}
