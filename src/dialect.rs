//! SQL dialect profiles.
//!
//! Each supported dialect differs in identifier quoting, pagination form,
//! null-coalesce and current-timestamp function names, and cast syntax.
//! [`DialectConverter`] captures exactly those five axes; the unparser is
//! dialect-blind apart from what it asks the converter for.

use crate::types::LogicalType;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::{
    Dialect as SqlparserDialect, GenericDialect, HiveDialect, MsSqlDialect, MySqlDialect,
    PostgreSqlDialect,
};
use strum::{Display, EnumIter, EnumString};

/// Supported SQL dialects.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    ValueEnum,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[strum(serialize = "mysql")]
    MySql,
    #[strum(serialize = "postgresql", serialize = "postgres")]
    PostgreSql,
    #[strum(serialize = "oracle")]
    Oracle,
    #[strum(serialize = "sqlserver", serialize = "mssql")]
    SqlServer,
    #[strum(serialize = "hive")]
    Hive,
}

impl Dialect {
    /// The sqlparser grammar used when this dialect is the declared source.
    ///
    /// Oracle has no dedicated sqlparser dialect; the generic grammar
    /// accepts its quoting and ROWNUM forms.
    pub fn parser_dialect(&self) -> Box<dyn SqlparserDialect> {
        match self {
            Dialect::MySql => Box::new(MySqlDialect {}),
            Dialect::PostgreSql => Box::new(PostgreSqlDialect {}),
            Dialect::Oracle => Box::new(GenericDialect {}),
            Dialect::SqlServer => Box::new(MsSqlDialect {}),
            Dialect::Hive => Box::new(HiveDialect {}),
        }
    }

    pub fn converter(&self) -> &'static dyn DialectConverter {
        match self {
            Dialect::MySql => &MySqlConverter,
            Dialect::PostgreSql => &PostgreSqlConverter,
            Dialect::Oracle => &OracleConverter,
            Dialect::SqlServer => &SqlServerConverter,
            Dialect::Hive => &HiveConverter,
        }
    }
}

/// How a dialect renders LIMIT/OFFSET semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationForm {
    /// Clause appended after ORDER BY, e.g. `LIMIT 10 OFFSET 5`.
    Trailing(String),
    /// Injected directly after the SELECT keyword, e.g. `TOP 10`.
    SelectTop(String),
    /// The whole query is wrapped in ROWNUM-filtering subqueries.
    RownumWrapper { limit: Option<u64>, offset: u64 },
}

/// The five dialect-specific rendering decisions.
pub trait DialectConverter: Sync {
    /// Quote an identifier, escaping embedded quote characters.
    fn quote_identifier(&self, ident: &str) -> String;

    /// Render the pagination form for a limit and optional offset.
    fn pagination(&self, limit: Option<u64>, offset: Option<u64>) -> Option<PaginationForm>;

    /// Function name used for two-argument null-coalescing.
    fn coalesce_function(&self) -> &'static str;

    /// Expression yielding the current timestamp.
    fn now_function(&self) -> &'static str;

    /// Render a cast of an already-rendered expression.
    fn unparse_cast(&self, expr: &str, target: LogicalType) -> String;

    /// Dialect type name used inside casts.
    fn type_name(&self, ty: LogicalType) -> &'static str {
        match ty {
            LogicalType::String => "VARCHAR",
            LogicalType::Boolean => "BOOLEAN",
            LogicalType::Int32 => "INTEGER",
            LogicalType::Int64 => "BIGINT",
            LogicalType::Float64 => "DOUBLE",
            LogicalType::Decimal => "DECIMAL",
            LogicalType::Date => "DATE",
            LogicalType::Timestamp => "TIMESTAMP",
            LogicalType::Binary => "VARBINARY",
            LogicalType::Array => "ARRAY",
            LogicalType::Json => "JSON",
        }
    }
}

fn quote_with(ident: &str, open: char, close: char) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push(open);
    for c in ident.chars() {
        out.push(c);
        if c == close {
            out.push(close);
        }
    }
    out.push(close);
    out
}

pub struct MySqlConverter;

impl DialectConverter for MySqlConverter {
    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '`', '`')
    }

    fn pagination(&self, limit: Option<u64>, offset: Option<u64>) -> Option<PaginationForm> {
        match (limit, offset) {
            (None, None) => None,
            (Some(n), None) => Some(PaginationForm::Trailing(format!("LIMIT {n}"))),
            (Some(n), Some(m)) => Some(PaginationForm::Trailing(format!("LIMIT {n} OFFSET {m}"))),
            // MySQL cannot offset without a limit; use its documented huge-limit idiom.
            (None, Some(m)) => Some(PaginationForm::Trailing(format!(
                "LIMIT 18446744073709551615 OFFSET {m}"
            ))),
        }
    }

    fn coalesce_function(&self) -> &'static str {
        "IFNULL"
    }

    fn now_function(&self) -> &'static str {
        "NOW()"
    }

    fn unparse_cast(&self, expr: &str, target: LogicalType) -> String {
        // MySQL CAST targets use SIGNED/CHAR in place of the standard names.
        let name = match target {
            LogicalType::Int32 | LogicalType::Int64 => "SIGNED",
            LogicalType::String => "CHAR",
            other => self.type_name(other),
        };
        format!("CAST({expr} AS {name})")
    }
}

pub struct PostgreSqlConverter;

impl DialectConverter for PostgreSqlConverter {
    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '"', '"')
    }

    fn pagination(&self, limit: Option<u64>, offset: Option<u64>) -> Option<PaginationForm> {
        match (limit, offset) {
            (None, None) => None,
            (Some(n), None) => Some(PaginationForm::Trailing(format!("LIMIT {n}"))),
            (Some(n), Some(m)) => Some(PaginationForm::Trailing(format!("LIMIT {n} OFFSET {m}"))),
            (None, Some(m)) => Some(PaginationForm::Trailing(format!("OFFSET {m}"))),
        }
    }

    fn coalesce_function(&self) -> &'static str {
        "COALESCE"
    }

    fn now_function(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    fn unparse_cast(&self, expr: &str, target: LogicalType) -> String {
        format!("{expr}::{}", self.type_name(target))
    }

    fn type_name(&self, ty: LogicalType) -> &'static str {
        match ty {
            LogicalType::Float64 => "DOUBLE PRECISION",
            LogicalType::Binary => "BYTEA",
            LogicalType::Json => "JSONB",
            other => MySqlConverter.type_name(other),
        }
    }
}

pub struct OracleConverter;

impl DialectConverter for OracleConverter {
    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '"', '"')
    }

    fn pagination(&self, limit: Option<u64>, offset: Option<u64>) -> Option<PaginationForm> {
        if limit.is_none() && offset.is_none() {
            return None;
        }
        Some(PaginationForm::RownumWrapper {
            limit,
            offset: offset.unwrap_or(0),
        })
    }

    fn coalesce_function(&self) -> &'static str {
        "NVL"
    }

    fn now_function(&self) -> &'static str {
        "SYSDATE"
    }

    fn unparse_cast(&self, expr: &str, target: LogicalType) -> String {
        format!("CAST({expr} AS {})", self.type_name(target))
    }

    fn type_name(&self, ty: LogicalType) -> &'static str {
        match ty {
            LogicalType::String => "VARCHAR2(4000)",
            LogicalType::Int32 | LogicalType::Int64 => "NUMBER",
            LogicalType::Float64 => "BINARY_DOUBLE",
            LogicalType::Decimal => "NUMBER",
            LogicalType::Binary => "RAW(2000)",
            other => MySqlConverter.type_name(other),
        }
    }
}

pub struct SqlServerConverter;

impl DialectConverter for SqlServerConverter {
    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '[', ']')
    }

    fn pagination(&self, limit: Option<u64>, offset: Option<u64>) -> Option<PaginationForm> {
        match (limit, offset) {
            (None, None) => None,
            (Some(n), None) => Some(PaginationForm::SelectTop(format!("TOP {n}"))),
            (limit, Some(m)) => {
                let mut clause = format!("OFFSET {m} ROWS");
                if let Some(n) = limit {
                    clause.push_str(&format!(" FETCH NEXT {n} ROWS ONLY"));
                }
                Some(PaginationForm::Trailing(clause))
            }
        }
    }

    fn coalesce_function(&self) -> &'static str {
        "ISNULL"
    }

    fn now_function(&self) -> &'static str {
        "GETDATE()"
    }

    fn unparse_cast(&self, expr: &str, target: LogicalType) -> String {
        format!("CAST({expr} AS {})", self.type_name(target))
    }

    fn type_name(&self, ty: LogicalType) -> &'static str {
        match ty {
            LogicalType::String => "NVARCHAR(MAX)",
            LogicalType::Int32 => "INT",
            LogicalType::Float64 => "FLOAT",
            LogicalType::Timestamp => "DATETIME2",
            LogicalType::Boolean => "BIT",
            other => MySqlConverter.type_name(other),
        }
    }
}

pub struct HiveConverter;

impl DialectConverter for HiveConverter {
    fn quote_identifier(&self, ident: &str) -> String {
        quote_with(ident, '`', '`')
    }

    fn pagination(&self, limit: Option<u64>, offset: Option<u64>) -> Option<PaginationForm> {
        // Hive supports only a bare LIMIT; an offset cannot be expressed and
        // stays with the engine as residual work.
        let n = limit?;
        let _ = offset;
        Some(PaginationForm::Trailing(format!("LIMIT {n}")))
    }

    fn coalesce_function(&self) -> &'static str {
        "COALESCE"
    }

    fn now_function(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    fn unparse_cast(&self, expr: &str, target: LogicalType) -> String {
        format!("CAST({expr} AS {})", self.type_name(target))
    }

    fn type_name(&self, ty: LogicalType) -> &'static str {
        match ty {
            LogicalType::String => "STRING",
            LogicalType::Int32 => "INT",
            other => MySqlConverter.type_name(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Dialect::MySql, "orders", "`orders`")]
    #[case(Dialect::PostgreSql, "orders", "\"orders\"")]
    #[case(Dialect::Oracle, "orders", "\"orders\"")]
    #[case(Dialect::SqlServer, "orders", "[orders]")]
    #[case(Dialect::Hive, "orders", "`orders`")]
    fn identifier_quoting(#[case] dialect: Dialect, #[case] ident: &str, #[case] expected: &str) {
        assert_eq!(dialect.converter().quote_identifier(ident), expected);
    }

    #[test]
    fn embedded_quotes_escaped() {
        assert_eq!(MySqlConverter.quote_identifier("od`d"), "`od``d`");
        assert_eq!(PostgreSqlConverter.quote_identifier("od\"d"), "\"od\"\"d\"");
        assert_eq!(SqlServerConverter.quote_identifier("od]d"), "[od]]d]");
    }

    #[rstest]
    #[case(Dialect::MySql, "IFNULL", "NOW()")]
    #[case(Dialect::PostgreSql, "COALESCE", "CURRENT_TIMESTAMP")]
    #[case(Dialect::Oracle, "NVL", "SYSDATE")]
    #[case(Dialect::SqlServer, "ISNULL", "GETDATE()")]
    #[case(Dialect::Hive, "COALESCE", "CURRENT_TIMESTAMP")]
    fn function_aliases(
        #[case] dialect: Dialect,
        #[case] coalesce: &str,
        #[case] now: &str,
    ) {
        assert_eq!(dialect.converter().coalesce_function(), coalesce);
        assert_eq!(dialect.converter().now_function(), now);
    }

    #[test]
    fn mysql_pagination() {
        let form = MySqlConverter.pagination(Some(10), Some(5)).unwrap();
        assert_eq!(form, PaginationForm::Trailing("LIMIT 10 OFFSET 5".into()));
    }

    #[test]
    fn sqlserver_pagination_forms() {
        assert_eq!(
            SqlServerConverter.pagination(Some(10), None).unwrap(),
            PaginationForm::SelectTop("TOP 10".into())
        );
        assert_eq!(
            SqlServerConverter.pagination(Some(10), Some(5)).unwrap(),
            PaginationForm::Trailing("OFFSET 5 ROWS FETCH NEXT 10 ROWS ONLY".into())
        );
    }

    #[test]
    fn oracle_pagination_wraps() {
        assert_eq!(
            OracleConverter.pagination(Some(10), Some(5)).unwrap(),
            PaginationForm::RownumWrapper {
                limit: Some(10),
                offset: 5
            }
        );
    }

    #[test]
    fn hive_pagination_drops_offset() {
        assert_eq!(
            HiveConverter.pagination(Some(10), Some(5)).unwrap(),
            PaginationForm::Trailing("LIMIT 10".into())
        );
        assert_eq!(HiveConverter.pagination(None, Some(5)), None);
    }

    #[rstest]
    #[case(Dialect::PostgreSql, "x::INTEGER")]
    #[case(Dialect::MySql, "CAST(x AS SIGNED)")]
    #[case(Dialect::Hive, "CAST(x AS INT)")]
    fn cast_syntax(#[case] dialect: Dialect, #[case] expected: &str) {
        assert_eq!(
            dialect.converter().unparse_cast("x", LogicalType::Int32),
            expected
        );
    }

    #[rstest]
    #[case("mysql", Dialect::MySql)]
    #[case("POSTGRES", Dialect::PostgreSql)]
    #[case("postgresql", Dialect::PostgreSql)]
    #[case("mssql", Dialect::SqlServer)]
    fn dialect_names_parse(#[case] name: &str, #[case] expected: Dialect) {
        assert_eq!(name.parse::<Dialect>().unwrap(), expected);
    }
}
