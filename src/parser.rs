//! Permissive SQL front end.
//!
//! Input is parsed under the declared dialect's grammar with a generic
//! fallback pass, so the accepted surface is the union of the dialect
//! extensions (backticks, brackets, `TOP n`, `FETCH FIRST`, `::` casts and
//! the rest). A failed parse reports a one-based position, a caret snippet
//! of the offending line and, when one is close enough, a keyword
//! suggestion. A partial tree is never returned.

use crate::dialect::Dialect;
use crate::error::{EngineError, EngineResult};
use regex::Regex;
use sqlparser::ast::{Query, Statement};
use sqlparser::dialect::{GenericDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use std::sync::OnceLock;
use tracing::debug;

/// A classified, parsed statement ready for binding.
#[derive(Debug, Clone)]
pub enum ParsedStatement {
    Query(Box<Query>),
    Explain(Box<Query>),
    ShowSchemas,
    ShowTables {
        source: Option<String>,
        /// SQL-92 LIKE pattern with `%` and `_` wildcards.
        pattern: Option<String>,
    },
    /// INSERT / UPDATE / DELETE, kept whole for single-source passthrough.
    Dml(Box<Statement>),
}

/// Parse one statement.
pub fn parse(sql: &str, source_dialect: Option<Dialect>) -> EngineResult<ParsedStatement> {
    let trimmed = sql.trim().trim_end_matches(';');
    if trimmed.is_empty() {
        return Err(syntax_error(sql, "empty statement".to_string(), 1, 1));
    }

    // SHOW commands are an engine extension outside the SQL grammar.
    if let Some(show) = parse_show(trimmed) {
        return Ok(show);
    }

    let statement = parse_with_fallback(sql, source_dialect)?;
    classify(statement, sql)
}

/// Parse a script into its individual statements.
pub fn parse_script(
    sql: &str,
    source_dialect: Option<Dialect>,
) -> EngineResult<Vec<ParsedStatement>> {
    split_statements(sql)
        .into_iter()
        .map(|stmt| parse(&stmt, source_dialect))
        .collect()
}

fn classify(statement: Statement, sql: &str) -> EngineResult<ParsedStatement> {
    match statement {
        Statement::Query(query) => Ok(ParsedStatement::Query(query)),
        Statement::Explain { statement, .. } => match *statement {
            Statement::Query(query) => Ok(ParsedStatement::Explain(query)),
            other => Err(EngineError::Unsupported(format!(
                "EXPLAIN of {} statements",
                statement_name(&other)
            ))),
        },
        stmt @ (Statement::Insert(_) | Statement::Update { .. } | Statement::Delete(_)) => {
            Ok(ParsedStatement::Dml(Box::new(stmt)))
        }
        other => {
            debug!(statement = statement_name(&other), "rejecting statement kind");
            let _ = sql;
            Err(EngineError::Unsupported(format!(
                "{} statements",
                statement_name(&other)
            )))
        }
    }
}

fn statement_name(statement: &Statement) -> &'static str {
    match statement {
        Statement::Query(_) => "SELECT",
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Drop { .. } => "DROP",
        Statement::AlterTable { .. } => "ALTER TABLE",
        Statement::StartTransaction { .. } | Statement::Commit { .. } | Statement::Rollback { .. } => {
            "transaction control"
        }
        _ => "this kind of",
    }
}

/// Parse under the declared grammar, then the generic grammar, then (when
/// the text smells of `::` casts) the PostgreSQL grammar. The error of the
/// declared pass wins when every pass fails.
fn parse_with_fallback(sql: &str, source_dialect: Option<Dialect>) -> EngineResult<Statement> {
    let primary: Box<dyn sqlparser::dialect::Dialect> = match source_dialect {
        Some(d) => d.parser_dialect(),
        None => Box::new(GenericDialect {}),
    };

    let primary_err = match parse_single(primary.as_ref(), sql) {
        Ok(statement) => return Ok(statement),
        Err(err) => err,
    };

    if source_dialect.is_some() {
        if let Ok(statement) = parse_single(&GenericDialect {}, sql) {
            return Ok(statement);
        }
    }
    if sql.contains("::") || sql.contains("->") {
        if let Ok(statement) = parse_single(&PostgreSqlDialect {}, sql) {
            return Ok(statement);
        }
    }

    Err(convert_parser_error(sql, primary_err))
}

fn parse_single(
    dialect: &dyn sqlparser::dialect::Dialect,
    sql: &str,
) -> Result<Statement, sqlparser::parser::ParserError> {
    let mut statements = Parser::parse_sql(dialect, sql)?;
    match statements.len() {
        1 => Ok(statements.remove(0)),
        n => Err(sqlparser::parser::ParserError::ParserError(format!(
            "expected one statement, found {n} at Line: 1, Column: 1"
        ))),
    }
}

/// Recover position information from the sqlparser message format
/// ("... at Line: X, Column: Y") and build the reporting invariant:
/// one-based position, caret snippet, optional keyword suggestion.
fn convert_parser_error(sql: &str, err: sqlparser::parser::ParserError) -> EngineError {
    static POSITION: OnceLock<Regex> = OnceLock::new();
    let position = POSITION.get_or_init(|| {
        Regex::new(r"Line:\s*(\d+)\s*,\s*Column:\s*(\d+)").expect("valid pattern")
    });

    let message = err.to_string();
    let (line, column) = position
        .captures(&message)
        .and_then(|caps| {
            let line: usize = caps.get(1)?.as_str().parse().ok()?;
            let column: usize = caps.get(2)?.as_str().parse().ok()?;
            Some((line, column))
        })
        .unwrap_or((1, 1));

    syntax_error(sql, message, line, column)
}

fn syntax_error(sql: &str, message: String, line: usize, column: usize) -> EngineError {
    let source_line = sql.lines().nth(line.saturating_sub(1)).unwrap_or("");
    let caret_offset = column.saturating_sub(1).min(source_line.len());
    let snippet = format!("{source_line}\n{}^", " ".repeat(caret_offset));

    let suggestion = offending_token(&message).and_then(nearest_keyword);

    EngineError::Syntax {
        line,
        column,
        snippet,
        message: clean_message(&message),
        suggestion,
    }
}

fn clean_message(message: &str) -> String {
    // Drop the redundant position suffix; the structured fields carry it.
    match message.find(" at Line:") {
        Some(pos) => message[..pos].to_string(),
        None => message.to_string(),
    }
}

/// Pull the token the parser choked on out of "..., found: <token>".
fn offending_token(message: &str) -> Option<String> {
    let idx = message.rfind("found: ")?;
    let token = message[idx + "found: ".len()..]
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "HAVING", "ORDER", "BY", "LIMIT", "OFFSET", "JOIN",
    "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "ON", "AS", "AND", "OR", "NOT", "IN",
    "EXISTS", "BETWEEN", "LIKE", "IS", "NULL", "UNION", "ALL", "DISTINCT", "INSERT", "INTO",
    "VALUES", "UPDATE", "SET", "DELETE", "CASE", "WHEN", "THEN", "ELSE", "END", "CAST", "TOP",
    "FETCH", "FIRST", "ROWS", "ONLY", "ASC", "DESC", "SHOW", "TABLES", "SCHEMAS", "EXPLAIN",
];

/// Nearest legal keyword by edit distance, within a distance of 2.
fn nearest_keyword(token: String) -> Option<String> {
    let upper = token.to_uppercase();
    if KEYWORDS.contains(&upper.as_str()) {
        return None;
    }
    KEYWORDS
        .iter()
        .map(|kw| (edit_distance(&upper, kw), *kw))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, kw)| kw.to_string())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// SHOW SCHEMAS / SHOW TABLES [FROM <source>] [LIKE '<pattern>'].
fn parse_show(sql: &str) -> Option<ParsedStatement> {
    static SHOW_SCHEMAS: OnceLock<Regex> = OnceLock::new();
    static SHOW_TABLES: OnceLock<Regex> = OnceLock::new();
    let show_schemas = SHOW_SCHEMAS
        .get_or_init(|| Regex::new(r"(?i)^\s*SHOW\s+SCHEMAS\s*$").expect("valid pattern"));
    let show_tables = SHOW_TABLES.get_or_init(|| {
        Regex::new(r"(?i)^\s*SHOW\s+TABLES(?:\s+FROM\s+([A-Za-z_][A-Za-z0-9_]*))?(?:\s+LIKE\s+'([^']*)')?\s*$")
            .expect("valid pattern")
    });

    if show_schemas.is_match(sql) {
        return Some(ParsedStatement::ShowSchemas);
    }
    if let Some(caps) = show_tables.captures(sql) {
        return Some(ParsedStatement::ShowTables {
            source: caps.get(1).map(|m| m.as_str().to_string()),
            pattern: caps.get(2).map(|m| m.as_str().to_string()),
        });
    }
    None
}

/// Split a script on top-level semicolons, honouring quotes and comments.
pub fn split_statements(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_backtick = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double && !in_backtick => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single && !in_backtick => {
                in_double = !in_double;
                current.push(c);
            }
            '`' if !in_single && !in_double => {
                in_backtick = !in_backtick;
                current.push(c);
            }
            '-' if !in_single && !in_double && !in_backtick && chars.peek() == Some(&'-') => {
                // Line comment: skip to end of line.
                for c in chars.by_ref() {
                    if c == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            ';' if !in_single && !in_double && !in_backtick => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("SELECT * FROM users", None)]
    #[case("SELECT `id` FROM `users` LIMIT 10 OFFSET 5", Some(Dialect::MySql))]
    #[case("SELECT \"id\" FROM \"users\" FETCH FIRST 3 ROWS ONLY", Some(Dialect::PostgreSql))]
    #[case("SELECT TOP 5 id FROM [users]", Some(Dialect::SqlServer))]
    #[case("SELECT id FROM users WHERE x::BIGINT > 3", Some(Dialect::PostgreSql))]
    fn dialect_extensions_accepted(#[case] sql: &str, #[case] dialect: Option<Dialect>) {
        let parsed = parse(sql, dialect).unwrap();
        assert!(matches!(parsed, ParsedStatement::Query(_)));
    }

    #[test]
    fn postgres_cast_falls_back_without_declared_dialect() {
        let parsed = parse("SELECT id::BIGINT FROM users", None).unwrap();
        assert!(matches!(parsed, ParsedStatement::Query(_)));
    }

    #[test]
    fn malformed_input_reports_position_and_snippet() {
        // With a wildcard select list, the misspelled keyword itself is the
        // offending token.
        let err = parse("SELECT * FRM users", None).unwrap_err();
        match err {
            EngineError::Syntax {
                line,
                column,
                snippet,
                suggestion,
                ..
            } => {
                assert_eq!(line, 1);
                assert!(column > 1);
                assert!(snippet.contains("SELECT * FRM users"));
                assert!(snippet.contains('^'));
                assert_eq!(suggestion.as_deref(), Some("FROM"));
            }
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn empty_statement_is_a_syntax_error() {
        assert!(matches!(
            parse("   ;", None),
            Err(EngineError::Syntax { .. })
        ));
    }

    #[rstest]
    #[case("SHOW SCHEMAS", None, None, true)]
    #[case("show tables", None, None, false)]
    #[case("SHOW TABLES FROM mysql_db", Some("mysql_db"), None, false)]
    #[case("SHOW TABLES FROM es_logs LIKE 'acc%'", Some("es_logs"), Some("acc%"), false)]
    fn show_statements(
        #[case] sql: &str,
        #[case] source: Option<&str>,
        #[case] pattern: Option<&str>,
        #[case] schemas: bool,
    ) {
        match parse(sql, None).unwrap() {
            ParsedStatement::ShowSchemas => assert!(schemas),
            ParsedStatement::ShowTables {
                source: s,
                pattern: p,
            } => {
                assert!(!schemas);
                assert_eq!(s.as_deref(), source);
                assert_eq!(p.as_deref(), pattern);
            }
            other => panic!("unexpected parse result {other:?}"),
        }
    }

    #[test]
    fn ddl_is_unsupported() {
        let err = parse("CREATE TABLE t (id INT)", None).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    #[test]
    fn dml_is_classified() {
        let parsed = parse("INSERT INTO t (id) VALUES (1)", None).unwrap();
        assert!(matches!(parsed, ParsedStatement::Dml(_)));
        let parsed = parse("DELETE FROM t WHERE id = 1", None).unwrap();
        assert!(matches!(parsed, ParsedStatement::Dml(_)));
    }

    #[test]
    fn explain_wraps_query() {
        let parsed = parse("EXPLAIN SELECT * FROM users", None).unwrap();
        assert!(matches!(parsed, ParsedStatement::Explain(_)));
    }

    #[test]
    fn script_splitting_respects_quotes_and_comments() {
        let script = r#"
            SELECT 'a;b' FROM t; -- trailing; comment
            SELECT 2;
        "#;
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("'a;b'"));
        assert_eq!(statements[1], "SELECT 2");
    }

    #[test]
    fn multiple_statements_in_one_parse_fail() {
        assert!(parse("SELECT 1; SELECT 2", None).is_err());
    }

    #[rstest]
    #[case("FRM", Some("FROM"))]
    #[case("SELEC", Some("SELECT"))]
    #[case("WHRE", Some("WHERE"))]
    #[case("zzzzzz", None)]
    fn keyword_suggestions(#[case] token: &str, #[case] expected: Option<&str>) {
        assert_eq!(
            nearest_keyword(token.to_string()).as_deref(),
            expected
        );
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("FRM", "FROM"), 1);
        assert_eq!(edit_distance("SELECT", "SELECT"), 0);
        assert_eq!(edit_distance("", "ON"), 2);
    }
}
