//! Logical type system and runtime values.
//!
//! The engine's closed type set is deliberately small: every connector maps
//! its native types into these, or discovery fails with `TypeNotSupported`.

use crate::error::{EngineError, EngineResult};
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use strum::{Display, EnumString};

/// Closed set of logical column types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    String,
    Boolean,
    Int32,
    Int64,
    Float64,
    Decimal,
    Date,
    Timestamp,
    Binary,
    Array,
    Json,
}

impl LogicalType {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            LogicalType::Int32 | LogicalType::Int64 | LogicalType::Float64 | LogicalType::Decimal
        )
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, LogicalType::Date | LogicalType::Timestamp)
    }

    /// Implicit coercion target for a comparison between two types.
    ///
    /// String vs numeric casts the string side to the numeric type; date vs
    /// timestamp widens to timestamp; mixed integer widths widen to the
    /// larger operand. Lossy directions (decimal to int32 and the like) are
    /// not implicit and require an explicit cast.
    pub fn comparison_type(self, other: LogicalType) -> Option<LogicalType> {
        use LogicalType::*;
        if self == other {
            return Some(self);
        }
        match (self, other) {
            (String, t) | (t, String) if t.is_numeric() => Some(t),
            (Date, Timestamp) | (Timestamp, Date) => Some(Timestamp),
            (Int32, Int64) | (Int64, Int32) => Some(Int64),
            (Int32, Float64) | (Float64, Int32) => Some(Float64),
            (Int64, Float64) | (Float64, Int64) => Some(Float64),
            (Int32, Decimal) | (Decimal, Int32) => Some(Decimal),
            (Int64, Decimal) | (Decimal, Int64) => Some(Decimal),
            (Float64, Decimal) | (Decimal, Float64) => Some(Float64),
            _ => None,
        }
    }

    /// Whether an implicit cast from `self` to `target` could lose data.
    pub fn lossy_cast(self, target: LogicalType) -> bool {
        use LogicalType::*;
        matches!(
            (self, target),
            (Int64, Int32)
                | (Float64, Int32)
                | (Float64, Int64)
                | (Decimal, Int32)
                | (Decimal, Int64)
                | (Timestamp, Date)
        )
    }
}

/// Runtime value. `Null` is typeless; everything else matches one
/// [`LogicalType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Decimal(Decimal),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn logical_type(&self) -> Option<LogicalType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(LogicalType::String),
            Value::Boolean(_) => Some(LogicalType::Boolean),
            Value::Int32(_) => Some(LogicalType::Int32),
            Value::Int64(_) => Some(LogicalType::Int64),
            Value::Float64(_) => Some(LogicalType::Float64),
            Value::Decimal(_) => Some(LogicalType::Decimal),
            Value::Date(_) => Some(LogicalType::Date),
            Value::Timestamp(_) => Some(LogicalType::Timestamp),
            Value::Binary(_) => Some(LogicalType::Binary),
            Value::Array(_) => Some(LogicalType::Array),
            Value::Json(_) => Some(LogicalType::Json),
        }
    }

    /// SQL truthiness: NULL and false are both "not true".
    pub fn is_true(&self) -> bool {
        matches!(self, Value::Boolean(true))
    }

    /// Cast to a target logical type, failing on unrepresentable values.
    pub fn cast(&self, target: LogicalType) -> EngineResult<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let fail = |v: &Value| EngineError::Validation {
            node: "cast".to_string(),
            column: None,
            reason: format!("cannot cast {v} to {target}"),
        };
        match (self, target) {
            (v, t) if v.logical_type() == Some(t) => Ok(v.clone()),
            (Value::String(s), LogicalType::Int32) => {
                s.trim().parse::<i32>().map(Value::Int32).map_err(|_| fail(self))
            }
            (Value::String(s), LogicalType::Int64) => {
                s.trim().parse::<i64>().map(Value::Int64).map_err(|_| fail(self))
            }
            (Value::String(s), LogicalType::Float64) => {
                s.trim().parse::<f64>().map(Value::Float64).map_err(|_| fail(self))
            }
            (Value::String(s), LogicalType::Decimal) => {
                s.trim().parse::<Decimal>().map(Value::Decimal).map_err(|_| fail(self))
            }
            (Value::String(s), LogicalType::Boolean) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "0" => Ok(Value::Boolean(false)),
                _ => Err(fail(self)),
            },
            (Value::String(s), LogicalType::Date) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|_| fail(self)),
            (Value::String(s), LogicalType::Timestamp) => {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                    .or_else(|_| {
                        NaiveDate::parse_from_str(s, "%Y-%m-%d")
                            .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
                    })
                    .map(Value::Timestamp)
                    .map_err(|_| fail(self))
            }
            (v, LogicalType::String) => Ok(Value::String(v.to_string())),
            (Value::Int32(i), LogicalType::Int64) => Ok(Value::Int64(*i as i64)),
            (Value::Int32(i), LogicalType::Float64) => Ok(Value::Float64(*i as f64)),
            (Value::Int32(i), LogicalType::Decimal) => Ok(Value::Decimal(Decimal::from(*i))),
            (Value::Int64(i), LogicalType::Int32) => i32::try_from(*i)
                .map(Value::Int32)
                .map_err(|_| fail(self)),
            (Value::Int64(i), LogicalType::Float64) => Ok(Value::Float64(*i as f64)),
            (Value::Int64(i), LogicalType::Decimal) => Ok(Value::Decimal(Decimal::from(*i))),
            (Value::Float64(f), LogicalType::Int32) => {
                if f.fract() == 0.0 && *f >= i32::MIN as f64 && *f <= i32::MAX as f64 {
                    Ok(Value::Int32(*f as i32))
                } else {
                    Err(fail(self))
                }
            }
            (Value::Float64(f), LogicalType::Int64) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                    Ok(Value::Int64(*f as i64))
                } else {
                    Err(fail(self))
                }
            }
            (Value::Float64(f), LogicalType::Decimal) => Decimal::try_from(*f)
                .map(Value::Decimal)
                .map_err(|_| fail(self)),
            (Value::Decimal(d), LogicalType::Float64) => {
                use rust_decimal::prelude::ToPrimitive;
                d.to_f64().map(Value::Float64).ok_or_else(|| fail(self))
            }
            (Value::Decimal(d), LogicalType::Int64) => {
                use rust_decimal::prelude::ToPrimitive;
                if d.fract().is_zero() {
                    d.to_i64().map(Value::Int64).ok_or_else(|| fail(self))
                } else {
                    Err(fail(self))
                }
            }
            (Value::Date(d), LogicalType::Timestamp) => {
                Ok(Value::Timestamp(d.and_hms_opt(0, 0, 0).unwrap_or_default()))
            }
            (Value::Timestamp(ts), LogicalType::Date) => Ok(Value::Date(ts.date())),
            _ => Err(fail(self)),
        }
    }

    /// Three-valued comparison. `None` when either side is NULL or the
    /// types have no common comparison type.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        let (lt, rt) = (self.logical_type()?, other.logical_type()?);
        let common = lt.comparison_type(rt)?;
        let left = self.cast(common).ok()?;
        let right = other.cast(common).ok()?;
        match (&left, &right) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
            (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
            (Value::Float64(a), Value::Float64(b)) => a.partial_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Binary(a), Value::Binary(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality key for hash grouping and join probes. NULL yields `None`
    /// so NULL keys never match.
    pub fn group_key(&self) -> Option<String> {
        if self.is_null() {
            return None;
        }
        Some(match self {
            Value::Float64(f) => format!("f:{}", f.to_bits()),
            other => format!("{}:{}", other.logical_type().map(|t| t.to_string()).unwrap_or_default(), other),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::String(s) => write!(f, "{s}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int32(i) => write!(f, "{i}"),
            Value::Int64(i) => write!(f, "{i}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
            Value::Binary(b) => {
                write!(f, "\\x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

/// One result row: values ordered by output ordinal.
pub type Row = Vec<Value>;

/// Contiguous batch of rows, the unit of transport between executor and
/// caller.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub offset: u64,
    pub done: bool,
    pub rows: Vec<Row>,
    /// Populated when the query was truncated at the intermediate cap.
    pub warning: Option<String>,
}

/// One column of an output row type.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub data_type: LogicalType,
    pub nullable: bool,
    /// Qualifier of the table the column came from, when still traceable.
    pub qualifier: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: LogicalType, nullable: bool) -> Self {
        Field {
            name: name.into(),
            data_type,
            nullable,
            qualifier: None,
        }
    }

    pub fn with_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }
}

/// Output row type of a plan node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Schema { fields }
    }

    pub fn empty() -> Self {
        Schema { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve a possibly-qualified column name to its ordinal.
    ///
    /// An unqualified name matching more than one field is ambiguous and
    /// fails; a qualified name must match both qualifier and field name.
    pub fn resolve(&self, qualifier: Option<&str>, name: &str) -> EngineResult<usize> {
        let matches: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| {
                f.name.eq_ignore_ascii_case(name)
                    && match qualifier {
                        Some(q) => f
                            .qualifier
                            .as_deref()
                            .map(|fq| fq.eq_ignore_ascii_case(q))
                            .unwrap_or(false),
                        None => true,
                    }
            })
            .map(|(i, _)| i)
            .collect();
        match matches.len() {
            0 => Err(EngineError::Validation {
                node: "column reference".to_string(),
                column: Some(display_name(qualifier, name)),
                reason: "column not found".to_string(),
            }),
            1 => Ok(matches[0]),
            _ => Err(EngineError::AmbiguousColumn(display_name(qualifier, name))),
        }
    }

    /// Concatenate two schemas (join output).
    pub fn join(&self, right: &Schema) -> Schema {
        let mut fields = self.fields.clone();
        fields.extend(right.fields.clone());
        Schema { fields }
    }
}

fn display_name(qualifier: Option<&str>, name: &str) -> String {
    match qualifier {
        Some(q) => format!("{q}.{name}"),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(LogicalType::String, LogicalType::Int64, Some(LogicalType::Int64))]
    #[case(LogicalType::Date, LogicalType::Timestamp, Some(LogicalType::Timestamp))]
    #[case(LogicalType::Int32, LogicalType::Int64, Some(LogicalType::Int64))]
    #[case(LogicalType::Int64, LogicalType::Float64, Some(LogicalType::Float64))]
    #[case(LogicalType::Boolean, LogicalType::Int32, None)]
    #[case(LogicalType::Binary, LogicalType::String, None)]
    fn comparison_coercion(
        #[case] left: LogicalType,
        #[case] right: LogicalType,
        #[case] expected: Option<LogicalType>,
    ) {
        assert_eq!(left.comparison_type(right), expected);
        assert_eq!(right.comparison_type(left), expected);
    }

    #[rstest]
    #[case(LogicalType::Decimal, LogicalType::Int32, true)]
    #[case(LogicalType::Int64, LogicalType::Int32, true)]
    #[case(LogicalType::Timestamp, LogicalType::Date, true)]
    #[case(LogicalType::Int32, LogicalType::Int64, false)]
    fn lossy_casts(#[case] from: LogicalType, #[case] to: LogicalType, #[case] lossy: bool) {
        assert_eq!(from.lossy_cast(to), lossy);
    }

    #[test]
    fn string_numeric_comparison_casts_string_side() {
        let left = Value::String("42".to_string());
        let right = Value::Int64(41);
        assert_eq!(left.compare(&right), Some(Ordering::Greater));
    }

    #[test]
    fn null_compares_as_unknown() {
        assert_eq!(Value::Null.compare(&Value::Int32(1)), None);
        assert_eq!(Value::Int32(1).compare(&Value::Null), None);
    }

    #[test]
    fn null_has_no_group_key() {
        assert_eq!(Value::Null.group_key(), None);
        assert!(Value::Int64(7).group_key().is_some());
    }

    #[test]
    fn group_keys_distinguish_types() {
        // Int64 1 and the string "1" must not land in the same hash bucket.
        assert_ne!(
            Value::Int64(1).group_key(),
            Value::String("1".to_string()).group_key()
        );
    }

    #[test]
    fn date_widens_to_timestamp() {
        let d = Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let ts = Value::Timestamp(
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        );
        assert_eq!(d.compare(&ts), Some(Ordering::Equal));
    }

    #[test]
    fn schema_resolution_rules() {
        let schema = Schema::new(vec![
            Field::new("id", LogicalType::Int64, false).with_qualifier("o"),
            Field::new("id", LogicalType::Int64, false).with_qualifier("l"),
            Field::new("status", LogicalType::String, true).with_qualifier("o"),
        ]);
        assert!(matches!(
            schema.resolve(None, "id"),
            Err(EngineError::AmbiguousColumn(_))
        ));
        assert_eq!(schema.resolve(Some("l"), "id").unwrap(), 1);
        assert_eq!(schema.resolve(None, "status").unwrap(), 2);
        assert!(schema.resolve(None, "missing").is_err());
    }

    #[test]
    fn lossless_int_cast_roundtrip() {
        let v = Value::Int64(7);
        assert_eq!(v.cast(LogicalType::Int32).unwrap(), Value::Int32(7));
        let big = Value::Int64(i64::MAX);
        assert!(big.cast(LogicalType::Int32).is_err());
    }
}
