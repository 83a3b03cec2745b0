//! Dynamic SQL value and row representation.
//!
//! Transfer queries are user-defined, so result shapes are only known at
//! runtime. Rows are decoded into [`SqlRow`] (ordered column/value pairs)
//! and values kept in their natural typed form until bound, letting the
//! driver handle type negotiation.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo, ValueRef};
use uuid::Uuid;

/// A single dynamically-typed SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::Date(_) => "date",
            Self::Timestamp(_) => "timestamp",
            Self::TimestampTz(_) => "timestamptz",
            Self::Uuid(_) => "uuid",
            Self::Json(_) => "json",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view of the value, parsing text when it looks like a number.
    ///
    /// Used by quantity sanitization: anything that cannot be read as a
    /// number maps to `None`.
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Decimal(d) => d.to_f64(),
            Self::Text(s) => s.trim().parse::<f64>().ok(),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Canonical string form used for keying (existence probes, processed
    /// identifiers, bonification article codes). `None` for NULL.
    pub fn key_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Decimal(d) => Some(d.normalize().to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Date(d) => Some(d.to_string()),
            Self::Timestamp(t) => Some(t.to_string()),
            Self::TimestampTz(t) => Some(t.to_rfc3339()),
            Self::Uuid(u) => Some(u.to_string()),
            Self::Json(v) => Some(v.to_string()),
        }
    }

    /// Convert a JSON scalar (as stored in task parameter documents) into
    /// its natural SQL value.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Bind this value onto a query, keeping its natural type.
    pub fn bind_to<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            Self::Null => query.bind(None::<String>),
            Self::Bool(b) => query.bind(*b),
            Self::Int(i) => query.bind(*i),
            Self::Float(f) => query.bind(*f),
            Self::Decimal(d) => query.bind(*d),
            Self::Text(s) => query.bind(s.clone()),
            Self::Date(d) => query.bind(*d),
            Self::Timestamp(t) => query.bind(*t),
            Self::TimestampTz(t) => query.bind(*t),
            Self::Uuid(u) => query.bind(*u),
            Self::Json(v) => query.bind(v.clone()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Date(d) => write!(f, "{d}"),
            Self::Timestamp(t) => write!(f, "{t}"),
            Self::TimestampTz(t) => write!(f, "{t}"),
            Self::Uuid(u) => write!(f, "{u}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

/// An ordered set of named values -- one row of a dynamic result.
///
/// Column order is preserved so passthrough inserts reproduce the source
/// shape. Lookup is by linear scan; transfer rows carry tens of columns,
/// not thousands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Set a column value, appending the column if it is not present.
    pub fn set(&mut self, column: &str, value: SqlValue) {
        match self.columns.iter().position(|c| c == column) {
            Some(i) => self.values[i] = value,
            None => {
                self.columns.push(column.to_owned());
                self.values.push(value);
            }
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl FromIterator<(String, SqlValue)> for SqlRow {
    fn from_iter<T: IntoIterator<Item = (String, SqlValue)>>(iter: T) -> Self {
        let mut row = Self::new();
        for (c, v) in iter {
            row.set(&c, v);
        }
        row
    }
}

/// Decode a dynamically-shaped `PgRow` into a [`SqlRow`].
///
/// Unsupported column types are an error naming the column; silently
/// stringifying them would corrupt the transfer.
pub fn decode_row(row: &PgRow) -> anyhow::Result<SqlRow> {
    let mut out = SqlRow::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = decode_value(row, idx).map_err(|e| {
            anyhow::anyhow!("column {:?}: {e}", column.name())
        })?;
        out.set(column.name(), value);
    }
    Ok(out)
}

fn decode_value(row: &PgRow, idx: usize) -> anyhow::Result<SqlValue> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_owned();

    let value = match type_name.as_str() {
        "BOOL" => SqlValue::Bool(row.try_get::<bool, _>(idx)?),
        "INT2" => SqlValue::Int(row.try_get::<i16, _>(idx)? as i64),
        "INT4" => SqlValue::Int(row.try_get::<i32, _>(idx)? as i64),
        "INT8" => SqlValue::Int(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => SqlValue::Float(row.try_get::<f32, _>(idx)? as f64),
        "FLOAT8" => SqlValue::Float(row.try_get::<f64, _>(idx)?),
        "NUMERIC" => SqlValue::Decimal(row.try_get::<Decimal, _>(idx)?),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            SqlValue::Text(row.try_get::<String, _>(idx)?)
        }
        "DATE" => SqlValue::Date(row.try_get::<NaiveDate, _>(idx)?),
        "TIMESTAMP" => SqlValue::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?),
        "TIMESTAMPTZ" => SqlValue::TimestampTz(row.try_get::<DateTime<Utc>, _>(idx)?),
        "UUID" => SqlValue::Uuid(row.try_get::<Uuid, _>(idx)?),
        "JSON" | "JSONB" => SqlValue::Json(row.try_get::<serde_json::Value, _>(idx)?),
        other => anyhow::bail!("unsupported column type {other}"),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_json_scalars() {
        assert_eq!(SqlValue::from_json(&serde_json::json!(null)), SqlValue::Null);
        assert_eq!(SqlValue::from_json(&serde_json::json!(true)), SqlValue::Bool(true));
        assert_eq!(SqlValue::from_json(&serde_json::json!(42)), SqlValue::Int(42));
        assert_eq!(SqlValue::from_json(&serde_json::json!(1.5)), SqlValue::Float(1.5));
        assert_eq!(
            SqlValue::from_json(&serde_json::json!("abc")),
            SqlValue::Text("abc".to_owned())
        );
    }

    #[test]
    fn as_numeric_parses_text() {
        assert_eq!(SqlValue::Text(" 3.5 ".to_owned()).as_numeric(), Some(3.5));
        assert_eq!(SqlValue::Text("-2".to_owned()).as_numeric(), Some(-2.0));
        assert_eq!(SqlValue::Text("maybe".to_owned()).as_numeric(), None);
        assert_eq!(SqlValue::Null.as_numeric(), None);
        assert_eq!(SqlValue::Int(7).as_numeric(), Some(7.0));
    }

    #[test]
    fn key_string_null_is_none() {
        assert_eq!(SqlValue::Null.key_string(), None);
        assert_eq!(SqlValue::Int(10).key_string(), Some("10".to_owned()));
        assert_eq!(
            SqlValue::Text("A-1".to_owned()).key_string(),
            Some("A-1".to_owned())
        );
    }

    #[test]
    fn row_preserves_column_order() {
        let mut row = SqlRow::new();
        row.set("b", SqlValue::Int(1));
        row.set("a", SqlValue::Int(2));
        row.set("b", SqlValue::Int(3));

        assert_eq!(row.columns(), &["b".to_owned(), "a".to_owned()]);
        assert_eq!(row.get("b"), Some(&SqlValue::Int(3)));
        assert_eq!(row.get("a"), Some(&SqlValue::Int(2)));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn row_get_missing() {
        let row = SqlRow::new();
        assert!(row.get("nope").is_none());
        assert!(!row.contains("nope"));
    }
}
