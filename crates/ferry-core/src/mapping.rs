//! Field mapping and target-driven value coercion.
//!
//! Down transfers copy `source_fields[i] -> target_fields[i]` pairwise,
//! fill defaults, then coerce values against the target table's column
//! metadata. Up and internal transfers pass rows through untouched.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use ferry_db::models::FieldMapping;
use ferry_db::server::ColumnMeta;
use ferry_db::value::{SqlRow, SqlValue};

/// Strings coerced to `true` on boolean columns.
const TRUE_STRINGS: &[&str] = &["true", "1", "yes", "s", "y"];
/// Strings coerced to `false` on boolean columns.
const FALSE_STRINGS: &[&str] = &["false", "0", "no", "n"];

/// What happened to a value during coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoercionKind {
    /// String cut down to the column's maximum length.
    Truncated,
    /// Unrecognized boolean string nulled out.
    BooleanNulled,
    /// Date string the column cannot accept.
    InvalidDate,
    /// Non-numeric value headed for a numeric column.
    InvalidNumber,
}

impl CoercionKind {
    /// Fatal notes mean the row cannot be written as-is.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::InvalidDate | Self::InvalidNumber)
    }
}

/// Diagnostic attached to one coerced column.
#[derive(Debug, Clone, PartialEq)]
pub struct CoercionNote {
    pub column: String,
    pub kind: CoercionKind,
    pub detail: String,
}

/// Apply the field mapping to one source row.
///
/// Unmapped source columns are dropped; defaults fill target columns the
/// mapping does not cover.
pub fn map_row(mapping: &FieldMapping, row: &SqlRow) -> SqlRow {
    let mut out = SqlRow::new();
    for (source, target) in mapping.source_fields.iter().zip(&mapping.target_fields) {
        let value = row.get(source).cloned().unwrap_or(SqlValue::Null);
        out.set(target, value);
    }
    for default in &mapping.defaults {
        if !out.contains(&default.field) {
            out.set(&default.field, SqlValue::from_json(&default.value));
        }
    }
    out
}

/// Coerce a row's values against target column metadata.
///
/// Columns absent from the metadata map pass through untouched; the
/// insert will fail loudly if they do not exist on the table.
pub fn coerce_row(
    row: &SqlRow,
    columns: &HashMap<String, ColumnMeta>,
) -> (SqlRow, Vec<CoercionNote>) {
    let mut out = SqlRow::new();
    let mut notes = Vec::new();

    for (column, value) in row.iter() {
        let Some(meta) = columns.get(column) else {
            out.set(column, value.clone());
            continue;
        };
        let coerced = coerce_value(column, value, meta, &mut notes);
        out.set(column, coerced);
    }

    (out, notes)
}

fn coerce_value(
    column: &str,
    value: &SqlValue,
    meta: &ColumnMeta,
    notes: &mut Vec<CoercionNote>,
) -> SqlValue {
    if value.is_null() {
        return SqlValue::Null;
    }

    if meta.is_boolean() {
        return coerce_boolean(column, value, notes);
    }

    if meta.is_date_like() {
        if let SqlValue::Text(s) = value {
            return match parse_date_string(s, meta) {
                Some(parsed) => parsed,
                None => {
                    notes.push(CoercionNote {
                        column: column.to_owned(),
                        kind: CoercionKind::InvalidDate,
                        detail: format!("cannot parse {s:?} as {}", meta.sql_type),
                    });
                    SqlValue::Null
                }
            };
        }
        return value.clone();
    }

    if meta.is_numeric() {
        if let SqlValue::Text(s) = value {
            return match s.trim().parse::<f64>() {
                Ok(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                    SqlValue::Int(n as i64)
                }
                Ok(n) => SqlValue::Float(n),
                Err(_) => {
                    notes.push(CoercionNote {
                        column: column.to_owned(),
                        kind: CoercionKind::InvalidNumber,
                        detail: format!("cannot parse {s:?} as {}", meta.sql_type),
                    });
                    SqlValue::Null
                }
            };
        }
        return value.clone();
    }

    if meta.is_character() {
        if let (SqlValue::Text(s), Some(max)) = (value, meta.max_length) {
            let max = max.max(0) as usize;
            if s.chars().count() > max {
                let truncated: String = s.chars().take(max).collect();
                notes.push(CoercionNote {
                    column: column.to_owned(),
                    kind: CoercionKind::Truncated,
                    detail: format!("value of {} chars truncated to {max}", s.chars().count()),
                });
                return SqlValue::Text(truncated);
            }
        }
        return value.clone();
    }

    value.clone()
}

fn coerce_boolean(column: &str, value: &SqlValue, notes: &mut Vec<CoercionNote>) -> SqlValue {
    match value {
        SqlValue::Bool(_) => value.clone(),
        SqlValue::Int(i) => SqlValue::Bool(*i != 0),
        SqlValue::Text(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            if TRUE_STRINGS.contains(&lowered.as_str()) {
                SqlValue::Bool(true)
            } else if FALSE_STRINGS.contains(&lowered.as_str()) {
                SqlValue::Bool(false)
            } else {
                notes.push(CoercionNote {
                    column: column.to_owned(),
                    kind: CoercionKind::BooleanNulled,
                    detail: format!("unrecognized boolean string {s:?}"),
                });
                SqlValue::Null
            }
        }
        _ => value.clone(),
    }
}

fn parse_date_string(s: &str, meta: &ColumnMeta) -> Option<SqlValue> {
    let trimmed = s.trim();

    if meta.sql_type == "date" {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Some(SqlValue::Date(date));
        }
        if let Some(SqlValue::Timestamp(ts)) = parse_timestamp(trimmed) {
            return Some(SqlValue::Date(ts.date()));
        }
        return None;
    }

    if let Some(parsed) = parse_timestamp(trimmed) {
        return Some(parsed);
    }
    // A bare date is midnight on timestamp columns.
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .map(|d| SqlValue::Timestamp(d.and_hms_opt(0, 0, 0).expect("midnight is valid")))
}

fn parse_timestamp(s: &str) -> Option<SqlValue> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(SqlValue::TimestampTz(dt.to_utc()));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, format) {
            return Some(SqlValue::Timestamp(dt));
        }
    }
    None
}
