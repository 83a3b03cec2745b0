//! Row validation: required fields and existence-key probes.

use std::collections::{HashMap, HashSet};

use ferry_db::models::{ExistenceCheck, ValidationRules};
use ferry_db::server::{ServerKey, ServerPools};
use ferry_db::value::{decode_row, SqlRow, SqlValue};

use crate::error::EngineError;
use crate::query::is_safe_identifier;

/// Existence probes batch their keys to stay well under the bind limit.
const EXISTENCE_BATCH_SIZE: usize = 500;

/// Why a row was dropped before insert.
#[derive(Debug, Clone, PartialEq)]
pub struct RowDiagnostic {
    pub reason: DiagnosticReason,
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticReason {
    MissingField,
}

/// Result of running validation over a row set.
#[derive(Debug, Default)]
pub struct ValidationOutcome {
    /// Rows that passed every check and are new to the destination.
    pub to_insert: Vec<SqlRow>,
    pub kept: u64,
    pub dropped_missing: u64,
    pub already_present: u64,
    pub diagnostics: Vec<RowDiagnostic>,
}

/// Drop rows missing any required field.
///
/// A field counts as missing when the column is absent or NULL.
pub fn check_required(
    rows: Vec<SqlRow>,
    required: &[String],
) -> (Vec<SqlRow>, Vec<RowDiagnostic>) {
    if required.is_empty() {
        return (rows, Vec::new());
    }

    let mut kept = Vec::with_capacity(rows.len());
    let mut diagnostics = Vec::new();

    'rows: for row in rows {
        for field in required {
            let missing = match row.get(field) {
                None => true,
                Some(value) => value.is_null(),
            };
            if missing {
                diagnostics.push(RowDiagnostic {
                    reason: DiagnosticReason::MissingField,
                    field: field.clone(),
                });
                continue 'rows;
            }
        }
        kept.push(row);
    }

    (kept, diagnostics)
}

/// Run the full validation pipeline over a row set.
///
/// `server` is the side holding the existence table (the transfer
/// destination). An absent or empty existence table skips the probe and
/// keeps every required-field-valid row.
pub async fn validate_rows(
    pools: &ServerPools,
    server: ServerKey,
    rules: &ValidationRules,
    rows: Vec<SqlRow>,
) -> Result<ValidationOutcome, EngineError> {
    let total = rows.len() as u64;
    let (valid, diagnostics) = check_required(rows, &rules.required_fields);
    let dropped_missing = total - valid.len() as u64;

    let (to_insert, already_present) = match &rules.existence_check {
        Some(check) if !check.table.is_empty() => {
            split_existing(pools, server, check, valid).await?
        }
        _ => (valid, 0),
    };

    Ok(ValidationOutcome {
        kept: to_insert.len() as u64,
        dropped_missing,
        already_present,
        diagnostics,
        to_insert,
    })
}

/// Probe the destination table and split rows into new vs. already-present.
///
/// Rows whose key is NULL cannot be probed and are treated as new.
async fn split_existing(
    pools: &ServerPools,
    server: ServerKey,
    check: &ExistenceCheck,
    rows: Vec<SqlRow>,
) -> Result<(Vec<SqlRow>, u64), EngineError> {
    if !is_safe_identifier(&check.table) {
        return Err(EngineError::InvalidConfig(format!(
            "existence table {:?} is not a valid identifier",
            check.table
        )));
    }
    if !is_safe_identifier(&check.key) {
        return Err(EngineError::InvalidConfig(format!(
            "existence key {:?} is not a valid identifier",
            check.key
        )));
    }

    // Dedupe probe keys while remembering one bindable value per key.
    let mut probe_values: HashMap<String, SqlValue> = HashMap::new();
    for row in &rows {
        if let Some(value) = row.get(&check.key) {
            if let Some(key) = value.key_string() {
                probe_values.entry(key).or_insert_with(|| value.clone());
            }
        }
    }

    let mut existing: HashSet<String> = HashSet::new();
    let values: Vec<SqlValue> = probe_values.into_values().collect();

    for chunk in values.chunks(EXISTENCE_BATCH_SIZE) {
        let placeholders: Vec<String> =
            (1..=chunk.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "SELECT {key} FROM {table} WHERE {key} IN ({placeholders})",
            key = check.key,
            table = check.table,
            placeholders = placeholders.join(", "),
        );

        let mut query = sqlx::query(&sql);
        for value in chunk {
            query = value.bind_to(query);
        }

        let found = query
            .fetch_all(pools.pool(server))
            .await
            .map_err(|e| EngineError::from_sqlx(server, e))?;

        for row in &found {
            let decoded = decode_row(row).map_err(EngineError::Internal)?;
            if let Some(key) = decoded.get(&check.key).and_then(SqlValue::key_string) {
                existing.insert(key);
            }
        }
    }

    let mut to_insert = Vec::new();
    let mut already_present = 0u64;
    for row in rows {
        let key = row.get(&check.key).and_then(SqlValue::key_string);
        match key {
            Some(k) if existing.contains(&k) => already_present += 1,
            _ => to_insert.push(row),
        }
    }

    Ok((to_insert, already_present))
}
