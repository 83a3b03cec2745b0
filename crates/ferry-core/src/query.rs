//! Query compilation and statement validation.
//!
//! The stored query is a complete SELECT; active parameters append a
//! WHERE suffix with `$n` placeholders. Values stay typed until bound --
//! nothing is ever string-interpolated into the SQL text.

use ferry_db::models::{ParamOperator, TaskParameter};
use ferry_db::value::SqlValue;

use crate::error::EngineError;

/// Keywords rejected in any user-supplied statement, as whole tokens.
const FORBIDDEN_TOKENS: &[&str] = &[
    "DROP", "TRUNCATE", "ALTER", "CREATE", "GRANT", "REVOKE", "EXEC", "EXECUTE",
];

/// A task parameter value, classified for binding.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(SqlValue),
    List(Vec<SqlValue>),
    Range {
        from: Option<SqlValue>,
        to: Option<SqlValue>,
    },
}

impl ParamValue {
    /// Classify a stored parameter document against its operator.
    pub fn from_parameter(param: &TaskParameter) -> Result<Self, EngineError> {
        match param.operator {
            ParamOperator::In => match &param.value {
                serde_json::Value::Array(items) => {
                    Ok(Self::List(items.iter().map(SqlValue::from_json).collect()))
                }
                // A scalar IN is a one-element list.
                other if !other.is_object() => Ok(Self::List(vec![SqlValue::from_json(other)])),
                _ => Err(EngineError::InvalidConfig(format!(
                    "parameter {:?}: IN requires an array value",
                    param.field
                ))),
            },
            ParamOperator::Between => match &param.value {
                serde_json::Value::Object(map) => {
                    let from = map
                        .get("from")
                        .filter(|v| !v.is_null())
                        .map(SqlValue::from_json);
                    let to = map
                        .get("to")
                        .filter(|v| !v.is_null())
                        .map(SqlValue::from_json);
                    Ok(Self::Range { from, to })
                }
                _ => Err(EngineError::InvalidConfig(format!(
                    "parameter {:?}: BETWEEN requires a {{from, to}} value",
                    param.field
                ))),
            },
            _ => match &param.value {
                serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                    Err(EngineError::InvalidConfig(format!(
                        "parameter {:?}: operator {} requires a scalar value",
                        param.field, param.operator
                    )))
                }
                other => Ok(Self::Scalar(SqlValue::from_json(other))),
            },
        }
    }
}

/// A compiled statement: final SQL text plus ordered bind values.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltQuery {
    pub sql: String,
    pub binds: Vec<SqlValue>,
}

impl BuiltQuery {
    pub fn without_params(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }
}

/// Compile the stored SELECT with its active parameters.
pub fn build_select(base: &str, params: &[TaskParameter]) -> Result<BuiltQuery, EngineError> {
    validate_select(base)?;

    let mut predicates: Vec<String> = Vec::new();
    let mut binds: Vec<SqlValue> = Vec::new();

    for param in params {
        if !is_safe_identifier(&param.field) {
            return Err(EngineError::InvalidConfig(format!(
                "parameter field {:?} is not a valid identifier",
                param.field
            )));
        }

        match ParamValue::from_parameter(param)? {
            ParamValue::Scalar(value) => {
                binds.push(value);
                predicates.push(format!(
                    "{} {} ${}",
                    param.field,
                    param.operator.sql(),
                    binds.len()
                ));
            }
            ParamValue::List(values) => {
                if values.is_empty() {
                    // Empty IN can never match.
                    predicates.push("1=0".to_owned());
                    continue;
                }
                let mut placeholders = Vec::with_capacity(values.len());
                for value in values {
                    binds.push(value);
                    placeholders.push(format!("${}", binds.len()));
                }
                predicates.push(format!(
                    "{} IN ({})",
                    param.field,
                    placeholders.join(", ")
                ));
            }
            ParamValue::Range { from, to } => {
                // A half-open range is skipped entirely rather than bound
                // against NULL.
                let (Some(from), Some(to)) = (from, to) else {
                    continue;
                };
                binds.push(from);
                let from_idx = binds.len();
                binds.push(to);
                let to_idx = binds.len();
                predicates.push(format!(
                    "{} BETWEEN ${from_idx} AND ${to_idx}",
                    param.field
                ));
            }
        }
    }

    if predicates.is_empty() {
        return Ok(BuiltQuery::without_params(base.trim()));
    }

    let connector = if has_where_clause(base) { "AND" } else { "WHERE" };
    let sql = format!("{} {} {}", base.trim(), connector, predicates.join(" AND "));
    Ok(BuiltQuery { sql, binds })
}

/// Validate a statement intended for dynamic SELECT execution.
///
/// Must begin with SELECT (whitespace/comments ignored) and carry none of
/// the forbidden keywords as whole tokens.
pub fn validate_select(sql: &str) -> Result<(), EngineError> {
    let stripped = strip_comments(sql);
    let trimmed = stripped.trim();

    let first_token = tokens(trimmed).next().unwrap_or_default();
    if !first_token.eq_ignore_ascii_case("SELECT") {
        return Err(EngineError::InvalidConfig(
            "query must begin with SELECT".to_owned(),
        ));
    }

    check_forbidden_tokens(trimmed)
}

/// Validate a post-update statement.
///
/// INSERT/UPDATE/MERGE/DELETE are allowed, but DELETE and UPDATE must be
/// qualified by a WHERE clause. The forbidden-keyword list still applies.
pub fn validate_non_destructive(sql: &str) -> Result<(), EngineError> {
    let stripped = strip_comments(sql);
    let trimmed = stripped.trim();

    if trimmed.is_empty() {
        return Err(EngineError::InvalidConfig(
            "post-update statement is empty".to_owned(),
        ));
    }

    check_forbidden_tokens(trimmed)?;

    let first_token = tokens(trimmed).next().unwrap_or_default().to_uppercase();
    if matches!(first_token.as_str(), "DELETE" | "UPDATE") && !has_where_clause(trimmed) {
        return Err(EngineError::InvalidConfig(format!(
            "unqualified {first_token} is not allowed in post-update statements"
        )));
    }

    Ok(())
}

fn check_forbidden_tokens(sql: &str) -> Result<(), EngineError> {
    for token in tokens(sql) {
        let upper = token.to_uppercase();
        if FORBIDDEN_TOKENS.contains(&upper.as_str()) {
            return Err(EngineError::InvalidConfig(format!(
                "statement contains forbidden keyword {upper}"
            )));
        }
        if upper.starts_with("XP_") || upper.starts_with("SP_") {
            return Err(EngineError::InvalidConfig(format!(
                "statement references system procedure {token}"
            )));
        }
    }
    Ok(())
}

/// Iterate the word-like tokens of a statement.
fn tokens(sql: &str) -> impl Iterator<Item = &str> {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
}

/// Whether the statement already carries a top-level WHERE token.
///
/// Token-level scan; a WHERE inside a subquery also counts, which matches
/// the append-with-AND behavior expected of stored queries.
pub fn has_where_clause(sql: &str) -> bool {
    tokens(&strip_comments(sql)).any(|t| t.eq_ignore_ascii_case("WHERE"))
}

/// Remove `--` line comments and `/* */` block comments.
pub fn strip_comments(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '-' && i + 1 < chars.len() && chars[i + 1] == '-' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if chars[i] == '/' && i + 1 < chars.len() && chars[i + 1] == '*' {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            out.push(' ');
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

/// Whether a name is safe to interpolate as an identifier.
///
/// Letters, digits, underscores, and a single schema qualifier dot.
pub fn is_safe_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > 128 {
        return false;
    }
    let mut parts = name.split('.');
    let valid_part = |part: &str| {
        !part.is_empty()
            && !part.starts_with(|c: char| c.is_ascii_digit())
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), None, _) => valid_part(a),
        (Some(a), Some(b), None) => valid_part(a) && valid_part(b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(field: &str, operator: ParamOperator, value: serde_json::Value) -> TaskParameter {
        TaskParameter {
            field: field.to_owned(),
            operator,
            value,
        }
    }

    #[test]
    fn no_params_returns_base() {
        let built = build_select("SELECT id FROM src", &[]).unwrap();
        assert_eq!(built.sql, "SELECT id FROM src");
        assert!(built.binds.is_empty());
    }

    #[test]
    fn scalar_params_append_where() {
        let built = build_select(
            "SELECT id, name FROM src",
            &[
                param("active", ParamOperator::Eq, serde_json::json!(1)),
                param("name", ParamOperator::Like, serde_json::json!("A%")),
            ],
        )
        .unwrap();
        assert_eq!(
            built.sql,
            "SELECT id, name FROM src WHERE active = $1 AND name LIKE $2"
        );
        assert_eq!(
            built.binds,
            vec![SqlValue::Int(1), SqlValue::Text("A%".to_owned())]
        );
    }

    #[test]
    fn existing_where_uses_and() {
        let built = build_select(
            "SELECT id FROM src WHERE active = 1",
            &[param("region", ParamOperator::Eq, serde_json::json!("N"))],
        )
        .unwrap();
        assert_eq!(
            built.sql,
            "SELECT id FROM src WHERE active = 1 AND region = $1"
        );
    }

    #[test]
    fn in_list_expands_placeholders() {
        let built = build_select(
            "SELECT id FROM src",
            &[param("region", ParamOperator::In, serde_json::json!(["N", "S", "E"]))],
        )
        .unwrap();
        assert_eq!(built.sql, "SELECT id FROM src WHERE region IN ($1, $2, $3)");
        assert_eq!(built.binds.len(), 3);
    }

    #[test]
    fn empty_in_is_always_false() {
        let built = build_select(
            "SELECT id FROM src",
            &[param("region", ParamOperator::In, serde_json::json!([]))],
        )
        .unwrap();
        assert_eq!(built.sql, "SELECT id FROM src WHERE 1=0");
        assert!(built.binds.is_empty());
    }

    #[test]
    fn between_binds_both_bounds() {
        let built = build_select(
            "SELECT id FROM src",
            &[param(
                "created",
                ParamOperator::Between,
                serde_json::json!({"from": "2024-01-01", "to": "2024-12-31"}),
            )],
        )
        .unwrap();
        assert_eq!(
            built.sql,
            "SELECT id FROM src WHERE created BETWEEN $1 AND $2"
        );
        assert_eq!(built.binds.len(), 2);
    }

    #[test]
    fn between_missing_bound_is_skipped() {
        for value in [
            serde_json::json!({"from": "2024-01-01"}),
            serde_json::json!({"to": "2024-12-31"}),
            serde_json::json!({"from": null, "to": "2024-12-31"}),
            serde_json::json!({}),
        ] {
            let built = build_select(
                "SELECT id FROM src",
                &[param("created", ParamOperator::Between, value)],
            )
            .unwrap();
            assert_eq!(built.sql, "SELECT id FROM src");
            assert!(built.binds.is_empty());
        }
    }

    #[test]
    fn mixed_skipped_and_active_params() {
        let built = build_select(
            "SELECT id FROM src",
            &[
                param("created", ParamOperator::Between, serde_json::json!({})),
                param("active", ParamOperator::Eq, serde_json::json!(true)),
            ],
        )
        .unwrap();
        assert_eq!(built.sql, "SELECT id FROM src WHERE active = $1");
        assert_eq!(built.binds, vec![SqlValue::Bool(true)]);
    }

    #[test]
    fn unsafe_field_rejected() {
        let err = build_select(
            "SELECT id FROM src",
            &[param("id; DROP TABLE x", ParamOperator::Eq, serde_json::json!(1))],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn select_validation_accepts_comments() {
        validate_select("  -- extraction\n  SELECT id FROM src").unwrap();
        validate_select("/* header */ SELECT 1").unwrap();
    }

    #[test]
    fn select_validation_rejects_non_select() {
        assert!(validate_select("UPDATE src SET x = 1").is_err());
        assert!(validate_select("").is_err());
    }

    #[test]
    fn select_validation_rejects_destructive_tokens() {
        for sql in [
            "SELECT 1; DROP TABLE users",
            "SELECT * FROM t WHERE x = 1 UNION SELECT 1; TRUNCATE t2",
            "SELECT xp_cmdshell('dir')",
            "SELECT * FROM sp_helpdb",
            "SELECT 1; EXEC something",
        ] {
            assert!(validate_select(sql).is_err(), "should reject: {sql}");
        }
    }

    #[test]
    fn select_validation_allows_substrings() {
        // Forbidden keywords as substrings of larger words are fine.
        validate_select("SELECT dropped_at, created_at FROM t").unwrap();
        validate_select("SELECT executor FROM t").unwrap();
    }

    #[test]
    fn non_destructive_requires_where_on_delete() {
        assert!(validate_non_destructive("DELETE FROM t").is_err());
        validate_non_destructive("DELETE FROM t WHERE id = 1").unwrap();
        assert!(validate_non_destructive("UPDATE t SET x = 1").is_err());
        validate_non_destructive("UPDATE t SET x = 1 WHERE id = 1").unwrap();
        validate_non_destructive("INSERT INTO t (a) VALUES (1)").unwrap();
    }

    #[test]
    fn non_destructive_rejects_forbidden() {
        assert!(validate_non_destructive("UPDATE t SET x = 1 WHERE id = 1; DROP TABLE t").is_err());
        assert!(validate_non_destructive("TRUNCATE t").is_err());
    }

    #[test]
    fn identifier_safety() {
        assert!(is_safe_identifier("orders"));
        assert!(is_safe_identifier("sales.orders"));
        assert!(is_safe_identifier("Linea_Pedido"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("1bad"));
        assert!(!is_safe_identifier("a.b.c"));
        assert!(!is_safe_identifier("t; DROP"));
        assert!(!is_safe_identifier("a b"));
    }

    #[test]
    fn strip_comments_handles_both_forms() {
        assert_eq!(
            strip_comments("SELECT 1 -- trailing\nFROM t").trim(),
            "SELECT 1 \nFROM t".trim()
        );
        assert_eq!(strip_comments("/* a */SELECT 1").trim(), "SELECT 1");
    }

    #[test]
    fn in_with_scalar_becomes_single_element() {
        let built = build_select(
            "SELECT id FROM src",
            &[param("region", ParamOperator::In, serde_json::json!("N"))],
        )
        .unwrap();
        assert_eq!(built.sql, "SELECT id FROM src WHERE region IN ($1)");
    }

    #[test]
    fn operator_scalar_rejects_array() {
        let err = build_select(
            "SELECT id FROM src",
            &[param("region", ParamOperator::Eq, serde_json::json!(["N"]))],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}
