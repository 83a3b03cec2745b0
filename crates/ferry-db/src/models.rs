use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How a task may be triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Manual,
    Auto,
    Both,
}

impl TaskKind {
    /// Whether a user may trigger this task directly.
    pub fn allows_manual(self) -> bool {
        matches!(self, Self::Manual | Self::Both)
    }

    /// Whether the scheduler may pick this task up.
    pub fn allows_auto(self) -> bool {
        matches!(self, Self::Auto | Self::Both)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Both => "both",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = TaskKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "both" => Ok(Self::Both),
            other => Err(TaskKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskKind`] string.
#[derive(Debug, Clone)]
pub struct TaskKindParseError(pub String);

impl fmt::Display for TaskKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskKindParseError {}

// ---------------------------------------------------------------------------

/// Logical transfer orientation.
///
/// `Down` moves rows from source to target through a field mapping;
/// `Up` moves rows from target back into source tables; `Internal`
/// stays within the source server; `General` runs a query with no
/// destination mapping at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    General,
    Up,
    Down,
    Internal,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::General => "general",
            Self::Up => "up",
            Self::Down => "down",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl FromStr for Direction {
    type Err = DirectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(Self::General),
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "internal" => Ok(Self::Internal),
            other => Err(DirectionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Direction`] string.
#[derive(Debug, Clone)]
pub struct DirectionParseError(pub String);

impl fmt::Display for DirectionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid direction: {:?}", self.0)
    }
}

impl std::error::Error for DirectionParseError {}

// ---------------------------------------------------------------------------

/// Whether results are materialized up front or processed in batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    Normal,
    Streaming,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

impl FromStr for TransferMode {
    type Err = TransferModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "streaming" => Ok(Self::Streaming),
            other => Err(TransferModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TransferMode`] string.
#[derive(Debug, Clone)]
pub struct TransferModeParseError(pub String);

impl fmt::Display for TransferModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transfer mode: {:?}", self.0)
    }
}

impl std::error::Error for TransferModeParseError {}

// ---------------------------------------------------------------------------

/// Persisted run state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl RunState {
    /// Terminal states never transition further within one execution.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunState {
    type Err = RunStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RunStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunState`] string.
#[derive(Debug, Clone)]
pub struct RunStateParseError(pub String);

impl fmt::Display for RunStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run state: {:?}", self.0)
    }
}

impl std::error::Error for RunStateParseError {}

// ---------------------------------------------------------------------------

/// Terminal outcome of one execution, as recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Cancelled,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionOutcome {
    type Err = ExecutionOutcomeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ExecutionOutcomeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionOutcome`] string.
#[derive(Debug, Clone)]
pub struct ExecutionOutcomeParseError(pub String);

impl fmt::Display for ExecutionOutcomeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution outcome: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionOutcomeParseError {}

// ---------------------------------------------------------------------------
// Sub-documents (stored as JSONB)
// ---------------------------------------------------------------------------

/// Comparison operator for a task parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "LIKE")]
    Like,
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "BETWEEN")]
    Between,
}

impl ParamOperator {
    /// SQL spelling of the operator.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::Between => "BETWEEN",
        }
    }
}

impl fmt::Display for ParamOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql())
    }
}

/// One parameter of the stored extraction query.
///
/// `value` is a scalar, an array (for IN), or `{"from": .., "to": ..}`
/// (for BETWEEN); classification happens at query-build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParameter {
    pub field: String,
    pub operator: ParamOperator,
    pub value: serde_json::Value,
}

/// Constant applied to a target column that no mapping pair covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultValue {
    pub field: String,
    pub value: serde_json::Value,
}

/// Source-to-target column mapping for down transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_table: String,
    pub target_table: String,
    pub source_fields: Vec<String>,
    pub target_fields: Vec<String>,
    #[serde(default)]
    pub defaults: Vec<DefaultValue>,
}

/// Existence probe against the destination table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistenceCheck {
    pub table: String,
    pub key: String,
}

/// Row-level validation rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub existence_check: Option<ExistenceCheck>,
}

/// Identifier mapping used by the post-update statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostUpdateMapping {
    /// Identifier column in the source view.
    pub view_key: String,
    /// Identifier column in the destination table.
    pub table_key: String,
}

/// Configuration of the bonification line-renumbering pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BonificationConfig {
    pub source_table: String,
    /// Column grouping rows into orders.
    pub order_field: String,
    /// Column giving the original intra-order line order.
    pub line_order_field: String,
    /// Column marking a row as a bonus line.
    pub indicator_field: String,
    /// Value of `indicator_field` that marks a bonus line.
    pub indicator_value: String,
    /// Column carrying the regular article code.
    pub regular_article_field: String,
    /// Column on bonus rows referencing a regular article code.
    pub reference_field: String,
    /// Output column receiving the final sequential line number.
    pub line_number_field: String,
    /// Output column receiving the referenced regular line number.
    pub line_reference_field: String,
    /// Quantity column sanitized during processing.
    pub quantity_field: String,
}

/// Summary of the last finished execution, persisted on the task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastExecutionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<i64>,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A stored transfer task definition plus its persisted run status.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub kind: TaskKind,
    pub direction: Direction,
    pub mode: TransferMode,
    pub active: bool,
    /// Parameterized SELECT (validated at upsert).
    pub query: String,
    pub parameters: Json<Vec<TaskParameter>>,
    pub clear_before_insert: bool,
    pub field_mapping: Option<Json<FieldMapping>>,
    /// Destination table for internal transfers.
    pub target_table: Option<String>,
    pub validation_rules: Option<Json<ValidationRules>>,
    pub post_update_query: Option<String>,
    pub post_update_mapping: Option<Json<PostUpdateMapping>>,
    pub linked_group: Option<String>,
    pub linked_execution_order: i32,
    /// Direct links, used only when no group is set.
    pub linked_tasks: Json<Vec<Uuid>>,
    pub is_coordinator: bool,
    /// Tasks chained after success (down transfers only).
    pub next_tasks: Json<Vec<Uuid>>,
    pub bonification: Option<Json<BonificationConfig>>,
    pub status: RunState,
    /// Last published percent; -1 after cancellation or failure.
    pub progress: i32,
    pub last_execution_date: Option<DateTime<Utc>>,
    pub last_execution_result: Option<Json<LastExecutionResult>>,
    pub execution_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The group this task executes with, treating empty strings as unset.
    pub fn group(&self) -> Option<&str> {
        self.linked_group.as_deref().filter(|g| !g.is_empty())
    }

    /// The single destination table of this task, when one applies.
    pub fn destination_table(&self) -> Option<&str> {
        match self.direction {
            Direction::Down => self.field_mapping.as_ref().map(|m| m.target_table.as_str()),
            Direction::Internal | Direction::Up => self.target_table.as_deref(),
            Direction::General => None,
        }
    }
}

/// One finished execution, as recorded in history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: ExecutionOutcome,
    pub rows_read: i64,
    pub rows_written: i64,
    pub rows_skipped: i64,
    pub orphan_bonifications: i64,
    pub error: Option<String>,
}

/// Singleton schedule configuration row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduleRow {
    /// Daily fire time in `HH:MM` 24-hour local form.
    pub hour: String,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_display_roundtrip() {
        let variants = [TaskKind::Manual, TaskKind::Auto, TaskKind::Both];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_kind_gates() {
        assert!(TaskKind::Manual.allows_manual());
        assert!(!TaskKind::Manual.allows_auto());
        assert!(TaskKind::Auto.allows_auto());
        assert!(!TaskKind::Auto.allows_manual());
        assert!(TaskKind::Both.allows_manual());
        assert!(TaskKind::Both.allows_auto());
    }

    #[test]
    fn direction_display_roundtrip() {
        let variants = [
            Direction::General,
            Direction::Up,
            Direction::Down,
            Direction::Internal,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: Direction = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn direction_invalid() {
        let result = "sideways".parse::<Direction>();
        assert!(result.is_err());
    }

    #[test]
    fn run_state_display_roundtrip() {
        let variants = [
            RunState::Pending,
            RunState::Running,
            RunState::Cancelling,
            RunState::Cancelled,
            RunState::Completed,
            RunState::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_state_terminal() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(!RunState::Cancelling.is_terminal());
    }

    #[test]
    fn execution_outcome_roundtrip() {
        let variants = [
            ExecutionOutcome::Success,
            ExecutionOutcome::Failure,
            ExecutionOutcome::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ExecutionOutcome = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn param_operator_serde_spelling() {
        let op: ParamOperator = serde_json::from_str("\"BETWEEN\"").expect("should parse");
        assert_eq!(op, ParamOperator::Between);
        assert_eq!(serde_json::to_string(&ParamOperator::Ne).unwrap(), "\"!=\"");
        assert_eq!(ParamOperator::Like.sql(), "LIKE");
    }

    #[test]
    fn parameter_document_roundtrip() {
        let doc = serde_json::json!([
            {"field": "active", "operator": "=", "value": 1},
            {"field": "region", "operator": "IN", "value": ["N", "S"]},
            {"field": "created", "operator": "BETWEEN", "value": {"from": "2024-01-01", "to": "2024-12-31"}}
        ]);
        let params: Vec<TaskParameter> =
            serde_json::from_value(doc.clone()).expect("should parse");
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].operator, ParamOperator::Eq);
        assert_eq!(params[1].operator, ParamOperator::In);
        assert_eq!(serde_json::to_value(&params).unwrap(), doc);
    }

    #[test]
    fn validation_rules_defaults() {
        let rules: ValidationRules = serde_json::from_str("{}").expect("should parse");
        assert!(rules.required_fields.is_empty());
        assert!(rules.existence_check.is_none());
    }

    #[test]
    fn field_mapping_roundtrip() {
        let mapping = FieldMapping {
            source_table: "CLIENTES".to_owned(),
            target_table: "Clientes".to_owned(),
            source_fields: vec!["ID".to_owned(), "NOMBRE_COMPLETO".to_owned()],
            target_fields: vec!["ClienteID".to_owned(), "Nombre".to_owned()],
            defaults: vec![DefaultValue {
                field: "Origen".to_owned(),
                value: serde_json::json!("EXT"),
            }],
        };
        let json = serde_json::to_string(&mapping).unwrap();
        let back: FieldMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(mapping, back);
    }
}
