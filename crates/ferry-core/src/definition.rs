//! TOML format for task definition files.
//!
//! These types map directly to the `task.toml` on-disk format and are
//! deserialized via `serde` + the `toml` crate. Linked and chained tasks
//! are authored by name and resolved to IDs at upsert time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use ferry_db::models::{
    BonificationConfig, DefaultValue, Direction, FieldMapping, ParamOperator, PostUpdateMapping,
    TaskKind, TaskParameter, TransferMode, ValidationRules,
};
use ferry_db::queries::tasks::{self as task_db, TaskDefinition};

use crate::error::EngineError;

/// Top-level structure of a `task.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    pub task: TaskBody,
}

/// The `[task]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskBody {
    /// Unique task name.
    pub name: String,
    /// Trigger kind: "manual", "auto", or "both".
    pub kind: String,
    /// Transfer orientation: "general", "up", "down", or "internal".
    pub direction: String,
    /// Result handling: "normal" or "streaming".
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Parameterized extraction SELECT.
    pub query: String,
    #[serde(default)]
    pub parameters: Vec<ParameterToml>,
    #[serde(default)]
    pub clear_before_insert: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_mapping: Option<FieldMappingToml>,
    /// Destination table for internal transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationToml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_update_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_update_mapping: Option<PostUpdateMappingToml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_group: Option<String>,
    #[serde(default)]
    pub linked_execution_order: i32,
    /// Names of directly-linked tasks (used when no group is set).
    #[serde(default)]
    pub linked_tasks: Vec<String>,
    /// Names of tasks chained after success (down transfers only).
    #[serde(default)]
    pub next_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bonification: Option<BonificationToml>,
}

/// A `[[task.parameters]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterToml {
    pub field: String,
    /// One of: =, !=, <, <=, >, >=, LIKE, IN, BETWEEN.
    pub operator: String,
    pub value: toml::Value,
}

/// The `[task.field_mapping]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldMappingToml {
    pub source_table: String,
    pub target_table: String,
    pub source_fields: Vec<String>,
    pub target_fields: Vec<String>,
    #[serde(default)]
    pub defaults: Vec<DefaultToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultToml {
    pub field: String,
    pub value: toml::Value,
}

/// The `[task.validation]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationToml {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existence_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existence_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostUpdateMappingToml {
    pub view_key: String,
    pub table_key: String,
}

/// The `[task.bonification]` table; field names mirror the stored config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BonificationToml {
    pub source_table: String,
    pub order_field: String,
    pub line_order_field: String,
    pub indicator_field: String,
    pub indicator_value: String,
    pub regular_article_field: String,
    pub reference_field: String,
    pub line_number_field: String,
    pub line_reference_field: String,
    pub quantity_field: String,
}

fn default_mode() -> String {
    "normal".to_owned()
}

fn default_active() -> bool {
    true
}

/// Parse a task definition file.
pub fn parse_task_toml(contents: &str) -> Result<TaskToml> {
    toml::from_str(contents).context("failed to parse task definition TOML")
}

fn json_value(value: &toml::Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn parse_operator(s: &str) -> Result<ParamOperator, EngineError> {
    serde_json::from_value(serde_json::Value::String(s.to_owned())).map_err(|_| {
        EngineError::InvalidConfig(format!("unknown parameter operator {s:?}"))
    })
}

impl TaskToml {
    /// Convert to the stored definition, resolving linked/next task names
    /// against the control store.
    pub async fn into_definition(self, pool: &PgPool) -> Result<TaskDefinition, EngineError> {
        let body = self.task;

        let kind: TaskKind = body
            .kind
            .parse()
            .map_err(|e| EngineError::InvalidConfig(format!("{e}")))?;
        let direction: Direction = body
            .direction
            .parse()
            .map_err(|e| EngineError::InvalidConfig(format!("{e}")))?;
        let mode: TransferMode = body
            .mode
            .parse()
            .map_err(|e| EngineError::InvalidConfig(format!("{e}")))?;

        let mut parameters = Vec::with_capacity(body.parameters.len());
        for p in &body.parameters {
            parameters.push(TaskParameter {
                field: p.field.clone(),
                operator: parse_operator(&p.operator)?,
                value: json_value(&p.value),
            });
        }

        let field_mapping = body.field_mapping.map(|m| FieldMapping {
            source_table: m.source_table,
            target_table: m.target_table,
            source_fields: m.source_fields,
            target_fields: m.target_fields,
            defaults: m
                .defaults
                .iter()
                .map(|d| DefaultValue {
                    field: d.field.clone(),
                    value: json_value(&d.value),
                })
                .collect(),
        });

        let validation_rules = body.validation.map(|v| ValidationRules {
            required_fields: v.required_fields,
            existence_check: match (v.existence_table, v.existence_key) {
                (Some(table), Some(key)) if !table.is_empty() => {
                    Some(ferry_db::models::ExistenceCheck { table, key })
                }
                _ => None,
            },
        });

        let linked_tasks = resolve_names(pool, &body.linked_tasks).await?;
        let next_tasks = resolve_names(pool, &body.next_tasks).await?;

        Ok(TaskDefinition {
            name: body.name,
            kind,
            direction,
            mode,
            active: body.active,
            query: body.query,
            parameters,
            clear_before_insert: body.clear_before_insert,
            field_mapping,
            target_table: body.target_table,
            validation_rules,
            post_update_query: body.post_update_query,
            post_update_mapping: body.post_update_mapping.map(|m| PostUpdateMapping {
                view_key: m.view_key,
                table_key: m.table_key,
            }),
            linked_group: body.linked_group,
            linked_execution_order: body.linked_execution_order,
            linked_tasks,
            // Derived from the post-update at validation time.
            is_coordinator: false,
            next_tasks,
            bonification: body.bonification.map(|b| BonificationConfig {
                source_table: b.source_table,
                order_field: b.order_field,
                line_order_field: b.line_order_field,
                indicator_field: b.indicator_field,
                indicator_value: b.indicator_value,
                regular_article_field: b.regular_article_field,
                reference_field: b.reference_field,
                line_number_field: b.line_number_field,
                line_reference_field: b.line_reference_field,
                quantity_field: b.quantity_field,
            }),
        })
    }
}

async fn resolve_names(pool: &PgPool, names: &[String]) -> Result<Vec<Uuid>, EngineError> {
    let mut ids = Vec::with_capacity(names.len());
    for name in names {
        let task = task_db::get_task_by_name(pool, name)
            .await
            .map_err(EngineError::Internal)?
            .ok_or_else(|| EngineError::NotFound(format!("task {name:?}")))?;
        ids.push(task.id);
    }
    Ok(ids)
}
