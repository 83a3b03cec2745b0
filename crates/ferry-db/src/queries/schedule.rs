//! Database query functions for the singleton `schedule_config` row.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::ScheduleRow;

/// Read the schedule configuration.
///
/// The singleton row is seeded by the initial migration, so a missing row
/// means the store was never migrated.
pub async fn get_schedule(pool: &PgPool) -> Result<ScheduleRow> {
    let row = sqlx::query_as::<_, ScheduleRow>(
        "SELECT hour, enabled, updated_at FROM schedule_config WHERE id",
    )
    .fetch_optional(pool)
    .await
    .context("failed to fetch schedule config")?;

    row.context("schedule_config row missing; run migrations first")
}

/// Update the daily fire time and enabled flag.
pub async fn set_schedule(pool: &PgPool, hour: &str, enabled: bool) -> Result<ScheduleRow> {
    let row = sqlx::query_as::<_, ScheduleRow>(
        "UPDATE schedule_config SET hour = $1, enabled = $2, updated_at = now() \
         WHERE id \
         RETURNING hour, enabled, updated_at",
    )
    .bind(hour)
    .bind(enabled)
    .fetch_one(pool)
    .await
    .context("failed to update schedule config")?;

    Ok(row)
}
