//! Control-store pool construction and schema management.

use std::path::Path;

use anyhow::{Context, Result, bail};
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::info;

use crate::config::StoreConfig;

/// Open the control-store pool with the configured tuning.
pub async fn create_pool(config: &StoreConfig) -> Result<PgPool> {
    config
        .pool
        .pg_options()
        .connect(&config.database_url)
        .await
        .with_context(|| {
            format!(
                "failed to connect to control store at {}",
                config.database_url
            )
        })
}

/// Apply pending migrations from the given directory.
///
/// Uses a runtime `Migrator` so that no running database is required at
/// compile time (unlike the `sqlx::migrate!()` macro).
pub async fn run_migrations(pool: &PgPool, migrations_dir: &Path) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(migrations_dir)
        .await
        .with_context(|| {
            format!(
                "failed to load migrations from {}",
                migrations_dir.display()
            )
        })?;
    let known = migrator.iter().count();

    migrator
        .run(pool)
        .await
        .context("failed to run control-store migrations")?;

    info!(migrations = known, "control-store schema is current");
    Ok(())
}

/// Create the control-store database when it does not exist yet.
///
/// Uses a one-off connection to the `postgres` maintenance database on
/// the same server; a pool is overkill for two statements.
pub async fn ensure_database_exists(config: &StoreConfig) -> Result<()> {
    let db_name = config
        .database_name()
        .context("store URL has no database name")?;

    // CREATE DATABASE cannot take a bound parameter, so the name is
    // interpolated and must be vetted first.
    if !is_plain_database_name(db_name) {
        bail!("store database name {db_name:?} contains invalid characters");
    }

    let maintenance_url = config.maintenance_url();
    let mut conn = PgConnection::connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to reach maintenance database at {maintenance_url}"))?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(&mut conn)
            .await
            .context("failed to query pg_database")?;

    if exists {
        info!(db = db_name, "control store database already exists");
    } else {
        conn.execute(format!("CREATE DATABASE {db_name}").as_str())
            .await
            .with_context(|| format!("failed to create database {db_name}"))?;
        info!(db = db_name, "control store database created");
    }

    conn.close().await.ok();
    Ok(())
}

/// Whether a name is safe to interpolate into CREATE DATABASE.
fn is_plain_database_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Return the default path to the migrations directory shipped with
/// `ferry-db`.
///
/// At runtime this resolves relative to the `ferry-db` crate's source tree
/// via the `CARGO_MANIFEST_DIR` compile-time env.
pub fn default_migrations_path() -> &'static Path {
    // CARGO_MANIFEST_DIR is set at *compile* time for the crate being
    // compiled, so this points at crates/ferry-db/.
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_vetting() {
        assert!(is_plain_database_name("ferry"));
        assert!(is_plain_database_name("ferry_test_01"));
        assert!(!is_plain_database_name(""));
        assert!(!is_plain_database_name("ferry; DROP DATABASE x"));
        assert!(!is_plain_database_name("ferry-prod"));
    }

    #[test]
    fn migrations_path_points_into_crate() {
        let path = default_migrations_path();
        assert!(path.ends_with("migrations"));
    }
}
