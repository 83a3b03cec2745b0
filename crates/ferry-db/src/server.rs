//! Data-plane server pools.
//!
//! One pool per configured server (source, target). Transfer code
//! addresses servers through [`ServerKey`] and never holds a raw URL.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::RwLock;

use crate::config::TransferConfig;

/// Which configured server a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerKey {
    Source,
    Target,
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

/// Stored column metadata for one target column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    /// `information_schema` data type name (e.g. `character varying`).
    pub sql_type: String,
    /// Character length cap, when the type carries one.
    pub max_length: Option<i32>,
    /// Numeric precision, when the type carries one.
    pub precision: Option<i32>,
    /// Numeric scale, when the type carries one.
    pub scale: Option<i32>,
    pub nullable: bool,
}

impl ColumnMeta {
    /// Whether the column is a single-bit / boolean column for the purpose
    /// of boolean-string coercion.
    pub fn is_boolean(&self) -> bool {
        matches!(self.sql_type.as_str(), "boolean" | "bit")
    }

    pub fn is_character(&self) -> bool {
        matches!(
            self.sql_type.as_str(),
            "character varying" | "character" | "text"
        )
    }

    pub fn is_date_like(&self) -> bool {
        self.sql_type.starts_with("timestamp") || self.sql_type == "date"
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self.sql_type.as_str(),
            "smallint" | "integer" | "bigint" | "numeric" | "real" | "double precision"
        )
    }
}

type ColumnCache = HashMap<(ServerKey, String), Arc<HashMap<String, ColumnMeta>>>;

/// Pooled connections to the source and target servers, plus a
/// per-(server, table) cache of introspected column metadata.
pub struct ServerPools {
    source: PgPool,
    target: PgPool,
    column_cache: RwLock<ColumnCache>,
}

impl ServerPools {
    /// Build both data-plane pools.
    ///
    /// Pools connect lazily; reachability is checked by [`Self::ping`]
    /// before a transfer starts, not at construction.
    pub fn connect(config: &TransferConfig) -> Result<Self> {
        let source = connect_one(&config.source_url, config)?;
        let target = connect_one(&config.target_url, config)?;
        Ok(Self {
            source,
            target,
            column_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Build from already-connected pools (tests point both at scratch
    /// databases on a shared instance).
    pub fn from_pools(source: PgPool, target: PgPool) -> Self {
        Self {
            source,
            target,
            column_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self, key: ServerKey) -> &PgPool {
        match key {
            ServerKey::Source => &self.source,
            ServerKey::Target => &self.target,
        }
    }

    /// Check out a connection. Raw `sqlx::Error` is returned so callers
    /// can classify pool exhaustion vs. network failure.
    pub async fn acquire(
        &self,
        key: ServerKey,
    ) -> std::result::Result<PoolConnection<Postgres>, sqlx::Error> {
        self.pool(key).acquire().await
    }

    /// Begin a transaction. The handle stays bound to one physical
    /// connection until commit or rollback.
    pub async fn begin(
        &self,
        key: ServerKey,
    ) -> std::result::Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool(key).begin().await
    }

    /// Liveness probe against one server.
    pub async fn ping(&self, key: ServerKey) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(self.pool(key))
            .await
            .with_context(|| format!("health check against {key} server failed"))?;
        Ok(())
    }

    /// Introspect column metadata for a table, cached per (server, table).
    ///
    /// `table` may be schema-qualified (`sales.orders`); unqualified names
    /// resolve against the connection's current schema.
    pub async fn column_types(
        &self,
        key: ServerKey,
        table: &str,
    ) -> Result<Arc<HashMap<String, ColumnMeta>>> {
        let cache_key = (key, table.to_owned());
        if let Some(cached) = self.column_cache.read().await.get(&cache_key) {
            return Ok(Arc::clone(cached));
        }

        let (schema, bare_table) = split_table_name(table);

        let rows: Vec<(String, String, Option<i32>, Option<i32>, Option<i32>, String)> =
            sqlx::query_as(
                "SELECT column_name::text, data_type::text, \
                        character_maximum_length, \
                        numeric_precision::int4, numeric_scale::int4, \
                        is_nullable::text \
                 FROM information_schema.columns \
                 WHERE table_schema = COALESCE($1, current_schema()) \
                   AND table_name = $2 \
                 ORDER BY ordinal_position",
            )
            .bind(schema)
            .bind(bare_table)
            .fetch_all(self.pool(key))
            .await
            .with_context(|| format!("failed to introspect columns of {table} on {key}"))?;

        if rows.is_empty() {
            anyhow::bail!("table {table} not found on {key} server");
        }

        let meta: HashMap<String, ColumnMeta> = rows
            .into_iter()
            .map(|(name, sql_type, max_length, precision, scale, nullable)| {
                (
                    name,
                    ColumnMeta {
                        sql_type,
                        max_length,
                        precision,
                        scale,
                        nullable: nullable == "YES",
                    },
                )
            })
            .collect();

        let meta = Arc::new(meta);
        self.column_cache
            .write()
            .await
            .insert(cache_key, Arc::clone(&meta));
        Ok(meta)
    }

    pub async fn table_exists(&self, key: ServerKey, table: &str) -> Result<bool> {
        let (schema, bare_table) = split_table_name(table);
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables \
             WHERE table_schema = COALESCE($1, current_schema()) \
               AND table_name = $2)",
        )
        .bind(schema)
        .bind(bare_table)
        .fetch_one(self.pool(key))
        .await
        .with_context(|| format!("failed to check existence of {table} on {key}"))?;
        Ok(exists)
    }

    /// Drop cached metadata (tests mutate scratch schemas between runs).
    pub async fn invalidate_columns(&self, key: ServerKey, table: &str) {
        self.column_cache
            .write()
            .await
            .remove(&(key, table.to_owned()));
    }

    pub async fn close(&self) {
        self.source.close().await;
        self.target.close().await;
    }
}

fn connect_one(url: &str, config: &TransferConfig) -> Result<PgPool> {
    config
        .pool
        .pg_options()
        // Dead connections on a remote server must be evicted, not
        // handed to a transfer mid-pipeline.
        .test_before_acquire(true)
        .connect_lazy(url)
        .with_context(|| format!("invalid server URL {url}"))
}

fn split_table_name(table: &str) -> (Option<&str>, &str) {
    match table.split_once('.') {
        Some((schema, bare)) => (Some(schema), bare),
        None => (None, table),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_qualified_name() {
        assert_eq!(split_table_name("sales.orders"), (Some("sales"), "orders"));
        assert_eq!(split_table_name("orders"), (None, "orders"));
    }

    #[test]
    fn column_meta_kind_checks() {
        let varchar = ColumnMeta {
            sql_type: "character varying".to_owned(),
            max_length: Some(50),
            precision: None,
            scale: None,
            nullable: true,
        };
        assert!(varchar.is_character());
        assert!(!varchar.is_boolean());

        let bit = ColumnMeta {
            sql_type: "boolean".to_owned(),
            max_length: None,
            precision: None,
            scale: None,
            nullable: false,
        };
        assert!(bit.is_boolean());

        let ts = ColumnMeta {
            sql_type: "timestamp without time zone".to_owned(),
            max_length: None,
            precision: None,
            scale: None,
            nullable: true,
        };
        assert!(ts.is_date_like());

        let num = ColumnMeta {
            sql_type: "numeric".to_owned(),
            max_length: None,
            precision: Some(12),
            scale: Some(2),
            nullable: true,
        };
        assert!(num.is_numeric());
    }

    #[test]
    fn server_key_display() {
        assert_eq!(ServerKey::Source.to_string(), "source");
        assert_eq!(ServerKey::Target.to_string(), "target");
    }
}
