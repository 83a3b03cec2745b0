use std::env;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

/// Tuning knobs for a connection pool.
///
/// Shared by the control store and the data-plane servers; each side
/// carries its own instance so the store backing the API and scheduler
/// can be provisioned independently of the transfer pools.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Smallest number of connections kept warm.
    pub min_connections: u32,
    /// Hard cap on open connections.
    pub max_connections: u32,
    /// How long `acquire` waits before giving up.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are reaped.
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl PoolSettings {
    /// Defaults for the control store.
    ///
    /// The store serves the HTTP surface and the scheduler at the same
    /// time, so it gets more headroom than a transfer pool.
    pub fn control_store() -> Self {
        Self {
            max_connections: 8,
            idle_timeout: Duration::from_secs(600),
            ..Self::default()
        }
    }

    /// Pool options with these settings applied.
    pub fn pg_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .min_connections(self.min_connections)
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
    }
}

/// Configuration for the control store: connection URL plus pool tuning.
///
/// The URL resolves from `FERRY_DATABASE_URL` when built via
/// [`StoreConfig::from_env`], with a localhost fallback.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Full PostgreSQL connection URL.
    pub database_url: String,
    /// Pool tuning for the store.
    pub pool: PoolSettings,
}

impl StoreConfig {
    /// Fallback URL when nothing is configured.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/ferry";

    /// Build a config from an explicit URL with store pool defaults.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            pool: PoolSettings::control_store(),
        }
    }

    /// Build a config from `FERRY_DATABASE_URL`, falling back to
    /// [`Self::DEFAULT_URL`].
    pub fn from_env() -> Self {
        match env::var("FERRY_DATABASE_URL") {
            Ok(url) => Self::new(url),
            Err(_) => Self::new(Self::DEFAULT_URL),
        }
    }

    /// Replace the pool tuning.
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Split the URL into the server part and the database name.
    ///
    /// `None` when there is no non-empty trailing path segment.
    fn split_url(&self) -> Option<(&str, &str)> {
        let slash = self.database_url.rfind('/')?;
        let name = &self.database_url[slash + 1..];
        if name.is_empty() {
            return None;
        }
        Some((&self.database_url[..slash], name))
    }

    /// The database name named by the URL, when one is present.
    pub fn database_name(&self) -> Option<&str> {
        self.split_url().map(|(_, name)| name)
    }

    /// URL of the `postgres` maintenance database on the same server,
    /// used to create the store database when it is absent.
    pub fn maintenance_url(&self) -> String {
        match self.split_url() {
            Some((server, _)) => format!("{server}/postgres"),
            None => self.database_url.clone(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Connection URLs for the two data-plane servers.
///
/// The source server holds the data being extracted; the target server
/// receives down-transfers. Internal transfers read and write the source.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Source server connection URL.
    pub source_url: String,
    /// Target server connection URL.
    pub target_url: String,
    /// Pool tuning shared by both servers.
    pub pool: PoolSettings,
}

impl TransferConfig {
    /// Build a config from `FERRY_SOURCE_URL` / `FERRY_TARGET_URL`.
    ///
    /// Both variables must be set; transfer tasks cannot run without
    /// knowing where the data lives.
    pub fn from_env() -> anyhow::Result<Self> {
        let source_url = env::var("FERRY_SOURCE_URL")
            .map_err(|_| anyhow::anyhow!("FERRY_SOURCE_URL is not set"))?;
        let target_url = env::var("FERRY_TARGET_URL")
            .map_err(|_| anyhow::anyhow!("FERRY_TARGET_URL is not set"))?;
        Ok(Self {
            source_url,
            target_url,
            pool: PoolSettings::default(),
        })
    }

    /// Build a config from explicit URLs.
    pub fn new(source_url: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            target_url: target_url.into(),
            pool: PoolSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_defaults() {
        let cfg = StoreConfig::new(StoreConfig::DEFAULT_URL);
        assert_eq!(cfg.database_url, "postgresql://localhost:5432/ferry");
        // The store ships with its own provisioning, not the transfer
        // pool defaults.
        assert_eq!(cfg.pool.max_connections, 8);
        assert_eq!(cfg.pool.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn store_pool_override() {
        let cfg = StoreConfig::new("postgresql://localhost:5432/ferry").with_pool(PoolSettings {
            max_connections: 2,
            ..PoolSettings::default()
        });
        assert_eq!(cfg.pool.max_connections, 2);
    }

    #[test]
    fn url_splitting() {
        let cfg = StoreConfig::new("postgresql://localhost:5432/mydb");
        assert_eq!(cfg.database_name(), Some("mydb"));
        assert_eq!(cfg.maintenance_url(), "postgresql://localhost:5432/postgres");

        // A URL with no database segment yields no name and is passed
        // through as its own maintenance URL.
        let bare = StoreConfig::new("postgresql://localhost:5432/");
        assert_eq!(bare.database_name(), None);
        assert_eq!(bare.maintenance_url(), "postgresql://localhost:5432/");
    }

    #[test]
    fn transfer_config_explicit() {
        let cfg = TransferConfig::new(
            "postgresql://src:5432/erp",
            "postgresql://dst:5432/warehouse",
        );
        assert_eq!(cfg.source_url, "postgresql://src:5432/erp");
        assert_eq!(cfg.target_url, "postgresql://dst:5432/warehouse");
        assert_eq!(cfg.pool.max_connections, 5);
    }
}
