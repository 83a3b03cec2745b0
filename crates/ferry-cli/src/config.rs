//! Configuration file management for ferry.
//!
//! Provides a TOML-based config file at `~/.config/ferry/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use ferry_core::context::EngineSettings;
use ferry_db::config::{StoreConfig, TransferConfig};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub store: StoreSection,
    pub source: ServerSection,
    pub target: ServerSection,
    #[serde(default)]
    pub engine: EngineSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EngineSection {
    /// Rows per streaming batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wall-clock limit for normal-mode tasks, in seconds.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Wall-clock limit for streaming tasks, in seconds. 0 = unbounded.
    #[serde(default)]
    pub streaming_timeout_secs: u64,
    /// Fail tasks on unresolved bonification references.
    #[serde(default)]
    pub strict_bonification: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            task_timeout_secs: default_task_timeout_secs(),
            streaming_timeout_secs: 0,
            strict_bonification: false,
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_task_timeout_secs() -> u64 {
    300
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the ferry config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/ferry` or `~/.config/ferry`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("ferry");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ferry")
}

/// Return the path to the ferry config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (connection URLs carry secrets).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Fully-resolved runtime configuration.
#[derive(Debug)]
pub struct FerryConfig {
    pub store: StoreConfig,
    pub transfer: TransferConfig,
    pub settings: EngineSettings,
}

impl FerryConfig {
    /// Resolve just the control-store URL (for `db-init`, which needs no
    /// data-plane servers).
    pub fn resolve_store(cli_store_url: Option<&str>) -> StoreConfig {
        let file = load_config().ok();
        let store_url = cli_store_url
            .map(str::to_owned)
            .or_else(|| std::env::var("FERRY_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.store.url.clone()))
            .unwrap_or_else(|| StoreConfig::DEFAULT_URL.to_owned());
        StoreConfig::new(store_url)
    }

    /// Resolve configuration from CLI flags, environment and the config
    /// file.
    ///
    /// Priority per value: CLI flag > env var > config file. The store
    /// URL falls back to a default; source/target URLs have none -- a
    /// transfer engine without servers is a misconfiguration.
    pub fn resolve(
        cli_store_url: Option<&str>,
        cli_source_url: Option<&str>,
        cli_target_url: Option<&str>,
    ) -> Result<Self> {
        let file = load_config().ok();

        let store_url = cli_store_url
            .map(str::to_owned)
            .or_else(|| std::env::var("FERRY_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.store.url.clone()))
            .unwrap_or_else(|| StoreConfig::DEFAULT_URL.to_owned());

        let source_url = cli_source_url
            .map(str::to_owned)
            .or_else(|| std::env::var("FERRY_SOURCE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.source.url.clone()));
        let target_url = cli_target_url
            .map(str::to_owned)
            .or_else(|| std::env::var("FERRY_TARGET_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.target.url.clone()));

        let (Some(source_url), Some(target_url)) = (source_url, target_url) else {
            bail!(
                "source/target server URLs not configured\n\
                 Set FERRY_SOURCE_URL and FERRY_TARGET_URL, or run `ferry init`."
            );
        };

        let engine = file.map(|f| f.engine).unwrap_or_default();
        let settings = EngineSettings {
            batch_size: engine.batch_size,
            task_timeout: Duration::from_secs(engine.task_timeout_secs),
            streaming_timeout: match engine.streaming_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            strict_bonification: engine.strict_bonification,
            ..EngineSettings::default()
        };

        Ok(Self {
            store: StoreConfig::new(store_url),
            transfer: TransferConfig::new(source_url, target_url),
            settings,
        })
    }
}
