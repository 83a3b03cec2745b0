mod config;
mod exec_cmds;
mod run_cmd;
mod serve_cmd;
mod task_cmds;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ferry_core::context::AppContext;
use ferry_core::service::{CallerIdentity, TaskService};
use ferry_db::pool;
use ferry_db::server::ServerPools;

use config::FerryConfig;

#[derive(Parser)]
#[command(name = "ferry", about = "Database transfer task engine")]
struct Cli {
    /// Control-store URL (overrides FERRY_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Source server URL (overrides FERRY_SOURCE_URL env var)
    #[arg(long, global = true)]
    source_url: Option<String>,

    /// Target server URL (overrides FERRY_TARGET_URL env var)
    #[arg(long, global = true)]
    target_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a ferry config file (no database required)
    Init {
        /// Control-store PostgreSQL URL
        #[arg(long, default_value = "postgresql://localhost:5432/ferry")]
        store_url: String,
        /// Source server PostgreSQL URL
        #[arg(long)]
        source_url: String,
        /// Target server PostgreSQL URL
        #[arg(long)]
        target_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the control-store database (create + migrate)
    DbInit,
    /// Task definition management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Execute a task and stream its progress
    Execute {
        /// Task name or ID
        task: String,
        /// Do not wait for completion
        #[arg(long)]
        no_follow: bool,
    },
    /// Cancel a running task
    Cancel {
        /// Task name or ID
        task: String,
        /// Abort in-flight operations instead of waiting for a boundary
        #[arg(long)]
        force: bool,
        /// Reason recorded with the cancellation
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show execution history for a task
    History {
        /// Task name or ID
        task: String,
        /// Maximum entries to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show linked-group membership for a task
    Linking {
        /// Task name or ID
        task: String,
    },
    /// Schedule management
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Run the scheduler daemon
    Run,
    /// Serve the HTTP API with per-task SSE progress streams
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8093)]
        port: u16,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// List all tasks
    List,
    /// Show one task definition and status
    Show {
        /// Task name or ID
        task: String,
    },
    /// Create or update a task from a TOML file
    Upsert {
        /// Path to the task TOML file
        file: String,
    },
    /// Delete a task
    Delete {
        /// Task name or ID
        task: String,
    },
}

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Show the daily schedule
    Show,
    /// Set the daily fire time
    Set {
        /// Fire time in HH:MM 24-hour local form
        hour: String,
        /// Disable the schedule without losing the hour
        #[arg(long)]
        disable: bool,
    },
}

/// Execute the `ferry init` command: write the config file.
fn cmd_init(store_url: &str, source_url: &str, target_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        store: config::StoreSection {
            url: store_url.to_owned(),
        },
        source: config::ServerSection {
            url: source_url.to_owned(),
        },
        target: config::ServerSection {
            url: target_url.to_owned(),
        },
        engine: config::EngineSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  store.url  = {store_url}");
    println!("  source.url = {source_url}");
    println!("  target.url = {target_url}");
    println!();
    println!("Next: run `ferry db-init` to create and migrate the control store.");

    Ok(())
}

/// Execute the `ferry db-init` command: create database and run migrations.
async fn cmd_db_init(store: &ferry_db::config::StoreConfig) -> anyhow::Result<()> {
    println!("Initializing ferry control store...");

    pool::ensure_database_exists(store).await?;
    let db_pool = pool::create_pool(store).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    db_pool.close().await;
    println!("ferry db-init complete.");
    Ok(())
}

/// Build the engine context from resolved configuration.
async fn build_context(resolved: &FerryConfig) -> anyhow::Result<Arc<AppContext>> {
    let store = pool::create_pool(&resolved.store)
        .await
        .context("control store unavailable")?;
    let servers = ServerPools::connect(&resolved.transfer)?;
    Ok(AppContext::new(store, servers, resolved.settings.clone()))
}

/// Caller identity for CLI-invoked operations.
fn cli_caller() -> CallerIdentity {
    let user = std::env::var("USER").unwrap_or_else(|_| "cli".to_owned());
    CallerIdentity(format!("cli:{user}"))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{e:#}");
        // Anything that reaches here without an explicit exit is a
        // configuration problem.
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        database_url,
        source_url,
        target_url,
        command,
    } = cli;
    let urls = ConnectionFlags {
        database_url,
        source_url,
        target_url,
    };

    match command {
        Commands::Init {
            store_url,
            source_url,
            target_url,
            force,
        } => {
            cmd_init(&store_url, &source_url, &target_url, force)?;
        }
        Commands::DbInit => {
            let store = FerryConfig::resolve_store(urls.database_url.as_deref());
            cmd_db_init(&store).await?;
        }
        Commands::Task { command } => {
            let service = urls.service().await?;
            task_cmds::run_task_command(command, &service, &cli_caller()).await?;
        }
        Commands::Execute { task, no_follow } => {
            let service = urls.service().await?;
            exec_cmds::run_execute(&service, &cli_caller(), &task, no_follow).await?;
        }
        Commands::Cancel {
            task,
            force,
            reason,
        } => {
            let service = urls.service().await?;
            exec_cmds::run_cancel(&service, &cli_caller(), &task, force, reason.as_deref()).await?;
        }
        Commands::History { task, limit } => {
            let service = urls.service().await?;
            exec_cmds::run_history(&service, &cli_caller(), &task, limit).await?;
        }
        Commands::Linking { task } => {
            let service = urls.service().await?;
            exec_cmds::run_linking(&service, &cli_caller(), &task).await?;
        }
        Commands::Schedule { command } => {
            let service = urls.service().await?;
            match command {
                ScheduleCommands::Show => {
                    let row = service.get_schedule(&cli_caller()).await?;
                    println!(
                        "Daily schedule: {} ({})",
                        row.hour,
                        if row.enabled { "enabled" } else { "disabled" }
                    );
                }
                ScheduleCommands::Set { hour, disable } => {
                    let row = service.set_schedule(&cli_caller(), &hour, !disable).await?;
                    println!(
                        "Daily schedule set to {} ({})",
                        row.hour,
                        if row.enabled { "enabled" } else { "disabled" }
                    );
                }
            }
        }
        Commands::Run => {
            let resolved = urls.resolve()?;
            run_cmd::run_daemon(&resolved).await;
        }
        Commands::Serve { bind, port } => {
            let resolved = urls.resolve()?;
            serve_cmd::run_serve(&resolved, &bind, port).await;
        }
    }

    Ok(())
}

/// Connection flags shared by every command.
struct ConnectionFlags {
    database_url: Option<String>,
    source_url: Option<String>,
    target_url: Option<String>,
}

impl ConnectionFlags {
    fn resolve(&self) -> anyhow::Result<FerryConfig> {
        FerryConfig::resolve(
            self.database_url.as_deref(),
            self.source_url.as_deref(),
            self.target_url.as_deref(),
        )
    }

    async fn service(&self) -> anyhow::Result<TaskService> {
        let resolved = self.resolve()?;
        let ctx = build_context(&resolved).await?;
        Ok(TaskService::new(ctx))
    }
}
