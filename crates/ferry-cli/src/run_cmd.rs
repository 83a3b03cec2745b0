//! `ferry run`: the scheduler daemon.
//!
//! Exit codes: 0 clean shutdown, 2 scheduler failed to start, 3 database
//! unavailable at startup, 4 runtime fatal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use ferry_core::scheduler;
use ferry_db::server::ServerKey;

use crate::config::FerryConfig;

pub async fn run_daemon(resolved: &FerryConfig) {
    // Databases must answer before the scheduler becomes eligible.
    let ctx = match crate::build_context(resolved).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("database unavailable: {e:#}");
            std::process::exit(3);
        }
    };
    for key in [ServerKey::Source, ServerKey::Target] {
        if let Err(e) = ctx.servers.ping(key).await {
            eprintln!("{key} server unavailable: {e:#}");
            std::process::exit(3);
        }
    }

    // Graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let registry = Arc::clone(&ctx.registry);
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            registry.cancel_all("process shutting down");
            cancel_clone.cancel();
        }
    });

    println!("ferry scheduler running (Ctrl+C to stop)");
    match scheduler::run_scheduler(ctx, cancel).await {
        Ok(()) => {
            println!("Scheduler stopped.");
        }
        Err(e) => {
            // Reconciliation runs before the first tick; a failure there
            // means the scheduler never started.
            eprintln!("scheduler failed: {e:#}");
            std::process::exit(2);
        }
    }
}
