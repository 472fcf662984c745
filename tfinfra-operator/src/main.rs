use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod commands;
mod config;
mod controller;
mod health;

use cli::{Args, Mode};

/// Initialize tracing:
/// 1. Console output (stdout) - what `kubectl logs` shows
/// 2. Optional file output (`TFINFRA_LOG_FILE`) - flat text for local runs
fn initialize_tracing() -> Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,\
         tfinfra_operator=debug,\
         tfinfra_actuator=debug,\
         kube_runtime=info,\
         hyper=warn"
            .into()
    });

    let stdout_layer = fmt::layer().with_target(true);

    let file_layer = match std::env::var("TFINFRA_LOG_FILE") {
        Ok(path) => {
            let path = Path::new(&path);
            let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .context("TFINFRA_LOG_FILE must name a file")?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

            let file_appender = tracing_appender::rolling::never(dir, file_name);
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

            // Dropping the guard stops file logging; it lives as long as the process
            std::mem::forget(guard);

            Some(fmt::layer().with_writer(file_writer).with_ansi(false))
        }
        Err(_) => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let args = Args::parse();

    match args.mode {
        Mode::Crd => commands::crd::print_crd(),
        Mode::Run {
            namespace,
            health_port,
        } => {
            initialize_tracing()?;
            commands::run::run_operator(namespace, health_port).await
        }
    }
}
