//! proctor CLI - per-session forward proxy gateway
//!
//! This is the CLI binary that runs the proctor-proxy gateway and manages
//! its lease database.

mod cli;
mod config;
mod output;

use clap::Parser;
use cli::{Cli, Commands, NotifyArgs, ReleaseArgs, ServeArgs};
use proctor_proxy::directory;
use proctor_proxy::lease::LeaseRegistry;
use proctor_proxy::reload::{NotificationQueue, NotificationTarget, PolicyAction};
use proctor_proxy::{GatewayConfig, ProxyError, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("proctor: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_serve(args, &cli.config, cli.database),
        Commands::Notify(args) => run_notify(args, &cli.config, cli.database),
        Commands::Leases => run_leases(&cli.config, cli.database),
        Commands::Release(args) => run_release(args, &cli.config, cli.database),
    }
}

fn load_config(path: &Path, port: Option<u16>, database: Option<PathBuf>) -> Result<GatewayConfig> {
    let mut config = config::load(path)?;
    config::apply_overrides(&mut config, port, database);
    Ok(config)
}

fn open_registry(config: &GatewayConfig) -> Result<LeaseRegistry> {
    LeaseRegistry::open(&config.database, config.port_range)
}

/// Run the gateway until Ctrl-C
fn run_serve(
    args: ServeArgs,
    config_path: &Path,
    database: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path, args.port, database)?;
    config.validate()?;
    let registry = open_registry(&config)?;
    let directory = directory::from_config(&config.directory)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ProxyError::Config(format!("Failed to start runtime: {}", e)))?;

    rt.block_on(async {
        let summary = config.clone();
        let handle = proctor_proxy::start(config, directory, registry).await?;
        output::print_serving(&summary, handle.port);

        tokio::signal::ctrl_c().await?;
        info!("Interrupted, shutting down");
        handle.stop().await;
        Ok::<(), ProxyError>(())
    })
}

/// Append a policy notification to the queue
fn run_notify(
    args: NotifyArgs,
    config_path: &Path,
    database: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path, None, database)?;
    let registry = open_registry(&config)?;
    let queue = NotificationQueue::new(registry.connection())?;

    let target = match (args.session, args.assessment) {
        (Some(session), _) => NotificationTarget::Session(session),
        (None, Some(assessment)) => NotificationTarget::Assessment(assessment),
        (None, None) => {
            return Err(ProxyError::Config(
                "either --session or --assessment is required".to_string(),
            ))
        }
    };
    let action = PolicyAction::from(args.action);
    let id = queue.notify(&target, action)?;
    output::print_queued(id, &target.to_string(), action.as_str());
    Ok(())
}

/// List port leases
fn run_leases(config_path: &Path, database: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path, None, database)?;
    let registry = open_registry(&config)?;
    output::print_leases(&registry.leases()?, chrono::Utc::now());
    Ok(())
}

/// Deactivate or delete a session's lease
fn run_release(
    args: ReleaseArgs,
    config_path: &Path,
    database: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(config_path, None, database)?;
    let registry = open_registry(&config)?;

    if args.delete {
        let port = registry
            .delete_lease(&args.session)?
            .ok_or_else(|| ProxyError::LeaseNotFound(format!("session {}", args.session)))?;
        output::print_deleted(&args.session, port);
        return Ok(());
    }

    let lease = registry
        .lease_for_session(&args.session)?
        .ok_or_else(|| ProxyError::LeaseNotFound(format!("session {}", args.session)))?;
    let seconds = registry.release(lease.port)?;
    output::print_released(&args.session, lease.port, seconds);
    Ok(())
}
