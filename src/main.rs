// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! wag command line.
//!
//! `wag start` runs the gateway; `wag devices` talks to a running gateway
//! over its control socket.

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use wag::config::{DEFAULT_CONFIG_PATH, DEFAULT_CONTROL_SOCKET};
use wag::{
    AuditLogger, BackgroundTasks, Config, ControlClient, ControlError, ControlServer, DeviceAddress,
    DeviceStore, Gateway, GatewayError, JsonFileStore, MemoryNetwork, NetworkLayer, SystemNetwork,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - the command was executed and failed
    pub const ERROR: i32 = 1;
    /// Usage error - invalid command line arguments
    pub const USAGE: i32 = 64;
    /// Service unavailable - the gateway is not running
    pub const SERVICE_UNAVAILABLE: i32 = 69;
    /// Configuration error
    pub const CONFIG: i32 = 78;
}

/// wag - zero-trust access gateway for WireGuard
#[derive(Parser)]
#[command(name = "wag")]
#[command(version = VERSION)]
#[command(about = "Zero-trust access gateway for WireGuard")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Track enforcement in memory only; do not touch firewall rules
        #[arg(long)]
        noiptables: bool,
    },

    /// Manage devices on a running gateway
    ///
    /// Examples:
    ///   wag devices --list
    ///   wag devices --sessions
    ///   wag devices --device 10.2.0.5 --lock
    Devices(DevicesArgs),
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["del", "list", "sessions", "reset", "lock"])
))]
struct DevicesArgs {
    /// Control socket of the running gateway
    #[arg(long, default_value = DEFAULT_CONTROL_SOCKET)]
    socket: PathBuf,

    /// Device address to act on
    #[arg(long)]
    device: Option<String>,

    /// Remove the device and revoke its access
    #[arg(long)]
    del: bool,

    /// List devices
    #[arg(long)]
    list: bool,

    /// List active sessions
    #[arg(long)]
    sessions: bool,

    /// Reset the failed-attempt counter
    #[arg(long)]
    reset: bool,

    /// Lock the device
    #[arg(long)]
    lock: bool,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // RUST_LOG=
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn print_error(message: impl std::fmt::Display) {
    eprintln!("{} {}", "error:".red().bold(), message);
}

fn main() {
    let cli = Cli::parse();

    let verbosity = match cli.command {
        // The daemon reports lifecycle events at info by default.
        Commands::Start { .. } => cli.verbose.max(1),
        Commands::Devices(_) => cli.verbose,
    };
    init_logging(verbosity);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            print_error(format!("failed to create async runtime: {}", e));
            std::process::exit(exit_codes::ERROR);
        }
    };

    let code = match cli.command {
        Commands::Start { config, noiptables } => match runtime.block_on(run_start(config, noiptables)) {
            Ok(code) => code,
            Err(e) => {
                print_error(format!("{:#}", e));
                exit_codes::CONFIG
            }
        },
        Commands::Devices(args) => runtime.block_on(run_devices(args)),
    };
    std::process::exit(code);
}

// =============================================================================
// devices
// =============================================================================

async fn run_devices(args: DevicesArgs) -> i32 {
    let client = ControlClient::new(&args.socket);

    let result = if args.list {
        client.list_devices().await
    } else if args.sessions {
        client.sessions().await
    } else {
        let Some(device) = args.device.as_deref().filter(|d| !d.trim().is_empty()) else {
            print_error(GatewayError::Validation("--device must be supplied for this action".into()).one_line());
            return exit_codes::USAGE;
        };
        if let Err(e) = device.parse::<DeviceAddress>() {
            print_error(e.one_line());
            return exit_codes::USAGE;
        }

        if args.del {
            client.block(device).await
        } else if args.reset {
            client.reset(device).await
        } else {
            client.lock(device).await
        }
    };

    match result {
        Ok(body) => {
            println!("{}", body);
            exit_codes::SUCCESS
        }
        Err(ControlError::Remote(e)) => {
            print_error(e.one_line());
            exit_codes::ERROR
        }
        Err(e @ ControlError::NotRunning(_)) => {
            print_error(e);
            exit_codes::SERVICE_UNAVAILABLE
        }
        Err(e) => {
            print_error(e);
            exit_codes::ERROR
        }
    }
}

// =============================================================================
// start
// =============================================================================

async fn run_start(config_path: PathBuf, noiptables: bool) -> Result<i32> {
    let config = Config::load(&config_path)?;

    let store = JsonFileStore::open(&config.database_location)
        .with_context(|| format!("Cannot open device store {}", config.database_location.display()))?;

    let audit = match &config.audit_log {
        Some(path) => AuditLogger::with_file(path)
            .with_context(|| format!("Cannot open audit log {}", path.display()))?,
        None => AuditLogger::in_memory(),
    };

    let network: Arc<dyn NetworkLayer> = if noiptables {
        tracing::warn!("Running with --noiptables: enforcement is tracked but not applied");
        Arc::new(MemoryNetwork::new())
    } else {
        Arc::new(SystemNetwork::new(&config.wireguard.dev_name))
    };

    let gateway = Arc::new(Gateway::new(
        &config,
        Arc::new(store) as Arc<dyn DeviceStore>,
        network,
        Arc::new(audit),
    ));

    // Claim the socket before touching the network, so a second instance
    // leaves the running one's rules alone.
    let server = match ControlServer::bind(&config.control_socket, Arc::clone(&gateway)).await {
        Ok(server) => server,
        Err(e @ ControlError::AlreadyRunning(_)) => {
            print_error(e);
            return Ok(exit_codes::ERROR);
        }
        Err(e) => {
            return Err(e).with_context(|| {
                format!("Failed to bind control socket {}", config.control_socket.display())
            });
        }
    };

    if let Err(e) = gateway.setup_network().await {
        if let Err(teardown) = gateway.teardown().await {
            tracing::error!(error = %teardown, "Teardown after failed setup also failed");
        }
        return Err(e).context("Failed to set up network enforcement");
    }

    match gateway.reconcile().await {
        Ok(report) => tracing::info!(%report, "Initial reconcile complete"),
        Err(e) => tracing::error!(error = %e, "Initial reconcile failed; the periodic pass will retry"),
    }

    let server_task = tokio::spawn(server.run());
    let background = BackgroundTasks::spawn(Arc::clone(&gateway), &config);

    tracing::info!(
        socket = %config.control_socket.display(),
        dev = %config.wireguard.dev_name,
        lockout = config.lockout,
        "wag started"
    );

    let signal = shutdown_signal().await;

    gateway.request_shutdown();
    background.join().await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Control server stopped with an error"),
        Err(e) => tracing::error!(error = %e, "Control server task panicked"),
    }

    let mut code = exit_codes::SUCCESS;
    if let Err(e) = gateway.teardown().await {
        tracing::error!(error = %e, "Teardown failed");
        code = exit_codes::ERROR;
    }
    signal?;
    tracing::info!("wag stopped");
    Ok(code)
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
        }
    }
    Ok(())
}
