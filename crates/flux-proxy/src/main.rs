//! CLI entry point: parses arguments, wires up logging, installs the
//! shutdown signal handlers, and runs the forwarding loop (C6) until a
//! signal or a fatal error ends it.

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clap::{CommandFactory, Parser};
use flux_network::{Config, ConnectionManager, LogLevel};
use tracing_subscriber::EnvFilter;

/// Non-blocking TCP forwarding proxy with optional per-side authenticated
/// encryption.
#[derive(Parser, Debug)]
#[command(name = "flux-proxy", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Encrypt the client-facing (downstream) side.
    #[arg(short = 'i')]
    encrypt_downstream: bool,

    /// Encrypt the server-facing (upstream) side.
    #[arg(short = 'o')]
    encrypt_upstream: bool,

    /// Print usage and exit non-zero.
    #[arg(short = 'h')]
    help: bool,

    /// Increase log verbosity (repeatable: -v for debug, -vv for I/O tracing).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    bind_addr: String,
    bind_port: u16,
    server_addr: String,
    server_port: u16,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if cli.help {
        let _ = Cli::command().print_help();
        println!();
        return ExitCode::FAILURE;
    }

    let config = Config::new(
        cli.bind_addr,
        cli.bind_port,
        cli.server_addr,
        cli.server_port,
        cli.encrypt_downstream,
        cli.encrypt_upstream,
        log_level_from_verbosity(cli.verbose),
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter_str())),
        )
        .init();

    let mut manager = match ConnectionManager::new(config) {
        Ok(manager) => manager,
        Err(err) => {
            tracing::error!(%err, "failed to start proxy");
            return ExitCode::FAILURE;
        }
    };

    let run_flag = Arc::new(AtomicBool::new(true));
    install_shutdown_handlers(&run_flag);

    let status = match manager.run(&run_flag) {
        Ok(status) => status,
        Err(err) => {
            tracing::error!(%err, "event loop exited with a fatal error");
            1
        }
    };

    manager.teardown();

    if status == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

/// Maps `-v` occurrence count to a [`LogLevel`]: none is `Info`, one is
/// `Debug`, two or more is `Io` (per-byte wire tracing). `RUST_LOG`, when
/// set, takes precedence over this default at the subscriber.
fn log_level_from_verbosity(count: u8) -> LogLevel {
    match count {
        0 => LogLevel::Info,
        1 => LogLevel::Debug,
        _ => LogLevel::Io,
    }
}

/// Registers SIGINT/SIGTERM handlers that flip `run_flag` to false. Async-
/// signal-safety is preserved: the handler body is a single atomic store.
fn install_shutdown_handlers(run_flag: &Arc<AtomicBool>) {
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let flag = Arc::clone(run_flag);
        unsafe {
            signal_hook::low_level::register(sig, move || {
                flag.store(false, Ordering::Relaxed);
            })
            .expect("failed to install signal handler");
        }
    }
}
