#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # fieldnode
//!
//! Unattended controller for a remote, power-constrained SBC: wakes on a
//! schedule, runs configured tasks, exchanges SBD messages and files with
//! a ground station over an Iridium modem, optionally brings up a RUDICS
//! dial-up link with an SSH tunnel, and puts the board back to sleep.
//!
//! All behaviour is driven by a single TOML configuration file:
//!
//! ```text
//! fieldnode --config /etc/fieldnode.toml
//! ```

use clap::Parser;
use tracing::{error, info, warn};

use fieldnode::{config::Config, logging, modem, pidfile::PidFile, sched::Scheduler, tasks, util};

/// Unattended field-node controller.
#[derive(Parser)]
#[command(name = "fieldnode", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long)]
    config: String,
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    // Resolve `~` and environment references in configured paths up front,
    // before anything opens them.
    config.general.pid_file = util::expand_path(&config.general.pid_file).into_owned();
    config.general.mt_destination = util::expand_path(&config.general.mt_destination).into_owned();
    if let Some(directory) = config.logging.directory.take() {
        config.logging.directory = Some(util::expand_path(&directory).into_owned());
    }

    logging::init(&config.logging);

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("Config error: {err}");
        }
        return 1;
    }

    info!("fieldnode v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Modem on {} ({})", config.modem.serial_port, config.modem.modem_type);

    // Breadcrumb for the sleep task's boot-to-wake drift correction.
    tasks::sleep::write_reboot_breadcrumb();

    let _pid_file = match PidFile::acquire(&config.general.pid_file) {
        Ok(pid_file) => pid_file,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    let config = std::sync::Arc::new(config);
    let connection = match modem::connect(&config) {
        Ok(connection) => connection,
        Err(e) => {
            error!("Cannot set up modem connection: {e}");
            return 1;
        }
    };

    let mut scheduler = match Scheduler::new(config.clone(), connection.clone()) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Cannot build schedule: {e}");
            return 1;
        }
    };

    // Pre-planning health checks; these run task bodies, so keep the
    // runtime's event loop out of it.
    let checks = tokio::task::block_in_place(|| scheduler.initial_checks());
    if let Err(e) = checks {
        error!("Failed on an unhealthy initial check, avoiding scheduler startup: {e}");
        return 1;
    }

    // Graceful shutdown on SIGINT/SIGTERM.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
            match sigterm {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    info!("Starting scheduler");
    let code = tokio::select! {
        result = scheduler.run() => {
            match result {
                Ok(()) => 0,
                Err(e) => {
                    error!("Scheduler failed: {e}");
                    1
                }
            }
        }
        () = shutdown => 0,
    };

    // Cleanup: stop supervisors, join the modem worker, release the radio.
    info!("Shutting down...");
    scheduler.stop_tasks();
    connection.shutdown();
    info!("Goodbye");
    code
}
