//! MOSW binary entry point
//!
//! Dispatches to daemon mode or subcommands based on CLI arguments.

use clap::Parser;
use color_eyre::eyre::Result;
use mosw::{cli::Args, cli::Command, commands, config::Config, daemon, logging};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        // No subcommand - show status
        None => {
            logging::init_cli();
            commands::status(false).await
        }

        // Daemon handles its own logging (file vs stderr)
        Some(Command::Daemon { foreground }) => {
            let config = Config::load()?;
            daemon::run(config, foreground).await
        }

        // Hybrid command (works with or without daemon)
        Some(Command::Status { json }) => {
            logging::init_cli();
            commands::status(json).await
        }

        // IPC-based command (requires daemon)
        Some(Command::Shutdown) => {
            logging::init_cli();
            commands::shutdown().await
        }

        // Local commands (no daemon needed)
        Some(Command::ListMonitors { json }) => {
            logging::init_cli();
            commands::list_monitors(json)
        }

        Some(Command::ListSinks { json }) => {
            logging::init_cli();
            commands::list_sinks(json)
        }

        Some(Command::Map {
            monitor,
            sink,
            force,
        }) => {
            logging::init_cli();
            commands::map_monitor(&monitor, &sink, force)
        }

        Some(Command::Unmap { monitor }) => {
            logging::init_cli();
            commands::unmap_monitor(&monitor)
        }

        Some(Command::Validate) => {
            logging::init_cli();
            let config = Config::load()?;
            config.print_summary();
            Ok(())
        }
    }
}
