//! Command-line interface definitions
//!
//! Uses clap for argument parsing with derive macros.

use clap::{Parser, Subcommand};

/// MOSW - Monitor Output Switcher
///
/// Switch the default audio output to follow the monitor holding the focused window.
#[derive(Parser)]
#[command(name = "mosw")]
#[command(version)]
#[command(
    about = "Monitor Output Switcher - Switch the default audio output to follow the focused monitor"
)]
#[command(after_help = "\
BEHAVIOR:
  - The daemon polls which monitor holds the focused window
  - Each monitor can be mapped to one PipeWire output (sink)
  - When focus moves to a mapped monitor, its output becomes the default
  - Monitors without a mapping leave the current output alone
  - The output is only switched when it differs from the last one applied

DAEMON MANAGEMENT:
  mosw daemon              Run the daemon (logs to ~/.local/share/mosw/daemon.log)
  mosw daemon --foreground Run with logs to stderr
  mosw status              Current output and daemon status (or just: mosw)
  mosw shutdown            Gracefully stop the daemon

MAPPINGS:
  mosw list-monitors       Attached monitors and their mapped outputs
  mosw list-sinks          Available PipeWire outputs
  mosw map 2 \"Speakers\"    Map monitor 2 to the output named \"Speakers\"
  mosw unmap 2             Remove the mapping for monitor 2
  mosw validate            Validate the config file

  MONITOR may be a list index, a connector (DP-1), a monitor name or a full key.

FILES:
  ~/.config/mosw/config.toml     Settings
  ~/.config/mosw/mappings.json   Monitor -> output mappings

IPC SOCKET:
  $XDG_RUNTIME_DIR/mosw.sock (or /tmp/mosw-$UID.sock)")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon (follows focus and switches audio)
    Daemon {
        /// Run in foreground with logs to stderr
        #[arg(short, long)]
        foreground: bool,
    },

    /// Show the current output and daemon status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Gracefully shutdown the daemon
    Shutdown,

    /// List attached monitors and their mapped outputs
    ListMonitors {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List available PipeWire outputs
    ListSinks {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Map a monitor to an output
    Map {
        /// Monitor index, connector, name or key (see list-monitors)
        monitor: String,

        /// Output description (see list-sinks)
        sink: String,

        /// Save even if the output is not currently available
        #[arg(long)]
        force: bool,
    },

    /// Remove the output mapping of a monitor
    Unmap {
        /// Monitor index, connector, name or key (see list-monitors)
        monitor: String,
    },

    /// Validate config file (local, no daemon needed)
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_map() {
        let args = Args::try_parse_from(["mosw", "map", "DP-1", "Speakers", "--force"]).unwrap();
        match args.command {
            Some(Command::Map {
                monitor,
                sink,
                force,
            }) => {
                assert_eq!(monitor, "DP-1");
                assert_eq!(sink, "Speakers");
                assert!(force);
            }
            _ => panic!("expected map command"),
        }
    }

    #[test]
    fn test_no_subcommand_is_status() {
        let args = Args::try_parse_from(["mosw"]).unwrap();
        assert!(args.command.is_none());
    }
}
