//! Command-line interface
//!
//! The binary mostly just runs the daemon; the subcommands exist so
//! shell-side tooling and users can locate the config file and data
//! directory without guessing platform conventions.

use crate::config::Config;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "hindsightd",
    version,
    about = "Local command suggestion daemon: observes your shell history and serves ranked completions over a Unix socket"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (the default when no subcommand is given)
    Run,
    /// Print the config file path and exit
    ConfigPath,
    /// Print the data directory and exit
    DataDir,
    /// Print the Unix socket path and exit
    SocketPath,
}

/// Handle informational subcommands. Returns true when one was handled
/// and the process should exit instead of running the daemon.
pub fn handle_cli() -> bool {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Run) => false,
        Some(Command::ConfigPath) => {
            match Config::config_path() {
                Some(path) => println!("{}", path.display()),
                None => eprintln!("no home directory; config file unavailable"),
            }
            true
        }
        Some(Command::DataDir) => {
            let config = Config::load();
            println!("{}", config.daemon.data_dir.display());
            true
        }
        Some(Command::SocketPath) => {
            let config = Config::load();
            println!("{}", config.daemon.socket_path().display());
            true
        }
    }
}
