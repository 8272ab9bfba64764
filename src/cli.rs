use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{config::Config, error::Error};

/// The command line interface for port keel.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// How much to log on stderr. `RUST_LOG` takes precedence.
    #[arg(long, global = true, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// Also log (at debug level) to daily rotated files in this directory.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the configured discoveries for a while, then list the ports they found.
    List {
        /// How long to let discoveries report, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        wait: u64,
    },

    /// Print ports as they come and go, until interrupted.
    Watch,

    /// Open a port with the monitor configured for its protocol.
    ///
    /// Standard input is sent to the port, the port's output is written to standard output.
    Monitor {
        /// The port's protocol, e.g. `serial`.
        protocol: String,

        /// The port's address, e.g. `/dev/ttyACM0`.
        address: String,

        /// A setting to apply before opening, e.g. `baudrate=115200`. May be repeated.
        #[arg(short, long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,
}

fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected `key=value`, got `{arg}`"))
}

/// Print the requested example.
pub fn handle_example(example: Examples) -> Result<(), Error> {
    match example {
        Examples::Config => println!("{}", Config::example().serialize_pretty()?),
    }

    Ok(())
}

/// Listens for SIGHUP on unix. Elsewhere it never fires.
///
/// Create it once and keep it: a signal arriving between two calls to
/// [`Hangup::recv`] is not lost.
#[derive(Debug)]
pub struct Hangup {
    #[cfg(unix)]
    signal: tokio::signal::unix::Signal,
}

impl Hangup {
    /// Start listening.
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            signal: signal(SignalKind::hangup())?,
        })
    }

    /// Start listening.
    #[cfg(not(unix))]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next hangup.
    #[cfg(unix)]
    pub async fn recv(&mut self) {
        self.signal.recv().await;
    }

    /// Wait for the next hangup.
    #[cfg(not(unix))]
    pub async fn recv(&mut self) {
        futures::future::pending::<()>().await
    }
}
