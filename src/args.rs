//! Command line arguments.

use clap::Parser;
use tracing::Level;

/// A program that allows you to mine timed drops on Twitch.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "twitch-drops-miner", version)]
pub struct Args {
    /// Increase logging verbosity (repeatable, up to -vvvv)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Start minimized to tray notifications only
    #[arg(long)]
    pub tray: bool,

    /// Also write logs to a file
    #[arg(long)]
    pub log: bool,

    /// Show raw websocket frames in the log
    #[arg(long = "debug-ws")]
    pub debug_ws: bool,

    /// Show raw GQL requests and responses in the log
    #[arg(long = "debug-gql")]
    pub debug_gql: bool,
}

impl Args {
    /// Base logging level derived from the number of `-v` occurrences.
    pub fn logging_level(&self) -> Level {
        match self.verbose {
            0 => Level::ERROR,
            1 => Level::WARN,
            2 => Level::INFO,
            3 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    /// Per-module filter directives for the tracing subscriber.
    ///
    /// The websocket and GQL modules are noisy at debug level, so they only
    /// reach it through their dedicated flags (or full `-vvvv`).
    pub fn filter_directives(&self) -> String {
        let base = self.logging_level();
        let ws = if self.debug_ws {
            Level::DEBUG
        } else if self.verbose >= 4 {
            Level::INFO
        } else {
            base
        };
        let gql = if self.debug_gql {
            Level::DEBUG
        } else if self.verbose >= 4 {
            Level::INFO
        } else {
            base
        };
        format!(
            "{base},twitch_drops_miner::ws={ws},twitch_drops_miner::http={gql}",
            base = base.to_string().to_lowercase(),
            ws = ws.to_string().to_lowercase(),
            gql = gql.to_string().to_lowercase(),
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
