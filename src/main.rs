//! Twitch Drops Miner
//!
//! Watches live streams on your behalf and claims timed drops for the games
//! you care about.

pub mod args;
pub mod auth;
pub mod constants;
pub mod error;
pub mod http;
pub mod lock;
pub mod miner;
pub mod models;
pub mod scoring;
pub mod settings;
pub mod ui;
pub mod utils;
pub mod ws;

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use args::Args;
use constants::{LOCK_PATH, LOG_PATH};
use error::MinerError;
use lock::InstanceLock;
use miner::Miner;
use settings::Settings;
use ui::{CloseSignal, Ui};

// Exit codes: 0 normal, 1 fatal error, 3 another instance running,
// 4 settings load failure.
const EXIT_FATAL: u8 = 1;
const EXIT_ALREADY_RUNNING: u8 = 3;
const EXIT_SETTINGS: u8 = 4;

fn init_logging(args: &Args) {
    let filter = EnvFilter::new(args.filter_directives());
    if args.log {
        match std::fs::File::create(LOG_PATH) {
            Ok(file) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(file)
                    .with_ansi(false)
                    .init();
                return;
            }
            Err(e) => eprintln!("Could not open {LOG_PATH}: {e}"),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> u8 {
    // presence of the lock file locks the instance; the guard releases it
    // on every exit path
    let _lock = match InstanceLock::acquire(LOCK_PATH) {
        Ok(lock) => lock,
        Err(_) => {
            eprintln!("Another instance is already running");
            return EXIT_ALREADY_RUNNING;
        }
    };

    let close = CloseSignal::new();
    {
        let close = close.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
            close.request_close();
        });
    }

    // the main run loop: only ReloadRequest restarts it
    loop {
        let settings = match Settings::load() {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("{e}");
                return EXIT_SETTINGS;
            }
        };
        let ui = Ui::new(close.clone(), settings.tray_notifications || args.tray);
        let miner = match Miner::new(settings, ui.clone(), close.clone()) {
            Ok(miner) => miner,
            Err(e) => {
                eprintln!("Startup failed: {e}");
                return EXIT_FATAL;
            }
        };
        let outcome = miner.run().await;
        // save state before deciding how to exit
        if let Ok(mut settings) = miner.settings.lock() {
            let _ = settings.save(false);
        }
        match outcome {
            Ok(()) | Err(MinerError::ExitRequest) => return 0,
            Err(MinerError::ReloadRequest) => continue,
            Err(MinerError::CaptchaRequired) => {
                ui.print("The platform demands a captcha; please log in from a browser first");
                return EXIT_FATAL;
            }
            Err(e) => {
                tracing::error!("Fatal: {e}");
                eprintln!("Fatal: {e}");
                return EXIT_FATAL;
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);
    ExitCode::from(run(args).await)
}
