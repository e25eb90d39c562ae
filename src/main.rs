//! mixtty - terminal volume control for PulseAudio
//!
//! Per-stream and per-device levels over PulseAudio's D-Bus control
//! interface, with rules to cap, pin or hide individual items.

mod bridge;
mod config;
mod error;
mod mixer;
mod session;
mod ui;

use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use bridge::{Bridge, StopOutcome};
use config::{Cli, Config, Options};
use error::AppError;
use mixer::Registry;
use session::{Command, DbusConnector, Session, SessionConfig, Update};

/// Messages in flight per bridge direction
const BRIDGE_CAPACITY: usize = 64;

/// How long the Session thread gets to wind down on exit
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("mixtty: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<(), AppError> {
    let config = Config::load(cli)?;
    init_logging(&config.options);

    log::info!("Starting mixtty");
    if let Some(path) = &config.source {
        log::info!("Using configuration from {}", path.display());
    }

    let rules = Arc::new(config.rule_engine()?);
    let options = config.options.clone();

    // Start the Session thread
    let (bridge, endpoint) = Bridge::<Command, Update>::spawn(BRIDGE_CAPACITY, move |end| {
        let registry = Registry::new(rules, options.scale(), options.naming());
        let connector = Box::new(DbusConnector::new(options.encoding));
        let session = Session::new(connector, registry, SessionConfig::default(), end.waker());
        session::run(session, end);
    })?;

    let result = ui::run(&endpoint, &config.options);

    if bridge.stop(STOP_TIMEOUT) == StopOutcome::TimedOut {
        log::warn!("Leaving the Session thread behind");
    }
    log::info!("Exiting");
    result
}

/// Log to stderr when asked to, otherwise to a file: stderr belongs to the
/// terminal UI.
fn init_logging(options: &Options) {
    let level = if options.debug { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if !options.verbose && !options.debug {
        let file = dirs::cache_dir()
            .map(|d| d.join("mixtty"))
            .and_then(|dir| {
                std::fs::create_dir_all(&dir).ok()?;
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("mixtty.log"))
                    .ok()
            });
        let target: Box<dyn std::io::Write + Send> = match file {
            Some(file) => Box::new(file),
            None => Box::new(std::io::sink()),
        };
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.init();
}
