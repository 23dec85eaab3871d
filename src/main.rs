//! htrelay binary: configuration, logging, signals, and the forwarder loop
//!
//! # Usage
//!
//! ```bash
//! # Forward with the default config file (/etc/htrelay.conf)
//! htrelay
//!
//! # Explicit config file
//! htrelay -c /etc/htrelay.conf
//!
//! # Legacy form: forward straight to a target IP with defaults
//! htrelay 192.168.192.100
//! ```

use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::error;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use htrelay::constants::DEFAULT_CONFIG_PATH;
use htrelay::{Forwarder, ForwarderConfig, Result};

/// Transparent RDP port forwarder with a hybrid UDP/TCP transport
#[derive(Parser, Debug)]
#[command(name = "htrelay", version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Target IP address (legacy form; the config file may override it)
    target_ip: Option<IpAddr>,
}

/// Raised by the signal handler, observed between loop iterations
static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn request_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only touches an atomic flag, which is
    // async-signal-safe.
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn load_config(args: &Args) -> ForwarderConfig {
    // Diagnostics from the loader go through a bootstrap subscriber; the
    // real one is installed afterwards, once log_file is known.
    let bootstrap = tracing_subscriber::fmt().with_env_filter(env_filter()).finish();
    tracing::subscriber::with_default(bootstrap, || {
        let mut config = ForwarderConfig::default();
        // Legacy positional target is applied first; an existing config
        // file takes precedence over it.
        if let Some(target_ip) = args.target_ip {
            config.target_ip = target_ip;
        }
        let path = args.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        config.apply_file(&path);
        config
    })
}

fn init_logging(config: &ForwarderConfig) -> Result<()> {
    match &config.log_file {
        Some(path) => {
            let file = File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stdout.and(Mutex::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();
        }
    }
    Ok(())
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args);
    init_logging(&config)?;
    install_signal_handlers()?;

    let mut forwarder = Forwarder::new(config)?;
    forwarder.run(&STOP)
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The subscriber may not be up yet for early failures.
            error!("fatal: {}", e);
            eprintln!("htrelay: {}", e);
            ExitCode::FAILURE
        }
    }
}
