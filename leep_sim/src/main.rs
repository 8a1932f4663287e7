//! # LEEP Simulator Binary
//!
//! Serves a simulated LEEP device described by a JSON register map.
//!
//! # Usage
//!
//! ```bash
//! # Plain register store on the default port
//! leep_sim regmap.json
//!
//! # Waveform logic, listening on all interfaces, with initial values
//! leep_sim -H 0.0.0.0:50006 -L hires regmap.json initial.txt
//!
//! # Slow replies for timeout testing
//! leep_sim -S 0.5 -d -v regmap.json
//! ```

#![deny(warnings)]

use clap::Parser;
use leep_common::config::{ConfigLoader, PeerAddress, SimulatorConfig};
use leep_sim::{InitialValues, LogicKind, SimImage, Simulator, build_logic};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// LEEP Simulator - protocol-compatible stand-in for a LEEP device
#[derive(Parser, Debug)]
#[command(name = "leep_sim")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Protocol-compatible LEEP device simulator")]
#[command(long_about = None)]
struct Args {
    /// JSON register map
    json: PathBuf,

    /// Initial values file (hex "address value" per line)
    initials: Option<PathBuf>,

    /// Interface and port to listen on
    #[arg(short = 'H', long = "host", default_value = "127.0.0.1:50006")]
    host: String,

    /// Log every register access
    #[arg(short, long)]
    debug: bool,

    /// Derived-data logic
    #[arg(short = 'L', long, value_enum, default_value_t = LogicKind::None)]
    logic: LogicKind,

    /// TOML file with custom waveform rules (hires logic)
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Delay before each reply, in seconds
    #[arg(short = 'S', long, default_value_t = 0.0)]
    slowdown: f64,

    /// Place the ROM at 0x4000 (16K words) behind an empty 2K ROM
    #[arg(short = 'B', long)]
    big_rom: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json_logs: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("Simulator failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("LEEP Simulator v{} starting...", env!("CARGO_PKG_VERSION"));

    let endpoint = resolve_endpoint(&args.host)?;
    if !(0.0..=3600.0).contains(&args.slowdown) {
        return Err(format!("-S value out of range: {}", args.slowdown).into());
    }

    let json = std::fs::read_to_string(&args.json)?;
    let mut image = SimImage::from_json(&json, args.big_rom)?;

    if let Some(path) = &args.initials {
        let initial = InitialValues::load(path)?;
        let applied = image.apply_initial(&initial);
        info!("Applied {} of {} initial values", applied, initial.len());
    }

    let rules = match &args.rules {
        Some(path) => {
            let config = SimulatorConfig::load(path)?;
            config.validate()?;
            config.rules
        }
        None => Vec::new(),
    };
    let logic = build_logic(args.logic, &image, &rules)?;

    if args.debug {
        for reg in image.iter() {
            info!(
                "  {}\t{:x}:{:x}",
                reg.name,
                reg.base,
                reg.base as usize + reg.storage.len() - 1
            );
        }
    }

    let sim = Simulator::bind(endpoint, image, logic)?;
    sim.set_debug(args.debug);
    sim.set_slowdown(Duration::from_secs_f64(args.slowdown));

    let running = sim.running_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    info!("Running");
    sim.exec()?;
    info!("Done");
    Ok(())
}

/// Resolve `iface[:port]`, defaulting the port.
fn resolve_endpoint(host: &str) -> Result<SocketAddr, Box<dyn std::error::Error>> {
    let peer: PeerAddress = host.parse()?;
    if let Some(addr) = peer.socket_addr() {
        return Ok(addr);
    }
    peer.lookup_string()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("Unable to resolve '{host}'").into())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose || args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
