//! # LEEP Device Binary
//!
//! Command-line access to a LEEP device: identity, diagnostics and
//! register reads and writes.
//!
//! # Usage
//!
//! ```bash
//! # Device identity and register map
//! leep_device 192.168.1.20 info
//!
//! # Full session report
//! leep_device localhost:50006 show 3
//!
//! # Read a register as 16-bit elements
//! leep_device 192.168.1.20 read trace_odata --width 16
//!
//! # Write two words at offset 4
//! leep_device -c device.toml 192.168.1.20 write scratch --offset 4 0x10 17
//! ```

#![deny(warnings)]

use clap::{Parser, Subcommand};
use leep_common::config::ConfigLoader;
use leep_common::rom;
use leep_device::{
    ChannelWaiter, Device, DeviceConfig, DeviceError, DeviceResult, Direction, Elements,
    QueueError, Waiter, registry,
};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

/// LEEP Device - register access over UDP
#[derive(Parser, Debug)]
#[command(name = "leep_device")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Register access to LEEP devices")]
#[command(long_about = None)]
struct Args {
    /// Device address: host, host:port, a.b.c.d[:port] or [v6][:port]
    peer: String,

    /// Device configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Local bind address
    #[arg(long)]
    bind: Option<String>,

    /// Per-frame reply timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// How long to wait for the connection and for each request
    #[arg(long, default_value_t = 5000)]
    wait_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print device identity and register map
    Info,
    /// Print the session report
    Show {
        /// Detail level, 0 to 3
        #[arg(default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=3))]
        level: u8,
    },
    /// List registers with address and size
    List,
    /// Read a register
    Read {
        /// Register name
        register: String,
        /// Element width in bits (16 or 32)
        #[arg(long, default_value_t = 32)]
        width: u32,
    },
    /// Write words to a register
    Write {
        /// Register name
        register: String,
        /// First word offset
        #[arg(long, default_value_t = 0)]
        offset: usize,
        /// Values, decimal or 0x-prefixed hex
        #[arg(required = true, value_parser = parse_word)]
        values: Vec<u32>,
    },
}

fn main() {
    if let Err(e) = run() {
        error!("leep_device failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    let mut config = match &args.config {
        Some(path) => DeviceConfig::load(path)?,
        None => DeviceConfig::new("leep"),
    };
    config.peer = Some(args.peer.clone());
    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.session.timeout_ms = timeout_ms;
    }

    let device = registry::get_or_create_device(config)?;
    info!("Device {} on {}", device.name(), device.local_addr());
    let result = execute(&device, &args);
    device.shutdown();
    result
}

fn execute(device: &Device, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let wait = Duration::from_millis(args.wait_ms);
    device.wait_connected(wait)?;

    match &args.command {
        Command::Info => {
            let blob = rom::decompress(&device.info_blob())?;
            let info: serde_json::Value = serde_json::from_slice(&blob)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Show { level } => print!("{}", device.show(*level)),
        Command::List => {
            for name in device.register_names() {
                let Some(snap) = device.register(&name) else {
                    continue;
                };
                match &snap.info {
                    Some(info) => println!(
                        "{:<24} {:#08x} {:>6} {:?}",
                        name,
                        info.base_addr,
                        info.word_count(),
                        info.access
                    ),
                    None => println!("{name:<24} unmapped"),
                }
            }
        }
        Command::Read { register, width } => {
            complete(device, register, wait, |d| d.try_queue(register, Direction::Read))?;
            match device.read_elements(register, *width)? {
                Elements::U16(values) => print_values(values.iter().map(|&v| u32::from(v)), 4),
                Elements::U32(values) => print_values(values.iter().copied(), 8),
            }
        }
        Command::Write {
            register,
            offset,
            values,
        } => {
            complete(device, register, wait, |d| d.write(register, *offset, values))?;
            println!("Wrote {} words to {}", values.len(), register);
        }
    }
    Ok(())
}

/// Run `start` with a waiter attached and block for its completion.
fn complete(
    device: &Device,
    register: &str,
    wait: Duration,
    start: impl FnOnce(&Device) -> Result<(), QueueError>,
) -> DeviceResult<()> {
    let (tx, rx) = mpsc::channel();
    let waiter = ChannelWaiter::new(tx);
    let id = waiter.id();
    device.attach(register, Box::new(waiter));
    if let Err(e) = start(device) {
        device.detach(register, id);
        return Err(e.into());
    }
    let (_, completion) = rx
        .recv_timeout(wait)
        .map_err(|_| DeviceError::WaitTimeout(register.to_string()))?;
    if completion.is_ok() {
        Ok(())
    } else {
        Err(DeviceError::Failed {
            register: register.to_string(),
            status: completion.status,
        })
    }
}

fn print_values(values: impl Iterator<Item = u32>, digits: usize) {
    for (index, value) in values.enumerate() {
        println!("{index:>6}: {value:#0width$x}", width = digits + 2);
    }
}

fn parse_word(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid value '{s}': {e}"))
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose { Level::DEBUG } else { Level::WARN };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
