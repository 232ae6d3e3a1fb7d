// tools/slcan_cli/main.rs
//
// Command-line front end: list serial ports, dump bus traffic, send a frame.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use slcan_driver::io::transport::list_serial_ports;
use slcan_driver::logging::{init_file_logging, stop_file_logging};
use slcan_driver::{tlog, IoError, SlcanConfig, SlcanDriver};

fn parse_can_id(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|_| format!("Invalid CAN ID '{}'", s))
}

#[derive(Parser, Debug)]
#[command(name = "slcan_cli", about = "Talk to an slcan USB-CAN adapter", long_about = None)]
struct Cli {
    /// Serial port of the adapter (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// CAN bit rate in bit/s
    #[arg(short, long, global = true)]
    bitrate: Option<u32>,

    /// Serial baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write the log to a timestamped file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available serial ports
    Ports,
    /// Print received frames
    Dump {
        /// One JSON object per line
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Stop after this many frames
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// Send one frame
    Send {
        /// Identifier in hex (e.g. 123 or 0x1ABCDEF0)
        #[arg(value_parser = parse_can_id)]
        id: u32,
        /// Payload in hex, up to 8 bytes (e.g. DEADBEEF)
        #[arg(default_value = "")]
        data: String,
        /// Use a 29-bit identifier
        #[arg(short, long, default_value_t = false)]
        extended: bool,
    },
}

fn build_config(cli: &Cli) -> Result<SlcanConfig, IoError> {
    let mut config = match (&cli.config, &cli.port) {
        (Some(path), _) => SlcanConfig::load(path)?,
        (None, Some(port)) => SlcanConfig::new(port.clone()),
        (None, None) => {
            return Err(IoError::configuration(
                "No serial port given (use --port or --config)",
            ))
        }
    };
    if let Some(port) = &cli.port {
        config.port = port.clone();
    }
    if let Some(bitrate) = cli.bitrate {
        config.bitrate = bitrate;
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }
    config.validate()?;
    Ok(config)
}

fn list_ports() -> Result<(), IoError> {
    let ports = list_serial_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let description = [port.manufacturer, port.product]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        println!("{}\t{}\t{}", port.port_name, port.port_type, description);
    }
    Ok(())
}

fn dump(config: &SlcanConfig, json: bool, count: Option<usize>) -> Result<(), IoError> {
    let mut driver = SlcanDriver::start(config)?;
    let mut received = 0usize;

    while count.map_or(true, |n| received < n) {
        match driver.receive(Duration::from_secs(1)) {
            Ok(Some(frame)) => {
                received += 1;
                if json {
                    match serde_json::to_string(&frame) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tlog!("[slcan] Could not serialise frame: {}", e),
                    }
                } else {
                    println!("{:>14.6}  {}", frame.ts_monotonic().unwrap_or(0.0), frame);
                }
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() || e == IoError::SessionDead => return Err(e),
            Err(e) => tlog!("[slcan] Receive error: {}", e),
        }
    }

    driver.close()
}

fn send(config: &SlcanConfig, id: u32, data: &str, extended: bool) -> Result<(), IoError> {
    let payload = hex::decode(data)
        .map_err(|e| IoError::invalid_frame(format!("Invalid payload '{}': {}", data, e)))?;
    let mut driver = SlcanDriver::start(config)?;
    driver.send(id, &payload, extended)?;
    // The stop request queues behind the frame, so closing flushes it out
    driver.close()
}

fn run(cli: &Cli) -> Result<(), IoError> {
    match &cli.command {
        Command::Ports => list_ports(),
        Command::Dump { json, count } => dump(&build_config(cli)?, *json, *count),
        Command::Send { id, data, extended } => send(&build_config(cli)?, *id, data, *extended),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(dir) = &cli.log_dir {
        if let Err(e) = init_file_logging(dir) {
            eprintln!("Could not start file logging in {}: {}", dir.display(), e);
        }
    }

    let result = run(&cli);
    stop_file_logging();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
