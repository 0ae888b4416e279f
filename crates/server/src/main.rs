//! RP6 remote-control command line.
//!
//! Two modes:
//!
//! - **serve**: bridges the robot's serial console (`--serial`) and/or a
//!   simulated robot (`--simulate`) to any number of TCP clients.
//! - **console**: line-oriented client; prints every received message and
//!   sends typed lines as robot commands.
//!
//! Logging goes through `tracing`. `--debug` lowers the default level to
//! debug; `RUST_LOG` overrides either default.

mod console;
mod scripts;
mod serve;
mod sim;

use clap::{Parser, Subcommand};
use rp6_remote_core::{CpuUsage, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT, RP6_CLOCK_HZ};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rp6-remote", version, about = "RP6 robot remote-control server and console")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bridge the robot (serial or simulated) to TCP clients
    Serve(ServeArgs),
    /// Connect to a server and exchange console text
    Console(ConsoleArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// TCP port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Serial device of the robot (already configured, e.g. with stty)
    #[arg(long, value_name = "PATH")]
    pub serial: Option<PathBuf>,

    /// Run a simulated robot on a virtual AVR clock
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub simulate: bool,

    /// Simulated clock speed in Hz
    #[arg(long, value_name = "HZ", default_value_t = RP6_CLOCK_HZ)]
    pub clock_speed: u64,

    /// Host CPU budget of the simulation: low, normal, high or max
    #[arg(long, default_value = "normal")]
    pub cpu_usage: CpuUsage,

    /// Main loop poll interval in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 5)]
    pub poll_ms: u64,

    /// Restore the simulated clock from this save state
    #[arg(long, value_name = "FILE")]
    pub load_state: Option<PathBuf>,

    /// Write the simulated clock to this save state on shutdown
    #[arg(long, value_name = "FILE")]
    pub save_state: Option<PathBuf>,

    /// Largest accepted frame body in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame: u32,

    /// Debug logging
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub debug: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ConsoleArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Debug logging
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub debug: bool,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => {
            init_logging(args.debug);
            serve::run(args)
        }
        Command::Console(args) => {
            init_logging(args.debug);
            console::run(args)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["rp6-remote", "serve", "--simulate"]).unwrap();
        let Command::Serve(args) = cli.command else { panic!("expected serve") };
        assert_eq!(args.port, 40000);
        assert_eq!(args.bind, "0.0.0.0");
        assert!(args.simulate);
        assert_eq!(args.clock_speed, 8_000_000);
        assert_eq!(args.cpu_usage, CpuUsage::Normal);
        assert_eq!(args.max_frame, 16 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_usage_parsed() {
        let cli = Cli::try_parse_from(["rp6-remote", "serve", "--cpu-usage", "max"]).unwrap();
        let Command::Serve(args) = cli.command else { panic!("expected serve") };
        assert_eq!(args.cpu_usage, CpuUsage::Max);
        assert!(Cli::try_parse_from(["rp6-remote", "serve", "--cpu-usage", "warp"]).is_err());
    }

    #[test]
    fn test_console_args() {
        let cli = Cli::try_parse_from(["rp6-remote", "console", "--host", "10.0.0.2", "--port", "4100"]).unwrap();
        let Command::Console(args) = cli.command else { panic!("expected console") };
        assert_eq!((args.host.as_str(), args.port), ("10.0.0.2", 4100));
    }
}
