//! CLI for the Infinite Noise TRNG.

mod commands;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "infnoise")]
#[command(about = "infnoise: driver for the Infinite Noise TRNG")]
#[command(version = infnoise_core::VERSION)]
struct Cli {
    #[command(flatten)]
    device: DeviceArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Device and health settings shared by every command.
#[derive(Args)]
struct DeviceArgs {
    /// JSON config file; flags below override its fields
    #[arg(long, global = true)]
    config: Option<String>,

    /// Expected raw entropy in bits per bit
    #[arg(long, global = true)]
    target_entropy: Option<f64>,

    /// Allowed relative deviation from the target (0.05 = 5%)
    #[arg(long, global = true)]
    tolerance: Option<f64>,

    /// Raw bits observed before the health bounds are enforced
    #[arg(long, global = true)]
    window: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream whitened bytes (or raw comparator bits) to stdout
    Stream {
        /// Output format: raw binary or hex text
        #[arg(long, default_value = "raw", value_parser = ["raw", "hex"])]
        format: String,

        /// Bytes to write (0 = until interrupted)
        #[arg(long, default_value = "0")]
        bytes: usize,

        /// Skip whitening and emit decoded comparator bits
        #[arg(long)]
        raw: bool,
    },

    /// Sample raw bits through the health monitor and report the estimate
    Health {
        /// Raw bits to sample
        #[arg(long, default_value = "160000")]
        bits: u64,

        /// Write the report as JSON
        #[arg(long)]
        output: Option<String>,
    },

    /// Create a named pipe and keep it filled with whitened bytes
    Device {
        /// FIFO path
        #[arg(default_value = "/tmp/infnoise-fifo")]
        path: String,

        /// Bytes per write to the FIFO
        #[arg(long, default_value = "4096")]
        buffer_size: usize,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = match commands::build_config(
        cli.device.config.as_deref(),
        cli.device.target_entropy,
        cli.device.tolerance,
        cli.device.window,
    ) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Stream { format, bytes, raw } => {
            commands::stream::run(config, &format, bytes, raw)
        }
        Commands::Health { bits, output } => {
            commands::health::run(config, bits, output.as_deref())
        }
        Commands::Device { path, buffer_size } => {
            commands::device::run(config, &path, buffer_size)
        }
    }
}
