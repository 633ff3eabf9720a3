use std::path::PathBuf;

use amcu_zenoh_runtime::config::{LOOP_HZ, MOTOR_PORT, UnitConfig};
use amcu_zenoh_runtime::runtime::{self, RunOptions};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Motor control unit runtime: drives a wheeled base from host commands over zenoh
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Servo bus serial port. Without this flag the motors are simulated.
    #[arg(long, num_args = 0..=1, default_missing_value = MOTOR_PORT)]
    port: Option<String>,

    /// JSON unit config, missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control loop rate in Hz
    #[arg(long, default_value_t = LOOP_HZ, value_parser = clap::value_parser!(u64).range(1..=1000))]
    loop_hz: u64,

    /// Servo IDs wired to motor slots 0, 1, 2, 3 in order
    #[arg(long, value_delimiter = ',', default_values_t = vec![7u8, 8, 9])]
    motor_ids: Vec<u8>,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match UnitConfig::load(path) {
            Ok(config) => {
                info!("Loaded unit config from {}", path.display());
                config
            }
            Err(e) => {
                eprintln!("Config error: {}", e);
                std::process::exit(1);
            }
        },
        None => UnitConfig::default(),
    };

    let options = RunOptions {
        port: args.port,
        config,
        loop_hz: args.loop_hz,
        motor_ids: args.motor_ids,
    };

    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
