use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use voice_gateway_rs::audio::AudioCapture;
use voice_gateway_rs::config;
use voice_gateway_rs::orchestrator::startup;

#[derive(Parser)]
#[command(name = "voice-gateway")]
#[command(about = "Local-first always-listening voice gateway for smart-home control")]
struct Args {
    /// Path to the JSON config file (env overrides still apply)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture device name (overrides config)
    #[arg(short, long)]
    device: Option<String>,

    /// List available audio input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if args.list_devices {
        match AudioCapture::list_devices() {
            Ok(devices) => {
                info!("Available audio input devices:");
                for (i, device) in devices.iter().enumerate() {
                    println!("  {}: {}", i, device);
                }
                return;
            }
            Err(e) => {
                error!("Failed to list audio devices: {}", e);
                std::process::exit(4);
            }
        }
    }

    info!("Starting voice gateway");
    info!(
        "Target platform: {} on {}",
        std::env::consts::ARCH,
        std::env::consts::OS
    );

    let mut gateway_config = match config::load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Startup aborted: {}", e);
            std::process::exit(2);
        }
    };
    if args.device.is_some() {
        gateway_config.audio.device = args.device;
    }

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    match runtime.block_on(startup::launch(gateway_config)) {
        Ok(()) => info!("Shutdown complete"),
        Err(e) => {
            error!("Fatal: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
