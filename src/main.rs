mod cli;
mod config;
mod device;
mod dispatcher;
mod logging;
mod pipeline;
mod protocol;
mod relay;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use config::RelayConfig;
use device::{AdbDevice, Device};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    logging::init_logging(&cli.log_level, cli.log_format)?;

    match cli.command {
        Commands::Serve(args) => {
            let config = RelayConfig::from_args(&args).context("invalid serve options")?;
            info!(capture = %config.pipeline.capture, "capture command");
            info!(transcoder = %config.pipeline.transcoder, "transcoder command");
            let device = Arc::new(AdbDevice::new(&args.device.adb, args.device.serial.clone()));
            relay::start_relay(config, device).await?;
        }
        Commands::Devices { device } => {
            let adb = AdbDevice::new(device.adb, device.serial);
            let listing = adb
                .list_devices()
                .await
                .context("failed to run `adb devices`")?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Commands::Resolution { device } => {
            let adb = AdbDevice::new(device.adb, device.serial);
            let size = adb
                .resolution()
                .await
                .context("failed to query device resolution")?;
            println!("{}", serde_json::to_string_pretty(&size)?);
        }
    }

    Ok(())
}
