use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::pipeline::DeliveryMode;

#[derive(Parser)]
#[command(name = "droidrelay")]
#[command(about = "📱 Relay a live Android screen to the browser and drive the device back", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log filter, e.g. `info` or `droidrelay=debug` (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "DROIDRELAY_LOG", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay server
    Serve(ServeArgs),

    /// Check which devices adb can see
    Devices {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Print the device's physical screen size
    Resolution {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

#[derive(Args, Clone, Debug)]
pub struct DeviceArgs {
    /// Path to the adb executable
    #[arg(long, env = "ADB_PATH", default_value = "adb")]
    pub adb: PathBuf,

    /// Serial of the device to use when more than one is attached
    #[arg(short, long, env = "ANDROID_SERIAL")]
    pub serial: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Interface to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// How video is delivered to the browser
    #[arg(short, long, value_enum, default_value_t = DeliveryMode::Raw)]
    pub mode: DeliveryMode,

    /// Path to the ffmpeg executable
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// screenrecord bit rate (e.g. 8m, 4000000)
    #[arg(long, default_value = "8m")]
    pub bit_rate: String,

    /// screenrecord output size
    #[arg(long, default_value = "720x1280")]
    pub capture_size: String,

    /// screenrecord time limit in seconds; the stream restarts when it runs out
    #[arg(long, default_value_t = 180)]
    pub time_limit: u32,

    /// Delay before restarting after the capture process exits (ms)
    #[arg(long, default_value_t = 2000)]
    pub restart_delay_ms: u64,

    /// Time a process gets to exit after SIGTERM before it is killed (ms)
    #[arg(long, default_value_t = 1500)]
    pub stop_grace_ms: u64,

    /// Pause between device input commands (ms)
    #[arg(long, default_value_t = 50)]
    pub command_delay_ms: u64,

    /// Max queued input commands per session before the oldest is dropped
    #[arg(long, default_value_t = 64)]
    pub queue_depth: usize,

    /// Logical coordinate space the browser sends touches in
    #[arg(long, default_value = "720x1280")]
    pub ui_size: String,

    /// Largest MJPEG frame accepted, in KiB
    #[arg(long, default_value_t = 8192)]
    pub max_frame_kib: usize,

    #[command(flatten)]
    pub device: DeviceArgs,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["droidrelay", "serve"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.mode, DeliveryMode::Raw);
        assert_eq!(args.capture_size, "720x1280");
        assert_eq!(args.restart_delay_ms, 2000);
        assert_eq!(args.command_delay_ms, 50);
    }

    #[test]
    fn test_serve_mjpeg_with_serial() {
        let cli = Cli::try_parse_from([
            "droidrelay",
            "--log-format",
            "json",
            "serve",
            "--mode",
            "mjpeg",
            "-s",
            "emulator-5554",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.mode, DeliveryMode::Mjpeg);
        assert_eq!(args.device.serial.as_deref(), Some("emulator-5554"));
    }
}
