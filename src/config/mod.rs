//! Validated server configuration, built from the `serve` arguments.

use std::time::Duration;

use crate::cli::ServeArgs;
use crate::device::{AdbDevice, UiSpace};
use crate::dispatcher::DispatcherConfig;
use crate::pipeline::{DeliveryMode, PipelineConfig, ProcessSpec};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid size {0:?}, expected WIDTHxHEIGHT")]
    InvalidSize(String),
    #[error("invalid bit rate {0:?}, expected digits with an optional k/m suffix")]
    InvalidBitRate(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: String,
    pub mode: DeliveryMode,
    pub pipeline: PipelineConfig,
    pub dispatcher: DispatcherConfig,
    pub max_frame_bytes: usize,
}

impl RelayConfig {
    pub fn from_args(args: &ServeArgs) -> Result<Self, ConfigError> {
        let (capture_width, capture_height) = parse_size(&args.capture_size)?;
        let (ui_width, ui_height) = parse_size(&args.ui_size)?;
        if !is_bit_rate(&args.bit_rate) {
            return Err(ConfigError::InvalidBitRate(args.bit_rate.clone()));
        }
        if args.queue_depth == 0 {
            return Err(ConfigError::Zero("queue depth"));
        }
        if args.max_frame_kib == 0 {
            return Err(ConfigError::Zero("max frame size"));
        }

        let adb = AdbDevice::new(&args.device.adb, args.device.serial.clone());
        let capture = capture_spec(
            &adb,
            &args.bit_rate,
            (capture_width, capture_height),
            args.time_limit,
        );
        let transcoder = transcoder_spec(&args.ffmpeg, args.mode);

        let mut pipeline = PipelineConfig::new(capture, transcoder);
        pipeline.restart_delay = Duration::from_millis(args.restart_delay_ms);
        pipeline.stop_grace = Duration::from_millis(args.stop_grace_ms);

        Ok(Self {
            addr: format!("{}:{}", args.host, args.port),
            mode: args.mode,
            pipeline,
            dispatcher: DispatcherConfig {
                ui_space: UiSpace {
                    width: f64::from(ui_width),
                    height: f64::from(ui_height),
                },
                inter_command_delay: Duration::from_millis(args.command_delay_ms),
                max_queue_depth: args.queue_depth,
            },
            max_frame_bytes: args.max_frame_kib * 1024,
        })
    }
}

/// `adb exec-out screenrecord` writing raw H.264 to stdout.
pub fn capture_spec(adb: &AdbDevice, bit_rate: &str, size: (u32, u32), time_limit: u32) -> ProcessSpec {
    let mut args = adb.serial_args();
    args.extend([
        "exec-out".to_string(),
        "screenrecord".to_string(),
        "--output-format=h264".to_string(),
        "--bit-rate".to_string(),
        bit_rate.to_string(),
        "--size".to_string(),
        format!("{}x{}", size.0, size.1),
        "--time-limit".to_string(),
        time_limit.to_string(),
        "-".to_string(),
    ]);
    ProcessSpec::new(adb.program(), args)
}

/// ffmpeg reading H.264 on stdin, tuned for latency over compression.
pub fn transcoder_spec(ffmpeg: &std::path::Path, mode: DeliveryMode) -> ProcessSpec {
    let input = ["-hide_banner", "-fflags", "nobuffer", "-i", "pipe:0"];
    let output: &[&str] = match mode {
        DeliveryMode::Raw => &[
            "-f",
            "mp4",
            "-movflags",
            "frag_keyframe+empty_moov+default_base_moof",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-maxrate",
            "8M",
            "-bufsize",
            "256K",
            "-profile:v",
            "baseline",
            "-fflags",
            "+genpts+flush_packets",
            "-g",
            "30",
            "-keyint_min",
            "15",
            "-sc_threshold",
            "0",
            "-an",
            "pipe:1",
        ],
        DeliveryMode::Mjpeg => &[
            "-f",
            "mjpeg",
            "-q:v",
            "3",
            "-r",
            "15",
            "-vf",
            "scale=480:854",
            "-an",
            "pipe:1",
        ],
    };
    ProcessSpec::new(ffmpeg, input.iter().chain(output).copied())
}

/// Parses `WIDTHxHEIGHT` with both sides non-zero.
pub fn parse_size(value: &str) -> Result<(u32, u32), ConfigError> {
    let invalid = || ConfigError::InvalidSize(value.to_string());
    let (width, height) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(invalid)?;
    let width: u32 = width.parse().map_err(|_| invalid())?;
    let height: u32 = height.parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

fn is_bit_rate(value: &str) -> bool {
    let digits = value.strip_suffix(['k', 'K', 'm', 'M']).unwrap_or(value);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let argv = ["droidrelay", "serve"].iter().chain(extra).copied();
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Serve(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("720x1280"), Ok((720, 1280)));
        assert_eq!(parse_size(" 1080X1920 "), Ok((1080, 1920)));
        assert!(parse_size("720").is_err());
        assert!(parse_size("0x1280").is_err());
        assert!(parse_size("axb").is_err());
    }

    #[test]
    fn test_bit_rate_validation() {
        assert!(is_bit_rate("8m"));
        assert!(is_bit_rate("4000000"));
        assert!(!is_bit_rate("m"));
        assert!(!is_bit_rate("8m; reboot"));
    }

    #[test]
    fn test_capture_spec_pins_serial() {
        let adb = AdbDevice::new("adb", Some("emulator-5554".into()));
        let spec = capture_spec(&adb, "8m", (720, 1280), 180);
        assert_eq!(
            spec.to_string(),
            "adb -s emulator-5554 exec-out screenrecord --output-format=h264 \
             --bit-rate 8m --size 720x1280 --time-limit 180 -"
        );
    }

    #[test]
    fn test_transcoder_spec_per_mode() {
        let raw = transcoder_spec(std::path::Path::new("ffmpeg"), DeliveryMode::Raw);
        assert!(raw.args.iter().any(|arg| arg == "frag_keyframe+empty_moov+default_base_moof"));
        assert_eq!(raw.args.last().map(String::as_str), Some("pipe:1"));

        let mjpeg = transcoder_spec(std::path::Path::new("ffmpeg"), DeliveryMode::Mjpeg);
        assert!(mjpeg.args.windows(2).any(|pair| pair == ["-f", "mjpeg"]));
        assert!(!mjpeg.args.iter().any(|arg| arg == "libx264"));
    }

    #[test]
    fn test_from_args_defaults() {
        let config = RelayConfig::from_args(&serve_args(&["--port", "8080"])).unwrap();
        assert!(config.addr.ends_with(":8080"));
        assert_eq!(config.pipeline.restart_delay, Duration::from_secs(2));
        assert_eq!(config.dispatcher.inter_command_delay, Duration::from_millis(50));
        assert_eq!(config.dispatcher.ui_space.width, 720.0);
        assert_eq!(config.max_frame_bytes, 8192 * 1024);
    }

    #[test]
    fn test_from_args_rejects_bad_values() {
        assert_eq!(
            RelayConfig::from_args(&serve_args(&["--queue-depth", "0"])).unwrap_err(),
            ConfigError::Zero("queue depth")
        );
        assert!(matches!(
            RelayConfig::from_args(&serve_args(&["--ui-size", "wide"])),
            Err(ConfigError::InvalidSize(_))
        ));
    }
}
