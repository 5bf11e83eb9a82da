//! `adb`-backed device: input injection, size queries and the device probe.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use super::{ActionOutcome, Device, DeviceAction, DeviceError, Resolution};

/// Characters the remote shell would otherwise interpret in `input text`.
const SHELL_METACHARACTERS: &[char] = &[
    '\\', '\'', '"', '`', '$', '&', '|', ';', '<', '>', '(', ')', '*', '?', '!', '~', '#', '[',
    ']', '{', '}',
];

/// Output of `adb devices`, shaped for the connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceListing {
    pub connected: bool,
    pub devices: Vec<String>,
    pub raw_output: String,
}

pub struct AdbDevice {
    program: PathBuf,
    serial: Option<String>,
}

impl AdbDevice {
    pub fn new(program: impl Into<PathBuf>, serial: Option<String>) -> Self {
        Self {
            program: program.into(),
            serial,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Leading arguments selecting the target device, if one was pinned.
    pub fn serial_args(&self) -> Vec<String> {
        match &self.serial {
            Some(serial) => vec!["-s".to_string(), serial.clone()],
            None => Vec::new(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.serial_args())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output, DeviceError> {
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|source| DeviceError::Spawn {
                program: self.program.display().to_string(),
                source,
            })
    }

    /// Lists attached devices (`adb devices`).
    pub async fn list_devices(&self) -> Result<DeviceListing, DeviceError> {
        let output = self.run(&["devices".to_string()]).await?;
        let raw_output = String::from_utf8_lossy(&output.stdout).into_owned();
        let devices = parse_device_list(&raw_output);
        Ok(DeviceListing {
            connected: !devices.is_empty(),
            devices,
            raw_output,
        })
    }
}

#[async_trait]
impl Device for AdbDevice {
    async fn perform(&self, action: &DeviceAction) -> Result<ActionOutcome, DeviceError> {
        let args = input_args(action);
        let output = self.run(&args).await?;
        let outcome = ActionOutcome {
            exit_code: output.status.code(),
        };
        if !outcome.succeeded() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                exit_code = ?outcome.exit_code,
                stderr = %stderr.trim(),
                "input stderr"
            );
        }
        Ok(outcome)
    }

    async fn resolution(&self) -> Result<Resolution, DeviceError> {
        let args = ["shell", "wm", "size"].map(String::from);
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(DeviceError::QueryFailed(output.status.code()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(output = %stdout.trim(), "wm size");
        parse_wm_size(&stdout).ok_or_else(|| DeviceError::UnparsableResolution(stdout.into_owned()))
    }
}

/// Builds the `adb shell input ...` argument list for an action.
pub fn input_args(action: &DeviceAction) -> Vec<String> {
    let mut args: Vec<String> = vec!["shell".into(), "input".into()];
    match action {
        DeviceAction::Tap { x, y } => {
            args.extend(["tap".into(), x.to_string(), y.to_string()]);
        }
        DeviceAction::Swipe {
            x1,
            y1,
            x2,
            y2,
            duration_ms,
        } => {
            args.extend([
                "swipe".into(),
                x1.to_string(),
                y1.to_string(),
                x2.to_string(),
                y2.to_string(),
                duration_ms.to_string(),
            ]);
        }
        DeviceAction::KeyEvent(code) => {
            args.extend(["keyevent".into(), code.to_string()]);
        }
        DeviceAction::Text(text) => {
            args.extend(["text".into(), escape_text(text)]);
        }
    }
    args
}

/// Escapes text for `input text`, which runs through the device shell.
///
/// Spaces and tabs become `%s`, the placeholder `input text` expands back to
/// a space. Newlines and other control characters are dropped: adb joins its
/// arguments into one shell command line, where they would end the command.
///
/// `input text` has no escape for its own placeholder, so a literal `%s` in
/// the input still arrives on the device as a space.
pub fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        if ch == ' ' || ch == '\t' {
            escaped.push_str("%s");
        } else if ch.is_control() {
            continue;
        } else {
            if SHELL_METACHARACTERS.contains(&ch) {
                escaped.push('\\');
            }
            escaped.push(ch);
        }
    }
    escaped
}

/// Parses `wm size` output, preferring the `Physical size:` line.
pub fn parse_wm_size(output: &str) -> Option<Resolution> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("Physical size:").and_then(parse_dimensions))
        .or_else(|| output.split_whitespace().find_map(parse_dimensions))
}

fn parse_dimensions(text: &str) -> Option<Resolution> {
    let (width, height) = text.trim().split_once('x')?;
    Resolution::new(width.trim().parse().ok()?, height.trim().parse().ok()?)
}

/// Serials of devices in the `device` state; `offline`/`unauthorized` are skipped.
pub fn parse_device_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (serial, state) = line.split_once('\t')?;
            (state.trim() == "device").then(|| serial.trim().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::KeyCode;

    #[test]
    fn test_parse_physical_size() {
        let output = "Physical size: 1080x1920\n";
        assert_eq!(parse_wm_size(output), Resolution::new(1080, 1920));
    }

    #[test]
    fn test_physical_size_wins_over_override() {
        let output = "Override size: 720x1280\nPhysical size: 1440x2960\n";
        assert_eq!(parse_wm_size(output), Resolution::new(1440, 2960));
    }

    #[test]
    fn test_bare_dimensions_fallback() {
        assert_eq!(parse_wm_size("1080x2400"), Resolution::new(1080, 2400));
        assert_eq!(parse_wm_size("error: no devices/emulators found"), None);
    }

    #[test]
    fn test_device_list_skips_offline() {
        let output = "List of devices attached\nemulator-5554\tdevice\nR58M123\toffline\n0123\tunauthorized\n\n";
        assert_eq!(parse_device_list(output), vec!["emulator-5554".to_string()]);
        assert!(parse_device_list("List of devices attached\n\n").is_empty());
    }

    #[test]
    fn test_escape_text() {
        assert_eq!(escape_text("hello world"), "hello%sworld");
        assert_eq!(escape_text(r#"it's "ok""#), r#"it\'s%s\"ok\""#);
        assert_eq!(escape_text("a;rm -rf $HOME"), r"a\;rm%s-rf%s\$HOME");
        assert_eq!(escape_text(r"back\slash"), r"back\\slash");
    }

    #[test]
    fn test_escape_text_cannot_break_the_command_line() {
        let escaped = escape_text("hi\necho\tINJECTED\r\n\u{0}");
        assert_eq!(escaped, "hiecho%sINJECTED");
        assert!(!escaped.chars().any(char::is_control));

        let args = input_args(&DeviceAction::Text("a\nreboot".into()));
        assert_eq!(args, vec!["shell", "input", "text", "areboot"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_escaped_text_runs_as_one_shell_command() {
        // the device shell sees the remote arguments joined by spaces
        let args = input_args(&DeviceAction::Text("hi\necho\tINJECTED; id".into()));
        let line = format!("echo {}", args[1..].join(" "));
        let output = Command::new("sh").arg("-c").arg(&line).output().await.unwrap();

        assert!(output.status.success());
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert_eq!(stdout, "input text hiecho%sINJECTED;%sid\n");
    }

    #[test]
    fn test_literal_placeholder_passes_through() {
        // `input text` turns this into a space on the device
        assert_eq!(escape_text("100%s"), "100%s");
        assert_eq!(escape_text("50%"), "50%");
    }

    #[test]
    fn test_input_args() {
        assert_eq!(
            input_args(&DeviceAction::Tap { x: 540, y: 960 }),
            vec!["shell", "input", "tap", "540", "960"]
        );
        assert_eq!(
            input_args(&DeviceAction::Swipe {
                x1: 1,
                y1: 2,
                x2: 3,
                y2: 4,
                duration_ms: 300
            }),
            vec!["shell", "input", "swipe", "1", "2", "3", "4", "300"]
        );
        assert_eq!(
            input_args(&DeviceAction::KeyEvent(KeyCode::HOME)),
            vec!["shell", "input", "keyevent", "3"]
        );
        assert_eq!(
            input_args(&DeviceAction::KeyEvent(KeyCode::Named("KEYCODE_ENTER".into()))),
            vec!["shell", "input", "keyevent", "KEYCODE_ENTER"]
        );
    }

    #[test]
    fn test_serial_is_prepended() {
        let device = AdbDevice::new("adb", Some("emulator-5554".into()));
        assert_eq!(device.serial_args(), vec!["-s", "emulator-5554"]);
        assert!(AdbDevice::new("adb", None).serial_args().is_empty());
    }
}
