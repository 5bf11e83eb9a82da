//! Device model: resolution, UI-space coordinate mapping and the [`Device`]
//! seam the command dispatcher drives.

pub mod adb;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

pub use adb::AdbDevice;

/// Resolution assumed until the device answers a size query.
pub const FALLBACK_RESOLUTION: Resolution = Resolution {
    width: 720,
    height: 1280,
};

/// Physical screen size of the device in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Returns `None` when either dimension is zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        (width > 0 && height > 0).then_some(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Logical coordinate space the browser addresses, independent of the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UiSpace {
    pub width: f64,
    pub height: f64,
}

impl Default for UiSpace {
    fn default() -> Self {
        Self {
            width: 720.0,
            height: 1280.0,
        }
    }
}

impl UiSpace {
    pub fn map_x(&self, x: f64, device: Resolution) -> i64 {
        (x / self.width * f64::from(device.width)).round() as i64
    }

    pub fn map_y(&self, y: f64, device: Resolution) -> i64 {
        (y / self.height * f64::from(device.height)).round() as i64
    }
}

/// Key event argument: either a numeric Android keycode or a `KEYCODE_*` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyCode {
    Numeric(u32),
    Named(String),
}

impl KeyCode {
    pub const BACK: KeyCode = KeyCode::Numeric(4);
    pub const HOME: KeyCode = KeyCode::Numeric(3);
    pub const MENU: KeyCode = KeyCode::Numeric(82);
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyCode::Numeric(code) => write!(f, "{code}"),
            KeyCode::Named(name) => f.write_str(name),
        }
    }
}

/// One input invocation, already in device coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAction {
    Tap {
        x: i64,
        y: i64,
    },
    Swipe {
        x1: i64,
        y1: i64,
        x2: i64,
        y2: i64,
        duration_ms: u64,
    },
    KeyEvent(KeyCode),
    Text(String),
}

/// Result of running an action. A non-zero exit is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    pub exit_code: Option<i32>,
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("device query exited with status {0:?}")]
    QueryFailed(Option<i32>),
    #[error("could not find a screen size in {0:?}")]
    UnparsableResolution(String),
}

#[async_trait]
pub trait Device: Send + Sync {
    /// Runs one input action against the device and waits for it to finish.
    async fn perform(&self, action: &DeviceAction) -> Result<ActionOutcome, DeviceError>;

    /// Queries the current screen resolution.
    async fn resolution(&self) -> Result<Resolution, DeviceError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory device that records every action and tracks overlap.
    pub struct RecordingDevice {
        pub performed: Mutex<Vec<DeviceAction>>,
        pub started: Mutex<Vec<DeviceAction>>,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub action_time: Duration,
        pub exit_code: Option<i32>,
        pub resolution: Resolution,
    }

    impl RecordingDevice {
        pub fn new(action_time: Duration) -> Self {
            Self {
                performed: Mutex::new(Vec::new()),
                started: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                action_time,
                exit_code: Some(0),
                resolution: Resolution {
                    width: 1080,
                    height: 1920,
                },
            }
        }

        pub fn performed(&self) -> Vec<DeviceAction> {
            self.performed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Device for RecordingDevice {
        async fn perform(&self, action: &DeviceAction) -> Result<ActionOutcome, DeviceError> {
            self.started.lock().unwrap().push(action.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.action_time).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.performed.lock().unwrap().push(action.clone());
            Ok(ActionOutcome {
                exit_code: self.exit_code,
            })
        }

        async fn resolution(&self) -> Result<Resolution, DeviceError> {
            Ok(self.resolution)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_center_maps_to_device_center() {
        let ui = UiSpace::default();
        let device = Resolution::new(1080, 1920).unwrap();
        assert_eq!(ui.map_x(360.0, device), 540);
        assert_eq!(ui.map_y(640.0, device), 960);
    }

    #[test]
    fn test_mapping_rounds_to_nearest_pixel() {
        let ui = UiSpace::default();
        let device = Resolution::new(1440, 2960).unwrap();
        // 100 / 720 * 1440 = 200, 333 / 1280 * 2960 = 770.06..
        assert_eq!(ui.map_x(100.0, device), 200);
        assert_eq!(ui.map_y(333.0, device), 770);
        // edges of the UI space land on the edges of the device
        let device = Resolution::new(1080, 1920).unwrap();
        assert_eq!(ui.map_y(700.0, device), 1050);
        assert_eq!(ui.map_x(720.0, device), 1080);
    }

    #[test]
    fn test_zero_dimension_is_rejected() {
        assert!(Resolution::new(0, 1920).is_none());
        assert!(Resolution::new(1080, 0).is_none());
    }
}
