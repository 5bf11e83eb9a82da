use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::device::{DeviceAction, KeyCode, Resolution, UiSpace};
use crate::pipeline::DeliveryMode;

/// Swipe duration used when the client does not send one.
pub const DEFAULT_SWIPE_DURATION_MS: u64 = 300;

/// Command kinds the dispatcher knows how to run.
const COMMAND_KINDS: &[&str] = &["tap", "swipe", "key", "text", "back", "home", "menu"];

/// Control messages sent from the relay to the browser (as JSON text frames)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once the session's pipeline has been started
    Connected {
        message: String,
        mode: DeliveryMode,
        timestamp: i64,
    },
    /// Device resolution, once the size query answers
    Resolution { width: u32, height: u32 },
    /// Pipeline lifecycle updates
    StreamStatus {
        status: StreamStatus,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_in_ms: Option<u64>,
    },
    /// Capture-level failure the user should see
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Active,
    Restarting,
    Stopped,
}

impl ServerMessage {
    pub fn connected(mode: DeliveryMode) -> Self {
        Self::Connected {
            message: "Interactive stream starting...".to_string(),
            mode,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn resolution(resolution: Resolution) -> Self {
        Self::Resolution {
            width: resolution.width,
            height: resolution.height,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no \"type\" field")]
    MissingType,
    #[error("invalid key code {0:?}")]
    InvalidKeyCode(String),
}

/// A device-control command received from the browser, in UI coordinates.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Command {
    Tap {
        x: f64,
        y: f64,
    },
    Swipe {
        #[serde(rename = "startX")]
        start_x: f64,
        #[serde(rename = "startY")]
        start_y: f64,
        #[serde(rename = "endX")]
        end_x: f64,
        #[serde(rename = "endY")]
        end_y: f64,
        #[serde(default = "default_swipe_duration")]
        duration: u64,
    },
    Key {
        #[serde(rename = "keyCode", deserialize_with = "deserialize_key_code")]
        key_code: KeyCode,
    },
    Text {
        text: String,
    },
    Back,
    Home,
    Menu,
    /// Well-formed message with a kind nobody handles; dropped by the dispatcher.
    #[serde(skip)]
    Unsupported {
        kind: String,
    },
}

fn default_swipe_duration() -> u64 {
    DEFAULT_SWIPE_DURATION_MS
}

fn deserialize_key_code<'de, D>(deserializer: D) -> Result<KeyCode, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Numeric(u32),
        Named(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Numeric(code) => Ok(KeyCode::Numeric(code)),
        Raw::Named(name) => match name.parse::<u32>() {
            Ok(code) => Ok(KeyCode::Numeric(code)),
            Err(_) if is_key_name(&name) => Ok(KeyCode::Named(name)),
            Err(_) => Err(serde::de::Error::custom(ProtocolError::InvalidKeyCode(name))),
        },
    }
}

fn is_key_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

impl Command {
    /// Parses one inbound text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !COMMAND_KINDS.contains(&kind) {
            return Ok(Command::Unsupported {
                kind: kind.to_string(),
            });
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn kind(&self) -> &str {
        match self {
            Command::Tap { .. } => "tap",
            Command::Swipe { .. } => "swipe",
            Command::Key { .. } => "key",
            Command::Text { .. } => "text",
            Command::Back => "back",
            Command::Home => "home",
            Command::Menu => "menu",
            Command::Unsupported { kind } => kind,
        }
    }

    /// Translates to a device action, mapping UI coordinates onto `device`.
    /// Returns `None` for unsupported kinds.
    pub fn to_action(&self, ui: &UiSpace, device: Resolution) -> Option<DeviceAction> {
        let action = match self {
            Command::Tap { x, y } => DeviceAction::Tap {
                x: ui.map_x(*x, device),
                y: ui.map_y(*y, device),
            },
            Command::Swipe {
                start_x,
                start_y,
                end_x,
                end_y,
                duration,
            } => DeviceAction::Swipe {
                x1: ui.map_x(*start_x, device),
                y1: ui.map_y(*start_y, device),
                x2: ui.map_x(*end_x, device),
                y2: ui.map_y(*end_y, device),
                duration_ms: *duration,
            },
            Command::Key { key_code } => DeviceAction::KeyEvent(key_code.clone()),
            Command::Text { text } => DeviceAction::Text(text.clone()),
            Command::Back => DeviceAction::KeyEvent(KeyCode::BACK),
            Command::Home => DeviceAction::KeyEvent(KeyCode::HOME),
            Command::Menu => DeviceAction::KeyEvent(KeyCode::MENU),
            Command::Unsupported { .. } => return None,
        };
        Some(action)
    }
}
