//! Capture → transcode pipeline.
//!
//! A session's pipeline is two external processes joined by a pipe: the
//! capture source (`adb exec-out screenrecord`) writes a raw H.264 stream
//! that the transcoder (`ffmpeg`) re-encodes into something a browser can
//! play. [`PipelineSupervisor`] owns both processes, their I/O tasks and the
//! restart timer; [`framing`] turns transcoder output into client messages.

pub mod framing;
pub mod process;
pub mod supervisor;

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use supervisor::PipelineSupervisor;

/// How transcoder output is delivered to the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Fragmented MP4 chunks, forwarded verbatim for a streaming decoder.
    Raw,
    /// Motion-JPEG; each complete JPEG is sent as one multipart part.
    Mjpeg,
}

/// An external program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub capture: ProcessSpec,
    pub transcoder: ProcessSpec,
    /// Backoff between a capture exit and the restart.
    pub restart_delay: Duration,
    /// How long a process gets after SIGTERM before it is killed.
    pub stop_grace: Duration,
    /// Read buffer size for transcoder stdout.
    pub read_chunk_size: usize,
}

impl PipelineConfig {
    pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(2);
    pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(1500);
    pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(capture: ProcessSpec, transcoder: ProcessSpec) -> Self {
        Self {
            capture,
            transcoder,
            restart_delay: Self::DEFAULT_RESTART_DELAY,
            stop_grace: Self::DEFAULT_STOP_GRACE,
            read_chunk_size: Self::DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Starting,
    Streaming,
    Stopping,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle | Failed, Starting)
                | (Starting, Streaming)
                | (Starting | Streaming, Failed)
                | (Idle | Starting | Streaming | Failed, Stopping)
                | (Stopping, Idle)
        )
    }

    /// True while a capture/transcoder pair is (or is being) launched.
    pub fn is_running(self) -> bool {
        matches!(self, PipelineState::Starting | PipelineState::Streaming)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Streaming => "streaming",
            PipelineState::Stopping => "stopping",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the supervisor reports up to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A chunk of transcoder output, in production order.
    Chunk(Bytes),
    /// First output of the current launch has arrived.
    StreamActive,
    /// A capture-level failure the client should hear about.
    Error { message: String },
    /// The capture source exited; a restart fires after `delay`.
    RestartScheduled { delay: Duration },
    /// The transcoder exited on its own; no restart is triggered by this.
    StreamInterrupted { exit_code: Option<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to spawn {role} process `{program}`: {source}")]
    Spawn {
        role: process::Role,
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn role(&self) -> process::Role {
        match self {
            PipelineError::Spawn { role, .. } => *role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineState::*;

    #[test]
    fn test_transition_table() {
        assert!(Idle.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Starting));
        assert!(Streaming.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Idle));

        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Streaming.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Starting));
        assert!(!Failed.can_transition_to(Streaming));
    }
}
