//! Subprocess plumbing for the pipeline: spawning, stdout/stderr readers,
//! the capture → transcoder pump, and graceful-then-forceful termination.
//!
//! Every helper task reports into the supervisor through one channel of
//! [`Tagged`] events carrying the launch generation, so events from a
//! pipeline that has already been replaced are recognisable as stale.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PipelineError, ProcessSpec};

/// Which end of the pipeline a process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Capture,
    Transcoder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Capture => "capture",
            Role::Transcoder => "transcoder",
        })
    }
}

#[derive(Debug)]
pub(crate) enum ProcessEvent {
    Output(Bytes),
    Diagnostic(String),
    Exited(Option<i32>),
}

#[derive(Debug)]
pub(crate) struct Tagged {
    pub generation: u64,
    pub role: Role,
    pub event: ProcessEvent,
}

pub(crate) type EventSender = mpsc::UnboundedSender<Tagged>;

/// How long an exited process's stderr gets to reach EOF before `Exited` is
/// reported anyway. A forked child (the adb server) can hold it open.
const DIAGNOSTIC_DRAIN: Duration = Duration::from_millis(500);

/// How a stderr line should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticClass {
    /// Encoder progress lines; not errors.
    Progress,
    /// The device is gone or unusable.
    Fatal,
    Other,
}

const PROGRESS_MARKERS: &[&str] = &["frame=", "fps=", "bitrate=", "speed="];
const FATAL_MARKERS: &[&str] = &[
    "no devices",
    "device not found",
    "device offline",
    "unauthorized",
];

pub fn classify_diagnostic(line: &str) -> DiagnosticClass {
    let lower = line.to_ascii_lowercase();
    if FATAL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        DiagnosticClass::Fatal
    } else if PROGRESS_MARKERS.iter().any(|marker| lower.contains(marker)) {
        DiagnosticClass::Progress
    } else {
        DiagnosticClass::Other
    }
}

/// User-facing text for a fatal diagnostic.
pub fn fatal_message(line: &str) -> String {
    let lower = line.to_ascii_lowercase();
    if lower.contains("no devices") || lower.contains("device not found") {
        "No Android device connected".to_string()
    } else {
        format!("Device unavailable: {}", line.trim())
    }
}

/// A spawned process whose exit is watched by a dedicated task.
///
/// Dropping the handle (or calling [`ManagedProcess::terminate`]) asks that
/// task to stop the process: SIGTERM first, SIGKILL after the grace period.
pub(crate) struct ManagedProcess {
    role: Role,
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    waiter: JoinHandle<()>,
}

pub(crate) struct Spawned {
    pub process: ManagedProcess,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

impl ManagedProcess {
    pub fn spawn(
        role: Role,
        spec: &ProcessSpec,
        stdin: Stdio,
        generation: u64,
        events: EventSender,
        grace: Duration,
    ) -> Result<Spawned, PipelineError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                role,
                program: spec.program.display().to_string(),
                source,
            })?;

        let pid = child.id();
        info!(%role, ?pid, command = %spec, "process started");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let diagnostics = child
            .stderr
            .take()
            .map(|stderr| spawn_diagnostic_reader(stderr, role, generation, events.clone()));

        let (kill_tx, kill_rx) = oneshot::channel();
        let waiter = tokio::spawn(async move {
            let exit_code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code(),
                    Err(e) => {
                        warn!(%role, "failed to wait for process: {}", e);
                        None
                    }
                },
                _ = kill_rx => terminate(&mut child, role, grace).await,
            };
            // stderr lines must reach the supervisor ahead of the exit
            if let Some(diagnostics) = diagnostics {
                if tokio::time::timeout(DIAGNOSTIC_DRAIN, diagnostics).await.is_err() {
                    debug!(%role, "stderr still open after exit, not waiting for it");
                }
            }
            info!(%role, ?pid, ?exit_code, "process exited");
            let _ = events.send(Tagged {
                generation,
                role,
                event: ProcessEvent::Exited(exit_code),
            });
        });

        Ok(Spawned {
            process: ManagedProcess {
                role,
                pid,
                kill: Some(kill_tx),
                waiter,
            },
            stdin,
            stdout,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Asks the waiter task to stop the process. Returns immediately.
    pub fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    pub fn has_exited(&self) -> bool {
        self.waiter.is_finished()
    }

    /// Terminates the process and waits until it has been reaped.
    pub async fn shutdown(mut self) {
        self.terminate();
        if let Err(e) = self.waiter.await {
            warn!(role = %self.role, "process waiter task failed: {}", e);
        }
    }
}

async fn terminate(child: &mut Child, role: Role, grace: Duration) -> Option<i32> {
    if request_exit(child) {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => return status.code(),
            Ok(Err(e)) => warn!(%role, "wait after SIGTERM failed: {}", e),
            Err(_) => debug!(%role, ?grace, "process ignored SIGTERM, killing"),
        }
    }

    if let Err(e) = child.kill().await {
        warn!(%role, "failed to kill process: {}", e);
    }
    match child.try_wait() {
        Ok(Some(status)) => status.code(),
        _ => None,
    }
}

/// Sends SIGTERM. Returns false when there is nothing to signal.
#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: `pid` is our own child and has not been reaped yet, since
    // `child.id()` returns `None` once the exit status was collected.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}

fn spawn_diagnostic_reader(
    stderr: ChildStderr,
    role: Role,
    generation: u64,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let event = Tagged {
                        generation,
                        role,
                        event: ProcessEvent::Diagnostic(line),
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(%role, "stderr read ended: {}", e);
                    break;
                }
            }
        }
    })
}

/// Forwards transcoder stdout as [`ProcessEvent::Output`] chunks.
pub(crate) fn spawn_output_reader<R>(
    mut stdout: R,
    chunk_size: usize,
    generation: u64,
    events: EventSender,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(chunk_size);
        loop {
            buf.reserve(chunk_size);
            match stdout.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let event = Tagged {
                        generation,
                        role: Role::Transcoder,
                        event: ProcessEvent::Output(buf.split().freeze()),
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("transcoder stdout read ended: {}", e);
                    break;
                }
            }
        }
    })
}

/// Copies capture stdout into transcoder stdin until either side closes.
pub(crate) fn spawn_pump<R, W>(mut from: R, mut to: W) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::io::copy(&mut from, &mut to).await {
            Ok(bytes) => debug!(bytes, "capture stream ended"),
            Err(e) => debug!("capture pump stopped: {}", e),
        }
        // dropping `to` closes transcoder stdin so it can flush and exit
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_lines_are_not_errors() {
        assert_eq!(
            classify_diagnostic("frame=  120 fps= 30 q=-1.0 size=  1024kB time=00:00:04.00 bitrate=2097.2kbits/s speed=1x"),
            DiagnosticClass::Progress
        );
    }

    #[test]
    fn test_missing_device_is_fatal() {
        let line = "error: no devices/emulators found";
        assert_eq!(classify_diagnostic(line), DiagnosticClass::Fatal);
        assert_eq!(fatal_message(line), "No Android device connected");
        assert_eq!(
            classify_diagnostic("error: device offline"),
            DiagnosticClass::Fatal
        );
    }

    #[test]
    fn test_other_lines() {
        assert_eq!(
            classify_diagnostic("[h264 @ 0x55d] non-existing PPS 0 referenced"),
            DiagnosticClass::Other
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stderr_is_reported_before_exit() {
        let spec = ProcessSpec::new(
            "sh",
            ["-c", "echo 'error: no devices/emulators found' >&2; exit 1"],
        );
        for generation in 0..25 {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let spawned = ManagedProcess::spawn(
                Role::Capture,
                &spec,
                Stdio::null(),
                generation,
                tx,
                Duration::from_millis(500),
            )
            .unwrap();

            let mut saw_diagnostic = false;
            loop {
                let tagged = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                match tagged.event {
                    ProcessEvent::Diagnostic(line) => {
                        assert_eq!(classify_diagnostic(&line), DiagnosticClass::Fatal);
                        saw_diagnostic = true;
                    }
                    ProcessEvent::Exited(code) => {
                        assert_eq!(code, Some(1));
                        break;
                    }
                    ProcessEvent::Output(_) => {}
                }
            }
            assert!(saw_diagnostic, "exit overtook stderr in run {generation}");
            spawned.process.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_output_reader_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &[u8] = b"0123456789abcdef";
        spawn_output_reader(input, 4, 7, tx).await.unwrap();

        let mut collected = Vec::new();
        while let Ok(tagged) = rx.try_recv() {
            assert_eq!(tagged.generation, 7);
            match tagged.event {
                ProcessEvent::Output(bytes) => collected.extend_from_slice(&bytes),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(collected, input);
    }
}
