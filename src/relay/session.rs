use futures_util::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::device::{Device, Resolution, FALLBACK_RESOLUTION};
use crate::dispatcher::CommandDispatcher;
use crate::pipeline::framing::OutputFramer;
use crate::pipeline::{DeliveryMode, PipelineEvent, PipelineSupervisor};
use crate::protocol::{Command, ServerMessage, StreamStatus};

pub type Outbound = mpsc::UnboundedSender<WsMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session's run loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError(String),
    /// The outbound writer went away (send failure on the socket).
    OutboundClosed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => f.write_str("client closed"),
            CloseReason::TransportError(e) => write!(f, "transport error: {e}"),
            CloseReason::OutboundClosed => f.write_str("send failed"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
        }
    }
}

/// Everything one client connection owns: its pipeline, its command queue
/// and the device size used to map its touches.
pub struct StreamSession {
    id: u64,
    state: SessionState,
    mode: DeliveryMode,
    supervisor: PipelineSupervisor,
    dispatcher: CommandDispatcher,
    framer: OutputFramer,
    resolution: watch::Sender<Resolution>,
    resolution_answer: Option<oneshot::Receiver<Resolution>>,
    resolution_query: Option<JoinHandle<()>>,
    outbound: Outbound,
}

impl StreamSession {
    /// Starts the pipeline and command worker and greets the client. The
    /// device size query runs in the background; until it answers, touches
    /// are mapped against [`FALLBACK_RESOLUTION`].
    pub fn open(id: u64, config: &RelayConfig, device: Arc<dyn Device>, outbound: Outbound) -> Self {
        let label = id.to_string();
        let (resolution, resolution_rx) = watch::channel(FALLBACK_RESOLUTION);
        let dispatcher = CommandDispatcher::spawn(
            device.clone(),
            resolution_rx,
            config.dispatcher.clone(),
            label.clone(),
        );

        let (answer_tx, answer_rx) = oneshot::channel();
        let resolution_query = tokio::spawn(async move {
            match device.resolution().await {
                Ok(size) => {
                    let _ = answer_tx.send(size);
                }
                Err(e) => warn!(session = id, "device size query failed, using fallback: {}", e),
            }
        });

        let mut session = Self {
            id,
            state: SessionState::Connecting,
            mode: config.mode,
            supervisor: PipelineSupervisor::new(config.pipeline.clone(), label),
            dispatcher,
            framer: OutputFramer::new(config.mode, config.max_frame_bytes),
            resolution,
            resolution_answer: Some(answer_rx),
            resolution_query: Some(resolution_query),
            outbound,
        };

        session.supervisor.start();
        session.send_control(&ServerMessage::connected(session.mode));
        session.state = SessionState::Active;
        info!(session = id, mode = ?session.mode, "session active");
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_commands(&self) -> usize {
        self.dispatcher.pending()
    }

    pub fn has_live_processes(&self) -> bool {
        self.supervisor.has_live_processes()
    }

    pub fn restart_pending(&self) -> bool {
        self.supervisor.restart_pending()
    }

    /// Pipeline launches so far, restarts included.
    pub fn launches(&self) -> u64 {
        self.supervisor.launches()
    }

    /// Pumps inbound commands and pipeline events until the client goes
    /// away or `shutdown` fires.
    pub async fn run<S>(&mut self, mut inbound: S, shutdown: CancellationToken) -> CloseReason
    where
        S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return CloseReason::Shutdown,
                _ = self.outbound.closed() => return CloseReason::OutboundClosed,
                message = inbound.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => self.on_text(&text),
                    Some(Ok(WsMessage::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.on_text(text),
                        Err(_) => debug!(session = self.id, len = data.len(), "ignoring non-UTF-8 binary message"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return CloseReason::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return CloseReason::TransportError(e.to_string()),
                },
                event = self.supervisor.next_event() => {
                    if !self.forward(event) {
                        return CloseReason::OutboundClosed;
                    }
                }
                answer = wait_answer(&mut self.resolution_answer) => {
                    self.resolution_answer = None;
                    if let Some(size) = answer {
                        self.on_resolution(size);
                    }
                }
            }
        }
    }

    /// Drops queued commands, cancels any restart and stops both processes.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closing;
        self.dispatcher.shutdown().await;
        if let Some(query) = self.resolution_query.take() {
            query.abort();
        }
        self.resolution_answer = None;
        self.supervisor.stop().await;
        self.framer.reset();
        self.state = SessionState::Closed;
        info!(session = self.id, "session closed");
    }

    fn on_text(&mut self, text: &str) {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                warn!(session = self.id, "dropping malformed message: {}", e);
                return;
            }
        };
        debug!(session = self.id, kind = command.kind(), "command received");
        if let Err(e) = self.dispatcher.enqueue(command) {
            warn!(session = self.id, "{}", e);
        }
    }

    fn on_resolution(&mut self, size: Resolution) {
        info!(session = self.id, resolution = %size, "device resolution");
        self.resolution.send_replace(size);
        self.send_control(&ServerMessage::resolution(size));
    }

    /// Returns false once the outbound channel is gone.
    fn forward(&mut self, event: PipelineEvent) -> bool {
        match event {
            PipelineEvent::Chunk(chunk) => {
                for payload in self.framer.frame(chunk) {
                    if !self.send(WsMessage::Binary(payload.to_vec())) {
                        return false;
                    }
                }
                true
            }
            PipelineEvent::StreamActive => {
                self.framer.reset();
                self.send_control(&ServerMessage::StreamStatus {
                    status: StreamStatus::Active,
                    message: "Video stream active".to_string(),
                    retry_in_ms: None,
                })
            }
            PipelineEvent::Error { message } => self.send_control(&ServerMessage::Error { message }),
            PipelineEvent::RestartScheduled { delay } => {
                let retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                self.send_control(&ServerMessage::StreamStatus {
                    status: StreamStatus::Restarting,
                    message: "Capture ended, restarting stream".to_string(),
                    retry_in_ms: Some(retry_in_ms),
                })
            }
            PipelineEvent::StreamInterrupted { exit_code } => {
                debug!(session = self.id, ?exit_code, "stream interrupted");
                self.send_control(&ServerMessage::StreamStatus {
                    status: StreamStatus::Stopped,
                    message: "Video stream stopped".to_string(),
                    retry_in_ms: None,
                })
            }
        }
    }

    fn send_control(&self, message: &ServerMessage) -> bool {
        match message.to_json() {
            Ok(json) => self.send(WsMessage::Text(json)),
            Err(e) => {
                warn!(session = self.id, "failed to encode control message: {}", e);
                true
            }
        }
    }

    fn send(&self, message: WsMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

async fn wait_answer(answer: &mut Option<oneshot::Receiver<Resolution>>) -> Option<Resolution> {
    match answer {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}
