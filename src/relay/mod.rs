pub mod session;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Error as WsError, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::device::Device;
use session::StreamSession;

/// How long the writer gets to flush after its session has closed.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Accepts browser connections and gives each its own [`StreamSession`].
///
/// Sessions share nothing but the device handle: every client gets its own
/// capture + transcode pipeline and its own command queue.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    device: Arc<dyn Device>,
    next_session: AtomicU64,
}

impl RelayServer {
    pub fn new(config: RelayConfig, device: Arc<dyn Device>) -> Self {
        Self {
            config: Arc::new(config),
            device,
            next_session: AtomicU64::new(1),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.addr))?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Runs the accept loop until `shutdown` resolves, then closes every
    /// live session and waits for their pipelines to stop.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        info!(%addr, mode = ?self.config.mode, "📡 relay listening");

        let sessions = TaskTracker::new();
        let cancel = CancellationToken::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down, closing {} session(s)", sessions.len());
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    let config = self.config.clone();
                    let device = self.device.clone();
                    let cancel = cancel.child_token();

                    sessions.spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, id, config, device, cancel).await {
                            // plain HTTP probes and scanners fail the handshake
                            if is_handshake_noise(&e) {
                                debug!(%peer, "rejected non-WebSocket connection: {}", e);
                            } else {
                                warn!(%peer, "connection error: {}", e);
                            }
                        }
                    });
                }
            }
        }

        cancel.cancel();
        sessions.close();
        sessions.wait().await;
        info!("relay stopped");
        Ok(())
    }
}

fn is_handshake_noise(error: &WsError) -> bool {
    matches!(
        error,
        WsError::Protocol(_) | WsError::Http(_) | WsError::HttpFormat(_) | WsError::ConnectionClosed
    )
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    config: Arc<RelayConfig>,
    device: Arc<dyn Device>,
    shutdown: CancellationToken,
) -> Result<(), WsError> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, ws_receiver) = ws_stream.split();
    info!(session = id, %peer, "client connected");

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    // Single writer so media and control messages keep their order
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!(session = id, "send failed: {}", e);
                return;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut session = StreamSession::open(id, &config, device, tx);
    let reason = session.run(ws_receiver, shutdown).await;
    session.close().await;
    debug!(
        session = id,
        state = ?session.state(),
        queued = session.pending_commands(),
        launches = session.launches(),
        restart_pending = session.restart_pending(),
        "session torn down"
    );
    if session.has_live_processes() {
        warn!(session = id, "pipeline processes outlived their session");
    }
    drop(session);

    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        send_task.abort();
    }
    info!(session = id, %peer, %reason, "client disconnected");
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}

pub async fn start_relay(config: RelayConfig, device: Arc<dyn Device>) -> Result<()> {
    let server = RelayServer::new(config, device);
    server.run().await
}
