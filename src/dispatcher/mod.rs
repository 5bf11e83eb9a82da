//! Per-session device command queue.
//!
//! Commands run strictly one at a time in arrival order, with a short pause
//! after each so the device's input service does not drop or reorder them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceAction, Resolution, UiSpace};
use crate::protocol::Command;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub ui_space: UiSpace,
    /// Pause after each dispatched command.
    pub inter_command_delay: Duration,
    /// Queue depth past which the oldest waiting command is dropped.
    pub max_queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ui_space: UiSpace::default(),
            inter_command_delay: Duration::from_millis(50),
            max_queue_depth: 64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("command dispatcher is shut down")]
    Closed,
}

/// What happened to an enqueued command.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Queued,
    /// The queue was full; this older command was discarded to make room.
    DroppedOldest(Command),
}

struct Queue {
    commands: Mutex<VecDeque<Command>>,
    notify: Notify,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Command>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct CommandDispatcher {
    queue: Arc<Queue>,
    max_depth: usize,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    label: String,
}

impl CommandDispatcher {
    /// Starts the worker task. `resolution` is read at dispatch time, so a
    /// size query that answers later applies to every command after it.
    pub fn spawn(
        device: Arc<dyn Device>,
        resolution: watch::Receiver<Resolution>,
        config: DispatcherConfig,
        label: impl Into<String>,
    ) -> Self {
        let label = label.into();
        let queue = Arc::new(Queue {
            commands: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        let cancel = CancellationToken::new();
        let max_depth = config.max_queue_depth.max(1);

        let worker = tokio::spawn(run_worker(
            queue.clone(),
            device,
            resolution,
            config,
            cancel.clone(),
            label.clone(),
        ));

        Self {
            queue,
            max_depth,
            cancel,
            worker: Some(worker),
            label,
        }
    }

    pub fn enqueue(&self, command: Command) -> Result<Enqueued, DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        let outcome = {
            let mut commands = self.queue.lock();
            let dropped = if commands.len() >= self.max_depth {
                commands.pop_front()
            } else {
                None
            };
            commands.push_back(command);
            dropped
        };
        self.queue.notify.notify_one();

        Ok(match outcome {
            Some(dropped) => {
                warn!(
                    session = %self.label,
                    kind = dropped.kind(),
                    depth = self.max_depth,
                    "command queue full, dropped oldest command"
                );
                Enqueued::DroppedOldest(dropped)
            }
            None => Enqueued::Queued,
        })
    }

    /// Commands waiting behind the one in flight.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Stops the worker, abandoning the in-flight command and discarding the
    /// queue. Later `enqueue` calls fail with [`DispatchError::Closed`].
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        let dropped = {
            let mut commands = self.queue.lock();
            let dropped = commands.len();
            commands.clear();
            dropped
        };
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(session = %self.label, "command worker failed: {}", e);
            }
        }
        info!(session = %self.label, dropped, "command dispatcher stopped");
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    queue: Arc<Queue>,
    device: Arc<dyn Device>,
    resolution: watch::Receiver<Resolution>,
    config: DispatcherConfig,
    cancel: CancellationToken,
    label: String,
) {
    loop {
        let next = queue.lock().pop_front();
        let Some(command) = next else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.notify.notified() => {}
            }
            continue;
        };

        let device_size = *resolution.borrow();
        let Some(action) = command.to_action(&config.ui_space, device_size) else {
            warn!(session = %label, kind = command.kind(), "unknown command type, dropping");
            continue;
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = execute(device.as_ref(), &action, &label) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.inter_command_delay) => {}
        }
    }
    debug!(session = %label, "command worker exited");
}

async fn execute(device: &dyn Device, action: &DeviceAction, label: &str) {
    debug!(session = %label, ?action, "dispatching command");
    match device.perform(action).await {
        Ok(outcome) if !outcome.succeeded() => {
            warn!(session = %label, exit_code = ?outcome.exit_code, ?action, "command failed");
        }
        Ok(_) => {}
        Err(e) => warn!(session = %label, ?action, "command error: {}", e),
    }
}
