use std::collections::VecDeque;
use std::pin::Pin;
use std::process::Stdio;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, trace, warn};

use super::process::{
    classify_diagnostic, fatal_message, spawn_output_reader, spawn_pump, DiagnosticClass,
    ManagedProcess, ProcessEvent, Role, Spawned, Tagged,
};
use super::{PipelineConfig, PipelineError, PipelineEvent, PipelineState};

/// Owns one session's capture → transcoder pipeline.
///
/// The supervisor is driven by its session: `start`/`stop` are called
/// directly, and [`PipelineSupervisor::next_event`] is polled in the
/// session's select loop to process subprocess events and the restart timer.
pub struct PipelineSupervisor {
    config: PipelineConfig,
    label: String,
    state: PipelineState,
    generation: u64,
    running: Option<RunningPipeline>,
    /// Processes from a failed launch still being terminated.
    retiring: Vec<ManagedProcess>,
    restart: Option<Pin<Box<Sleep>>>,
    restarts: u64,
    pending: VecDeque<PipelineEvent>,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
}

struct RunningPipeline {
    generation: u64,
    capture: Option<ManagedProcess>,
    transcoder: Option<ManagedProcess>,
    io_tasks: Vec<JoinHandle<()>>,
    first_output_seen: bool,
}

impl RunningPipeline {
    fn retire(mut self, into: &mut Vec<ManagedProcess>) {
        for mut process in [self.capture.take(), self.transcoder.take()].into_iter().flatten() {
            process.terminate();
            into.push(process);
        }
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
    }
}

impl PipelineSupervisor {
    pub fn new(config: PipelineConfig, label: impl Into<String>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            label: label.into(),
            state: PipelineState::Idle,
            generation: 0,
            running: None,
            retiring: Vec::new(),
            restart: None,
            restarts: 0,
            pending: VecDeque::new(),
            events_tx,
            events_rx,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Number of launches made so far, restarts included.
    pub fn launches(&self) -> u64 {
        self.generation
    }

    /// Number of restart timers that actually fired.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn restart_pending(&self) -> bool {
        self.restart.is_some()
    }

    /// Whether any pipeline process is still alive.
    pub fn has_live_processes(&self) -> bool {
        let running = self.running.as_ref().is_some_and(|running| {
            [&running.capture, &running.transcoder]
                .into_iter()
                .flatten()
                .any(|process| !process.has_exited())
        });
        running || self.retiring.iter().any(|process| !process.has_exited())
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(session = %self.label, from = %self.state, to = %next, "ignoring invalid pipeline transition");
            return;
        }
        debug!(session = %self.label, from = %self.state, to = %next, "pipeline state");
        self.state = next;
    }

    /// Launches the pipeline unless one is already starting or streaming.
    pub fn start(&mut self) {
        if self.state.is_running() {
            info!(session = %self.label, state = %self.state, "stream already running, skipping start");
            return;
        }
        if self.state == PipelineState::Stopping {
            debug!(session = %self.label, "pipeline is stopping, skipping start");
            return;
        }
        if self.running.is_some() {
            // transcoder died but capture is still up; its exit drives the restart
            info!(session = %self.label, "waiting for capture to exit before restarting");
            return;
        }

        self.restart = None;
        self.retiring.retain(|process| !process.has_exited());
        self.generation += 1;
        self.transition(PipelineState::Starting);
        info!(session = %self.label, generation = self.generation, "starting video stream");

        match self.launch() {
            Ok(running) => self.running = Some(running),
            Err(err) => {
                error!(session = %self.label, "{}", err);
                self.transition(PipelineState::Failed);
                self.pending.push_back(PipelineEvent::Error {
                    message: err.to_string(),
                });
                if err.role() == Role::Capture {
                    self.schedule_restart();
                }
            }
        }
    }

    fn launch(&mut self) -> Result<RunningPipeline, PipelineError> {
        let generation = self.generation;
        let grace = self.config.stop_grace;

        let Spawned {
            process: transcoder,
            stdin: transcoder_stdin,
            stdout: transcoder_stdout,
        } = ManagedProcess::spawn(
            Role::Transcoder,
            &self.config.transcoder,
            Stdio::piped(),
            generation,
            self.events_tx.clone(),
            grace,
        )?;

        let capture = match ManagedProcess::spawn(
            Role::Capture,
            &self.config.capture,
            Stdio::null(),
            generation,
            self.events_tx.clone(),
            grace,
        ) {
            Ok(spawned) => spawned,
            Err(err) => {
                let mut transcoder = transcoder;
                transcoder.terminate();
                self.retiring.push(transcoder);
                return Err(err);
            }
        };

        let mut io_tasks = Vec::with_capacity(2);
        if let (Some(from), Some(to)) = (capture.stdout, transcoder_stdin) {
            io_tasks.push(spawn_pump(from, to));
        }
        if let Some(stdout) = transcoder_stdout {
            io_tasks.push(spawn_output_reader(
                stdout,
                self.config.read_chunk_size,
                generation,
                self.events_tx.clone(),
            ));
        }

        Ok(RunningPipeline {
            generation,
            capture: Some(capture.process),
            transcoder: Some(transcoder),
            io_tasks,
            first_output_seen: false,
        })
    }

    fn schedule_restart(&mut self) {
        let delay = self.config.restart_delay;
        info!(session = %self.label, ?delay, "scheduling stream restart");
        self.restart = Some(Box::pin(sleep(delay)));
        self.pending
            .push_back(PipelineEvent::RestartScheduled { delay });
    }

    /// Waits for the next event worth reporting to the session.
    ///
    /// Cancel-safe: all state changes happen synchronously after a channel
    /// receive or timer completion, so dropping the future loses nothing.
    pub async fn next_event(&mut self) -> PipelineEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            tokio::select! {
                Some(tagged) = self.events_rx.recv() => self.handle(tagged),
                () = restart_elapsed(&mut self.restart) => {
                    self.restart = None;
                    self.restarts += 1;
                    info!(session = %self.label, restarts = self.restarts, "restarting video stream");
                    self.start();
                }
            }
        }
    }

    fn handle(&mut self, tagged: Tagged) {
        let Tagged {
            generation,
            role,
            event,
        } = tagged;
        let Some(running) = self
            .running
            .as_mut()
            .filter(|running| running.generation == generation)
        else {
            trace!(session = %self.label, %role, generation, "dropping event from a retired pipeline");
            return;
        };

        match event {
            ProcessEvent::Output(chunk) => {
                if !running.first_output_seen {
                    running.first_output_seen = true;
                    info!(session = %self.label, bytes = chunk.len(), "first video chunk");
                    if self.state == PipelineState::Starting {
                        self.transition(PipelineState::Streaming);
                        self.pending.push_back(PipelineEvent::StreamActive);
                    }
                }
                self.pending.push_back(PipelineEvent::Chunk(chunk));
            }
            ProcessEvent::Diagnostic(line) => match classify_diagnostic(&line) {
                DiagnosticClass::Progress => trace!(session = %self.label, %role, "{}", line),
                DiagnosticClass::Fatal => {
                    error!(session = %self.label, %role, "{}", line);
                    self.pending.push_back(PipelineEvent::Error {
                        message: fatal_message(&line),
                    });
                }
                DiagnosticClass::Other => warn!(session = %self.label, %role, "{}", line),
            },
            ProcessEvent::Exited(exit_code) => match role {
                Role::Capture => self.on_capture_exit(exit_code),
                Role::Transcoder => {
                    running.transcoder = None;
                    warn!(session = %self.label, ?exit_code, "transcoder exited");
                    if self.state.is_running() {
                        self.transition(PipelineState::Failed);
                        self.pending
                            .push_back(PipelineEvent::StreamInterrupted { exit_code });
                    }
                }
            },
        }
    }

    fn on_capture_exit(&mut self, exit_code: Option<i32>) {
        info!(session = %self.label, ?exit_code, "capture exited");
        if let Some(mut running) = self.running.take() {
            running.capture = None;
            running.retire(&mut self.retiring);
        }
        if self.state == PipelineState::Stopping {
            return;
        }
        self.transition(PipelineState::Failed);
        self.schedule_restart();
    }

    /// Cancels any pending restart and tears the pipeline down, waiting until
    /// both processes have been reaped.
    pub async fn stop(&mut self) {
        self.restart = None;
        if self.state == PipelineState::Idle && self.running.is_none() && self.retiring.is_empty() {
            debug!(session = %self.label, "pipeline already idle");
            return;
        }

        info!(session = %self.label, "stopping video stream");
        self.transition(PipelineState::Stopping);
        if let Some(running) = self.running.take() {
            running.retire(&mut self.retiring);
        }
        for process in self.retiring.drain(..) {
            let role = process.role();
            let pid = process.pid();
            process.shutdown().await;
            debug!(session = %self.label, %role, ?pid, "process stopped");
        }

        // anything still queued belongs to the pipeline we just tore down
        while self.events_rx.try_recv().is_ok() {}
        self.pending.clear();
        self.transition(PipelineState::Idle);
    }
}

async fn restart_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
