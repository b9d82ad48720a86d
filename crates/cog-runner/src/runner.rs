//! Runner: owns the worker process and the state shared with every task that
//! talks to it.
//!
//! Background tasks started by [`Runner::start`]:
//! - stdout and stderr pumps feeding the log buffer
//! - exit watcher, which also performs forced kills
//! - event handler applying [`WorkerEvent`]s
//!
//! All of them, and every caller of [`Runner::predict`], go through one state
//! lock. The lock is never held across an await.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::correlator::{PredictionHandle, SubmitError};
use crate::events::{EventReceiver, EventSender, WorkerEvent, event_channel};
use crate::health::{SetupResult, Status};
use crate::logs::{self, LogSource};
use crate::protocol::PredictionRequest;
use crate::state::RunnerState;
use crate::supervisor::{
    PythonSpawner, SpawnError, WorkerCommand, WorkerExit, WorkerSpawner, spawn_output_pump,
    wait_for_exit,
};
use crate::workdir::{ProtocolError, WorkingDir};

/// How long the exit watcher waits for output pumps to flush after exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("runner already started")]
    AlreadyStarted,
    #[error("failed to launch worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("working directory I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RunnerConfig {
    pub working_dir: PathBuf,
    pub module_name: String,
    pub class_name: String,
    pub python: String,
    pub await_explicit_shutdown: bool,
    /// Grace period after `stop` before the worker is killed. `None` waits forever.
    pub shutdown_timeout: Option<Duration>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl RunnerConfig {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        module_name: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            module_name: module_name.into(),
            class_name: class_name.into(),
            python: "python3".to_string(),
            await_explicit_shutdown: false,
            shutdown_timeout: None,
            spawner: Arc::new(PythonSpawner),
        }
    }

    pub fn with_python(mut self, python: impl Into<String>) -> Self {
        self.python = python.into();
        self
    }

    pub fn with_await_explicit_shutdown(mut self, await_explicit_shutdown: bool) -> Self {
        self.await_explicit_shutdown = await_explicit_shutdown;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.python.clone(),
            working_dir: self.working_dir.clone(),
            module_name: self.module_name.clone(),
            class_name: self.class_name.clone(),
        }
    }
}

/// Snapshot of runner health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: Status,
    pub setup_result: Option<SetupResult>,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == Status::Ready
    }
}

pub struct Runner {
    config: RunnerConfig,
    workdir: WorkingDir,
    state: Mutex<RunnerState>,
    events_tx: EventSender,
    events_rx: Mutex<Option<EventReceiver>>,
    kill: CancellationToken,
    terminate_tx: watch::Sender<bool>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Arc<Self> {
        let (events_tx, events_rx) = event_channel();
        let (terminate_tx, _) = watch::channel(false);
        Arc::new(Self {
            workdir: WorkingDir::new(config.working_dir.clone()),
            state: Mutex::new(RunnerState::new(config.await_explicit_shutdown)),
            config,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            kill: CancellationToken::new(),
            terminate_tx,
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Runner state mutex poisoned");
                poisoned.into_inner()
            }
        }
    }

    /// Launch the worker and the background tasks watching it.
    ///
    /// A launch failure leaves the runner in `SETUP_FAILED`.
    pub fn start(self: &Arc<Self>) -> Result<(), RunnerError> {
        let events_rx = self
            .events_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(RunnerError::AlreadyStarted)?;

        self.lock_state().begin_setup();

        let mut child = match self.launch() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start worker");
                self.lock_state().launch_failed();
                return Err(e);
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "Failed to kill worker without piped output");
            }
            self.lock_state().launch_failed();
            return Err(SpawnError::Other("worker output not captured".to_string()).into());
        };

        let pid = child.id();
        tracing::info!(?pid, "Worker started");
        self.lock_state().mark_launched();

        let (gate_tx, gate_rx) = watch::channel(false);
        let pumps = [
            self.spawn_pump(stdout, LogSource::Stdout, gate_rx.clone()),
            self.spawn_pump(stderr, LogSource::Stderr, gate_rx),
        ];

        let runner = Arc::clone(self);
        let kill = self.kill.clone();
        tokio::spawn(async move {
            let exit = wait_for_exit(child, kill).await;
            // Let the pumps hand over the last lines before logs are attributed.
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(pumps))
                .await
                .is_err()
            {
                tracing::warn!(?pid, "Worker output still open after exit");
            }
            runner.handle_exit(exit);
        });

        tokio::spawn(run_event_loop(Arc::downgrade(self), events_rx));

        gate_tx.send_replace(true);
        Ok(())
    }

    fn launch(&self) -> Result<tokio::process::Child, RunnerError> {
        self.workdir.ensure_exists()?;
        let command = self.config.command();
        tracing::info!(
            working_dir = %command.working_dir.display(),
            module = %command.module_name,
            class = %command.class_name,
            "Starting worker"
        );
        Ok(self.config.spawner.spawn(&command)?)
    }

    fn spawn_pump<R>(
        self: &Arc<Self>,
        reader: R,
        source: LogSource,
        gate: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let runner = Arc::clone(self);
        spawn_output_pump(reader, source, gate, move |source, line| {
            runner.append_log(source, &line)
        })
    }

    /// Echo a worker line and buffer it unless it is internal.
    pub fn append_log(&self, source: LogSource, line: &str) {
        logs::echo(line);
        if !self.lock_state().logs_mut().append(line) {
            tracing::trace!(source = source.as_str(), "Filtered internal worker line");
        }
    }

    /// Submit a prediction. Await the returned handle for the response.
    pub fn predict(&self, request: PredictionRequest) -> Result<PredictionHandle, SubmitError> {
        self.lock_state().submit(&self.workdir, request)
    }

    /// Apply a worker event. A protocol failure is fatal to the runner.
    pub fn handle_event(&self, event: WorkerEvent) {
        let mut state = self.lock_state();
        if let Err(e) = state.handle_event(&self.workdir, event) {
            tracing::error!(error = %e, "Worker protocol failure");
            state.fail_protocol(&self.workdir, &e);
            drop(state);
            self.kill.cancel();
        }
    }

    /// Deliver any responses the worker has written.
    pub fn match_responses(&self) -> Result<usize, ProtocolError> {
        self.lock_state().match_responses(&self.workdir)
    }

    /// Record the worker's exit and stop the server if the policy says so.
    pub fn handle_exit(&self, exit: WorkerExit) {
        let terminate = {
            let mut state = self.lock_state();
            state.record_exit(&self.workdir, exit);
            state.should_terminate_after_exit()
        };
        // Disarms any pending shutdown timer.
        self.kill.cancel();
        if terminate {
            self.terminate();
        }
    }

    /// Ask the worker to stop, or stop the server if the worker is already gone.
    pub fn shutdown(&self) -> Result<(), RunnerError> {
        let running = {
            let mut state = self.lock_state();
            tracing::info!(pending = state.pending_len(), "Shutdown requested");
            state.request_shutdown();
            state.worker_running()
        };

        if !running {
            self.terminate();
            return Ok(());
        }

        self.workdir.write_stop()?;
        if let Some(timeout) = self.config.shutdown_timeout {
            let kill = self.kill.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !kill.is_cancelled() {
                    tracing::warn!(?timeout, "Worker did not stop in time");
                    kill.cancel();
                }
            });
        }
        Ok(())
    }

    pub fn health(&self) -> HealthSnapshot {
        let state = self.lock_state();
        HealthSnapshot {
            status: state.status(),
            setup_result: state.setup_result().cloned(),
        }
    }

    pub fn schema(&self) -> Option<String> {
        self.lock_state().schema().map(str::to_string)
    }

    /// The worker's exit code, once it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        self.lock_state().exit().map(WorkerExit::code)
    }

    /// Sender for worker events, e.g. for an OS signal forwarder.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Flips to `true` once the server should stop.
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminate_tx.subscribe()
    }

    /// Stop the supervising server. The worker is not touched.
    pub fn terminate(&self) {
        tracing::info!("Terminating server");
        self.terminate_tx.send_replace(true);
    }
}

#[cfg(test)]
impl Runner {
    /// Put the runner in the launched state without spawning anything.
    pub(crate) fn mark_launched_for_tests(&self) {
        let mut state = self.lock_state();
        state.begin_setup();
        state.mark_launched();
    }
}

async fn run_event_loop(runner: Weak<Runner>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let Some(runner) = runner.upgrade() else {
            break;
        };
        runner.handle_event(event);
    }
    tracing::debug!("Worker event loop finished");
}
