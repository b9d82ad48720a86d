//! Runner state: readiness, setup result, schema, buffered logs and pending
//! predictions, mutated together under one lock.
//!
//! Every method here runs with the runner's state lock held. File reads and
//! deletes that belong to a transition happen inside the same call, so no
//! other task observes the new status before its side effects.

use crate::correlator::{PendingTable, PredictionHandle, SubmitError};
use crate::events::WorkerEvent;
use crate::health::{SetupResult, Status};
use crate::logs::LogBuffer;
use crate::protocol::PredictionRequest;
use crate::supervisor::WorkerExit;
use crate::workdir::{ProtocolError, WorkingDir};

const SETUP_FAILED: &str = "setup failed";
const DEFUNCT: &str = "server is defunct";

#[derive(Default)]
pub struct RunnerState {
    status: Status,
    setup_result: Option<SetupResult>,
    schema: Option<String>,
    logs: LogBuffer,
    pending: PendingTable,
    launched: bool,
    exit: Option<WorkerExit>,
    shutdown_requested: bool,
    await_explicit_shutdown: bool,
}

impl RunnerState {
    pub fn new(await_explicit_shutdown: bool) -> Self {
        Self {
            await_explicit_shutdown,
            ..Self::default()
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn setup_result(&self) -> Option<&SetupResult> {
        self.setup_result.as_ref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn exit(&self) -> Option<&WorkerExit> {
        self.exit.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn logs_mut(&mut self) -> &mut LogBuffer {
        &mut self.logs
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Stamp the placeholder setup result before the worker launches.
    pub fn begin_setup(&mut self) {
        self.status = Status::Starting;
        self.setup_result = Some(SetupResult::starting());
    }

    pub fn mark_launched(&mut self) {
        self.launched = true;
    }

    /// The worker could not be launched at all.
    pub fn launch_failed(&mut self) {
        self.status = Status::SetupFailed;
        let placeholder = self.setup_result.take().unwrap_or_else(SetupResult::starting);
        self.setup_result = Some(placeholder.failed(self.logs.drain()));
    }

    /// Whether the worker was launched and has not exited yet.
    pub fn worker_running(&self) -> bool {
        self.launched && self.exit.is_none()
    }

    pub fn check_accepting(&self) -> Result<(), SubmitError> {
        match self.status {
            Status::SetupFailed => {
                tracing::error!("Prediction rejected: setup failed");
                Err(SubmitError::SetupFailed)
            }
            Status::Defunct => {
                tracing::error!("Prediction rejected: server is defunct");
                Err(SubmitError::Defunct)
            }
            Status::Starting | Status::Ready | Status::Busy => Ok(()),
        }
    }

    pub fn submit(
        &mut self,
        workdir: &WorkingDir,
        request: PredictionRequest,
    ) -> Result<PredictionHandle, SubmitError> {
        self.check_accepting()?;
        self.pending.submit(workdir, request)
    }

    /// Apply a worker event. Events in a terminal state are ignored.
    pub fn handle_event(
        &mut self,
        workdir: &WorkingDir,
        event: WorkerEvent,
    ) -> Result<(), ProtocolError> {
        if self.status.is_terminal() {
            tracing::debug!(?event, status = %self.status, "Ignoring worker event in terminal state");
            return Ok(());
        }

        match event {
            WorkerEvent::Ready => {
                if self.status == Status::Starting {
                    self.complete_setup(workdir)?;
                    if self.status.is_terminal() {
                        return Ok(());
                    }
                } else {
                    self.status = Status::Ready;
                }
                tracing::info!("Runner is ready");
            }
            WorkerEvent::Busy => {
                if self.status == Status::Starting {
                    tracing::warn!("Worker reported busy before setup completed");
                    return Ok(());
                }
                tracing::info!("Runner is busy");
                self.status = Status::Busy;
            }
        }

        self.match_responses(workdir)?;
        Ok(())
    }

    /// Read the schema and the worker's setup result, leaving `Starting`.
    fn complete_setup(&mut self, workdir: &WorkingDir) -> Result<(), ProtocolError> {
        tracing::info!("Updating setup result");
        let mut result = workdir.read_setup_result()?;
        tracing::info!("Updating OpenAPI schema");
        // A worker that failed to load its predictor has no schema to offer.
        let schema = match workdir.read_schema() {
            Ok(schema) => Some(schema),
            Err(e) if result.is_failed() => {
                tracing::debug!(error = %e, "No schema after failed setup");
                None
            }
            Err(e) => return Err(e),
        };

        result.logs = self.logs.drain();
        self.schema = schema;
        if result.is_failed() {
            tracing::error!("Setup failed");
            self.status = Status::SetupFailed;
            self.setup_result = Some(result);
            self.abandon_pending(workdir, SETUP_FAILED);
        } else {
            tracing::info!("Setup succeeded");
            self.status = Status::Ready;
            self.setup_result = Some(result);
        }
        Ok(())
    }

    pub fn match_responses(&mut self, workdir: &WorkingDir) -> Result<usize, ProtocolError> {
        self.pending.match_responses(workdir, &mut self.logs)
    }

    /// Record the worker's exit and move to the matching terminal state.
    pub fn record_exit(&mut self, workdir: &WorkingDir, exit: WorkerExit) {
        match self.status {
            Status::Starting => {
                let logs = self.logs.drain();
                tracing::error!(%exit, %logs, "Worker exited before setup completed");
                self.status = Status::SetupFailed;
                let placeholder = self.setup_result.take().unwrap_or_else(SetupResult::starting);
                self.setup_result = Some(placeholder.failed(logs));
                self.abandon_pending(workdir, SETUP_FAILED);
            }
            Status::Ready | Status::Busy => {
                if exit.is_success() {
                    tracing::info!(%exit, "Worker exited");
                } else {
                    tracing::error!(%exit, "Worker exited with error");
                }
                // Responses written just before exit are still deliverable.
                if let Err(e) = self.match_responses(workdir) {
                    tracing::error!(error = %e, "Failed to collect final responses");
                }
                self.status = Status::Defunct;
                self.abandon_pending(workdir, DEFUNCT);
            }
            Status::SetupFailed | Status::Defunct => {
                tracing::info!(%exit, status = %self.status, "Worker exited");
            }
        }
        self.exit = Some(exit);
    }

    /// A worker file could not be read or decoded. The runner cannot recover.
    pub fn fail_protocol(&mut self, workdir: &WorkingDir, error: &ProtocolError) {
        let reason = format!("protocol error: {}", error);
        if self.status == Status::Starting {
            self.status = Status::SetupFailed;
            let mut logs = self.logs.drain();
            if !logs.is_empty() {
                logs.push('\n');
            }
            logs.push_str(&reason);
            let placeholder = self.setup_result.take().unwrap_or_else(SetupResult::starting);
            self.setup_result = Some(placeholder.failed(logs));
        } else if !self.status.is_terminal() {
            self.status = Status::Defunct;
        }
        self.abandon_pending(workdir, &reason);
        self.shutdown_requested = true;
    }

    fn abandon_pending(&mut self, workdir: &WorkingDir, reason: &str) {
        let abandoned = self.pending.abandon_all(workdir, reason, &mut self.logs);
        if abandoned > 0 {
            tracing::warn!(abandoned, %reason, "Abandoned pending predictions");
        }
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    /// Whether the outer server should stop once the worker has exited.
    pub fn should_terminate_after_exit(&self) -> bool {
        !self.await_explicit_shutdown || self.shutdown_requested()
    }
}
