//! Request/response correlation over the working directory.
//!
//! Each submitted request is written as `request-<id>.json` and parked under the
//! name of the response file the worker will produce for it. A matching pass
//! lists the directory and hands every pending response file to its waiter.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::logs::LogBuffer;
use crate::protocol::{
    PredictionRequest, PredictionResponse, is_valid_prediction_id, request_file_name,
    response_file_name,
};
use crate::workdir::{ProtocolError, WorkingDir};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("setup failed")]
    SetupFailed,
    #[error("server is defunct")]
    Defunct,
    #[error("prediction ID exists")]
    DuplicateId(String),
    #[error("invalid prediction ID: {0:?}")]
    InvalidId(String),
    #[error("failed to write prediction request: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("prediction was dropped without a response")]
    Dropped,
}

/// Caller's side of a pending prediction.
#[derive(Debug)]
pub struct PredictionHandle {
    id: String,
    rx: oneshot::Receiver<PredictionResponse>,
}

impl PredictionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the worker's response.
    pub async fn wait(self) -> Result<PredictionResponse, PredictionError> {
        self.rx.await.map_err(|_| PredictionError::Dropped)
    }

    /// Take the response if it has already been delivered.
    pub fn try_take(&mut self) -> Option<PredictionResponse> {
        self.rx.try_recv().ok()
    }
}

struct PendingPrediction {
    request: PredictionRequest,
    deliver: oneshot::Sender<PredictionResponse>,
}

impl PendingPrediction {
    fn id(&self) -> &str {
        self.request.id.as_deref().unwrap_or_default()
    }

    fn deliver(self, response: PredictionResponse) {
        let Self { request, deliver } = self;
        if deliver.send(response).is_err() {
            tracing::debug!(prediction_id = ?request.id, "Caller went away before delivery");
        }
    }
}

/// Pending predictions keyed by expected response file name.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingPrediction>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(&response_file_name(id))
    }

    /// Write the request file and register a waiter for its response.
    ///
    /// Nothing is registered unless the request file was written.
    pub fn submit(
        &mut self,
        workdir: &WorkingDir,
        mut request: PredictionRequest,
    ) -> Result<PredictionHandle, SubmitError> {
        request.assign_defaults();
        let id = request.id.clone().unwrap_or_default();
        if !is_valid_prediction_id(&id) {
            return Err(SubmitError::InvalidId(id));
        }

        if self.contains(&id) {
            tracing::error!(prediction_id = %id, "Prediction rejected: prediction ID exists");
            return Err(SubmitError::DuplicateId(id));
        }

        tracing::info!(prediction_id = %id, "Received prediction request");
        workdir.write_request(&request)?;

        let (deliver, rx) = oneshot::channel();
        self.entries
            .insert(response_file_name(&id), PendingPrediction { request, deliver });
        Ok(PredictionHandle { id, rx })
    }

    /// Deliver every pending response the worker has written.
    ///
    /// Returns the number delivered. Responses delivered before a decode
    /// failure stay delivered and removed. The undecodable file is removed too.
    pub fn match_responses(
        &mut self,
        workdir: &WorkingDir,
        logs: &mut LogBuffer,
    ) -> Result<usize, ProtocolError> {
        let ready: Vec<String> = workdir
            .entries()?
            .into_iter()
            .filter(|name| self.entries.contains_key(name))
            .collect();

        let mut delivered = 0;
        for name in ready {
            let mut response = match workdir.read_response(&name) {
                Ok(response) => response,
                Err(e @ ProtocolError::Decode { .. }) => {
                    if let Err(remove_err) = workdir.remove(&name) {
                        tracing::warn!(file = %name, error = %remove_err, "Failed to remove undecodable response");
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let Some(pending) = self.entries.remove(&name) else {
                continue;
            };
            tracing::info!(prediction_id = %pending.id(), "Received prediction response");

            response.adopt_request(&pending.request);
            response.logs = logs.drain();
            pending.deliver(response);
            delivered += 1;

            if let Err(e) = workdir.remove(&name) {
                tracing::warn!(file = %name, error = %e, "Failed to remove consumed response");
            }
        }
        Ok(delivered)
    }

    /// Fail every pending prediction with `reason`.
    ///
    /// Whatever logs are buffered go to the first abandoned prediction.
    pub fn abandon_all(&mut self, workdir: &WorkingDir, reason: &str, logs: &mut LogBuffer) -> usize {
        if self.is_empty() {
            return 0;
        }
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            tracing::warn!(prediction_id = %pending.id(), %reason, "Abandoning pending prediction");
            if let Err(e) = workdir.remove(&request_file_name(pending.id())) {
                tracing::warn!(prediction_id = %pending.id(), error = %e, "Failed to remove request file");
            }
            let mut response = PredictionResponse::abandoned(&pending.request, reason);
            response.logs = logs.drain();
            pending.deliver(response);
        }
        count
    }
}
