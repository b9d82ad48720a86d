//! Filesystem side of the worker protocol.

use std::io;
use std::path::PathBuf;

use crate::health::SetupResult;
use crate::protocol::{
    OPENAPI_FILE, PredictionRequest, PredictionResponse, SETUP_RESULT_FILE, STOP_FILE,
    request_file_name,
};

/// A file the worker wrote could not be read or decoded.
///
/// Either means the runner and the worker disagree about the protocol, which
/// cannot be repaired locally.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to read {file}: {source}")]
    Read {
        file: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode {file}: {source}")]
    Decode {
        file: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{file} has no setup status")]
    MissingSetupStatus { file: String },
    #[error("failed to list working directory: {0}")]
    List(#[source] io::Error),
}

/// The directory shared with the worker.
#[derive(Debug, Clone)]
pub struct WorkingDir {
    root: PathBuf,
}

impl WorkingDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn ensure_exists(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Write `request-<id>.json`. The request must already carry its id.
    pub fn write_request(&self, request: &PredictionRequest) -> io::Result<()> {
        let id = request
            .id
            .as_deref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request has no id"))?;
        let bytes = serde_json::to_vec(request).map_err(io::Error::other)?;
        std::fs::write(self.join(&request_file_name(id)), bytes)
    }

    /// Names of every entry currently in the directory.
    pub fn entries(&self) -> Result<Vec<String>, ProtocolError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root).map_err(ProtocolError::List)? {
            let entry = entry.map_err(ProtocolError::List)?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    pub fn read_response(&self, name: &str) -> Result<PredictionResponse, ProtocolError> {
        self.read_json(name)
    }

    pub fn read_setup_result(&self) -> Result<SetupResult, ProtocolError> {
        let result: SetupResult = self.read_json(SETUP_RESULT_FILE)?;
        if result.status.is_none() {
            return Err(ProtocolError::MissingSetupStatus {
                file: SETUP_RESULT_FILE.to_string(),
            });
        }
        Ok(result)
    }

    /// The schema document, verbatim.
    pub fn read_schema(&self) -> Result<String, ProtocolError> {
        std::fs::read_to_string(self.join(OPENAPI_FILE)).map_err(|source| ProtocolError::Read {
            file: OPENAPI_FILE.to_string(),
            source,
        })
    }

    pub fn write_stop(&self) -> io::Result<()> {
        std::fs::write(self.join(STOP_FILE), b"")
    }

    /// Remove a file; a file that is already gone is not an error.
    pub fn remove(&self, name: &str) -> io::Result<()> {
        match std::fs::remove_file(self.join(name)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ProtocolError> {
        let bytes = std::fs::read(self.join(name)).map_err(|source| ProtocolError::Read {
            file: name.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ProtocolError::Decode {
            file: name.to_string(),
            source,
        })
    }
}
