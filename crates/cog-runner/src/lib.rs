//! cog-runner: supervising prediction server for file-protocol Cog workers.
//!
//! The [`Runner`] launches a single worker process, tracks its readiness and
//! exchanges predictions with it through JSON files in a shared working
//! directory. [`transport::serve`] exposes it over HTTP.

mod correlator;
mod health;
mod logs;
mod protocol;
mod state;
mod workdir;

pub mod events;
pub mod runner;
pub mod supervisor;
pub mod transport;

pub use correlator::{PredictionError, PredictionHandle, SubmitError};
pub use events::{EventSender, WorkerEvent};
pub use health::{SetupResult, SetupStatus, Status};
pub use logs::{INTERNAL_MARKER, LogBuffer, LogSource};
pub use protocol::{PredictionRequest, PredictionResponse, PredictionStatus};
pub use runner::{HealthSnapshot, Runner, RunnerConfig, RunnerError};
pub use supervisor::{SpawnError, WorkerCommand, WorkerExit, WorkerSpawner};
pub use workdir::{ProtocolError, WorkingDir};
