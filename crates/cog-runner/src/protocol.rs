//! Wire types for the file protocol shared with the worker.
//!
//! The runner and the worker exchange complete JSON files in a shared working
//! directory:
//! - `request-<id>.json`: runner → worker, one per prediction
//! - `response-<id>.json`: worker → runner, deleted once consumed
//! - `setup_result.json`, `openapi.json`: worker → runner, read once setup finishes
//! - `stop`: runner → worker, empty sentinel asking the worker to exit

use serde::{Deserialize, Serialize};

pub const SETUP_RESULT_FILE: &str = "setup_result.json";
pub const OPENAPI_FILE: &str = "openapi.json";
pub const STOP_FILE: &str = "stop";

pub fn request_file_name(id: &str) -> String {
    format!("request-{}.json", id)
}

pub fn response_file_name(id: &str) -> String {
    format!("response-{}.json", id)
}

/// Whether an id can be embedded in a file name inside the working directory.
pub fn is_valid_prediction_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
        && !id.chars().any(char::is_whitespace)
}

pub fn generate_prediction_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Prediction lifecycle status as reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Starting,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_empty_input", deserialize_with = "deserialize_input")]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

fn default_empty_input() -> serde_json::Value {
    serde_json::json!({})
}

fn deserialize_input<'de, D>(deserializer: D) -> Result<serde_json::Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(if value.is_null() {
        serde_json::json!({})
    } else {
        value
    })
}

impl PredictionRequest {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            id: None,
            input,
            created_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Fill in a generated id and a creation timestamp where absent.
    pub fn assign_defaults(&mut self) {
        if self.id.as_deref().is_none_or(str::is_empty) {
            self.id = Some(generate_prediction_id());
        }
        if self.created_at.as_deref().is_none_or(str::is_empty) {
            self.created_at = Some(crate::health::now_rfc3339());
        }
    }
}

impl Default for PredictionRequest {
    fn default() -> Self {
        Self::new(default_empty_input())
    }
}

/// A prediction result.
///
/// The worker only writes `output`, `status`, `error` and the timing fields;
/// `id`, `input` and `created_at` are filled in from the original request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PredictionStatus>,
}

impl PredictionResponse {
    /// Response for a prediction the worker will never answer.
    pub fn abandoned(request: &PredictionRequest, reason: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            input: request.input.clone(),
            created_at: request.created_at.clone(),
            completed_at: Some(crate::health::now_rfc3339()),
            error: Some(reason.into()),
            status: Some(PredictionStatus::Failed),
            ..Self::default()
        }
    }

    /// Overwrite the request-owned fields with the original request's values.
    pub fn adopt_request(&mut self, request: &PredictionRequest) {
        self.id = request.id.clone();
        self.input = request.input.clone();
        self.created_at = request.created_at.clone();
    }
}
