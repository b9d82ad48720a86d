//! Readiness status and setup result types.

use serde::{Deserialize, Serialize};

/// Readiness of the supervised worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Worker launched, setup not confirmed yet
    #[default]
    Starting,
    /// Setup failed, or the worker exited before confirming setup
    SetupFailed,
    /// Idle and available for a prediction
    Ready,
    /// Processing a prediction
    Busy,
    /// Worker exited after having been usable
    Defunct,
}

impl Status {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SetupFailed | Self::Defunct)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::SetupFailed => "SETUP_FAILED",
            Self::Ready => "READY",
            Self::Busy => "BUSY",
            Self::Defunct => "DEFUNCT",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the setup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Starting,
    Succeeded,
    Failed,
}

/// Result of the setup phase.
///
/// The worker writes this to `setup_result.json` without logs; the runner
/// attaches the output it captured while setup ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupResult {
    /// When setup started (RFC 3339).
    pub started_at: String,
    /// When setup completed (RFC 3339), if finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SetupStatus>,
    /// Worker output captured during setup.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
}

impl SetupResult {
    /// Placeholder stamped at launch, kept in case setup never reports back.
    pub fn starting() -> Self {
        Self {
            started_at: now_rfc3339(),
            completed_at: None,
            status: Some(SetupStatus::Starting),
            logs: String::new(),
        }
    }

    pub fn failed(mut self, logs: String) -> Self {
        self.completed_at = Some(now_rfc3339());
        self.status = Some(SetupStatus::Failed);
        self.logs = logs;
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == Some(SetupStatus::Failed)
    }
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_default_is_starting() {
        assert_eq!(Status::default(), Status::Starting);
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                Status::Starting,
                Status::SetupFailed,
                Status::Ready,
                Status::Busy,
                Status::Defunct,
            ],
            @r#"
        [
          "STARTING",
          "SETUP_FAILED",
          "READY",
          "BUSY",
          "DEFUNCT"
        ]
        "#
        );
    }

    #[test]
    fn status_display_matches_wire_format() {
        for status in [
            Status::Starting,
            Status::SetupFailed,
            Status::Ready,
            Status::Busy,
            Status::Defunct,
        ] {
            let wire = serde_json::to_value(status).unwrap();
            assert_eq!(wire, status.to_string());
        }
    }

    #[test]
    fn only_setup_failed_and_defunct_are_terminal() {
        assert!(!Status::Starting.is_terminal());
        assert!(!Status::Ready.is_terminal());
        assert!(!Status::Busy.is_terminal());
        assert!(Status::SetupFailed.is_terminal());
        assert!(Status::Defunct.is_terminal());
    }

    #[test]
    fn setup_status_deserializes_lowercase() {
        assert_eq!(
            serde_json::from_str::<SetupStatus>("\"succeeded\"").unwrap(),
            SetupStatus::Succeeded
        );
        assert!(serde_json::from_str::<SetupStatus>("\"exploded\"").is_err());
    }

    #[test]
    fn setup_result_decodes_worker_file() {
        let raw = r#"{"started_at": "2024-01-01T00:00:00+00:00", "status": "succeeded", "completed_at": "2024-01-01T00:00:05+00:00"}"#;
        let result: SetupResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.status, Some(SetupStatus::Succeeded));
        assert_eq!(
            result.completed_at.as_deref(),
            Some("2024-01-01T00:00:05+00:00")
        );
        assert!(result.logs.is_empty());
    }

    #[test]
    fn placeholder_then_failed() {
        let placeholder = SetupResult::starting();
        assert_eq!(placeholder.status, Some(SetupStatus::Starting));
        assert!(placeholder.completed_at.is_none());

        let started_at = placeholder.started_at.clone();
        let failed = placeholder.failed("boom".to_string());
        assert!(failed.is_failed());
        assert_eq!(failed.started_at, started_at);
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.logs, "boom");
    }

    #[test]
    fn setup_result_omits_empty_fields() {
        let result = SetupResult {
            started_at: "2024-01-01T00:00:00+00:00".to_string(),
            completed_at: None,
            status: None,
            logs: String::new(),
        };
        insta::assert_json_snapshot!(result, @r#"
        {
          "started_at": "2024-01-01T00:00:00+00:00"
        }
        "#);
    }
}
