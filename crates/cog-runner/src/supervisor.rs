//! Worker process supervision: launching, output streaming and exit watching.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::logs::LogSource;

/// Python module the worker runs as.
pub const WORKER_MODULE: &str = "cog.internal.file_runner";

/// How to invoke the worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub working_dir: PathBuf,
    pub module_name: String,
    pub class_name: String,
}

impl WorkerCommand {
    pub fn args(&self) -> Vec<String> {
        vec![
            "-m".to_string(),
            WORKER_MODULE.to_string(),
            "--working-dir".to_string(),
            self.working_dir.display().to_string(),
            "--module-name".to_string(),
            self.module_name.clone(),
            "--class-name".to_string(),
            self.class_name.clone(),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
///
/// Implementations must pipe stdout and stderr.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Launches the worker with the configured interpreter.
pub struct PythonSpawner;

impl WorkerSpawner for PythonSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let child = Command::new(&command.program)
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    /// Non-zero exit; `code` is `None` when killed by a signal.
    Failed { code: Option<i32> },
    /// Waiting on the process itself failed.
    WaitError(String),
}

impl WorkerExit {
    pub fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) if status.success() => Self::Success,
            Ok(status) => Self::Failed {
                code: status.code(),
            },
            Err(e) => Self::WaitError(e.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Process exit code; `-1` when the process did not exit normally.
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failed { code: Some(code) } => *code,
            Self::Failed { code: None } | Self::WaitError(_) => -1,
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("exited successfully"),
            Self::Failed { code: Some(code) } => write!(f, "exited with code {}", code),
            Self::Failed { code: None } => f.write_str("terminated by signal"),
            Self::WaitError(e) => write!(f, "wait failed: {}", e),
        }
    }
}

/// Wait for the child to exit, killing it first if `kill` is cancelled.
pub async fn wait_for_exit(mut child: Child, kill: CancellationToken) -> WorkerExit {
    let pid = child.id();
    tokio::select! {
        result = child.wait() => WorkerExit::from_wait(result),
        _ = kill.cancelled() => {
            tracing::warn!(?pid, "Force-killing worker");
            if let Err(e) = child.start_kill() {
                tracing::error!(?pid, error = %e, "Failed to kill worker");
            }
            WorkerExit::from_wait(child.wait().await)
        }
    }
}

/// Stream `reader` line by line into `sink` once the launch gate opens.
///
/// Invalid UTF-8 is replaced rather than ending the stream. Returns when the
/// stream closes or the gate is dropped without opening.
pub fn spawn_output_pump<R, F>(
    reader: R,
    source: LogSource,
    mut launched: watch::Receiver<bool>,
    mut sink: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(LogSource, String) + Send + 'static,
{
    tokio::spawn(async move {
        if launched.wait_for(|open| *open).await.is_err() {
            tracing::debug!(source = source.as_str(), "Launch gate dropped before opening");
            return;
        }

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }
                    sink(source, String::from_utf8_lossy(&buf).into_owned());
                }
                Err(e) => {
                    tracing::warn!(source = source.as_str(), error = %e, "Worker output stream failed");
                    break;
                }
            }
        }
        tracing::debug!(source = source.as_str(), "Worker output stream closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn collect() -> (
        Arc<Mutex<Vec<(LogSource, String)>>>,
        impl FnMut(LogSource, String) + Send + 'static,
    ) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        (lines, move |source, line| {
            sink_lines.lock().unwrap().push((source, line))
        })
    }

    #[test]
    fn worker_args() {
        let cmd = WorkerCommand {
            program: "python3".to_string(),
            working_dir: PathBuf::from("/tmp/work"),
            module_name: "predict".to_string(),
            class_name: "Predictor".to_string(),
        };
        assert_eq!(
            cmd.args(),
            vec![
                "-m",
                "cog.internal.file_runner",
                "--working-dir",
                "/tmp/work",
                "--module-name",
                "predict",
                "--class-name",
                "Predictor",
            ]
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(WorkerExit::Success.code(), 0);
        assert!(WorkerExit::Success.is_success());
        assert_eq!(WorkerExit::Failed { code: Some(3) }.code(), 3);
        assert_eq!(WorkerExit::Failed { code: None }.code(), -1);
        assert_eq!(WorkerExit::WaitError("gone".into()).code(), -1);
        assert!(!WorkerExit::Failed { code: Some(1) }.is_success());
    }

    #[tokio::test]
    async fn pump_waits_for_gate() {
        let (gate_tx, gate_rx) = watch::channel(false);
        let (lines, sink) = collect();
        let handle = spawn_output_pump(&b"one\ntwo\n"[..], LogSource::Stdout, gate_rx, sink);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lines.lock().unwrap().is_empty());

        gate_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(
            *lines.lock().unwrap(),
            vec![
                (LogSource::Stdout, "one".to_string()),
                (LogSource::Stdout, "two".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn pump_keeps_going_past_invalid_utf8() {
        let (_gate_tx, gate_rx) = watch::channel(true);
        let (lines, sink) = collect();
        spawn_output_pump(
            &b"bad \xff byte\r\nlast line without newline"[..],
            LogSource::Stderr,
            gate_rx,
            sink,
        )
        .await
        .unwrap();

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, LogSource::Stderr);
        assert_eq!(lines[0].1, "bad \u{fffd} byte");
        assert_eq!(lines[1].1, "last line without newline");
    }

    #[tokio::test]
    async fn pump_exits_when_gate_dropped() {
        let (gate_tx, gate_rx) = watch::channel(false);
        let (lines, sink) = collect();
        let handle = spawn_output_pump(&b"never\n"[..], LogSource::Stdout, gate_rx, sink);
        drop(gate_tx);
        handle.await.unwrap();
        assert!(lines.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_wait_kills_child() {
        let child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let kill = CancellationToken::new();
        kill.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), wait_for_exit(child, kill))
            .await
            .unwrap();
        assert_eq!(exit, WorkerExit::Failed { code: None });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_reports_exit_code() {
        let child = Command::new("sh").args(["-c", "exit 3"]).spawn().unwrap();
        let exit = wait_for_exit(child, CancellationToken::new()).await;
        assert_eq!(exit, WorkerExit::Failed { code: Some(3) });
    }
}
