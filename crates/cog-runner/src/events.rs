//! Readiness notifications from the worker.
//!
//! The worker announces "ready" and "busy" transitions. Inside the runner they
//! travel as [`WorkerEvent`] over an mpsc channel; the OS signals a real worker
//! raises are forwarded into that channel by [`forward_os_signals`].

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Worker is idle: setup finished or a prediction completed.
    Ready,
    /// Worker picked up a prediction.
    Busy,
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Forward SIGUSR1 as [`WorkerEvent::Ready`] and SIGUSR2 as [`WorkerEvent::Busy`].
///
/// Handlers are installed before this returns, so the default action (exit)
/// never applies to a worker signal raised afterwards. The forwarding task
/// ends when the receiving side is dropped.
///
/// Busy is polled first: when both signals are pending at once the worker has
/// already gone busy and back, so the pair must be delivered ending on Ready.
#[cfg(unix)]
pub fn forward_os_signals(tx: EventSender) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut ready = signal(SignalKind::user_defined1())?;
    let mut busy = signal(SignalKind::user_defined2())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = busy.recv() => WorkerEvent::Busy,
                _ = ready.recv() => WorkerEvent::Ready,
                _ = tx.closed() => break,
            };
            tracing::trace!(?event, "Received worker signal");
            if tx.send(event).is_err() {
                break;
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (tx, mut rx) = event_channel();
        tx.send(WorkerEvent::Busy).unwrap();
        tx.send(WorkerEvent::Ready).unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(WorkerEvent::Busy));
        assert_eq!(rx.recv().await, Some(WorkerEvent::Ready));
        assert_eq!(rx.recv().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn forwarder_stops_when_receiver_dropped() {
        let (tx, rx) = event_channel();
        let forwarder = forward_os_signals(tx).unwrap();
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(5), forwarder)
            .await
            .expect("forwarder should exit")
            .unwrap();
    }

    /// Raise SIGUSR2 then SIGUSR1 at this process, both landing before the
    /// forwarder is polled.
    #[cfg(unix)]
    fn raise_busy_then_ready() {
        let pid = std::process::id().to_string();
        let status = std::process::Command::new("sh")
            .args(["-c", "kill -USR2 \"$1\"; kill -USR1 \"$1\"", "sh", pid.as_str()])
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn busy_then_ready_pair_ends_ready() {
        use crate::health::Status;
        use crate::protocol::{OPENAPI_FILE, SETUP_RESULT_FILE};
        use crate::state::RunnerState;
        use crate::workdir::WorkingDir;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let wd = WorkingDir::new(dir.path());
        std::fs::write(wd.join(OPENAPI_FILE), "{}").unwrap();
        std::fs::write(
            wd.join(SETUP_RESULT_FILE),
            r#"{"started_at": "2024-01-01T00:00:00+00:00", "status": "succeeded"}"#,
        )
        .unwrap();
        let mut state = RunnerState::new(false);
        state.begin_setup();
        state.mark_launched();
        state.handle_event(&wd, WorkerEvent::Ready).unwrap();

        let (tx, mut rx) = event_channel();
        let forwarder = forward_os_signals(tx).unwrap();

        for _ in 0..20 {
            // Blocking the runtime thread keeps both signals pending together.
            raise_busy_then_ready();
            std::thread::sleep(Duration::from_millis(20));

            let mut received = Vec::new();
            while received.len() < 2 {
                let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                    .await
                    .expect("worker signal should be forwarded")
                    .unwrap();
                state.handle_event(&wd, event).unwrap();
                received.push(event);
            }
            assert_eq!(received, vec![WorkerEvent::Busy, WorkerEvent::Ready]);
            assert_eq!(state.status(), Status::Ready);
        }

        drop(rx);
        forwarder.await.unwrap();
    }
}
