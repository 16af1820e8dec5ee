//! Wait trackers: one spawned task per
//! process, which blocks on the backend's wait call and then finalizes
//! that process's state.
//!
//! Deliberately two separate functions rather than one generic over
//! "primary process or exec": an earlier, single merged implementation
//! indexed into the container's exec map even for the primary process
//! and needed the map to be present before it was actually populated,
//! which raced when `Start` and an immediate `Delete` ran back to back.
//! Two functions with no shared branch make that race structurally
//! impossible instead of carefully avoided.

use std::sync::Arc;

use chrono::Utc;

use crate::backend::SandboxBackend;
use crate::container::Container;
use crate::exec::{Exec, UNKNOWN_EXIT_CODE};
use crate::reaper::{ExitRecord, ExitReaper};

fn clamp_exit_status(code: i32) -> u32 {
    if code < 0 {
        UNKNOWN_EXIT_CODE
    } else {
        code as u32
    }
}

/// Waits on a container's primary process and finalizes the container.
///
/// Blocks on the I/O relay's drained signal before asking the backend to
/// wait for the process, so the exit record is never published ahead of
/// the relay finishing its copies. Execs skip this: their I/O is already
/// running by start time and drains via their own relay independently of
/// the container's wait.
pub fn wait_primary(
    backend: Arc<dyn SandboxBackend>,
    sandbox: String,
    container: Arc<Container>,
    token: String,
    reaper: ExitReaper,
) {
    tokio::spawn(async move {
        let drained = container.io.lock().await.as_ref().map(|io| io.drained_cell());
        if let Some(drained) = drained {
            drained.wait().await;
        }

        let exit_status = match backend.wait_process(&sandbox, &container.id, &token).await {
            Ok(code) => clamp_exit_status(code),
            Err(err) => {
                tracing::warn!(container_id = %container.id, %err, "wait_process failed; reporting unknown exit");
                UNKNOWN_EXIT_CODE
            }
        };
        let exited_at = Utc::now();

        {
            let mut state = container.state.lock().await;
            if let Err(err) = state.stop() {
                tracing::debug!(container_id = %container.id, %err, "container already stopped");
            }
        }
        let _ = container.exit.set((exit_status, exited_at));

        reaper
            .enqueue(ExitRecord {
                container_id: container.id.clone(),
                exec_id: None,
                pid: container.pid().await,
                exit_status,
                exited_at,
            })
            .await;
    });
}

/// Waits on an exec process and finalizes that exec only; the parent
/// container's state is untouched.
pub fn wait_exec(
    backend: Arc<dyn SandboxBackend>,
    sandbox: String,
    container: Arc<Container>,
    exec: Arc<Exec>,
    token: String,
    reaper: ExitReaper,
) {
    tokio::spawn(async move {
        let exit_status = match backend.wait_process(&sandbox, &container.id, &token).await {
            Ok(code) => clamp_exit_status(code),
            Err(err) => {
                tracing::warn!(container_id = %container.id, exec_id = %exec.id, %err, "wait_process failed; reporting unknown exit");
                UNKNOWN_EXIT_CODE
            }
        };
        let exited_at = Utc::now();

        {
            let mut state = exec.state.lock().await;
            if let Err(err) = state.stop() {
                tracing::debug!(exec_id = %exec.id, %err, "exec already stopped");
            }
        }
        let _ = exec.exit.set((exit_status, exited_at));

        reaper
            .enqueue(ExitRecord {
                container_id: container.id.clone(),
                exec_id: Some(exec.id.clone()),
                pid: exec.pid().await,
                exit_status,
                exited_at,
            })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProcessSpec;
    use crate::container::ContainerKind;
    use crate::event::RecordingEventPublisher;
    use crate::mock::MockBackend;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn container() -> Arc<Container> {
        Arc::new(Container::new(
            "c1",
            ContainerKind::PodContainer,
            PathBuf::from("/run/bundle/c1"),
            Arc::new(oci_spec::runtime::Spec::default()),
            vec![],
            false,
            None,
            None,
            None,
            Utc::now(),
        ))
    }

    #[tokio::test]
    async fn wait_primary_stops_container_and_reports_exit() {
        let mock = Arc::new(MockBackend::new());
        mock.queue_exit("c1", "tok", 7);
        let backend: Arc<dyn SandboxBackend> = mock;
        let publisher = Arc::new(RecordingEventPublisher::new());
        let reaper = ExitReaper::spawn(publisher.clone());
        let c = container();

        wait_primary(backend, "sbx".into(), c.clone(), "tok".into(), reaper);

        let (code, _) = c.exit.wait().await;
        assert_eq!(*code, 7);
        assert_eq!(*c.state.lock().await, crate::state::TaskState::Stopped);
    }

    #[tokio::test]
    async fn wait_primary_blocks_on_io_drain_before_reporting_exit() {
        use crate::io::{BackendIo, OrchestratorIo, TtyIo};
        use tokio::io::{duplex, AsyncWriteExt};

        let mock = Arc::new(MockBackend::new());
        mock.queue_exit("c1", "tok", 0);
        let backend: Arc<dyn SandboxBackend> = mock;
        let publisher = Arc::new(RecordingEventPublisher::new());
        let reaper = ExitReaper::spawn(publisher.clone());
        let c = container();

        let (backend_stdout_r, mut backend_stdout_w) = duplex(64);
        let (orch_stdout_w, _orch_stdout_r) = duplex(64);
        let relay = TtyIo::spawn(
            BackendIo::Pipes {
                stdin: None,
                stdout: Some(Box::new(backend_stdout_r)),
                stderr: None,
            },
            OrchestratorIo {
                stdin: None,
                stdout: Some(Box::new(orch_stdout_w)),
                stderr: None,
            },
        );
        *c.io.lock().await = Some(relay);

        wait_primary(backend, "sbx".into(), c.clone(), "tok".into(), reaper);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(c.exit.try_wait().is_none(), "exit reported before I/O drained");

        backend_stdout_w.shutdown().await.unwrap();

        let (code, _) = c.exit.wait().await;
        assert_eq!(*code, 0);
    }

    #[tokio::test]
    async fn wait_exec_does_not_touch_container_state() {
        let mock = Arc::new(MockBackend::new());
        mock.queue_exit("c1", "extok", 3);
        let backend: Arc<dyn SandboxBackend> = mock;
        let publisher = Arc::new(RecordingEventPublisher::new());
        let reaper = ExitReaper::spawn(publisher.clone());
        let c = container();
        let exec = Arc::new(Exec::new("e1", "c1", ProcessSpec::default(), None, None, None));

        wait_exec(backend, "sbx".into(), c.clone(), exec.clone(), "extok".into(), reaper);

        let (code, _) = exec.exit.wait().await;
        assert_eq!(*code, 3);
        assert_eq!(*c.state.lock().await, crate::state::TaskState::Created);
    }
}
