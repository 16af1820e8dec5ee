//! The TTY I/O relay: copies bytes between the
//! orchestrator-provided stdio endpoints and whatever the backend hands
//! back for a process, either as one bidirectional terminal stream or as
//! three independent one-way pipes.
//!
//! Every relay fires its drained signal exactly once, whether because all
//! copies hit EOF or because it was cancelled by `CloseIO` or a kill.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::sync::WaitableCell;

/// Whatever the backend gives us for a single process's I/O. A terminal
/// process multiplexes stdout+stderr onto one stream; a non-terminal one
/// gets up to three independent streams depending on what the caller
/// asked `Create`/`Exec` to wire up.
pub enum BackendIo {
    Terminal {
        read: Box<dyn AsyncRead + Send + Unpin>,
        write: Box<dyn AsyncWrite + Send + Unpin>,
    },
    Pipes {
        stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    },
}

/// The orchestrator-side endpoints named at `Create`/`Exec` time (fifo
/// paths in production, in-memory pipes in tests).
pub struct OrchestratorIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

/// A running relay for one process. Dropping this does not stop the
/// copies; use `close_stdin`/`cancel` explicitly.
pub struct TtyIo {
    stdin_cancel: CancellationToken,
    all_cancel: CancellationToken,
    drained: WaitableCell<()>,
}

impl TtyIo {
    /// Spawns the copy tasks and returns a handle plus a cell that fires
    /// once every direction has drained (EOF or cancellation).
    pub fn spawn(backend: BackendIo, orchestrator: OrchestratorIo) -> Arc<TtyIo> {
        let stdin_cancel = CancellationToken::new();
        let all_cancel = CancellationToken::new();
        let drained = WaitableCell::new();

        let mut legs = 0usize;
        let done = Arc::new(tokio::sync::Semaphore::new(0));

        match backend {
            BackendIo::Terminal { read, write } => {
                if let Some(stdin) = orchestrator.stdin {
                    legs += 1;
                    spawn_leg(stdin, write, stdin_cancel.clone(), done.clone());
                }
                if let Some(stdout) = orchestrator.stdout {
                    legs += 1;
                    spawn_leg(read, stdout, all_cancel.clone(), done.clone());
                }
            }
            BackendIo::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                if let (Some(src), Some(dst)) = (orchestrator.stdin, stdin) {
                    legs += 1;
                    spawn_leg(src, dst, stdin_cancel.clone(), done.clone());
                }
                if let (Some(src), Some(dst)) = (stdout, orchestrator.stdout) {
                    legs += 1;
                    spawn_leg(src, dst, all_cancel.clone(), done.clone());
                }
                if let (Some(src), Some(dst)) = (stderr, orchestrator.stderr) {
                    legs += 1;
                    spawn_leg(src, dst, all_cancel.clone(), done.clone());
                }
            }
        }

        let handle = Arc::new(TtyIo {
            stdin_cancel,
            all_cancel,
            drained: drained.clone(),
        });

        if legs == 0 {
            // Nothing to copy: the signal fires immediately.
            let _ = drained.set(());
        } else {
            tokio::spawn(async move {
                for _ in 0..legs {
                    let _ = done.acquire().await;
                }
                let _ = drained.set(());
            });
        }

        handle
    }

    /// `CloseIO`: stop forwarding stdin only, leaving stdout/stderr legs
    /// running until they hit EOF on their own.
    pub fn close_stdin(&self) {
        self.stdin_cancel.cancel();
    }

    /// Kill/teardown: stop every leg immediately.
    pub fn cancel(&self) {
        self.stdin_cancel.cancel();
        self.all_cancel.cancel();
    }

    pub async fn wait_drained(&self) {
        self.drained.wait().await;
    }

    pub fn drained_cell(&self) -> WaitableCell<()> {
        self.drained.clone()
    }
}

fn spawn_leg(
    mut src: impl AsyncRead + Send + Unpin + 'static,
    mut dst: impl AsyncWrite + Send + Unpin + 'static,
    cancel: CancellationToken,
    done: Arc<tokio::sync::Semaphore>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = tokio::io::copy(&mut src, &mut dst) => {
                if let Err(err) = res {
                    tracing::debug!(%err, "io relay leg ended with error");
                }
            }
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut dst).await;
        done.add_permits(1);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn pipes_drain_on_eof() {
        let (mut orch_stdin_w, orch_stdin_r) = duplex(64);
        let (backend_stdin_r, backend_stdin_w) = duplex(64);
        let (backend_stdout_r, mut backend_stdout_w) = duplex(64);
        let (orch_stdout_w, mut orch_stdout_r) = duplex(64);

        let backend = BackendIo::Pipes {
            stdin: Some(Box::new(backend_stdin_w)),
            stdout: Some(Box::new(backend_stdout_r)),
            stderr: None,
        };
        let _ = backend_stdin_r;
        let orchestrator = OrchestratorIo {
            stdin: Some(Box::new(orch_stdin_r)),
            stdout: Some(Box::new(orch_stdout_w)),
            stderr: None,
        };

        let relay = TtyIo::spawn(backend, orchestrator);

        backend_stdout_w.write_all(b"hi").await.unwrap();
        backend_stdout_w.shutdown().await.unwrap();
        orch_stdin_w.shutdown().await.unwrap();

        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut orch_stdout_r, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"hi");

        relay.wait_drained().await;
    }

    #[tokio::test]
    async fn no_legs_drains_immediately() {
        let backend = BackendIo::Pipes {
            stdin: None,
            stdout: None,
            stderr: None,
        };
        let orchestrator = OrchestratorIo {
            stdin: None,
            stdout: None,
            stderr: None,
        };
        let relay = TtyIo::spawn(backend, orchestrator);
        relay.wait_drained().await;
    }

    #[tokio::test]
    async fn close_stdin_does_not_cancel_stdout() {
        let (orch_stdin_w, orch_stdin_r) = duplex(64);
        let (backend_stdin_r, backend_stdin_w) = duplex(64);
        let (backend_stdout_r, mut backend_stdout_w) = duplex(64);
        let (orch_stdout_w, mut orch_stdout_r) = duplex(64);

        let backend = BackendIo::Pipes {
            stdin: Some(Box::new(backend_stdin_w)),
            stdout: Some(Box::new(backend_stdout_r)),
            stderr: None,
        };
        let _ = backend_stdin_r;
        let orchestrator = OrchestratorIo {
            stdin: Some(Box::new(orch_stdin_r)),
            stdout: Some(Box::new(orch_stdout_w)),
            stderr: None,
        };

        let relay = TtyIo::spawn(backend, orchestrator);
        relay.close_stdin();
        drop(orch_stdin_w);

        backend_stdout_w.write_all(b"ok").await.unwrap();
        backend_stdout_w.shutdown().await.unwrap();

        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut orch_stdout_r, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf, b"ok");

        relay.wait_drained().await;
    }
}
