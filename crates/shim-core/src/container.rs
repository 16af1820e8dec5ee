//! The Container entity: either a sandbox-typed container
//! (the one whose lifecycle drives the sandbox's own) or an ordinary pod
//! container running inside an already-created sandbox.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use oci_spec::runtime::Spec;

use crate::backend::Mount;
use crate::exec::Exec;
use crate::id_map::IdMap;
use crate::io::TtyIo;
use crate::state::TaskState;
use crate::sync::WaitableCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Sandbox,
    PodContainer,
}

pub struct Container {
    pub id: String,
    pub kind: ContainerKind,
    pub bundle: PathBuf,
    pub spec: Arc<Spec>,
    pub rootfs: Vec<Mount>,
    pub terminal: bool,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub created_at: DateTime<Utc>,

    /// Guards the container's own state transitions and its `pid`.
    /// Callers serialize on this before touching `state`/`pid`/`io`.
    pub lock: tokio::sync::Mutex<()>,
    pub state: tokio::sync::Mutex<TaskState>,
    pub pid: tokio::sync::OnceCell<u32>,
    pub token: tokio::sync::OnceCell<String>,
    pub io: tokio::sync::Mutex<Option<Arc<TtyIo>>>,

    pub execs: IdMap<Exec>,
    pub exit: WaitableCell<(u32, DateTime<Utc>)>,
}

impl Container {
    pub fn new(
        id: impl Into<String>,
        kind: ContainerKind,
        bundle: PathBuf,
        spec: Arc<Spec>,
        rootfs: Vec<Mount>,
        terminal: bool,
        stdin: Option<String>,
        stdout: Option<String>,
        stderr: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            bundle,
            spec,
            rootfs,
            terminal,
            stdin,
            stdout,
            stderr,
            created_at,
            lock: tokio::sync::Mutex::new(()),
            state: tokio::sync::Mutex::new(TaskState::default()),
            pid: tokio::sync::OnceCell::new(),
            token: tokio::sync::OnceCell::new(),
            io: tokio::sync::Mutex::new(None),
            execs: IdMap::new(),
            exit: WaitableCell::new(),
        }
    }

    pub fn is_sandbox(&self) -> bool {
        matches!(self.kind, ContainerKind::Sandbox)
    }

    pub async fn pid(&self) -> u32 {
        self.pid.get().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::Spec;

    fn empty_container(kind: ContainerKind) -> Container {
        Container::new(
            "c1",
            kind,
            PathBuf::from("/run/bundle/c1"),
            Arc::new(Spec::default()),
            vec![],
            false,
            None,
            None,
            None,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn sandbox_kind_flag() {
        let c = empty_container(ContainerKind::Sandbox);
        assert!(c.is_sandbox());
        let c = empty_container(ContainerKind::PodContainer);
        assert!(!c.is_sandbox());
    }

    #[tokio::test]
    async fn starts_with_no_execs_and_created_state() {
        let c = empty_container(ContainerKind::PodContainer);
        assert!(c.execs.is_empty().await);
        assert_eq!(*c.state.lock().await, TaskState::Created);
    }
}
