//! The Exec entity: an additional process run inside an
//! already-running container, tracked separately from the container's
//! primary process but sharing its lifetime ceiling (an exec cannot
//! outlive its container).

use chrono::{DateTime, Utc};

use crate::backend::ProcessSpec;
use crate::io::TtyIo;
use crate::state::TaskState;
use crate::sync::WaitableCell;

/// Exit code used before a real one is known, and as the guaranteed
/// fallback if the process vanishes without ever reporting one.
pub const UNKNOWN_EXIT_CODE: u32 = 255;

pub struct Exec {
    pub id: String,
    pub container_id: String,
    pub spec: ProcessSpec,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub token: tokio::sync::OnceCell<String>,
    pub pid: tokio::sync::OnceCell<u32>,
    pub state: tokio::sync::Mutex<TaskState>,
    pub io: tokio::sync::Mutex<Option<std::sync::Arc<TtyIo>>>,
    pub exit: WaitableCell<(u32, DateTime<Utc>)>,
}

impl Exec {
    pub fn new(
        id: impl Into<String>,
        container_id: impl Into<String>,
        spec: ProcessSpec,
        stdin: Option<String>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            container_id: container_id.into(),
            spec,
            stdin,
            stdout,
            stderr,
            token: tokio::sync::OnceCell::new(),
            pid: tokio::sync::OnceCell::new(),
            state: tokio::sync::Mutex::new(TaskState::default()),
            io: tokio::sync::Mutex::new(None),
            exit: WaitableCell::new(),
        }
    }

    pub async fn pid(&self) -> u32 {
        self.pid.get().copied().unwrap_or(0)
    }
}
