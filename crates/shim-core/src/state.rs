//! Container/Exec task state, as a closed set of variants with explicit
//! transition functions — see DESIGN.md for the state-machine notes
//! as tagged variants".

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl TaskState {
    /// `Created -> Running`. Valid on both containers and execs.
    pub fn start(&mut self) -> Result<()> {
        match self {
            TaskState::Created => {
                *self = TaskState::Running;
                Ok(())
            }
            s => Err(Error::FailedPrecondition(format!(
                "cannot start task in state {s:?}"
            ))),
        }
    }

    /// `Running -> Paused`. Callers must additionally reject this for
    /// sandbox-typed containers before calling here.
    pub fn pause(&mut self) -> Result<()> {
        match self {
            TaskState::Running => {
                *self = TaskState::Paused;
                Ok(())
            }
            s => Err(Error::FailedPrecondition(format!(
                "cannot pause task in state {s:?}"
            ))),
        }
    }

    /// `Paused -> Running`.
    pub fn resume(&mut self) -> Result<()> {
        match self {
            TaskState::Paused => {
                *self = TaskState::Running;
                Ok(())
            }
            s => Err(Error::FailedPrecondition(format!(
                "cannot resume task in state {s:?}"
            ))),
        }
    }

    /// `{Running, Paused} -> Stopped`, as a result of process exit, a Kill,
    /// or a Delete. Idempotent once already Stopped.
    pub fn stop(&mut self) -> Result<()> {
        match self {
            TaskState::Running | TaskState::Paused => {
                *self = TaskState::Stopped;
                Ok(())
            }
            TaskState::Stopped => Ok(()),
            TaskState::Created => Err(Error::FailedPrecondition(
                "cannot stop task that was never started".into(),
            )),
        }
    }

    /// `Created -> Stopped`, the Delete-before-Start path.
    pub fn delete_before_start(&mut self) -> Result<()> {
        match self {
            TaskState::Created => {
                *self = TaskState::Stopped;
                Ok(())
            }
            s => Err(Error::FailedPrecondition(format!(
                "cannot delete-before-start task in state {s:?}"
            ))),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, TaskState::Stopped)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let mut s = TaskState::default();
        assert_eq!(s, TaskState::Created);
        s.start().unwrap();
        assert_eq!(s, TaskState::Running);
        s.pause().unwrap();
        assert_eq!(s, TaskState::Paused);
        s.resume().unwrap();
        assert_eq!(s, TaskState::Running);
        s.stop().unwrap();
        assert_eq!(s, TaskState::Stopped);
    }

    #[test]
    fn delete_before_start() {
        let mut s = TaskState::default();
        s.delete_before_start().unwrap();
        assert!(s.is_stopped());
    }

    #[test]
    fn all_invalid_transitions_fail() {
        for initial in [
            TaskState::Created,
            TaskState::Running,
            TaskState::Paused,
            TaskState::Stopped,
        ] {
            let mut s = initial;
            if s.start().is_ok() {
                assert_eq!(initial, TaskState::Created);
            }
            let mut s = initial;
            if s.pause().is_ok() {
                assert_eq!(initial, TaskState::Running);
            }
            let mut s = initial;
            if s.resume().is_ok() {
                assert_eq!(initial, TaskState::Paused);
            }
            let mut s = initial;
            if s.delete_before_start().is_ok() {
                assert_eq!(initial, TaskState::Created);
            }
        }
    }

    #[test]
    fn stop_is_idempotent_once_stopped() {
        let mut s = TaskState::Stopped;
        s.stop().unwrap();
        assert_eq!(s, TaskState::Stopped);
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let mut s = TaskState::Created;
        assert!(s.stop().is_err());
    }
}
