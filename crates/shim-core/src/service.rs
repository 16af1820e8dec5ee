//! The task service dispatcher: the single
//! entry point every RPC handler in `shim-bin` calls into. Owns the
//! sandbox-vs-container classification, the service-level and
//! per-container locking, and wiring each container up to its I/O relay
//! and wait tracker.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::backend::{Mount, ProcessSpec, ResourceSpec, SandboxBackend};
use crate::bundle::{self, LoadedBundle};
use crate::container::{Container, ContainerKind};
use crate::error::{Error, Result};
use crate::event::{Event, EventPublisher};
use crate::exec::Exec;
use crate::id_map::IdMap;
use crate::io::{BackendIo, OrchestratorIo, TtyIo};
use crate::reaper::ExitReaper;
use crate::sandbox::Sandbox;
use crate::state::TaskState;
use crate::wait::{wait_exec, wait_primary};

pub struct CreateRequest {
    pub id: String,
    pub bundle: PathBuf,
    pub rootfs: Vec<Mount>,
    pub terminal: bool,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub id: String,
    pub pid: u32,
    pub state: TaskState,
    pub terminal: bool,
}

pub struct TaskService {
    backend: Arc<dyn SandboxBackend>,
    events: Arc<dyn EventPublisher>,
    reaper: ExitReaper,
    /// Serializes sandbox creation/registration. Per-container operations
    /// take the container's own `lock` instead; holding this one any
    /// longer than that would serialize unrelated containers on one shim.
    sandbox: tokio::sync::Mutex<Option<Arc<Sandbox>>>,
    containers: IdMap<Container>,
    /// Network namespace path supplied on the CLI, used to fill in a
    /// bundle's blank network namespace entry; `None` when the CLI gave
    /// none, in which case a blank entry is left as-is.
    cli_netns: Option<String>,
}

impl TaskService {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        events: Arc<dyn EventPublisher>,
        cli_netns: Option<String>,
    ) -> Self {
        let reaper = ExitReaper::spawn(events.clone());
        Self {
            backend,
            events,
            reaper,
            sandbox: tokio::sync::Mutex::new(None),
            containers: IdMap::new(),
            cli_netns,
        }
    }

    pub async fn create(&self, req: CreateRequest) -> Result<ContainerState> {
        let LoadedBundle {
            bundle,
            spec,
            sandbox_id,
            is_sandbox,
        } = bundle::load(&req.id, &req.bundle, self.cli_netns.as_deref())?;

        let container = if is_sandbox {
            self.create_sandbox_container(req, bundle, spec).await?
        } else {
            self.create_pod_container(req, bundle, spec, sandbox_id).await?
        };

        self.events
            .publish(Event::TaskCreate {
                container_id: container.id.clone(),
                pid: 0,
            })
            .await;

        Ok(ContainerState {
            id: container.id.clone(),
            pid: 0,
            state: TaskState::Created,
            terminal: container.terminal,
        })
    }

    async fn create_sandbox_container(
        &self,
        req: CreateRequest,
        bundle: PathBuf,
        spec: oci_spec::runtime::Spec,
    ) -> Result<Arc<Container>> {
        let mut slot = self.sandbox.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyExists(
                "this shim already manages a sandbox".into(),
            ));
        }

        let netns = spec
            .linux()
            .as_ref()
            .and_then(|l| l.namespaces().clone())
            .and_then(|namespaces| {
                namespaces
                    .iter()
                    .find(|ns| matches!(ns.typ(), oci_spec::runtime::LinuxNamespaceType::Network))
                    .and_then(|ns| ns.path().clone())
            });

        let handle = self
            .backend
            .create_sandbox(&spec, &req.rootfs, &req.id, &bundle, netns.as_deref())
            .await?;

        let sandbox = Arc::new(Sandbox::new(req.id.clone(), handle, netns, bundle.clone()));
        *slot = Some(sandbox.clone());
        drop(slot);

        let container = Arc::new(Container::new(
            req.id.clone(),
            ContainerKind::Sandbox,
            bundle,
            Arc::new(spec),
            req.rootfs,
            req.terminal,
            req.stdin,
            req.stdout,
            req.stderr,
            Utc::now(),
        ));
        self.containers.insert(req.id, container.clone()).await?;
        Ok(container)
    }

    async fn create_pod_container(
        &self,
        req: CreateRequest,
        bundle: PathBuf,
        spec: oci_spec::runtime::Spec,
        sandbox_id: Option<String>,
    ) -> Result<Arc<Container>> {
        let sandbox = {
            let slot = self.sandbox.lock().await;
            slot.clone()
        }
        .ok_or_else(|| Error::FailedPrecondition("no sandbox exists on this shim yet".into()))?;

        if let Some(expected) = &sandbox_id {
            if expected != &sandbox.id {
                return Err(Error::InvalidArgument(format!(
                    "container references sandbox {expected}, this shim manages {}",
                    sandbox.id
                )));
            }
        }

        self.backend
            .create_container(&sandbox.handle, &spec, &req.rootfs, &req.id, &bundle)
            .await?;

        let container = Arc::new(Container::new(
            req.id.clone(),
            ContainerKind::PodContainer,
            bundle,
            Arc::new(spec),
            req.rootfs,
            req.terminal,
            req.stdin,
            req.stdout,
            req.stderr,
            Utc::now(),
        ));
        self.containers.insert(req.id, container.clone()).await?;
        Ok(container)
    }

    pub async fn start(&self, id: &str) -> Result<u32> {
        let container = self.containers.get(id).await?;
        let sandbox = self.require_sandbox().await?;
        let _guard = container.lock.lock().await;

        {
            let mut state = container.state.lock().await;
            state.start()?;
        }

        if container.is_sandbox() {
            self.backend.start_sandbox(&sandbox.handle).await?;
        }
        let info = self.backend.start_container(&sandbox.handle, id).await?;
        container
            .pid
            .set(info.pid)
            .map_err(|_| Error::bug("container pid set twice"))?;
        container
            .token
            .set(info.token.clone())
            .map_err(|_| Error::bug("container token set twice"))?;

        if let Ok(backend_io) = self.backend.io_stream(&sandbox.handle, id, &info.token).await {
            if let Ok(orchestrator_io) = open_orchestrator_io(&container).await {
                let relay = TtyIo::spawn(backend_io, orchestrator_io);
                *container.io.lock().await = Some(relay);
            }
        }

        wait_primary(
            self.backend.clone(),
            sandbox.handle.clone(),
            container.clone(),
            info.token,
            self.reaper.handle(),
        );

        self.events
            .publish(Event::TaskStart {
                container_id: id.to_string(),
                pid: info.pid,
            })
            .await;

        Ok(info.pid)
    }

    pub async fn exec(
        &self,
        container_id: &str,
        exec_id: &str,
        spec: ProcessSpec,
        stdin: Option<String>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Result<()> {
        let container = self.containers.get(container_id).await?;
        {
            let state = container.state.lock().await;
            if *state != TaskState::Running {
                return Err(Error::FailedPrecondition(
                    "cannot exec into a container that is not running".into(),
                ));
            }
        }
        let exec = Arc::new(Exec::new(exec_id, container_id, spec, stdin, stdout, stderr));
        container.execs.insert(exec_id, exec).await?;
        self.events
            .publish(Event::TaskExecAdded {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn start_exec(&self, container_id: &str, exec_id: &str) -> Result<u32> {
        let container = self.containers.get(container_id).await?;
        let sandbox = self.require_sandbox().await?;
        let exec = container.execs.get(exec_id).await?;

        {
            let mut state = exec.state.lock().await;
            state.start()?;
        }

        let info = self
            .backend
            .enter_container(&sandbox.handle, container_id, &exec.spec)
            .await?;
        exec.pid
            .set(info.pid)
            .map_err(|_| Error::bug("exec pid set twice"))?;
        exec.token
            .set(info.token.clone())
            .map_err(|_| Error::bug("exec token set twice"))?;

        if let Ok(backend_io) = self.backend.io_stream(&sandbox.handle, container_id, &info.token).await {
            if let Ok(orchestrator_io) =
                open_orchestrator_io_paths(&exec.stdin, &exec.stdout, &exec.stderr).await
            {
                let relay = TtyIo::spawn(backend_io, orchestrator_io);
                *exec.io.lock().await = Some(relay);
            }
        }

        wait_exec(
            self.backend.clone(),
            sandbox.handle.clone(),
            container.clone(),
            exec.clone(),
            info.token,
            self.reaper.handle(),
        );

        self.events
            .publish(Event::TaskExecStarted {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
                pid: info.pid,
            })
            .await;

        Ok(info.pid)
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let container = self.containers.get(id).await?;
        if container.is_sandbox() {
            return Err(Error::InvalidArgument(
                "the sandbox's own container cannot be paused".into(),
            ));
        }
        let sandbox = self.require_sandbox().await?;
        let _guard = container.lock.lock().await;
        {
            let mut state = container.state.lock().await;
            state.pause()?;
        }
        self.backend.pause_container(&sandbox.handle, id).await?;
        self.events
            .publish(Event::TaskPaused {
                container_id: id.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let container = self.containers.get(id).await?;
        if container.is_sandbox() {
            return Err(Error::InvalidArgument(
                "the sandbox's own container cannot be resumed".into(),
            ));
        }
        let sandbox = self.require_sandbox().await?;
        let _guard = container.lock.lock().await;
        {
            let mut state = container.state.lock().await;
            state.resume()?;
        }
        self.backend.resume_container(&sandbox.handle, id).await?;
        self.events
            .publish(Event::TaskResumed {
                container_id: id.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn kill(&self, id: &str, exec_id: Option<&str>, signal: u32, all: bool) -> Result<()> {
        let container = self.containers.get(id).await?;
        let sandbox = self.require_sandbox().await?;
        let token = match exec_id {
            None => container.token.get().cloned().unwrap_or_else(|| id.to_string()),
            Some(exec_id) => {
                let exec = container.execs.get(exec_id).await?;
                exec.token.get().cloned().unwrap_or_else(|| exec_id.to_string())
            }
        };
        self.backend
            .signal_process(&sandbox.handle, id, &token, signal, all)
            .await
    }

    pub async fn close_io(&self, id: &str, exec_id: Option<&str>) -> Result<()> {
        let container = self.containers.get(id).await?;
        match exec_id {
            None => {
                if let Some(io) = container.io.lock().await.as_ref() {
                    io.close_stdin();
                }
            }
            Some(exec_id) => {
                let exec = container.execs.get(exec_id).await?;
                if let Some(io) = exec.io.lock().await.as_ref() {
                    io.close_stdin();
                }
            }
        }
        Ok(())
    }

    pub async fn resize_pty(&self, id: &str, exec_id: Option<&str>, height: u32, width: u32) -> Result<()> {
        let container = self.containers.get(id).await?;
        let sandbox = self.require_sandbox().await?;
        let token = match exec_id {
            None => container.token.get().cloned().unwrap_or_default(),
            Some(exec_id) => {
                let exec = container.execs.get(exec_id).await?;
                exec.token.get().cloned().unwrap_or_default()
            }
        };
        self.backend
            .winsize_process(&sandbox.handle, id, &token, height, width)
            .await
    }

    pub async fn state(&self, id: &str) -> Result<ContainerState> {
        let container = self.containers.get(id).await?;
        let state = *container.state.lock().await;
        Ok(ContainerState {
            id: container.id.clone(),
            pid: container.pid().await,
            state,
            terminal: container.terminal,
        })
    }

    pub async fn stats(&self, id: &str) -> Result<Vec<u8>> {
        let sandbox = self.require_sandbox().await?;
        Ok(self.backend.stats_container(&sandbox.handle, id).await?.data)
    }

    pub async fn pids(&self, id: &str) -> Result<Vec<u32>> {
        let sandbox = self.require_sandbox().await?;
        self.backend.list_pids(&sandbox.handle, id).await
    }

    pub async fn update(&self, id: &str, resources: ResourceSpec) -> Result<()> {
        let sandbox = self.require_sandbox().await?;
        self.backend
            .update_container_resources(&sandbox.handle, id, &resources)
            .await
    }

    pub async fn wait(&self, id: &str, exec_id: Option<&str>) -> Result<(u32, chrono::DateTime<Utc>)> {
        let container = self.containers.get(id).await?;
        match exec_id {
            None => Ok(*container.exit.wait().await),
            Some(exec_id) => {
                let exec = container.execs.get(exec_id).await?;
                Ok(*exec.exit.wait().await)
            }
        }
    }

    pub async fn delete(&self, id: &str, exec_id: Option<&str>) -> Result<(u32, chrono::DateTime<Utc>)> {
        let container = self.containers.get(id).await?;

        if let Some(exec_id) = exec_id {
            let exec = container.execs.remove(exec_id).await.ok_or_else(|| Error::NotFound(exec_id.to_string()))?;
            let exit = exec.exit.try_wait().copied().unwrap_or((0, Utc::now()));
            return Ok(exit);
        }

        let sandbox = self.require_sandbox().await?;
        let needs_stop = {
            let mut state = container.state.lock().await;
            if *state == TaskState::Created {
                state.delete_before_start()?;
                false
            } else {
                !state.is_stopped()
            }
        };

        if needs_stop {
            if let Some(io) = container.io.lock().await.as_ref() {
                io.cancel();
                io.wait_drained().await;
            }
            self.backend.stop_container(&sandbox.handle, id).await?;
            // The wait tracker spawned by `start` observes the process exit,
            // transitions the container to Stopped, and enqueues its
            // TaskExit; block here so Delete only returns once that has
            // happened, matching Wait's own synchronization on this cell.
            container.exit.wait().await;
        }

        self.backend.delete_container(&sandbox.handle, id).await?;
        let exit = container.exit.try_wait().copied().unwrap_or((0, Utc::now()));
        self.containers.remove(id).await;

        self.events
            .publish(Event::TaskDelete {
                container_id: id.to_string(),
                pid: container.pid().await,
                exit_status: exit.0,
                exited_at: exit.1,
            })
            .await;

        if container.is_sandbox() {
            self.backend.delete_sandbox(&sandbox.handle).await?;
            *self.sandbox.lock().await = None;
        }

        Ok(exit)
    }

    pub async fn shutdown(&self) -> Result<()> {
        if self.containers.is_empty().await {
            Ok(())
        } else {
            Err(Error::FailedPrecondition(
                "cannot shut down while containers remain".into(),
            ))
        }
    }

    async fn require_sandbox(&self) -> Result<Arc<Sandbox>> {
        self.sandbox
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::FailedPrecondition("no sandbox exists on this shim yet".into()))
    }
}

async fn open_orchestrator_io(container: &Container) -> Result<OrchestratorIo> {
    open_orchestrator_io_paths(&container.stdin, &container.stdout, &container.stderr).await
}

async fn open_orchestrator_io_paths(
    stdin: &Option<String>,
    stdout: &Option<String>,
    stderr: &Option<String>,
) -> Result<OrchestratorIo> {
    let stdin: Option<Box<dyn AsyncRead + Send + Unpin>> = match stdin {
        Some(path) => Some(Box::new(tokio::fs::File::open(path).await?)),
        None => None,
    };
    let stdout: Option<Box<dyn AsyncWrite + Send + Unpin>> = match stdout {
        Some(path) => Some(Box::new(
            tokio::fs::OpenOptions::new().write(true).open(path).await?,
        )),
        None => None,
    };
    let stderr: Option<Box<dyn AsyncWrite + Send + Unpin>> = match stderr {
        Some(path) => Some(Box::new(
            tokio::fs::OpenOptions::new().write(true).open(path).await?,
        )),
        None => None,
    };
    Ok(OrchestratorIo {
        stdin,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingEventPublisher;
    use crate::mock::MockBackend;
    use oci_spec::runtime::SpecBuilder;
    use std::collections::HashMap;

    fn write_bundle(dir: &std::path::Path, is_sandbox: bool, sandbox_id: Option<&str>) {
        let mut annotations = HashMap::new();
        annotations.insert(
            bundle::CONTAINER_TYPE_ANNOTATION.to_string(),
            if is_sandbox {
                bundle::CONTAINER_TYPE_SANDBOX.to_string()
            } else {
                bundle::CONTAINER_TYPE_CONTAINER.to_string()
            },
        );
        if let Some(sid) = sandbox_id {
            annotations.insert(bundle::SANDBOX_ANNOTATION.to_string(), sid.to_string());
        }
        let spec = SpecBuilder::default().annotations(annotations).build().unwrap();
        spec.save(dir.join("config.json")).unwrap();
    }

    fn service() -> TaskService {
        let (svc, _backend) = service_with_backend();
        svc
    }

    fn service_with_backend() -> (TaskService, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        let events = Arc::new(RecordingEventPublisher::new());
        (TaskService::new(backend.clone(), events, None), backend)
    }

    #[tokio::test]
    async fn create_sandbox_then_start() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), true, None);

        let created = svc
            .create(CreateRequest {
                id: "sbx1".into(),
                bundle: dir.path().to_path_buf(),
                rootfs: vec![],
                terminal: false,
                stdin: None,
                stdout: None,
                stderr: None,
            })
            .await
            .unwrap();
        assert_eq!(created.state, TaskState::Created);

        let pid = svc.start("sbx1").await.unwrap();
        assert!(pid > 0);

        let state = svc.state("sbx1").await.unwrap();
        assert_eq!(state.state, TaskState::Running);
    }

    #[tokio::test]
    async fn pod_container_without_sandbox_is_failed_precondition() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), false, Some("sbx1"));

        let err = svc
            .create(CreateRequest {
                id: "c1".into(),
                bundle: dir.path().to_path_buf(),
                rootfs: vec![],
                terminal: false,
                stdin: None,
                stdout: None,
                stderr: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn pause_on_sandbox_container_is_rejected() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), true, None);
        svc.create(CreateRequest {
            id: "sbx1".into(),
            bundle: dir.path().to_path_buf(),
            rootfs: vec![],
            terminal: false,
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap();
        svc.start("sbx1").await.unwrap();

        let err = svc.pause("sbx1").await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn resume_on_sandbox_container_is_rejected() {
        let svc = service();
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), true, None);
        svc.create(CreateRequest {
            id: "sbx1".into(),
            bundle: dir.path().to_path_buf(),
            rootfs: vec![],
            terminal: false,
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap();
        svc.start("sbx1").await.unwrap();

        let err = svc.resume("sbx1").await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn exec_then_wait_reports_exit_without_affecting_container() {
        let (svc, backend) = service_with_backend();
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), true, None);
        svc.create(CreateRequest {
            id: "sbx1".into(),
            bundle: dir.path().to_path_buf(),
            rootfs: vec![],
            terminal: false,
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap();
        svc.start("sbx1").await.unwrap();

        svc.exec("sbx1", "e1", ProcessSpec::default(), None, None, None).await.unwrap();
        // enter_container's token is deterministic from the mock's
        // naming scheme: tok-<container id>-<argv joined>.
        backend.queue_exit("sbx1", "tok-sbx1-", 5);
        svc.start_exec("sbx1", "e1").await.unwrap();

        let (code, _) = svc.wait("sbx1", Some("e1")).await.unwrap();
        assert_eq!(code, 5);

        let container_state = svc.state("sbx1").await.unwrap();
        assert_eq!(container_state.state, TaskState::Running);
    }

    #[tokio::test]
    async fn delete_running_container_drives_stop_and_waits_for_exit() {
        let (svc, backend) = service_with_backend();
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), true, None);
        svc.create(CreateRequest {
            id: "sbx1".into(),
            bundle: dir.path().to_path_buf(),
            rootfs: vec![],
            terminal: false,
            stdin: None,
            stdout: None,
            stderr: None,
        })
        .await
        .unwrap();
        svc.start("sbx1").await.unwrap();

        // start's token is deterministic from the mock's naming scheme.
        backend.queue_exit("sbx1", "tok-sbx1", 9);

        let (code, _) = svc.delete("sbx1", None).await.unwrap();
        assert_eq!(code, 9);

        let err = svc.state("sbx1").await.unwrap_err();
        assert_eq!(err.code(), crate::error::Code::NotFound);
    }
}
