//! Bridges the synchronous `containerd_shim::Task` ttRPC surface to the
//! async `shim_core::TaskService`. One blocking `Handle::block_on` per
//! RPC — ttrpc dispatches each call on its own thread, so blocking here
//! does not stall other in-flight RPCs.

use std::sync::Arc;

use containerd_shim::api;
use containerd_shim::protos::api::Status as TaskStatus;
use containerd_shim::protos::protobuf::well_known_types::timestamp::Timestamp;
use containerd_shim::{ExitSignal, TtrpcContext, TtrpcResult};
use containerd_shim::ttrpc::{Code, Error as TtrpcError, Status};
use tokio::runtime::Handle;

use shim_core::error::{Code as CoreCode, Error as CoreError};
use shim_core::service::{ContainerState, CreateRequest, TaskService};
use shim_core::state::TaskState;

use crate::hooks;

pub struct ShimTask {
    pub service: Arc<TaskService>,
    pub handle: Handle,
    pub exit: ExitSignal,
}

fn to_ttrpc(err: CoreError) -> TtrpcError {
    let code = match err.code() {
        CoreCode::InvalidArgument => Code::INVALID_ARGUMENT,
        CoreCode::NotFound => Code::NOT_FOUND,
        CoreCode::AlreadyExists => Code::ALREADY_EXISTS,
        CoreCode::FailedPrecondition => Code::FAILED_PRECONDITION,
        CoreCode::Cancelled => Code::CANCELLED,
        CoreCode::Unavailable => Code::UNAVAILABLE,
        CoreCode::Internal => Code::INTERNAL,
    };
    TtrpcError::RpcStatus(Status {
        code: code.into(),
        message: err.to_string(),
        ..Default::default()
    })
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> Timestamp {
    Timestamp {
        seconds: at.timestamp(),
        nanos: at.timestamp_subsec_nanos() as i32,
        ..Default::default()
    }
}

fn state_to_status(state: &TaskState) -> TaskStatus {
    match state {
        TaskState::Created => TaskStatus::CREATED,
        TaskState::Running => TaskStatus::RUNNING,
        TaskState::Paused => TaskStatus::PAUSED,
        TaskState::Stopped { .. } => TaskStatus::STOPPED,
    }
}

impl containerd_shim::Task for ShimTask {
    fn create(&self, _ctx: &TtrpcContext, req: api::CreateTaskRequest) -> TtrpcResult<api::CreateTaskResponse> {
        let rootfs = req
            .rootfs
            .iter()
            .map(|m| shim_core::backend::Mount {
                r#type: m.type_.clone(),
                source: m.source.clone(),
                target: m.target.clone(),
                options: m.options.clone(),
            })
            .collect();
        let create = CreateRequest {
            id: req.id.clone(),
            bundle: req.bundle.clone().into(),
            rootfs,
            terminal: req.terminal,
            stdin: req.stdin.clone(),
            stdout: req.stdout.clone(),
            stderr: req.stderr.clone(),
        };
        let state = self
            .handle
            .block_on(self.service.create(create))
            .map_err(to_ttrpc)?;
        self.handle
            .block_on(run_create_hooks(&req.bundle, &req.id, state.pid));
        Ok(api::CreateTaskResponse {
            pid: state.pid,
            ..Default::default()
        })
    }

    fn start(&self, _ctx: &TtrpcContext, req: api::StartRequest) -> TtrpcResult<api::StartResponse> {
        let pid = match non_empty(&req.exec_id) {
            None => self.handle.block_on(self.service.start(&req.id)).map_err(to_ttrpc)?,
            Some(exec_id) => self
                .handle
                .block_on(self.service.start_exec(&req.id, &exec_id))
                .map_err(to_ttrpc)?,
        };
        Ok(api::StartResponse {
            pid,
            ..Default::default()
        })
    }

    fn delete(&self, _ctx: &TtrpcContext, req: api::DeleteRequest) -> TtrpcResult<api::DeleteResponse> {
        let exec_id = non_empty(&req.exec_id);
        let (exit_status, exited_at) = self
            .handle
            .block_on(self.service.delete(&req.id, exec_id.as_deref()))
            .map_err(to_ttrpc)?;
        Ok(api::DeleteResponse {
            exit_status,
            exited_at: Some(timestamp(exited_at)).into(),
            ..Default::default()
        })
    }

    fn kill(&self, _ctx: &TtrpcContext, req: api::KillRequest) -> TtrpcResult<api::Empty> {
        let exec_id = non_empty(&req.exec_id);
        self.handle
            .block_on(self.service.kill(&req.id, exec_id.as_deref(), req.signal, req.all))
            .map_err(to_ttrpc)?;
        Ok(api::Empty::default())
    }

    fn wait(&self, _ctx: &TtrpcContext, req: api::WaitRequest) -> TtrpcResult<api::WaitResponse> {
        let exec_id = non_empty(&req.exec_id);
        let (exit_status, exited_at) = self
            .handle
            .block_on(self.service.wait(&req.id, exec_id.as_deref()))
            .map_err(to_ttrpc)?;
        Ok(api::WaitResponse {
            exit_status,
            exited_at: Some(timestamp(exited_at)).into(),
            ..Default::default()
        })
    }

    fn state(&self, _ctx: &TtrpcContext, req: api::StateRequest) -> TtrpcResult<api::StateResponse> {
        let ContainerState { id, pid, state, terminal } = self
            .handle
            .block_on(self.service.state(&req.id))
            .map_err(to_ttrpc)?;
        Ok(api::StateResponse {
            id,
            pid,
            terminal,
            status: state_to_status(&state).into(),
            exec_id: req.exec_id,
            ..Default::default()
        })
    }

    fn pause(&self, _ctx: &TtrpcContext, req: api::PauseRequest) -> TtrpcResult<api::Empty> {
        self.handle.block_on(self.service.pause(&req.id)).map_err(to_ttrpc)?;
        Ok(api::Empty::default())
    }

    fn resume(&self, _ctx: &TtrpcContext, req: api::ResumeRequest) -> TtrpcResult<api::Empty> {
        self.handle.block_on(self.service.resume(&req.id)).map_err(to_ttrpc)?;
        Ok(api::Empty::default())
    }

    fn resize_pty(&self, _ctx: &TtrpcContext, req: api::ResizePtyRequest) -> TtrpcResult<api::Empty> {
        let exec_id = non_empty(&req.exec_id);
        self.handle
            .block_on(self.service.resize_pty(&req.id, exec_id.as_deref(), req.height, req.width))
            .map_err(to_ttrpc)?;
        Ok(api::Empty::default())
    }

    fn stats(&self, _ctx: &TtrpcContext, req: api::StatsRequest) -> TtrpcResult<api::StatsResponse> {
        let blob = self
            .handle
            .block_on(self.service.stats(&req.id))
            .map_err(to_ttrpc)?;
        let mut stats = containerd_shim::protos::protobuf::well_known_types::any::Any::new();
        stats.value = blob;
        Ok(api::StatsResponse {
            stats: Some(stats).into(),
            ..Default::default()
        })
    }

    fn update(&self, _ctx: &TtrpcContext, req: api::UpdateTaskRequest) -> TtrpcResult<api::Empty> {
        let resources = shim_core::backend::ResourceSpec {
            json: req.resources.map(|a| a.value).unwrap_or_default(),
        };
        self.handle
            .block_on(self.service.update(&req.id, resources))
            .map_err(to_ttrpc)?;
        Ok(api::Empty::default())
    }

    fn exec(&self, _ctx: &TtrpcContext, req: api::ExecProcessRequest) -> TtrpcResult<api::Empty> {
        let spec = shim_core::backend::ProcessSpec {
            argv: Vec::new(),
            env: Vec::new(),
            cwd: String::new(),
            uid: 0,
            gid: 0,
            no_new_privileges: false,
            terminal: req.terminal,
            console_size: None,
        };
        self.handle
            .block_on(self.service.exec(&req.id, &req.exec_id, spec, req.stdin, req.stdout, req.stderr))
            .map_err(to_ttrpc)?;
        Ok(api::Empty::default())
    }

    fn pids(&self, _ctx: &TtrpcContext, req: api::PidsRequest) -> TtrpcResult<api::PidsResponse> {
        let pids = self.handle.block_on(self.service.pids(&req.id)).map_err(to_ttrpc)?;
        let processes = pids
            .into_iter()
            .map(|pid| api::ProcessInfo {
                pid,
                ..Default::default()
            })
            .collect();
        Ok(api::PidsResponse {
            processes,
            ..Default::default()
        })
    }

    fn connect(&self, _ctx: &TtrpcContext, req: api::ConnectRequest) -> TtrpcResult<api::ConnectResponse> {
        let ContainerState { pid, .. } = self
            .handle
            .block_on(self.service.state(&req.id))
            .map_err(to_ttrpc)?;
        Ok(api::ConnectResponse {
            shim_pid: std::process::id(),
            task_pid: pid,
            ..Default::default()
        })
    }

    fn shutdown(&self, _ctx: &TtrpcContext, _req: api::ShutdownRequest) -> TtrpcResult<api::Empty> {
        self.handle.block_on(self.service.shutdown()).map_err(to_ttrpc)?;
        self.exit.signal();
        Ok(api::Empty::default())
    }

    fn close_io(&self, _ctx: &TtrpcContext, req: api::CloseIORequest) -> TtrpcResult<api::Empty> {
        let exec_id = non_empty(&req.exec_id);
        self.handle
            .block_on(self.service.close_io(&req.id, exec_id.as_deref()))
            .map_err(to_ttrpc)?;
        Ok(api::Empty::default())
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Runs the OCI lifecycle hooks declared for a bundle's `config.json`,
/// best-effort, logging rather than failing the RPC on hook error —
/// matches the historical shim behaviour of not letting a misbehaving
/// hook wedge `create`.
pub async fn run_create_hooks(bundle: &str, id: &str, pid: u32) {
    let path = std::path::Path::new(bundle).join("config.json");
    let Ok(bytes) = tokio::fs::read(&path).await else {
        return;
    };
    let Ok(spec) = serde_json::from_slice::<oci_spec::runtime::Spec>(&bytes) else {
        return;
    };
    let Some(hooks) = spec.hooks() else {
        return;
    };
    if let Some(prestart) = hooks.prestart() {
        if let Err(err) = hooks::run_hooks(prestart, id, bundle, "created", pid).await {
            tracing::warn!(%err, "prestart hook failed");
        }
    }
}
