mod backend;
mod cli;
mod hooks;
mod task;

use std::env;
use std::sync::Arc;

use containerd_shim::{self as shim, Config, DeleteResponse, StartOpts};
use tokio::runtime::{Handle, Runtime};

use shim_core::event::NopEventPublisher;
use shim_core::service::TaskService;

use backend::AgentBackend;
use task::ShimTask;

/// CID the in-VM agent listens on, overridable so a test harness can point
/// the shim at a fake agent without editing the bundle.
const DEFAULT_AGENT_CID_ENV: &str = "KATA_SHIM_AGENT_CID";

/// Network namespace path the CLI/runtime has already set up for this
/// sandbox, used to fill in a bundle whose own netns entry is blank.
const CLI_NETNS_ENV: &str = "KATA_SHIM_NETNS";

fn agent_cid() -> u32 {
    env::var(DEFAULT_AGENT_CID_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3)
}

fn cli_netns() -> Option<String> {
    env::var(CLI_NETNS_ENV).ok().filter(|v| !v.is_empty())
}

/// Implements `containerd_shim::Shim`: owns the tokio runtime the rest of
/// the process runs on and hands out the `Task` adapter containerd calls
/// into over ttRPC.
struct Shim {
    runtime: Runtime,
    task: Arc<ShimTask>,
}

impl shim::Shim for Shim {
    type T = ArcTask;

    fn new(_runtime_id: &str, _id: &str, _namespace: &str, _publisher: shim::RemotePublisher, _config: &mut Config) -> Self {
        let runtime = Runtime::new().expect("failed to start tokio runtime");
        let handle = runtime.handle().clone();
        let backend = Arc::new(AgentBackend::new(agent_cid()));
        let events = Arc::new(NopEventPublisher);
        let service = Arc::new(TaskService::new(backend, events, cli_netns()));
        let task = Arc::new(ShimTask {
            service,
            handle: handle.clone(),
            exit: shim::ExitSignal::default(),
        });
        spawn_management_endpoint(&handle);
        Self { runtime, task }
    }

    fn start_shim(&mut self, opts: StartOpts) -> Result<String, shim::Error> {
        let address = shim::spawn(opts, Vec::new())?;
        Ok(address)
    }

    fn wait(&mut self) {
        self.task.exit.wait();
    }

    fn get_task_service(&self) -> Self::T {
        ArcTask(self.task.clone())
    }

    fn delete_shim(&mut self) -> Result<DeleteResponse, shim::Error> {
        Ok(DeleteResponse::default())
    }
}

/// `Task` is implemented on `ShimTask`, not `Arc<ShimTask>`; this thin
/// newtype lets `get_task_service` hand out a cheap clone per connection
/// the way the trait expects.
#[derive(Clone)]
struct ArcTask(Arc<ShimTask>);

impl shim::Task for ArcTask {
    fn create(&self, ctx: &shim::TtrpcContext, req: shim::api::CreateTaskRequest) -> shim::TtrpcResult<shim::api::CreateTaskResponse> {
        self.0.create(ctx, req)
    }
    fn start(&self, ctx: &shim::TtrpcContext, req: shim::api::StartRequest) -> shim::TtrpcResult<shim::api::StartResponse> {
        self.0.start(ctx, req)
    }
    fn delete(&self, ctx: &shim::TtrpcContext, req: shim::api::DeleteRequest) -> shim::TtrpcResult<shim::api::DeleteResponse> {
        self.0.delete(ctx, req)
    }
    fn kill(&self, ctx: &shim::TtrpcContext, req: shim::api::KillRequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.kill(ctx, req)
    }
    fn wait(&self, ctx: &shim::TtrpcContext, req: shim::api::WaitRequest) -> shim::TtrpcResult<shim::api::WaitResponse> {
        self.0.wait(ctx, req)
    }
    fn state(&self, ctx: &shim::TtrpcContext, req: shim::api::StateRequest) -> shim::TtrpcResult<shim::api::StateResponse> {
        self.0.state(ctx, req)
    }
    fn pause(&self, ctx: &shim::TtrpcContext, req: shim::api::PauseRequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.pause(ctx, req)
    }
    fn resume(&self, ctx: &shim::TtrpcContext, req: shim::api::ResumeRequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.resume(ctx, req)
    }
    fn resize_pty(&self, ctx: &shim::TtrpcContext, req: shim::api::ResizePtyRequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.resize_pty(ctx, req)
    }
    fn stats(&self, ctx: &shim::TtrpcContext, req: shim::api::StatsRequest) -> shim::TtrpcResult<shim::api::StatsResponse> {
        self.0.stats(ctx, req)
    }
    fn update(&self, ctx: &shim::TtrpcContext, req: shim::api::UpdateTaskRequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.update(ctx, req)
    }
    fn exec(&self, ctx: &shim::TtrpcContext, req: shim::api::ExecProcessRequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.exec(ctx, req)
    }
    fn pids(&self, ctx: &shim::TtrpcContext, req: shim::api::PidsRequest) -> shim::TtrpcResult<shim::api::PidsResponse> {
        self.0.pids(ctx, req)
    }
    fn connect(&self, ctx: &shim::TtrpcContext, req: shim::api::ConnectRequest) -> shim::TtrpcResult<shim::api::ConnectResponse> {
        self.0.connect(ctx, req)
    }
    fn shutdown(&self, ctx: &shim::TtrpcContext, req: shim::api::ShutdownRequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.shutdown(ctx, req)
    }
    fn close_io(&self, ctx: &shim::TtrpcContext, req: shim::api::CloseIORequest) -> shim::TtrpcResult<shim::api::Empty> {
        self.0.close_io(ctx, req)
    }
}

fn init_tracing() {
    let args = cli::parse(&env::args().collect::<Vec<_>>());
    let filter = if args.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn spawn_management_endpoint(handle: &Handle) {
    let socket_name = format!(
        "kata-shim-{}",
        env::var("KATA_SANDBOX_ID").unwrap_or_else(|_| "unknown".into())
    );
    handle.spawn(async move {
        let registry = prometheus::default_registry().clone();
        let endpoint = Arc::new(shim_management::ManagementEndpoint::new(registry, "", None));
        match shim_management::ManagementEndpoint::bind_abstract(&socket_name) {
            Ok(listener) => {
                if let Err(err) = endpoint.serve(listener).await {
                    tracing::error!(%err, "management endpoint stopped");
                }
            }
            Err(err) => tracing::error!(%err, "failed to bind management endpoint"),
        }
    });
}

fn main() {
    init_tracing();
    shim::run::<Shim>("io.containerd.kata.v3", None);
}
