//! The `SandboxBackend` contract: everything the core needs
//! from the VM/hypervisor + in-VM agent layer. The VM implementation
//! itself is out of scope — this is a narrow capability
//! trait, in the spirit of Design Note "Backend as capability interface".

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oci_spec::runtime::Spec;

use crate::error::Result;

/// Opaque handle to a running VM/sandbox. The core never inspects it.
pub type SandboxHandle = String;

/// Returned by `start_container`/`enter_container`: the backend's own
/// process token (used for subsequent wait/signal/winsize calls) plus the
/// pid surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub token: String,
    pub pid: u32,
}

/// A single rootfs mount entry, as supplied by the orchestrator.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct Mount {
    pub r#type: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

/// An exec process specification.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub no_new_privileges: bool,
    pub terminal: bool,
    pub console_size: Option<(u32, u32)>,
}

/// Raw (unparsed) resource-update payload for `Update`.
#[derive(Debug, Clone, Default)]
pub struct ResourceSpec {
    pub json: Vec<u8>,
}

/// Opaque, serialized stats blob returned by `stats_container`.
#[derive(Debug, Clone, Default)]
pub struct StatsBlob {
    pub data: Vec<u8>,
}

/// The VM/agent capability surface the dispatcher drives. Implemented by
/// the real hypervisor integration in production, and by `MockBackend`
/// (behind the `testing` feature) in tests.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn create_sandbox(
        &self,
        spec: &Spec,
        rootfs: &[Mount],
        id: &str,
        bundle: &Path,
        netns: Option<&Path>,
    ) -> Result<SandboxHandle>;

    async fn create_container(
        &self,
        sandbox: &SandboxHandle,
        spec: &Spec,
        rootfs: &[Mount],
        id: &str,
        bundle: &Path,
    ) -> Result<()>;

    async fn start_sandbox(&self, sandbox: &SandboxHandle) -> Result<()>;

    async fn start_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<ProcessInfo>;

    async fn enter_container(
        &self,
        sandbox: &SandboxHandle,
        id: &str,
        spec: &ProcessSpec,
    ) -> Result<ProcessInfo>;

    /// Blocks until the process exits, returning its exit code.
    async fn wait_process(&self, sandbox: &SandboxHandle, id: &str, token: &str) -> Result<i32>;

    async fn signal_process(
        &self,
        sandbox: &SandboxHandle,
        id: &str,
        token: &str,
        signal: u32,
        all: bool,
    ) -> Result<()>;

    async fn winsize_process(
        &self,
        sandbox: &SandboxHandle,
        id: &str,
        token: &str,
        height: u32,
        width: u32,
    ) -> Result<()>;

    async fn pause_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()>;
    async fn resume_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()>;
    async fn stop_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()>;
    async fn delete_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()>;

    async fn stats_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<StatsBlob>;

    async fn update_container_resources(
        &self,
        sandbox: &SandboxHandle,
        id: &str,
        resources: &ResourceSpec,
    ) -> Result<()>;

    async fn list_pids(&self, sandbox: &SandboxHandle, id: &str) -> Result<Vec<u32>>;

    /// Returns the stdin sink / stdout+stderr source fd-like handles for a
    /// process. Modelled narrowly as raw owned fds; the relay (`io`
    /// module) takes ownership of whichever of the three it requested.
    async fn io_stream(
        &self,
        sandbox: &SandboxHandle,
        id: &str,
        token: &str,
    ) -> Result<crate::io::BackendIo>;

    async fn stop_sandbox(&self, sandbox: &SandboxHandle) -> Result<()>;
    async fn delete_sandbox(&self, sandbox: &SandboxHandle) -> Result<()>;

    /// Used by out-of-process cleanup tooling to recover a sandbox handle
    /// by id without going through the normal create path.
    async fn fetch_sandbox(&self, id: &str) -> Result<Option<SandboxHandle>>;

    fn get_netns(&self, sandbox: &SandboxHandle) -> Option<PathBuf>;
    fn id(&self) -> &str;
    async fn get_all_containers(&self, sandbox: &SandboxHandle) -> Result<Vec<String>>;
}
