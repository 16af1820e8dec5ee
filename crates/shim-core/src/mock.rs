//! An in-memory `SandboxBackend` for exercising the dispatcher without a
//! real VM. Exists only for tests; see `testing` feature.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use oci_spec::runtime::Spec;
use tokio::sync::Notify;

use crate::backend::{Mount, ProcessInfo, ProcessSpec, ResourceSpec, SandboxBackend, SandboxHandle, StatsBlob};
use crate::error::{Error, Result};
use crate::io::BackendIo;

#[derive(Default)]
struct State {
    sandboxes: HashMap<String, SandboxHandle>,
    containers: HashMap<String, Vec<String>>, // sandbox id -> container ids
    pids: HashMap<String, u32>,               // "sandbox:id" -> pid
    exits: HashMap<String, i32>,              // "sandbox:id:token" -> exit code
    paused: HashMap<String, bool>,
    create_sandbox_calls: u32,
}

pub struct MockBackend {
    state: Mutex<State>,
    notify: Notify,
    next_pid: AtomicU32,
    id: String,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            next_pid: AtomicU32::new(1000),
            id: "mock".to_string(),
        }
    }

    /// Pre-arms the exit code `wait_process` will eventually return for
    /// the given `(container, token)` pair.
    pub fn queue_exit(&self, container: &str, token: &str, code: i32) {
        let key = format!("{container}:{token}");
        self.state.lock().unwrap().exits.insert(key, code);
        self.notify.notify_waiters();
    }

    pub fn create_sandbox_call_count(&self) -> u32 {
        self.state.lock().unwrap().create_sandbox_calls
    }

    fn pid_key(sandbox: &str, id: &str) -> String {
        format!("{sandbox}:{id}")
    }

    fn exit_key(container: &str, token: &str) -> String {
        format!("{container}:{token}")
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for MockBackend {
    async fn create_sandbox(
        &self,
        _spec: &Spec,
        _rootfs: &[Mount],
        id: &str,
        _bundle: &std::path::Path,
        _netns: Option<&std::path::Path>,
    ) -> Result<SandboxHandle> {
        let mut state = self.state.lock().unwrap();
        state.create_sandbox_calls += 1;
        let handle = format!("handle-{id}");
        state.sandboxes.insert(id.to_string(), handle.clone());
        state.containers.insert(id.to_string(), Vec::new());
        Ok(handle)
    }

    async fn create_container(
        &self,
        sandbox: &SandboxHandle,
        _spec: &Spec,
        _rootfs: &[Mount],
        id: &str,
        _bundle: &std::path::Path,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .entry(sandbox.clone())
            .or_default()
            .push(id.to_string());
        Ok(())
    }

    async fn start_sandbox(&self, _sandbox: &SandboxHandle) -> Result<()> {
        Ok(())
    }

    async fn start_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<ProcessInfo> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .pids
            .insert(Self::pid_key(sandbox, id), pid);
        Ok(ProcessInfo {
            token: format!("tok-{id}"),
            pid,
        })
    }

    async fn enter_container(
        &self,
        sandbox: &SandboxHandle,
        id: &str,
        spec: &ProcessSpec,
    ) -> Result<ProcessInfo> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .pids
            .insert(Self::pid_key(sandbox, id), pid);
        Ok(ProcessInfo {
            token: format!("tok-{id}-{}", spec.argv.join("-")),
            pid,
        })
    }

    async fn wait_process(&self, _sandbox: &SandboxHandle, container: &str, token: &str) -> Result<i32> {
        let key = Self::exit_key(container, token);
        loop {
            if let Some(code) = self.state.lock().unwrap().exits.get(&key).copied() {
                return Ok(code);
            }
            self.notify.notified().await;
        }
    }

    async fn signal_process(
        &self,
        _sandbox: &SandboxHandle,
        _id: &str,
        _token: &str,
        _signal: u32,
        _all: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn winsize_process(
        &self,
        _sandbox: &SandboxHandle,
        _id: &str,
        _token: &str,
        _height: u32,
        _width: u32,
    ) -> Result<()> {
        Ok(())
    }

    async fn pause_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .paused
            .insert(Self::pid_key(sandbox, id), true);
        Ok(())
    }

    async fn resume_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .paused
            .insert(Self::pid_key(sandbox, id), false);
        Ok(())
    }

    async fn stop_container(&self, _sandbox: &SandboxHandle, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn delete_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.containers.get_mut(sandbox) {
            list.retain(|c| c != id);
        }
        Ok(())
    }

    async fn stats_container(&self, _sandbox: &SandboxHandle, _id: &str) -> Result<StatsBlob> {
        Ok(StatsBlob::default())
    }

    async fn update_container_resources(
        &self,
        _sandbox: &SandboxHandle,
        _id: &str,
        _resources: &ResourceSpec,
    ) -> Result<()> {
        Ok(())
    }

    async fn list_pids(&self, sandbox: &SandboxHandle, id: &str) -> Result<Vec<u32>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pids
            .get(&Self::pid_key(sandbox, id))
            .copied()
            .into_iter()
            .collect())
    }

    async fn io_stream(&self, _sandbox: &SandboxHandle, _id: &str, _token: &str) -> Result<BackendIo> {
        let (stdin_r, stdin_w) = tokio::io::duplex(4096);
        let (stdout_r, stdout_w) = tokio::io::duplex(4096);
        // Leak the write-to-stdin / read-from-stdout peer ends into the
        // box itself is not possible without a pair channel, so a mock
        // only needs to hand back one side of each: the side the relay
        // will drive.
        let _ = stdin_r;
        let _ = stdout_w;
        Ok(BackendIo::Pipes {
            stdin: Some(Box::new(stdin_w)),
            stdout: Some(Box::new(stdout_r)),
            stderr: None,
        })
    }

    async fn stop_sandbox(&self, _sandbox: &SandboxHandle) -> Result<()> {
        Ok(())
    }

    async fn delete_sandbox(&self, sandbox: &SandboxHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.containers.remove(sandbox);
        state.sandboxes.retain(|_, h| h != sandbox);
        Ok(())
    }

    async fn fetch_sandbox(&self, id: &str) -> Result<Option<SandboxHandle>> {
        Ok(self.state.lock().unwrap().sandboxes.get(id).cloned())
    }

    fn get_netns(&self, _sandbox: &SandboxHandle) -> Option<PathBuf> {
        None
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn get_all_containers(&self, sandbox: &SandboxHandle) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(sandbox)
            .cloned()
            .unwrap_or_default())
    }
}

/// Convenience used by dispatcher tests that need to assert an id was
/// never registered.
pub fn not_found(id: &str) -> Error {
    Error::NotFound(id.to_string())
}
