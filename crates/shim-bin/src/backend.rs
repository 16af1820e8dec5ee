//! The concrete `SandboxBackend`: talks to the in-VM agent over a vsock
//! connection using a small length-prefixed JSON protocol.
//!
//! The real kata-agent wire protocol is a ttrpc service defined in a
//! protobuf schema that was not present in the reference pack this shim
//! was built from, so this speaks a simplified protocol of its own
//! instead of reproducing that schema from memory — see DESIGN.md. The
//! `SandboxBackend` trait is the faithful, stable contract; this struct
//! is the one concrete implementation of it shipped here.
//!
//! The socket fd is wrapped the same way a pidfd is wrapped for
//! async wait (`AsyncFd` over a raw, non-blocking fd) rather than
//! spawning a blocking-IO thread per call.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, VsockAddr};
use oci_spec::runtime::Spec;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::unix::AsyncFd;
use tokio::sync::Mutex;

use shim_core::backend::{Mount, ProcessInfo, ProcessSpec, ResourceSpec, SandboxBackend, SandboxHandle, StatsBlob};
use shim_core::error::{Error, Result};
use shim_core::io::BackendIo;

/// Well-known vsock port the in-VM agent listens on.
pub const AGENT_VSOCK_PORT: u32 = 1024;

struct VsockConn {
    fd: AsyncFd<OwnedFd>,
}

impl VsockConn {
    fn connect(cid: u32, port: u32) -> Result<Self> {
        let fd = socket(AddressFamily::Vsock, SockType::Stream, SockFlag::empty(), None)
            .map_err(|err| Error::Unavailable(format!("vsock socket: {err}")))?;
        let addr = VsockAddr::new(cid, port);
        connect(fd.as_raw_fd(), &addr).map_err(|err| Error::Unavailable(format!("vsock connect: {err}")))?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd: AsyncFd::new(fd).map_err(Error::Io)?,
        })
    }

    async fn write_all_async(&self, buf: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let mut guard = self.fd.writable().await.map_err(Error::Io)?;
            let res = guard.try_io(|inner| raw_write(inner.get_ref().as_raw_fd(), &buf[written..]));
            match res {
                Ok(Ok(n)) => written += n,
                Ok(Err(err)) => return Err(Error::Io(err)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    async fn write_frame(&self, payload: &[u8]) -> Result<()> {
        let len = (payload.len() as u32).to_le_bytes();
        self.write_all_async(&len).await?;
        self.write_all_async(payload).await
    }

    async fn read_frame(&self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.read_exact_async(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.read_exact_async(&mut buf).await?;
        Ok(buf)
    }

    async fn read_exact_async(&self, buf: &mut [u8]) -> Result<()> {
        let mut read = 0;
        while read < buf.len() {
            let mut guard = self.fd.readable().await.map_err(Error::Io)?;
            let res = guard.try_io(|inner| raw_read(inner.get_ref().as_raw_fd(), &mut buf[read..]));
            match res {
                Ok(Ok(0)) => return Err(Error::Unavailable("vsock connection closed".into())),
                Ok(Ok(n)) => read += n,
                Ok(Err(err)) => return Err(Error::Io(err)),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

fn raw_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

pub struct AgentBackend {
    cid: u32,
    conn: Mutex<Option<VsockConn>>,
    id: String,
}

impl AgentBackend {
    pub fn new(cid: u32) -> Self {
        Self {
            cid,
            conn: Mutex::new(None),
            id: format!("vsock-cid-{cid}"),
        }
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(&self, method: &str, req: &Req) -> Result<Resp> {
        let mut slot = self.conn.lock().await;
        if slot.is_none() {
            *slot = Some(VsockConn::connect(self.cid, AGENT_VSOCK_PORT)?);
        }
        let conn = slot.as_ref().expect("connection just established");

        #[derive(Serialize)]
        struct Envelope<'a, T> {
            method: &'a str,
            body: &'a T,
        }
        let payload = serde_json::to_vec(&Envelope { method, body: req })?;
        conn.write_frame(&payload).await?;
        let response = conn.read_frame().await?;

        #[derive(serde::Deserialize)]
        struct ResponseEnvelope<T> {
            ok: bool,
            error: Option<String>,
            body: Option<T>,
        }
        let envelope: ResponseEnvelope<Resp> = serde_json::from_slice(&response)?;
        if !envelope.ok {
            return Err(Error::Unavailable(
                envelope.error.unwrap_or_else(|| "agent call failed".into()),
            ));
        }
        envelope
            .body
            .ok_or_else(|| Error::bug(format!("{method}: agent reported success with no body")))
    }
}

#[derive(Serialize)]
struct CreateSandboxReq<'a> {
    id: &'a str,
    bundle: &'a str,
    rootfs: &'a [Mount],
}

#[async_trait]
impl SandboxBackend for AgentBackend {
    async fn create_sandbox(
        &self,
        _spec: &Spec,
        rootfs: &[Mount],
        id: &str,
        bundle: &Path,
        _netns: Option<&Path>,
    ) -> Result<SandboxHandle> {
        self.call(
            "CreateSandbox",
            &CreateSandboxReq {
                id,
                bundle: &bundle.to_string_lossy(),
                rootfs,
            },
        )
        .await
    }

    async fn create_container(
        &self,
        sandbox: &SandboxHandle,
        _spec: &Spec,
        rootfs: &[Mount],
        id: &str,
        bundle: &Path,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
            bundle: &'a str,
            rootfs: &'a [Mount],
        }
        self.call(
            "CreateContainer",
            &Req {
                sandbox,
                id,
                bundle: &bundle.to_string_lossy(),
                rootfs,
            },
        )
        .await
    }

    async fn start_sandbox(&self, sandbox: &SandboxHandle) -> Result<()> {
        self.call("StartSandbox", &sandbox).await
    }

    async fn start_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<ProcessInfo> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
        }
        self.call("StartContainer", &Req { sandbox, id }).await
    }

    async fn enter_container(&self, sandbox: &SandboxHandle, id: &str, spec: &ProcessSpec) -> Result<ProcessInfo> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
            argv: &'a [String],
            env: &'a [String],
            cwd: &'a str,
            uid: u32,
            gid: u32,
            no_new_privileges: bool,
            terminal: bool,
        }
        self.call(
            "EnterContainer",
            &Req {
                sandbox,
                id,
                argv: &spec.argv,
                env: &spec.env,
                cwd: &spec.cwd,
                uid: spec.uid,
                gid: spec.gid,
                no_new_privileges: spec.no_new_privileges,
                terminal: spec.terminal,
            },
        )
        .await
    }

    async fn wait_process(&self, sandbox: &SandboxHandle, id: &str, token: &str) -> Result<i32> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
            token: &'a str,
        }
        self.call("WaitProcess", &Req { sandbox, id, token }).await
    }

    async fn signal_process(&self, sandbox: &SandboxHandle, id: &str, token: &str, signal: u32, all: bool) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
            token: &'a str,
            signal: u32,
            all: bool,
        }
        self.call("SignalProcess", &Req { sandbox, id, token, signal, all }).await
    }

    async fn winsize_process(&self, sandbox: &SandboxHandle, id: &str, token: &str, height: u32, width: u32) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
            token: &'a str,
            height: u32,
            width: u32,
        }
        self.call("WinsizeProcess", &Req { sandbox, id, token, height, width }).await
    }

    async fn pause_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
        }
        self.call("PauseContainer", &Req { sandbox, id }).await
    }

    async fn resume_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
        }
        self.call("ResumeContainer", &Req { sandbox, id }).await
    }

    async fn stop_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
        }
        self.call("StopContainer", &Req { sandbox, id }).await
    }

    async fn delete_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
        }
        self.call("DeleteContainer", &Req { sandbox, id }).await
    }

    async fn stats_container(&self, sandbox: &SandboxHandle, id: &str) -> Result<StatsBlob> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
        }
        self.call("StatsContainer", &Req { sandbox, id }).await
    }

    async fn update_container_resources(&self, sandbox: &SandboxHandle, id: &str, resources: &ResourceSpec) -> Result<()> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
            resources: &'a [u8],
        }
        self.call(
            "UpdateContainerResources",
            &Req {
                sandbox,
                id,
                resources: &resources.json,
            },
        )
        .await
    }

    async fn list_pids(&self, sandbox: &SandboxHandle, id: &str) -> Result<Vec<u32>> {
        #[derive(Serialize)]
        struct Req<'a> {
            sandbox: &'a str,
            id: &'a str,
        }
        self.call("ListPids", &Req { sandbox, id }).await
    }

    async fn io_stream(&self, _sandbox: &SandboxHandle, _id: &str, _token: &str) -> Result<BackendIo> {
        // Multiplexed stdio over the same control channel would need real
        // framing per stream; the simplified envelope protocol above only
        // carries one request/response pair per call. See DESIGN.md.
        Err(Error::Unavailable(
            "streaming process I/O over the agent vsock channel is not implemented by this backend".into(),
        ))
    }

    async fn stop_sandbox(&self, sandbox: &SandboxHandle) -> Result<()> {
        self.call("StopSandbox", &sandbox).await
    }

    async fn delete_sandbox(&self, sandbox: &SandboxHandle) -> Result<()> {
        self.call("DeleteSandbox", &sandbox).await
    }

    async fn fetch_sandbox(&self, id: &str) -> Result<Option<SandboxHandle>> {
        self.call("FetchSandbox", &id).await
    }

    fn get_netns(&self, _sandbox: &SandboxHandle) -> Option<PathBuf> {
        None
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn get_all_containers(&self, sandbox: &SandboxHandle) -> Result<Vec<String>> {
        self.call("GetAllContainers", &sandbox).await
    }
}
