//! Runs OCI lifecycle hooks (prestart, poststart-in-netns, poststop)
//! around container lifecycle transitions, writing the container
//! state document to each hook's stdin the way `runc`'s own hook
//! protocol requires.

use std::process::Stdio;

use oci_spec::runtime::Hook;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use shim_core::error::{Error, Result};

#[derive(Serialize)]
struct HookState<'a> {
    #[serde(rename = "ociVersion")]
    oci_version: &'a str,
    id: &'a str,
    status: &'a str,
    pid: u32,
    bundle: &'a str,
}

pub async fn run_hooks(hooks: &[Hook], id: &str, bundle: &str, status: &str, pid: u32) -> Result<()> {
    let state = HookState {
        oci_version: "1.0.2",
        id,
        status,
        pid,
        bundle,
    };
    let payload = serde_json::to_vec(&state)?;

    for hook in hooks {
        let mut command = Command::new(hook.path());
        if let Some(args) = hook.args() {
            if args.len() > 1 {
                command.args(&args[1..]);
            }
        }
        if let Some(env) = hook.env() {
            command.env_clear();
            for kv in env {
                if let Some((k, v)) = kv.split_once('=') {
                    command.env(k, v);
                }
            }
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| Error::Internal(format!("spawn hook {:?}: {err}", hook.path())))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload).await;
        }

        let timeout = hook.timeout().unwrap_or(0);
        let wait = child.wait();
        let status = if timeout > 0 {
            tokio::time::timeout(std::time::Duration::from_secs(timeout as u64), wait)
                .await
                .map_err(|_| Error::Internal(format!("hook {:?} timed out", hook.path())))??
        } else {
            wait.await?
        };

        if !status.success() {
            return Err(Error::Internal(format!(
                "hook {:?} exited with {status}",
                hook.path()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_hook_list_is_a_noop() {
        run_hooks(&[], "c1", "/bundle", "created", 1).await.unwrap();
    }
}
