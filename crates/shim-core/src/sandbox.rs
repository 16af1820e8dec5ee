//! The sandbox entity: at most one per shim process, created
//! either by an explicit `Create` of a sandbox-typed container or
//! implicitly discovered when the first pod container references one
//! that already exists.

use std::path::PathBuf;

use crate::backend::SandboxHandle;

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub handle: SandboxHandle,
    pub netns: Option<PathBuf>,
    pub bundle: PathBuf,
}

impl Sandbox {
    pub fn new(id: impl Into<String>, handle: SandboxHandle, netns: Option<PathBuf>, bundle: PathBuf) -> Self {
        Self {
            id: id.into(),
            handle,
            netns,
            bundle,
        }
    }
}
