//! Transport-agnostic core of a VM-isolated container shim: the state
//! machines, concurrency primitives, and task-service dispatcher that
//! `shim-bin` wires up to a real ttRPC transport and a real
//! [`backend::SandboxBackend`].

pub mod backend;
pub mod bundle;
pub mod container;
pub mod error;
pub mod event;
pub mod exec;
pub mod id_map;
pub mod io;
pub mod reaper;
pub mod sandbox;
pub mod service;
pub mod state;
pub mod sync;
pub mod wait;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use error::{Code, Error, Result};
pub use service::{ContainerState, CreateRequest, TaskService};
