//! Supervision of the OS processes behind nodes.
//!
//! `control` hides the platform behind the [`ProcessControl`] capability;
//! `lifecycle` drives each node through `Stopped → Starting → Running →
//! Stopping → Stopped` on top of it.
pub mod control;
pub mod lifecycle;

use std::path::PathBuf;

use thiserror::Error;

use crate::node::RunState;

pub use control::{LaunchSpec, ProcessControl, TerminateOutcome, UnixProcessControl};
pub use lifecycle::{LifecycleStats, ProcessLifecycle, ProcessLimits, ProcessStats};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("working directory {0} does not exist")]
    MissingWorkingDir(PathBuf),
    #[error("spawned process has no pid")]
    NoPid,
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },
    #[error("waiting for pid {pid} failed: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("node {node_id} is {state:?}, expected {expected:?}")]
    InvalidState {
        node_id: String,
        state: RunState,
        expected: RunState,
    },
    #[error("node {node_id} reached its restart limit of {max}")]
    RestartLimit { node_id: String, max: u32 },
    #[error("unknown node {0}")]
    UnknownNode(String),
}
