use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{
    process::{Child, Command},
    time::{Instant, sleep},
};
use tracing::{debug, warn};

use super::ProcessError;

/// Everything needed to launch one node process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Nothing to do; no signal was sent.
    AlreadyExited,
    /// Exited within the grace window after the polite request.
    Graceful,
    /// Had to be killed.
    Forced,
}

/// Platform capability for starting, stopping and probing processes.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn start(&self, spec: &LaunchSpec) -> Result<u32, ProcessError>;

    /// Ask `pid` to exit, escalating to a forced kill once `grace` has passed.
    async fn terminate(&self, pid: u32, grace: Duration) -> Result<TerminateOutcome, ProcessError>;

    fn is_alive(&self, pid: u32) -> bool;

    /// Exit code of a reaped child. The record is handed over once, so a
    /// second call for the same pid returns `None`.
    fn take_exit_code(&self, pid: u32) -> Option<i32>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// `ProcessControl` on Unix: tokio children, SIGTERM then SIGKILL.
#[derive(Debug, Default)]
pub struct UnixProcessControl {
    children: DashMap<u32, Child>,
    exits: DashMap<u32, i32>,
}

impl UnixProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal { pid, source }),
        }
    }

    fn record_exit(&self, pid: u32, status: std::process::ExitStatus) {
        use std::os::unix::process::ExitStatusExt;
        let code = status.code().or_else(|| status.signal().map(|s| 128 + s)).unwrap_or(-1);
        debug!(pid, code, "process exited");
        self.exits.insert(pid, code);
    }

    async fn wait_until_gone(&self, pid: u32, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            if !self.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ProcessControl for UnixProcessControl {
    async fn start(&self, spec: &LaunchSpec) -> Result<u32, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &spec.working_dir {
            if !dir.is_dir() {
                return Err(ProcessError::MissingWorkingDir(dir.clone()));
            }
            cmd.current_dir(dir);
        }
        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id().ok_or(ProcessError::NoPid)?;
        self.exits.remove(&pid);
        self.children.insert(pid, child);
        Ok(pid)
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> Result<TerminateOutcome, ProcessError> {
        if !self.is_alive(pid) {
            return Ok(TerminateOutcome::AlreadyExited);
        }
        self.signal(pid, Signal::SIGTERM)?;
        if self.wait_until_gone(pid, grace).await {
            return Ok(TerminateOutcome::Graceful);
        }

        warn!(pid, ?grace, "process ignored SIGTERM, killing");
        self.signal(pid, Signal::SIGKILL)?;
        if let Some((_, mut child)) = self.children.remove(&pid) {
            let status = child.wait().await.map_err(|source| ProcessError::Wait { pid, source })?;
            self.record_exit(pid, status);
        } else {
            self.wait_until_gone(pid, grace).await;
        }
        Ok(TerminateOutcome::Forced)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let owned = match self.children.get_mut(&pid) {
            Some(mut child) => Some(child.try_wait()),
            None => None,
        };
        match owned {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                self.children.remove(&pid);
                self.record_exit(pid, status);
                false
            }
            Some(Err(e)) => {
                warn!(pid, "try_wait failed: {e}");
                self.children.remove(&pid);
                false
            }
            // not ours: check with signal 0
            None => kill(Pid::from_raw(pid as i32), None).is_ok(),
        }
    }

    fn take_exit_code(&self, pid: u32) -> Option<i32> {
        self.exits.remove(&pid).map(|(_, code)| code)
    }
}
