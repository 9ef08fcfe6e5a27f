use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Result of executing one command string on the remote host.
///
/// `stdout` and `stderr` are line-split with trailing newlines stripped;
/// `timestamp` is wall-clock seconds at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command_string: String,
    pub timestamp: f64,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub code: i32,
}

/// The transport boundary between the manager and the environment.
///
/// Implementations own the session to one host (SSH or anything
/// SSH-shaped). `disconnect` must be idempotent.
#[async_trait]
pub trait Terminal: Send {
    /// Probe whether the host is reachable.
    ///
    /// Fails with [`ManagerError::Offline`](crate::ManagerError::Offline).
    async fn ping(&mut self) -> Result<()>;

    /// Establish a session.
    ///
    /// Fails with [`ManagerError::Connect`](crate::ManagerError::Connect) or
    /// [`ManagerError::Authentication`](crate::ManagerError::Authentication).
    async fn connect(&mut self) -> Result<()>;

    /// Tear down the session, if any.
    async fn disconnect(&mut self) -> Result<()>;

    /// Run a command string and collect its output.
    ///
    /// Fails with [`ManagerError::Timeout`](crate::ManagerError::Timeout) or
    /// [`ManagerError::Execution`](crate::ManagerError::Execution).
    async fn execute(&mut self, string: &str, timeout: Duration) -> Result<CommandOutput>;
}
