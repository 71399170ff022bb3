//! Running processes and how they ended

use crate::error::Result;
use async_trait::async_trait;

/// A launched process that can be waited on.
///
/// Dropping a handle before `wait` returns kills the process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ExitStatus>;
}

/// Process exit status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal that terminated the process (Unix only)
    #[cfg(unix)]
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Exit code 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
        }
    }
}

/// Result of running a command to completion
#[derive(Debug, Clone)]
pub struct ExitResult {
    /// How the process ended
    pub status: ExitStatus,
    /// Everything the process wrote to stdout
    pub stdout: String,
    /// Everything the process wrote to stderr
    pub stderr: String,
}

impl ExitResult {
    /// Exit code 0
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, with signal deaths reported as -1
    pub fn code(&self) -> i32 {
        self.status.code.unwrap_or(-1)
    }
}
