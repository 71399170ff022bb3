//! Structured remote commands
//!
//! Callers describe what should happen on a host; [`RemoteCommand::to_command`]
//! is the only place a command line is built from that description. File
//! content always travels on stdin and never appears in the command line.

use command_executor::Command;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Fixed locations on every host
pub mod remote_paths {
    /// CA certificate
    pub const CA_CERT: &str = "/etc/nebula/ca.crt";
    /// Host certificate
    pub const HOST_CERT: &str = "/etc/nebula/host.crt";
    /// Host private key
    pub const HOST_KEY: &str = "/etc/nebula/host.key";
    /// Nebula config
    pub const CONFIG: &str = "/etc/nebula/config.yaml";
}

/// How the Nebula service picks up a new config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceAction {
    /// Reload in place
    #[default]
    Reload,
    /// Full restart
    Restart,
}

impl ServiceAction {
    /// Argument passed to `service`
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Reload => "reload",
            ServiceAction::Restart => "restart",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reload" => Ok(ServiceAction::Reload),
            "restart" => Ok(ServiceAction::Restart),
            other => Err(format!(
                "unknown restart type '{}', expected reload or restart",
                other
            )),
        }
    }
}

/// Everything the distributor runs on a host
#[derive(Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Replace a file with the given content
    WriteFile {
        /// Destination path
        path: PathBuf,
        /// Full file content
        content: Vec<u8>,
    },
    /// Print a file
    ReadFile {
        /// File to read
        path: PathBuf,
    },
    /// Reload or restart the Nebula service
    ServiceControl {
        /// What to do
        action: ServiceAction,
    },
    /// Print the host's name
    Hostname,
}

impl RemoteCommand {
    /// Write `content` to `path`
    pub fn write_file(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        RemoteCommand::WriteFile {
            path: path.into(),
            content: content.into(),
        }
    }

    /// Read `path`
    pub fn read_file(path: impl Into<PathBuf>) -> Self {
        RemoteCommand::ReadFile { path: path.into() }
    }

    /// Render the concrete command
    pub fn to_command(&self) -> Command {
        match self {
            RemoteCommand::WriteFile { path, content } => Command::builder("sh")
                .arg("-c")
                .arg("cat > \"$1\"")
                .arg("sh")
                .arg(path)
                .stdin(content.clone())
                .build(),
            RemoteCommand::ReadFile { path } => Command::builder("cat").arg(path).build(),
            RemoteCommand::ServiceControl { action } => Command::builder("service")
                .arg("nebula")
                .arg(action.as_str())
                .build(),
            RemoteCommand::Hostname => Command::new("hostname"),
        }
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCommand::WriteFile { path, content } => f
                .debug_struct("WriteFile")
                .field("path", path)
                .field("bytes", &content.len())
                .finish(),
            RemoteCommand::ReadFile { path } => {
                f.debug_struct("ReadFile").field("path", path).finish()
            }
            RemoteCommand::ServiceControl { action } => f
                .debug_struct("ServiceControl")
                .field("action", action)
                .finish(),
            RemoteCommand::Hostname => f.write_str("Hostname"),
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCommand::WriteFile { path, .. } => write!(f, "write {}", path.display()),
            RemoteCommand::ReadFile { path } => write!(f, "read {}", path.display()),
            RemoteCommand::ServiceControl { action } => write!(f, "service nebula {}", action),
            RemoteCommand::Hostname => f.write_str("hostname"),
        }
    }
}
