//! Effective connection settings and path resolution
//!
//! Port and username are resolved per host, then from the fleet-wide `ssh`
//! section, then from built-in defaults (port 22, empty username).

use crate::{HostSpec, SshDefaults};
use std::path::{Path, PathBuf};

/// Port used when neither the host nor the fleet sets one
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Connection parameters for one host after precedence is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// SSH port
    pub port: u16,
    /// Login name; empty means the client default
    pub username: String,
    /// Run privileged commands through sudo
    pub use_sudo: bool,
}

/// Resolve the connection parameters for `host`
pub fn resolve_connection(defaults: &SshDefaults, host: &HostSpec) -> ConnectionParams {
    let overrides = host.ssh.as_ref();
    ConnectionParams {
        port: overrides
            .and_then(|ssh| ssh.port)
            .or(defaults.port)
            .unwrap_or(DEFAULT_SSH_PORT),
        username: overrides
            .and_then(|ssh| ssh.username.clone())
            .or_else(|| defaults.username.clone())
            .unwrap_or_default(),
        use_sudo: overrides.and_then(|ssh| ssh.use_sudo).unwrap_or(true),
    }
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
