//! SSH remote execution backend using the OpenSSH client
//!
//! Sessions are OpenSSH control masters: [`SshConfig::master_command`] opens a
//! persistent authenticated connection on a control socket, ordinary commands
//! multiplex over it, and [`SshConfig::exit_command`] tears it down.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::command::Command;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::process::ExitResult;

/// Exit code the OpenSSH client reserves for its own failures
pub const SSH_CLIENT_FAILURE: i32 = 255;

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Target host (hostname or IP)
    host: String,
    /// SSH user (optional, uses system default if not specified)
    user: Option<String>,
    /// SSH port (optional, defaults to 22)
    port: Option<u16>,
    /// Path to identity file (private key)
    identity_file: Option<PathBuf>,
    /// TCP connect timeout passed to the client
    connect_timeout: Option<Duration>,
    /// Control socket shared by the session's commands
    control_path: Option<PathBuf>,
    /// Never prompt for passwords or passphrases
    batch_mode: bool,
    /// Record unknown host keys instead of refusing the host
    accept_new_host_keys: bool,
    /// Additional SSH arguments
    extra_args: Vec<String>,
}

impl SshConfig {
    /// Create a new SSH configuration for the given host
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: None,
            port: None,
            identity_file: None,
            connect_timeout: None,
            control_path: None,
            batch_mode: true,
            accept_new_host_keys: true,
            extra_args: Vec::new(),
        }
    }

    /// Set the SSH user. An empty name leaves the client default in place.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        let user = user.into();
        self.user = (!user.is_empty()).then_some(user);
        self
    }

    /// Set the SSH port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the identity file (private key)
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Set the client's TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Multiplex commands over a control socket at this path
    pub fn with_control_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_path = Some(path.into());
        self
    }

    /// Allow or forbid interactive prompts
    pub fn with_batch_mode(mut self, enabled: bool) -> Self {
        self.batch_mode = enabled;
        self
    }

    /// Trust hosts missing from known_hosts on first contact. A changed key
    /// is refused either way.
    pub fn with_accept_new_host_keys(mut self, enabled: bool) -> Self {
        self.accept_new_host_keys = enabled;
        self
    }

    /// Add extra SSH arguments
    pub fn with_extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// The bare host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port commands will use
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    /// Get the destination string (user@host if user is specified)
    pub fn destination(&self) -> String {
        if let Some(user) = &self.user {
            format!("{}@{}", user, self.host)
        } else {
            self.host.clone()
        }
    }

    /// `ssh` with every option from this config, without a destination
    fn ssh_command(&self) -> Command {
        let mut ssh = Command::new("ssh");

        if let Some(port) = self.port {
            ssh.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            ssh.arg("-i").arg(identity);
        }
        if let Some(timeout) = self.connect_timeout {
            ssh.arg("-o")
                .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        }
        if self.batch_mode {
            ssh.arg("-o").arg("BatchMode=yes");
        }
        if self.accept_new_host_keys {
            ssh.arg("-o").arg("StrictHostKeyChecking=accept-new");
        }
        if let Some(path) = &self.control_path {
            ssh.arg("-o").arg(format!("ControlPath={}", path.display()));
        }
        for arg in &self.extra_args {
            ssh.arg(arg);
        }
        ssh
    }

    /// Open (or reuse) a persistent control master for this destination
    pub fn master_command(&self) -> Command {
        let mut ssh = self.ssh_command();
        ssh.arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg(self.destination())
            .arg("true");
        ssh
    }

    /// Ask the control master whether it is alive
    pub fn check_command(&self) -> Command {
        let mut ssh = self.ssh_command();
        ssh.arg("-O").arg("check").arg(self.destination());
        ssh
    }

    /// Tell the control master to exit
    pub fn exit_command(&self) -> Command {
        let mut ssh = self.ssh_command();
        ssh.arg("-O").arg("exit").arg(self.destination());
        ssh
    }

    /// Install the local public key on the remote host's authorized keys
    pub fn copy_id_command(&self) -> Command {
        let mut copy = Command::new("ssh-copy-id");
        if let Some(port) = self.port {
            copy.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            copy.arg("-i").arg(identity);
        }
        if self.accept_new_host_keys {
            copy.arg("-o").arg("StrictHostKeyChecking=accept-new");
        }
        copy.arg(self.destination());
        copy
    }

    /// Wrap a command so it runs on the remote host
    pub fn wrap(&self, mut command: Command) -> Command {
        let mut ssh = self.ssh_command();
        if self.control_path.is_some() {
            ssh.arg("-o").arg("ControlMaster=no");
        }
        ssh.arg(self.destination());
        ssh.arg(command.to_shell_string());
        if let Some(input) = command.take_stdin() {
            ssh.stdin(input);
        }
        ssh
    }

    /// Classify a finished `ssh` invocation.
    ///
    /// Returns `None` when the exit code belongs to the remote command, and an
    /// error when the client itself failed to reach or authenticate to the host.
    pub fn client_failure(&self, result: &ExitResult) -> Option<Error> {
        if result.status.code != Some(SSH_CLIENT_FAILURE) {
            return None;
        }
        let stderr = result.stderr.trim();
        // A failed host key check is not fixed by pushing our key
        if stderr.contains("Permission denied")
            || stderr.contains("Too many authentication failures")
        {
            return Some(Error::SshAuthenticationFailed {
                host: self.destination(),
            });
        }
        Some(Error::SshConnectionFailed {
            host: self.destination(),
            reason: stderr
                .lines()
                .last()
                .unwrap_or("ssh exited with status 255")
                .to_string(),
        })
    }
}

/// SSH launcher that wraps another launcher for remote execution
#[derive(Debug, Clone)]
pub struct SshLauncher<L> {
    inner: L,
    config: SshConfig,
}

impl<L> SshLauncher<L> {
    /// Create a new SSH launcher wrapping the given inner launcher
    pub fn new(inner: L, config: SshConfig) -> Self {
        Self { inner, config }
    }

    /// The connection settings
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

impl SshLauncher<crate::backends::local::LocalLauncher> {
    /// Convenience constructor for SSH wrapping LocalLauncher
    pub fn to_host(config: SshConfig) -> Self {
        Self {
            inner: crate::backends::local::LocalLauncher,
            config,
        }
    }
}

#[async_trait]
impl<L> Launcher for SshLauncher<L>
where
    L: Launcher,
{
    type Output = L::Output;
    type Handle = L::Handle;

    async fn launch(&self, command: Command) -> Result<(Self::Output, Self::Handle)> {
        let ssh_cmd = self.config.wrap(command);
        self.inner
            .launch(ssh_cmd)
            .await
            .map_err(|e| e.with_layer_context("SSH"))
    }
}
