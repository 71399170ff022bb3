//! Sessions to a single host
//!
//! [`SshTransport`] keeps an OpenSSH control master open for the lifetime of
//! the session and multiplexes every command over it. [`LocalTransport`] runs
//! commands on this machine for hosts whose mesh address is one of ours.

use async_trait::async_trait;
use command_executor::backends::{LocalLauncher, SshConfig, SshLauncher, SudoLauncher};
use command_executor::{Command, Executor, ExitResult};
use std::fmt;
use tracing::{debug, warn};

use crate::Result;

/// A session to one host
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human readable target, for logs
    fn target(&self) -> String;

    /// Open the session
    async fn connect(&mut self) -> Result<()>;

    /// Close the session. Closing an unopened session is a no-op.
    async fn disconnect(&mut self) -> Result<()>;

    /// Whether the session is usable right now
    async fn is_connected(&self) -> bool;

    /// Run a command, under sudo when `privileged` is set.
    ///
    /// A command that ran and exited non-zero is `Ok`; transport failures
    /// (connection lost, authentication refused) are `Err`.
    async fn run(&self, command: Command, privileged: bool) -> Result<ExitResult>;

    /// Install our public key on the host
    async fn push_key(&self) -> Result<()>;
}

/// OpenSSH session multiplexed over a control socket
pub struct SshTransport {
    config: SshConfig,
    sudo_password: Option<String>,
    connected: bool,
}

impl SshTransport {
    /// Create a transport; nothing is opened until [`Transport::connect`]
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            sudo_password: None,
            connected: false,
        }
    }

    /// Answer sudo prompts with this password
    pub fn with_sudo_password(mut self, password: Option<String>) -> Self {
        self.sudo_password = password;
        self
    }

    /// Connection settings
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn sudo_launcher(&self) -> SudoLauncher<SshLauncher<LocalLauncher>> {
        let sudo = SudoLauncher::new(SshLauncher::to_host(self.config.clone()));
        match &self.sudo_password {
            Some(password) => sudo.with_password(password.clone()),
            None => sudo,
        }
    }

    /// Turn an `ssh` exit of 255 into a transport error
    fn classify(&self, result: ExitResult) -> Result<ExitResult> {
        match self.config.client_failure(&result) {
            Some(error) => Err(error.into()),
            None => Ok(result),
        }
    }
}

impl fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTransport")
            .field("config", &self.config)
            .field("connected", &self.connected)
            .finish()
    }
}

#[async_trait]
impl Transport for SshTransport {
    fn target(&self) -> String {
        format!("{}:{}", self.config.destination(), self.config.port())
    }

    async fn connect(&mut self) -> Result<()> {
        let local = Executor::local("ssh-master");
        let result = local.execute(self.config.master_command()).await?;
        if result.success() {
            debug!(host = %self.target(), "ssh session established");
            self.connected = true;
            return Ok(());
        }
        self.connected = false;
        match self.config.client_failure(&result) {
            Some(error) => Err(error.into()),
            None => Err(command_executor::Error::SshConnectionFailed {
                host: self.config.destination(),
                reason: format!("session check exited with {}", result.code()),
            }
            .into()),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let local = Executor::local("ssh-master");
        let result = local.execute(self.config.exit_command()).await?;
        if !result.success() {
            debug!(host = %self.target(), stderr = %result.stderr.trim(), "control master already gone");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        if !self.connected {
            return false;
        }
        let local = Executor::local("ssh-master");
        matches!(local.execute(self.config.check_command()).await, Ok(result) if result.success())
    }

    async fn run(&self, command: Command, privileged: bool) -> Result<ExitResult> {
        let result = if privileged {
            Executor::new("ssh-sudo", self.sudo_launcher())
                .execute(command)
                .await?
        } else {
            Executor::new("ssh", SshLauncher::to_host(self.config.clone()))
                .execute(command)
                .await?
        };
        self.classify(result)
    }

    async fn push_key(&self) -> Result<()> {
        warn!(host = %self.target(), "authentication failed, copying public key");
        let local = Executor::local("ssh-copy-id");
        let result = local.execute(self.config.copy_id_command()).await?;
        if result.success() {
            Ok(())
        } else {
            Err(command_executor::Error::SshAuthenticationFailed {
                host: self.config.destination(),
            }
            .into())
        }
    }
}

/// Runs commands on this machine
#[derive(Default)]
pub struct LocalTransport {
    sudo_password: Option<String>,
}

impl LocalTransport {
    /// Create a local transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer sudo prompts with this password
    pub fn with_sudo_password(mut self, password: Option<String>) -> Self {
        self.sudo_password = password;
        self
    }
}

impl fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn target(&self) -> String {
        "localhost".to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn run(&self, command: Command, privileged: bool) -> Result<ExitResult> {
        if privileged {
            let sudo = SudoLauncher::new(LocalLauncher);
            let sudo = match &self.sudo_password {
                Some(password) => sudo.with_password(password.clone()),
                None => sudo,
            };
            Ok(Executor::new("local-sudo", sudo).execute(command).await?)
        } else {
            Ok(Executor::local("local").execute(command).await?)
        }
    }

    async fn push_key(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RemoteCommand;

    #[smol_potat::test]
    async fn test_local_transport_runs_unprivileged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let transport = LocalTransport::new();
        assert!(transport.is_connected().await);

        let write = RemoteCommand::write_file(&path, "listen:\n  port: 4242\n");
        assert!(transport.run(write.to_command(), false).await.unwrap().success());

        let read = transport
            .run(RemoteCommand::read_file(&path).to_command(), false)
            .await
            .unwrap();
        assert_eq!(read.stdout, "listen:\n  port: 4242\n");
    }

    #[smol_potat::test]
    async fn test_unopened_ssh_session_reports_disconnected() {
        let mut transport = SshTransport::new(SshConfig::new("10.42.0.99"));
        assert!(!transport.is_connected().await);
        transport.disconnect().await.unwrap();
        assert_eq!(transport.target(), "10.42.0.99:22");
    }
}
