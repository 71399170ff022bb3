//! Sudo launcher for privilege escalation
//!
//! Without a password the command runs under `sudo -n`, which fails instead of
//! hanging when sudo would prompt. With a password a small shell reads the
//! first stdin line, hands it to `sudo -S -k -v` to validate credentials, then
//! runs the command under `sudo -n` with the rest of stdin. sudo only reads the
//! password when it actually prompts, so NOPASSWD rules and root logins never
//! see it in the command's input.
//!
//! # Example
//!
//! ```no_run
//! use command_executor::{Command, Executor};
//! use command_executor::backends::{local::LocalLauncher, sudo::SudoLauncher};
//!
//! # async fn example() -> command_executor::Result<()> {
//! let executor = Executor::new("privileged-task", SudoLauncher::new(LocalLauncher));
//!
//! // This will run: sudo -n service nebula reload
//! let cmd = Command::builder("service").arg("nebula").arg("reload").build();
//! let result = executor.execute(cmd).await?;
//! # Ok(())
//! # }
//! ```

use crate::{Command, error::Result, launcher::Launcher};
use async_trait::async_trait;

/// Validates the password from the first stdin line, then runs `"$@"`.
///
/// Both sudo calls share the shell as parent so a tty-less timestamp still
/// matches; do not `exec` the second one.
const VALIDATE_THEN_RUN: &str =
    r#"IFS= read -r pw; printf '%s\n' "$pw" | sudo -S -k -v -p '' && sudo -n "$@""#;

/// Launcher that wraps another launcher to execute commands with sudo
#[derive(Clone)]
pub struct SudoLauncher<L> {
    inner: L,
    password: Option<String>,
}

impl<L> SudoLauncher<L> {
    /// Create a new sudo launcher wrapping the given launcher
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            password: None,
        }
    }

    /// Answer sudo's password prompt with this password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Build the sudo command line for `command`
    pub fn wrap(&self, mut command: Command) -> Command {
        let payload = command.take_stdin();
        let mut sudo = match &self.password {
            Some(password) => {
                let mut input = Vec::with_capacity(password.len() + 1);
                input.extend_from_slice(password.as_bytes());
                input.push(b'\n');
                input.extend(payload.unwrap_or_default());
                Command::builder("sh")
                    .arg("-c")
                    .arg(VALIDATE_THEN_RUN)
                    .arg("sh")
                    .stdin(input)
                    .build()
            }
            None => {
                let mut sudo = Command::builder("sudo").arg("-n").build();
                if let Some(payload) = payload {
                    sudo.stdin(payload);
                }
                sudo
            }
        };

        sudo.arg(command.get_program()).args(command.get_args());
        for (key, val) in command.get_envs() {
            sudo.env(key, val);
        }
        if let Some(dir) = command.get_current_dir() {
            sudo.current_dir(dir);
        }
        sudo
    }
}

impl<L: std::fmt::Debug> std::fmt::Debug for SudoLauncher<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SudoLauncher")
            .field("inner", &self.inner)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl<L> Launcher for SudoLauncher<L>
where
    L: Launcher,
{
    type Output = L::Output;
    type Handle = L::Handle;

    async fn launch(&self, command: Command) -> Result<(Self::Output, Self::Handle)> {
        let sudo_command = self.wrap(command);
        self.inner
            .launch(sudo_command)
            .await
            .map_err(|e| e.with_layer_context("Sudo"))
    }
}
