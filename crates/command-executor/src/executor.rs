//! Named entry point over a launcher stack

use crate::command::Command;
use crate::error::Result;
use crate::launcher::Launcher;
use crate::process::ExitResult;
use tracing::debug;

/// Runs commands through a launcher stack, logging under `name`
pub struct Executor<L: Launcher> {
    name: String,
    launcher: L,
}

impl<L: Launcher> Executor<L> {
    /// Wrap `launcher`
    pub fn new(name: impl Into<String>, launcher: L) -> Self {
        Self {
            name: name.into(),
            launcher,
        }
    }

    /// Run `command` to completion
    pub async fn execute(&self, command: Command) -> Result<ExitResult> {
        debug!(executor = %self.name, program = ?command.get_program(), "executing command");
        let result = self.launcher.execute(command).await?;
        debug!(executor = %self.name, code = ?result.status.code, "command finished");
        Ok(result)
    }
}
