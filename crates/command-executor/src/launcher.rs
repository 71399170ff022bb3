//! Launcher trait for executing commands in different contexts

use crate::command::Command;
use crate::error::Result;
use crate::output::OutputLine;
use crate::process::{ExitResult, ProcessHandle};
use async_trait::async_trait;
use futures::stream::Stream;

/// A launcher that can execute commands in a specific context
///
/// Launchers wrap each other: an outer launcher rewrites the command and hands
/// it to its inner launcher, until `LocalLauncher` finally spawns a process.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Output lines of a launched process
    type Output: Stream<Item = OutputLine> + Send + Unpin;

    /// The process handle type this launcher produces
    type Handle: ProcessHandle;

    /// Start `command`, returning its output and a handle to wait on
    async fn launch(&self, command: Command) -> Result<(Self::Output, Self::Handle)>;

    /// Execute a command and wait for it to complete, capturing stdout and stderr separately
    async fn execute(&self, command: Command) -> Result<ExitResult> {
        use futures::StreamExt;

        let (mut output, mut handle) = self.launch(command).await?;
        let mut stdout = String::new();
        let mut stderr = String::new();

        while let Some(line) = output.next().await {
            let (sink, text) = match line {
                OutputLine::Stdout(text) => (&mut stdout, text),
                OutputLine::Stderr(text) => (&mut stderr, text),
            };
            sink.push_str(&text);
            sink.push('\n');
        }

        let status = handle.wait().await?;
        Ok(ExitResult {
            status,
            stdout,
            stderr,
        })
    }
}
