//! Spawning processes on this machine

use async_process::{Child, ChildStderr, ChildStdout, Stdio};
use async_trait::async_trait;
use futures::io::AsyncWriteExt;
use futures::stream::Stream;
use futures_lite::io::{AsyncBufReadExt, BufReader, Split};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::output::OutputLine;
use crate::process::{ExitStatus, ProcessHandle};

/// Spawns commands as local child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLauncher;

/// A local child process; killed if dropped before it is waited on
pub struct LocalProcessHandle {
    child: Child,
    finished: bool,
}

/// Interleaved stdout and stderr lines of a local child.
///
/// Bytes that are not UTF-8 are replaced rather than ending the stream.
pub struct LocalOutput {
    stdout: Option<Split<BufReader<ChildStdout>>>,
    stderr: Option<Split<BufReader<ChildStderr>>>,
}

#[async_trait]
impl Launcher for LocalLauncher {
    type Output = LocalOutput;
    type Handle = LocalProcessHandle;

    /// Any stdin payload is written in full and the pipe closed before the
    /// output is returned, so the child must be able to consume it without
    /// first producing output.
    async fn launch(&self, mut command: Command) -> Result<(Self::Output, Self::Handle)> {
        let input = command.take_stdin();
        let mut async_cmd = command.prepare();

        async_cmd.stdout(Stdio::piped());
        async_cmd.stderr(Stdio::piped());
        async_cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = async_cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::CommandNotFound {
                    command: command.get_program().to_string_lossy().into_owned(),
                }
            } else {
                Error::spawn_failed(format!("Failed to spawn process: {}", e))
            }
        })?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            // A child that exits without reading everything closes the pipe;
            // its exit status tells the real story.
            if let Err(e) = stdin.write_all(&data).await {
                tracing::debug!(error = %e, "stdin closed early");
            }
            let _ = stdin.close().await;
        }

        let output = LocalOutput {
            stdout: child.stdout.take().map(|s| BufReader::new(s).split(b'\n')),
            stderr: child.stderr.take().map(|s| BufReader::new(s).split(b'\n')),
        };
        let handle = LocalProcessHandle {
            child,
            finished: false,
        };
        Ok((output, handle))
    }
}

#[async_trait]
impl ProcessHandle for LocalProcessHandle {
    async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .status()
            .await
            .map_err(|e| Error::spawn_failed(format!("Failed to wait for process: {}", e)))?;
        self.finished = true;
        Ok(status.into())
    }
}

impl Drop for LocalProcessHandle {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
        }
    }
}

fn poll_lines<R>(
    source: &mut Option<Split<BufReader<R>>>,
    cx: &mut Context<'_>,
) -> Poll<Option<String>>
where
    R: futures_lite::io::AsyncRead + Unpin,
{
    let Some(lines) = source else {
        return Poll::Ready(None);
    };
    match Pin::new(lines).poll_next(cx) {
        Poll::Ready(Some(Ok(line))) => {
            Poll::Ready(Some(String::from_utf8_lossy(&line).into_owned()))
        }
        Poll::Ready(Some(Err(e))) => {
            tracing::warn!(error = %e, "lost process output");
            *source = None;
            Poll::Ready(None)
        }
        Poll::Ready(None) => {
            *source = None;
            Poll::Ready(None)
        }
        Poll::Pending => Poll::Pending,
    }
}

impl Stream for LocalOutput {
    type Item = OutputLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        let stdout = poll_lines(&mut this.stdout, cx);
        if let Poll::Ready(Some(line)) = stdout {
            return Poll::Ready(Some(OutputLine::Stdout(line)));
        }
        let stderr = poll_lines(&mut this.stderr, cx);
        if let Poll::Ready(Some(line)) = stderr {
            return Poll::Ready(Some(OutputLine::Stderr(line)));
        }

        if this.stdout.is_none() && this.stderr.is_none() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

impl crate::executor::Executor<LocalLauncher> {
    /// An executor that spawns on this machine
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, LocalLauncher)
    }
}
