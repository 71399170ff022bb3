//! Runtime-agnostic command execution library
//!
//! This crate provides a unified interface for executing commands on the local
//! machine, under `sudo`, and on remote hosts through the OpenSSH client.
//! Launchers compose: `SudoLauncher<SshLauncher<LocalLauncher>>` runs a
//! privileged command on a remote host, and the SSH layer is the only place a
//! command line is rendered for a remote shell.

#![warn(missing_docs)]

pub mod backends;
pub mod command;
pub mod error;
pub mod executor;
pub mod launcher;
pub mod output;
pub mod process;

pub use command::{Command, shell_escape};
pub use error::{Error, Result};
pub use executor::Executor;
pub use launcher::Launcher;
pub use output::OutputLine;
pub use process::{ExitResult, ExitStatus, ProcessHandle};
