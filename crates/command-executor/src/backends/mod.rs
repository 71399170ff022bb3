//! Backend implementations for different execution contexts
//!
//! `LocalLauncher` spawns processes; `SshLauncher` and `SudoLauncher` rewrite a
//! command and delegate to the launcher they wrap. Privileged remote execution
//! is `SudoLauncher::new(SshLauncher::to_host(config))`: sudo wraps the
//! command first, then SSH carries the whole line to the remote shell.

pub mod local;
pub mod ssh;
pub mod sudo;

pub use local::{LocalLauncher, LocalOutput, LocalProcessHandle};
pub use ssh::{SshConfig, SshLauncher};
pub use sudo::SudoLauncher;
