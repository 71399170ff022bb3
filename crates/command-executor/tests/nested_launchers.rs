//! Tests for the nested launcher architecture

use async_trait::async_trait;
use command_executor::backends::ssh::{SshConfig, SshLauncher};
use command_executor::backends::sudo::SudoLauncher;
use command_executor::{Command, ExitStatus, Launcher, OutputLine, ProcessHandle, Result};
use futures::stream;
use std::sync::{Arc, Mutex};

/// Launcher that records the final command instead of spawning it
#[derive(Clone, Default)]
struct RecordingLauncher {
    seen: Arc<Mutex<Vec<Command>>>,
}

struct FinishedHandle;

#[async_trait]
impl ProcessHandle for FinishedHandle {
    async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(ExitStatus {
            code: Some(0),
            #[cfg(unix)]
            signal: None,
        })
    }
}

#[async_trait]
impl Launcher for RecordingLauncher {
    type Output = stream::Empty<OutputLine>;
    type Handle = FinishedHandle;

    async fn launch(&self, command: Command) -> Result<(Self::Output, Self::Handle)> {
        self.seen.lock().unwrap().push(command);
        Ok((stream::empty(), FinishedHandle))
    }
}

fn last_arg(cmd: &Command) -> String {
    cmd.get_args()
        .last()
        .map(|a| a.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[smol_potat::test]
async fn test_sudo_over_ssh_runs_sudo_remotely() {
    let recorder = RecordingLauncher::default();
    let config = SshConfig::new("10.42.0.7").with_user("ops");
    let launcher = SudoLauncher::new(SshLauncher::new(recorder.clone(), config))
        .with_password("pw");

    let cmd = Command::builder("service").arg("nebula").arg("restart").build();
    let result = launcher.execute(cmd).await.unwrap();
    assert!(result.success());

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get_program(), "ssh");
    let remote = last_arg(&seen[0]);
    assert!(remote.starts_with("sh -c "), "{}", remote);
    assert!(remote.contains("sudo -n"), "{}", remote);
    assert!(remote.ends_with(" sh service nebula restart"), "{}", remote);
    // The password travels over the SSH channel's stdin, never on a command line.
    assert_eq!(seen[0].get_stdin(), Some(&b"pw\n"[..]));
}

#[smol_potat::test]
async fn test_nested_ssh_quotes_each_hop() {
    let recorder = RecordingLauncher::default();
    let bastion = SshLauncher::new(recorder.clone(), SshConfig::new("bastion").with_user("jump"));
    let target = SshLauncher::new(bastion, SshConfig::new("10.42.0.9"));

    target
        .execute(Command::builder("cat").arg("/etc/nebula/config.yaml").build())
        .await
        .unwrap();

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(
        last_arg(&seen[0]),
        "ssh -o BatchMode=yes -o StrictHostKeyChecking=accept-new 10.42.0.9 'cat /etc/nebula/config.yaml'"
    );
}
