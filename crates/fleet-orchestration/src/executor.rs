//! Retrying command execution over a [`Transport`]
//!
//! Commands are retried on any non-zero exit or transport error. Every
//! `reconnect_every` consecutive failures the session is torn down and opened
//! again, then the executor waits `reconnect_pause` instead of `backoff`. An
//! authentication failure triggers one key push before the same command is
//! tried again.
//!
//! Nothing here knows whether a command is idempotent. Everything the
//! distributor issues (whole-file overwrites, service reloads) is safe to
//! repeat.

use async_io::Timer;
use command_executor::ExitResult;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command::RemoteCommand;
use crate::transport::Transport;
use crate::{Error, Result};

/// Retry and reconnect settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per command, including the first
    pub max_attempts: u32,
    /// Wait between attempts
    pub backoff: Duration,
    /// Reconnect after this many consecutive failures; 0 never reconnects
    pub reconnect_every: u32,
    /// Wait after a reconnect
    pub reconnect_pause: Duration,
    /// Attempts to open the session
    pub connect_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            backoff: Duration::from_secs(2),
            reconnect_every: 5,
            reconnect_pause: Duration::from_secs(10),
            connect_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// No waiting anywhere; for tests and dry runs
    pub fn immediate() -> Self {
        Self {
            backoff: Duration::ZERO,
            reconnect_pause: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Runs [`RemoteCommand`]s on one host with retries
pub struct RemoteExecutor {
    transport: Box<dyn Transport>,
    policy: RetryPolicy,
}

impl RemoteExecutor {
    /// Wrap a transport
    pub fn new(transport: Box<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// The retry policy in force
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Open the session, pushing our key once if authentication fails
    pub async fn connect(&mut self) -> Result<()> {
        let attempts = self.policy.connect_attempts.max(1);
        let mut key_pushed = false;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_authentication_failure() && !key_pushed => {
                    key_pushed = true;
                    if let Err(push) = self.transport.push_key().await {
                        warn!(host = %self.transport.target(), error = %push, "key push failed");
                    }
                    last_error = Some(e);
                }
                Err(e) => {
                    warn!(host = %self.transport.target(), attempt, error = %e, "connect failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                pause(self.policy.backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Network("no connection attempts made".to_string())))
    }

    /// Whether the session is usable
    pub async fn test_connectivity(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Close the session
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.transport.disconnect().await {
            debug!(host = %self.transport.target(), error = %e, "disconnect failed");
        }
    }

    /// Run `command`, retrying per the policy.
    ///
    /// Returns the first successful result. When every attempt exits non-zero
    /// the last result is returned so the caller can inspect it; when the last
    /// attempt failed at the transport level that error is returned instead.
    pub async fn execute(&mut self, command: &RemoteCommand, privileged: bool) -> Result<ExitResult> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut key_pushed = false;
        let mut failures = 0u32;
        let mut last: Option<Result<ExitResult>> = None;

        for attempt in 1..=max_attempts {
            match self.transport.run(command.to_command(), privileged).await {
                Ok(result) if result.success() => {
                    if attempt > 1 {
                        info!(host = %self.transport.target(), %command, attempt, "command succeeded after retry");
                    }
                    return Ok(result);
                }
                Ok(result) => {
                    warn!(
                        host = %self.transport.target(),
                        %command,
                        attempt,
                        code = result.code(),
                        stderr = %result.stderr.trim(),
                        "command failed"
                    );
                    last = Some(Ok(result));
                }
                Err(e) if e.is_authentication_failure() && !key_pushed => {
                    key_pushed = true;
                    if let Err(push) = self.transport.push_key().await {
                        warn!(host = %self.transport.target(), error = %push, "key push failed");
                    }
                    last = Some(Err(e));
                    continue;
                }
                Err(e) => {
                    warn!(host = %self.transport.target(), %command, attempt, error = %e, "command failed");
                    last = Some(Err(e));
                }
            }

            failures += 1;
            if attempt == max_attempts {
                break;
            }
            if self.policy.reconnect_every > 0 && failures % self.policy.reconnect_every == 0 {
                self.reconnect().await;
                pause(self.policy.reconnect_pause).await;
            } else {
                pause(self.policy.backoff).await;
            }
        }

        last.unwrap_or_else(|| Err(Error::Network(format!("{} was never attempted", command))))
    }

    async fn reconnect(&mut self) {
        info!(host = %self.transport.target(), "reconnecting");
        if let Err(e) = self.transport.disconnect().await {
            debug!(host = %self.transport.target(), error = %e, "disconnect before reconnect failed");
        }
        if let Err(e) = self.transport.connect().await {
            warn!(host = %self.transport.target(), error = %e, "reconnect failed");
        }
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        Timer::after(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use command_executor::{Command, ExitStatus};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Script {
        outcomes: VecDeque<std::result::Result<i32, &'static str>>,
        runs: u32,
        connects: u32,
        disconnects: u32,
        key_pushes: u32,
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport(Arc<Mutex<Script>>);

    impl ScriptedTransport {
        fn with_outcomes(outcomes: &[std::result::Result<i32, &'static str>]) -> Self {
            let transport = Self::default();
            transport.0.lock().unwrap().outcomes = outcomes.iter().copied().collect();
            transport
        }
    }

    fn exit(code: i32) -> ExitResult {
        ExitResult {
            status: ExitStatus {
                code: Some(code),
                #[cfg(unix)]
                signal: None,
            },
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn target(&self) -> String {
            "scripted".to_string()
        }

        async fn connect(&mut self) -> Result<()> {
            self.0.lock().unwrap().connects += 1;
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.0.lock().unwrap().disconnects += 1;
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            true
        }

        async fn run(&self, _command: Command, _privileged: bool) -> Result<ExitResult> {
            let mut script = self.0.lock().unwrap();
            script.runs += 1;
            match script.outcomes.pop_front().unwrap_or(Ok(0)) {
                Ok(code) => Ok(exit(code)),
                Err("auth") => Err(command_executor::Error::SshAuthenticationFailed {
                    host: "scripted".to_string(),
                }
                .into()),
                Err(reason) => Err(Error::Network(reason.to_string())),
            }
        }

        async fn push_key(&self) -> Result<()> {
            self.0.lock().unwrap().key_pushes += 1;
            Ok(())
        }
    }

    fn executor(transport: &ScriptedTransport, policy: RetryPolicy) -> RemoteExecutor {
        RemoteExecutor::new(Box::new(transport.clone()), policy)
    }

    #[smol_potat::test]
    async fn test_retries_until_success() {
        let transport = ScriptedTransport::with_outcomes(&[Ok(1), Err("reset"), Ok(0)]);
        let mut exec = executor(&transport, RetryPolicy::immediate());

        let result = exec.execute(&RemoteCommand::Hostname, false).await.unwrap();
        assert!(result.success());
        assert_eq!(transport.0.lock().unwrap().runs, 3);
    }

    #[smol_potat::test]
    async fn test_reconnects_every_nth_failure() {
        let transport = ScriptedTransport::with_outcomes(&[Ok(1); 12]);
        let policy = RetryPolicy {
            max_attempts: 12,
            reconnect_every: 5,
            ..RetryPolicy::immediate()
        };
        let mut exec = executor(&transport, policy);

        let result = exec.execute(&RemoteCommand::Hostname, true).await.unwrap();
        assert_eq!(result.code(), 1);

        let script = transport.0.lock().unwrap();
        assert_eq!(script.runs, 12);
        assert_eq!(script.disconnects, 2);
        assert_eq!(script.connects, 2);
    }

    #[smol_potat::test]
    async fn test_authentication_failure_pushes_key_once() {
        let transport = ScriptedTransport::with_outcomes(&[Err("auth"), Err("auth"), Ok(0)]);
        let mut exec = executor(&transport, RetryPolicy::immediate());

        assert!(exec.execute(&RemoteCommand::Hostname, false).await.is_ok());
        let script = transport.0.lock().unwrap();
        assert_eq!(script.key_pushes, 1);
        assert_eq!(script.runs, 3);
    }

    #[smol_potat::test]
    async fn test_last_transport_error_is_returned() {
        let transport = ScriptedTransport::with_outcomes(&[Err("reset"); 3]);
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::immediate()
        };
        let mut exec = executor(&transport, policy);

        let err = exec.execute(&RemoteCommand::Hostname, false).await.unwrap_err();
        assert!(matches!(err, Error::Network(reason) if reason == "reset"));
    }
}
