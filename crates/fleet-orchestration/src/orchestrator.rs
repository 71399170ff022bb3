//! Fleet orchestrator
//!
//! Walks the plan one host at a time. Each host moves through
//!
//! ```text
//! Pending -> Reachable -> Connected -> IdentityInstalled -> ConfigInstalled
//!         -> ConfigVerified -> Reloaded
//! ```
//!
//! and stops at the first hard failure, which becomes one [`FailureRecord`].
//! Hosts on this machine skip the probe and run through [`LocalTransport`];
//! hosts flagged `skip_connection` stop at `Done` after their identity is
//! issued. A failing host never stops the hosts after it.
//!
//! [`LocalTransport`]: crate::LocalTransport

use async_trait::async_trait;
use command_executor::backends::SshConfig;
use futures_lite::FutureExt;
use std::any::Any;
use std::fmt;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Instrument, error, info, info_span, warn};

use crate::command::{RemoteCommand, ServiceAction, remote_paths};
use crate::credentials::CredentialCache;
use crate::executor::{RemoteExecutor, RetryPolicy};
use crate::identity::IdentityProvider;
use crate::plan::{DistributionPlan, DistributionRecord};
use crate::probe::{LocalAddresses, port_open};
use crate::transport::{LocalTransport, SshTransport, Transport};

/// Why a host did not finish cleanly
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    /// Config composition failed before the host entered the plan
    #[error("config composition failed: {0}")]
    Composition(String),

    /// Local certificate issuance failed
    #[error("certificate issuance failed: {0}")]
    IdentityIssueFailed(String),

    /// Nothing listening on the SSH port
    #[error("port {port} down")]
    PortDown {
        /// Probed port
        port: u16,
    },

    /// Could not open a session
    #[error("could not connect: {0}")]
    ConnectFailed(String),

    /// Writing identity material failed
    #[error("identity install failed on `{command}`")]
    IdentityInstallFailed {
        /// The command that failed
        command: String,
    },

    /// Writing the config failed
    #[error("config install failed: {0}")]
    ConfigInstallFailed(String),

    /// The installed config does not carry this run's token
    #[error("failed to verify installed config")]
    VerifyMismatch,

    /// Reload or restart exited non-zero; -1 when no exit status came back
    #[error("service reload failed with exit code {code}")]
    ReloadFailed {
        /// Exit code
        code: i32,
    },

    /// Anything else
    #[error("unhandled error: {0}")]
    Unhandled(String),
}

impl DistributionError {
    /// Soft failures are reported but do not stop the host
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            DistributionError::VerifyMismatch | DistributionError::ReloadFailed { .. }
        )
    }
}

/// Per-host progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Not started
    Pending,
    /// SSH port answered
    Reachable,
    /// Session open
    Connected,
    /// CA, cert and key written
    IdentityInstalled,
    /// Config written
    ConfigInstalled,
    /// Installed config carries this run's token
    ConfigVerified,
    /// Service picked up the new config
    Reloaded,
    /// Finished without touching the network
    Done,
    /// Stopped by a hard failure
    Failed,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HostState::Pending => "pending",
            HostState::Reachable => "reachable",
            HostState::Connected => "connected",
            HostState::IdentityInstalled => "identity installed",
            HostState::ConfigInstalled => "config installed",
            HostState::ConfigVerified => "config verified",
            HostState::Reloaded => "reloaded",
            HostState::Done => "done",
            HostState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One failure for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    /// Host name
    pub hostname: String,
    /// Address the host was reached at, or would have been
    pub address: IpAddr,
    /// What went wrong
    pub error: DistributionError,
    /// Whether processing of the host stopped here
    pub hard: bool,
}

impl FailureRecord {
    /// The human readable reason
    pub fn reason(&self) -> String {
        self.error.to_string()
    }
}

/// Final state of one processed host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOutcome {
    /// Host name
    pub hostname: String,
    /// Address used
    pub address: IpAddr,
    /// Last state reached
    pub state: HostState,
}

/// Everything a run produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Every host in plan order with the state it ended in
    pub outcomes: Vec<HostOutcome>,
    /// Failures in the order they happened
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    /// Failures that stopped a host
    pub fn hard_failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(|f| f.hard)
    }

    /// Failures that were reported while the host carried on
    pub fn integrity_warnings(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(|f| !f.hard)
    }

    /// Hosts that did not hit a hard failure
    pub fn completed(&self) -> impl Iterator<Item = &HostOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state != HostState::Failed)
    }

    /// Whether no host hit a hard failure
    pub fn is_success(&self) -> bool {
        self.hard_failures().next().is_none()
    }
}

/// What a run should do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Connect and identify only
    pub ping: bool,
    /// Write configs and identities, never touch a host
    pub generate_only: bool,
    /// Issue and install fresh identities
    pub generate_certs: bool,
    /// How the service picks up the config
    pub restart_type: ServiceAction,
    /// Refuse to reload when verification fails
    pub strict_verify: bool,
}

/// Timing and retry knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Reachability probe timeout
    pub probe_timeout: Duration,
    /// SSH connect timeout
    pub connect_timeout: Duration,
    /// Per-command retry policy
    pub retry: RetryPolicy,
    /// Wait after a reload
    pub reload_settle: Duration,
    /// Wait after reloading this machine so its link comes back
    pub local_settle: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            reload_settle: Duration::from_secs(2),
            local_settle: Duration::from_secs(10),
        }
    }
}

/// Opens transports to hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Whether the host's SSH port accepts connections
    async fn probe(&self, record: &DistributionRecord, timeout: Duration) -> bool {
        port_open(record.address, record.port, timeout).await
    }

    /// A transport to a remote host
    fn remote(
        &self,
        record: &DistributionRecord,
        sudo_password: Option<String>,
        connect_timeout: Duration,
    ) -> Box<dyn Transport>;

    /// A transport to this machine
    fn local(&self, sudo_password: Option<String>) -> Box<dyn Transport> {
        Box::new(LocalTransport::new().with_sudo_password(sudo_password))
    }
}

/// Connects with the OpenSSH client
#[derive(Debug, Clone)]
pub struct SshConnector {
    control_path: PathBuf,
    identity_file: Option<PathBuf>,
}

impl SshConnector {
    /// Keep control sockets at `control_path`; `%C` expands per destination
    pub fn new(control_path: impl Into<PathBuf>) -> Self {
        Self {
            control_path: control_path.into(),
            identity_file: None,
        }
    }

    /// Authenticate with this private key
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("nebula-distributor-%C"))
    }
}

#[async_trait]
impl Connector for SshConnector {
    fn remote(
        &self,
        record: &DistributionRecord,
        sudo_password: Option<String>,
        connect_timeout: Duration,
    ) -> Box<dyn Transport> {
        let mut config = SshConfig::new(record.address.to_string())
            .with_user(record.username.as_str())
            .with_port(record.port)
            .with_connect_timeout(connect_timeout)
            .with_control_path(&self.control_path);
        if let Some(identity) = &self.identity_file {
            config = config.with_identity_file(identity);
        }
        Box::new(SshTransport::new(config).with_sudo_password(sudo_password))
    }
}

/// Tracks one host through the state machine
struct HostReport {
    state: HostState,
    warnings: Vec<DistributionError>,
}

/// Runs the distribution state machine over a plan
pub struct FleetOrchestrator<'a, C> {
    connector: C,
    identities: &'a dyn IdentityProvider,
    settings: OrchestratorSettings,
    local_addresses: LocalAddresses,
    credentials: CredentialCache,
}

impl<'a, C: Connector> FleetOrchestrator<'a, C> {
    /// Create an orchestrator
    pub fn new(
        connector: C,
        identities: &'a dyn IdentityProvider,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            connector,
            identities,
            settings,
            local_addresses: LocalAddresses::default(),
            credentials: CredentialCache::new(),
        }
    }

    /// Treat hosts at these addresses as this machine
    pub fn with_local_addresses(mut self, addresses: LocalAddresses) -> Self {
        self.local_addresses = addresses;
        self
    }

    /// Sudo passwords keyed by username
    pub fn with_credentials(mut self, credentials: CredentialCache) -> Self {
        self.credentials = credentials;
        self
    }

    /// Process every host in plan order
    pub async fn run(&self, plan: &DistributionPlan, options: &RunOptions) -> RunSummary {
        let mut summary = RunSummary::default();

        for rejected in &plan.rejected {
            summary.outcomes.push(HostOutcome {
                hostname: rejected.hostname.clone(),
                address: rejected.address,
                state: HostState::Failed,
            });
            summary.failures.push(FailureRecord {
                hostname: rejected.hostname.clone(),
                address: rejected.address,
                error: DistributionError::Composition(rejected.reason.clone()),
                hard: true,
            });
        }

        for record in &plan.records {
            let span = info_span!("host", host = %record.hostname, address = %record.address);
            let mut report = HostReport {
                state: HostState::Pending,
                warnings: Vec::new(),
            };

            let outcome = AssertUnwindSafe(
                self.distribute(record, options, &mut report)
                    .instrument(span),
            )
            .catch_unwind()
            .await;

            for warning in report.warnings.drain(..) {
                summary.failures.push(FailureRecord {
                    hostname: record.hostname.clone(),
                    address: record.address,
                    error: warning,
                    hard: false,
                });
            }

            let hard = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => Some(DistributionError::Unhandled(panic_message(panic))),
            };
            if let Some(e) = hard {
                error!(host = %record.hostname, address = %record.address, state = %report.state, error = %e, "host failed");
                report.state = HostState::Failed;
                summary.failures.push(FailureRecord {
                    hostname: record.hostname.clone(),
                    address: record.address,
                    error: e,
                    hard: true,
                });
            }

            summary.outcomes.push(HostOutcome {
                hostname: record.hostname.clone(),
                address: record.address,
                state: report.state,
            });
        }

        summary
    }

    async fn distribute(
        &self,
        record: &DistributionRecord,
        options: &RunOptions,
        report: &mut HostReport,
    ) -> Result<(), DistributionError> {
        if let Some(change) = &record.ip_change {
            info!(new_ip = %change.new_ip, "changing mesh address");
        }

        // Identities are issued before connecting so a copy exists locally
        // even when the host cannot be reached.
        if !options.ping
            && (options.generate_certs
                || !self.identities.has_identity(record.role, &record.hostname))
        {
            self.identities
                .issue(&record.identity_request())
                .await
                .map_err(|e| DistributionError::IdentityIssueFailed(e.to_string()))?;
        }

        if options.generate_only {
            report.state = HostState::Done;
            return Ok(());
        }
        if record.skip_connection {
            info!("skipping connection");
            report.state = HostState::Done;
            return Ok(());
        }

        let password = if record.use_sudo {
            self.credentials.get(&record.username).map(str::to_string)
        } else {
            None
        };

        let is_local = self.local_addresses.contains(&record.address);
        let transport = if is_local {
            info!("target is this machine, running locally");
            self.connector.local(password)
        } else {
            if !self
                .connector
                .probe(record, self.settings.probe_timeout)
                .await
            {
                return Err(DistributionError::PortDown { port: record.port });
            }
            report.state = HostState::Reachable;
            self.connector
                .remote(record, password, self.settings.connect_timeout)
        };

        let mut executor = RemoteExecutor::new(transport, self.settings.retry);
        info!("connecting");
        executor
            .connect()
            .await
            .map_err(|e| DistributionError::ConnectFailed(e.to_string()))?;
        report.state = HostState::Connected;

        let result = self
            .install(&mut executor, record, options, report, is_local)
            .await;
        executor.disconnect().await;
        result
    }

    async fn install(
        &self,
        executor: &mut RemoteExecutor,
        record: &DistributionRecord,
        options: &RunOptions,
        report: &mut HostReport,
        is_local: bool,
    ) -> Result<(), DistributionError> {
        match executor.execute(&RemoteCommand::Hostname, false).await {
            Ok(result) if result.success() => {
                info!(remote_hostname = %result.stdout.trim(), "connected to host")
            }
            _ => warn!("could not read remote hostname"),
        }
        if options.ping {
            return Ok(());
        }

        let privileged = record.use_sudo;

        if options.generate_certs {
            info!("installing identity");
            let material = self
                .identities
                .material(record.role, &record.hostname)
                .await
                .map_err(|e| DistributionError::Unhandled(e.to_string()))?;
            for (path, content) in [
                (remote_paths::CA_CERT, material.ca_cert),
                (remote_paths::HOST_CERT, material.host_cert),
                (remote_paths::HOST_KEY, material.host_key),
            ] {
                let command = RemoteCommand::write_file(path, content);
                match executor.execute(&command, privileged).await {
                    Ok(result) if result.success() => {}
                    _ => {
                        return Err(DistributionError::IdentityInstallFailed {
                            command: command.to_string(),
                        });
                    }
                }
            }
            report.state = HostState::IdentityInstalled;
        }

        info!("installing config");
        let config = async_fs::read(&record.config_path).await.map_err(|e| {
            DistributionError::Unhandled(format!(
                "cannot read {}: {}",
                record.config_path.display(),
                e
            ))
        })?;
        let install = RemoteCommand::write_file(remote_paths::CONFIG, config);
        match executor.execute(&install, privileged).await {
            Ok(result) if result.success() => {}
            Ok(result) => {
                return Err(DistributionError::ConfigInstallFailed(format!(
                    "exit code {}: {}",
                    result.code(),
                    result.stderr.trim()
                )));
            }
            Err(e) => return Err(DistributionError::ConfigInstallFailed(e.to_string())),
        }
        report.state = HostState::ConfigInstalled;

        let verified = match executor
            .execute(&RemoteCommand::read_file(remote_paths::CONFIG), privileged)
            .await
        {
            Ok(result) => result.success() && result.stdout.contains(&record.token),
            Err(e) => {
                warn!(error = %e, "could not read back config");
                false
            }
        };
        if verified {
            info!("config installed and verified");
            report.state = HostState::ConfigVerified;
        } else if options.strict_verify {
            return Err(DistributionError::VerifyMismatch);
        } else {
            warn!("installed config does not carry this build's token");
            report.warnings.push(DistributionError::VerifyMismatch);
        }

        let action = record.service_action(options.restart_type);
        info!(%action, "reloading nebula");
        let reload = RemoteCommand::ServiceControl { action };
        match executor.execute(&reload, privileged).await {
            Ok(result) if result.success() => report.state = HostState::Reloaded,
            Ok(result) => {
                report.warnings.push(DistributionError::ReloadFailed {
                    code: result.code(),
                });
            }
            Err(e) => {
                warn!(error = %e, "reload did not complete");
                report
                    .warnings
                    .push(DistributionError::ReloadFailed { code: -1 });
            }
        }
        pause(self.settings.reload_settle).await;

        if is_local {
            info!("waiting for the local link to come back");
            pause(self.settings.local_settle).await;
        }
        Ok(())
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        async_io::Timer::after(duration).await;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic".to_string()
    }
}
