//! # Fleet Orchestration
//!
//! Distributes generated Nebula configs and identities to a fleet of hosts.
//!
//! The pieces, leaf first:
//!
//! - [`RemoteCommand`]: a structured description of everything we ever run on
//!   a host, rendered to a concrete command line in one place
//! - [`Transport`]: a session to one host, over SSH or on the local machine
//! - [`RemoteExecutor`]: retry and reconnect policy around a transport
//! - [`IdentityProvider`]: issues and reads certificate material
//! - [`build_plan`]: composes, renders and writes every host's config
//! - [`connection_plan`]: the same records without touching disk, for ping runs
//! - [`FleetOrchestrator`]: runs the per-host state machine over the plan
//!
//! ## Example
//!
//! ```no_run
//! use fleet_orchestration::{
//!     FleetOrchestrator, NebulaCert, OrchestratorSettings, RunOptions, SshConnector,
//!     build_plan,
//! };
//! use nebula_config::{Composer, IpChangeMap, SourcePaths, SourceStore, parser};
//!
//! # async fn example() -> fleet_orchestration::Result<()> {
//! let network = parser::parse_file("config.yml")?;
//! let store = SourceStore::load(&SourcePaths::new("files"))?;
//! let changes = IpChangeMap::default();
//! let plan = build_plan(&network, &Composer::new(&store), &changes, None)?;
//!
//! let identities = NebulaCert::new("ca.crt", "ca.key", "files/certs");
//! let orchestrator = FleetOrchestrator::new(
//!     SshConnector::default(),
//!     &identities,
//!     OrchestratorSettings::default(),
//! );
//! let summary = orchestrator.run(&plan, &RunOptions::default()).await;
//! println!("{} hosts failed", summary.hard_failures().count());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod command;
mod credentials;
mod executor;
mod identity;
mod orchestrator;
mod plan;
mod probe;
mod transport;

pub use command::{RemoteCommand, ServiceAction, remote_paths};
pub use credentials::{
    CredentialCache, CredentialStore, KEYRING_SERVICE, KeyringStore, MemoryStore,
    gather_passwords,
};
pub use executor::{RemoteExecutor, RetryPolicy};
pub use identity::{IdentityMaterial, IdentityProvider, IdentityRequest, NebulaCert};
pub use orchestrator::{
    Connector, DistributionError, FailureRecord, FleetOrchestrator, HostOutcome, HostState,
    OrchestratorSettings, RunOptions, RunSummary, SshConnector,
};
pub use plan::{
    DistributionPlan, DistributionRecord, RejectedHost, build_plan, connection_plan,
    render_config, verification_token,
};
pub use probe::{LocalAddresses, port_open};
pub use transport::{LocalTransport, SshTransport, Transport};

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Command executor errors
    #[error("Command execution error: {0}")]
    CommandExecutor(#[from] command_executor::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] nebula_config::ConfigError),

    /// Certificate issuance or lookup failed
    #[error("Identity error: {0}")]
    Identity(String),

    /// Credential store error
    #[error("Credential store error: {0}")]
    Credentials(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the remote host rejected our credentials
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Error::CommandExecutor(e) if e.is_authentication_failure())
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;
