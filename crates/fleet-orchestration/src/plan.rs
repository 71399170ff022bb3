//! Distribution plan builder
//!
//! Composes every selected host's config, stamps it with a header and a fresh
//! verification token, writes it to the output directory as
//! `<type>-<hostname>.yml` and records how to reach the host. Ping runs use
//! [`connection_plan`], which leaves the output directory alone.

use chrono::{DateTime, Local};
use nebula_config::resolver::resolve_connection;
use nebula_config::{ComposedConfig, Composer, HostSpec, IpChange, IpChangeMap, NetworkConfig, Role};
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::ServiceAction;
use crate::identity::IdentityRequest;
use crate::{Error, Result};

/// Everything needed to distribute one host's config
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionRecord {
    /// Host name
    pub hostname: String,
    /// Host or lighthouse
    pub role: Role,
    /// Mesh address from the network config
    pub nebula_ip: IpAddr,
    /// Address we connect to
    pub address: IpAddr,
    /// Mesh subnet prefix length
    pub prefix: u8,
    /// SSH port
    pub port: u16,
    /// SSH login; empty means the client default
    pub username: String,
    /// Run privileged commands through sudo
    pub use_sudo: bool,
    /// The rendered config on local disk
    pub config_path: PathBuf,
    /// Token embedded in the rendered config
    pub token: String,
    /// Group memberships
    pub groups: Vec<String>,
    /// Nebula release architecture
    pub arch: String,
    /// Init system
    pub init: String,
    /// Generate artifacts only, never connect
    pub skip_connection: bool,
    /// Pending address change
    pub ip_change: Option<IpChange>,
}

impl DistributionRecord {
    /// The certificate request for this host; a pending change issues for the
    /// new address
    pub fn identity_request(&self) -> IdentityRequest {
        IdentityRequest {
            hostname: self.hostname.clone(),
            role: self.role,
            ip: self.ip_change.map_or(self.nebula_ip, |change| change.new_ip),
            prefix: self.prefix,
            groups: self.groups.clone(),
        }
    }

    /// A pending address change always restarts
    pub fn service_action(&self, requested: ServiceAction) -> ServiceAction {
        if self.ip_change.is_some() {
            ServiceAction::Restart
        } else {
            requested
        }
    }
}

/// A host whose config could not be composed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedHost {
    /// Host name
    pub hostname: String,
    /// Mesh address
    pub address: IpAddr,
    /// Why composition failed
    pub reason: String,
}

/// Records in plan order, plus hosts that never made it into the plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistributionPlan {
    /// Hosts first, then lighthouses, each in declaration order
    pub records: Vec<DistributionRecord>,
    /// Hosts whose composition failed
    pub rejected: Vec<RejectedHost>,
}

/// A fresh random token
pub fn verification_token() -> String {
    format!("{}-{}", Uuid::new_v4(), Uuid::new_v4())
}

/// Header block followed by the composed document
pub fn render_config(
    composed: &ComposedConfig,
    spec: &HostSpec,
    token: &str,
    built: DateTime<Local>,
) -> Result<String> {
    let body = composed.to_yaml()?;
    Ok(format!(
        "# Nebula hostname: {}\n# nebula_ip: {}\n# Type: {}\n# groups: {}\n# Config built: {}\n# {}\n\n{}",
        composed.hostname(),
        spec.nebula_ip,
        composed.role(),
        spec.groups.join(", "),
        built.format("%m/%d/%Y %H:%M:%S"),
        token,
        body
    ))
}

/// Build the plan and write every rendered config.
///
/// `selection` restricts the plan to the named hosts; names that match
/// nothing are logged and ignored. A host whose composition fails is listed
/// in [`DistributionPlan::rejected`] and the rest of the plan is unaffected.
pub fn build_plan(
    network: &NetworkConfig,
    composer: &Composer<'_>,
    changes: &IpChangeMap,
    selection: Option<&[String]>,
) -> Result<DistributionPlan> {
    fs::create_dir_all(&network.config_output_dir)?;

    let mut plan = DistributionPlan::default();
    for (role, hostname, spec) in selected(network, selection) {
        let composed = match composer.compose(hostname, role, spec) {
            Ok(composed) => composed,
            Err(e) => {
                warn!(host = %hostname, error = %e, "skipping host");
                plan.rejected.push(RejectedHost {
                    hostname: hostname.to_string(),
                    address: spec.nebula_ip,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let token = verification_token();
        let text = render_config(&composed, spec, &token, Local::now())?;
        let config_path = config_path(network, role, hostname);
        fs::write(&config_path, text).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("cannot write {}: {}", config_path.display(), e),
            ))
        })?;
        debug!(host = %hostname, path = %config_path.display(), "wrote config");

        plan.records
            .push(record(network, role, hostname, spec, changes, config_path, token));
    }

    info!(
        planned = plan.records.len(),
        rejected = plan.rejected.len(),
        "distribution plan built"
    );
    Ok(plan)
}

/// Connection details only, for runs that never install anything.
///
/// Nothing is composed or written; records point at where `build_plan` would
/// write and carry no token.
pub fn connection_plan(
    network: &NetworkConfig,
    changes: &IpChangeMap,
    selection: Option<&[String]>,
) -> DistributionPlan {
    let records = selected(network, selection)
        .map(|(role, hostname, spec)| {
            let path = config_path(network, role, hostname);
            record(network, role, hostname, spec, changes, path, String::new())
        })
        .collect();
    DistributionPlan {
        records,
        rejected: Vec::new(),
    }
}

/// Entries in plan order, restricted to `selection`; unknown names are logged
fn selected<'a>(
    network: &'a NetworkConfig,
    selection: Option<&'a [String]>,
) -> impl Iterator<Item = (Role, &'a str, &'a HostSpec)> {
    if let Some(names) = selection {
        for name in names {
            if network.find(name).is_none() {
                warn!(host = %name, "selected host is not in the network config");
            }
        }
    }
    network.entries().filter(move |(_, hostname, _)| {
        selection.is_none_or(|names| names.iter().any(|n| n == hostname))
    })
}

fn config_path(network: &NetworkConfig, role: Role, hostname: &str) -> PathBuf {
    network
        .config_output_dir
        .join(format!("{}-{}.yml", role, hostname))
}

fn record(
    network: &NetworkConfig,
    role: Role,
    hostname: &str,
    spec: &HostSpec,
    changes: &IpChangeMap,
    config_path: PathBuf,
    token: String,
) -> DistributionRecord {
    let connection = resolve_connection(&network.ssh, spec);
    let ip_change = changes.get(hostname).copied();
    DistributionRecord {
        hostname: hostname.to_string(),
        role,
        nebula_ip: spec.nebula_ip,
        address: ip_change.map_or(spec.nebula_ip, |change| change.nebula_ip),
        prefix: network.subnet_prefix_size,
        port: connection.port,
        username: connection.username,
        use_sudo: connection.use_sudo,
        config_path,
        token,
        groups: spec.groups.clone(),
        arch: spec.arch.clone(),
        init: spec.init.clone(),
        skip_connection: spec.skip_connection,
        ip_change,
    }
}
