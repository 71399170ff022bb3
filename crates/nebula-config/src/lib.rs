//! # Nebula Configuration
//!
//! Network-wide config parsing and per-host Nebula config composition.
//!
//! This crate reads the fleet description (`config.yml`), validates it, loads
//! the layered template documents from the source tree and merges them into
//! one Nebula config per host.

#![warn(missing_docs)]

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;

pub mod change_ip;
pub mod composer;
pub mod merge;
pub mod parser;
pub mod resolver;
pub mod source;

pub use change_ip::{IpChange, IpChangeMap};
pub use composer::{ComposedConfig, Composer};
pub use resolver::ConnectionParams;
pub use source::{SourcePaths, SourceStore};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        /// File that could not be read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse a YAML file
    #[error("Failed to parse {path}: {source}")]
    FileYamlError {
        /// File that failed to parse
        path: PathBuf,
        /// Underlying parse error
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// A required top-level key is absent
    #[error("Missing config item: {0}")]
    MissingKey(&'static str),

    /// Composition failed for a single host
    #[error("Cannot compose config for '{host}': {reason}")]
    Composition {
        /// Host whose config could not be built
        host: String,
        /// What was wrong with the layers
        reason: String,
    },
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level keys that must be present in the network config
pub const REQUIRED_KEYS: [&str; 4] = [
    "subnet_prefix_size",
    "config_output_dir",
    "hosts",
    "lighthouses",
];

/// The network-wide config document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Prefix length of the mesh subnet
    pub subnet_prefix_size: u8,

    /// Where generated host configs are written
    pub config_output_dir: PathBuf,

    /// Installer output directory. Accepted for compatibility, unused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sfx_output_dir: Option<PathBuf>,

    /// Certificate authority and output locations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certs: Option<CertsConfig>,

    /// Fleet-wide SSH defaults
    #[serde(default)]
    pub ssh: SshDefaults,

    /// Regular hosts, in declaration order
    #[serde(default, deserialize_with = "null_as_empty")]
    pub hosts: IndexMap<String, HostSpec>,

    /// Lighthouses, in declaration order
    #[serde(default, deserialize_with = "null_as_empty")]
    pub lighthouses: IndexMap<String, HostSpec>,
}

/// Fleet-wide SSH settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshDefaults {
    /// Default login name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Default SSH port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Fetch or prompt for sudo passwords
    #[serde(default)]
    pub ask_sudo: bool,

    /// Reachability and connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for SshDefaults {
    fn default() -> Self {
        Self {
            username: None,
            port: None,
            ask_sudo: false,
            timeout: default_timeout(),
        }
    }
}

/// Certificate authority material and the directory issued pairs go to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertsConfig {
    /// CA certificate
    pub ca_cert: PathBuf,
    /// CA private key
    pub ca_key: PathBuf,
    /// Directory for issued host certificates and keys
    pub output_dir: PathBuf,
}

/// One host entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSpec {
    /// Address inside the mesh
    pub nebula_ip: IpAddr,

    /// Group memberships, in declared order
    #[serde(default, deserialize_with = "null_as_empty")]
    pub groups: Vec<String>,

    /// Named override fragments, lowest precedence first
    #[serde(default, deserialize_with = "null_as_empty")]
    pub overrides: Vec<String>,

    /// Nebula release architecture
    #[serde(default = "default_arch")]
    pub arch: String,

    /// Init system on the host
    #[serde(default = "default_init")]
    pub init: String,

    /// Per-host SSH settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<HostSsh>,

    /// Generate artifacts only, never connect
    #[serde(default)]
    pub skip_connection: bool,
}

/// Per-host SSH settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostSsh {
    /// SSH port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Login name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Run privileged commands through sudo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_sudo: Option<bool>,
}

/// Whether a host is a regular member or a lighthouse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular mesh member
    Host,
    /// Rendezvous node
    Lighthouse,
}

impl Role {
    /// Name used in file names and config headers
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Lighthouse => "lighthouse",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NetworkConfig {
    /// Every entry in plan order: hosts first, then lighthouses
    pub fn entries(&self) -> impl Iterator<Item = (Role, &str, &HostSpec)> {
        self.hosts
            .iter()
            .map(|(name, spec)| (Role::Host, name.as_str(), spec))
            .chain(
                self.lighthouses
                    .iter()
                    .map(|(name, spec)| (Role::Lighthouse, name.as_str(), spec)),
            )
    }

    /// Look up a host or lighthouse by name
    pub fn find(&self, hostname: &str) -> Option<(Role, &HostSpec)> {
        self.hosts
            .get(hostname)
            .map(|spec| (Role::Host, spec))
            .or_else(|| {
                self.lighthouses
                    .get(hostname)
                    .map(|spec| (Role::Lighthouse, spec))
            })
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_timeout() -> u64 {
    3
}

fn default_arch() -> String {
    "linux-amd64".to_string()
}

fn default_init() -> String {
    "systemd".to_string()
}
