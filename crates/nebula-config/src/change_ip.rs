//! IP change map
//!
//! ```yaml
//! web1:
//!   new_ip: 10.42.1.10     # address the new certificate is issued for
//!   nebula_ip: 10.42.0.10  # address the host is reachable at today
//! ```
//!
//! A host listed here is contacted at `nebula_ip`, gets an identity for
//! `new_ip`, and is restarted rather than reloaded.

use crate::{ConfigError, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// A pending address change for one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpChange {
    /// Address after the change
    pub new_ip: IpAddr,
    /// Address before the change
    pub nebula_ip: IpAddr,
}

/// Pending address changes keyed by hostname
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpChangeMap(IndexMap<String, IpChange>);

impl IpChangeMap {
    /// Read the map from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse the map from YAML text; an empty document is an empty map
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let map: Option<IndexMap<String, IpChange>> = serde_yaml::from_str(content)?;
        Ok(Self(map.unwrap_or_default()))
    }

    /// The change recorded for `hostname`
    pub fn get(&self, hostname: &str) -> Option<&IpChange> {
        self.0.get(hostname)
    }

    /// Number of hosts with a pending change
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no change is pending
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, IpChange)> for IpChangeMap {
    fn from_iter<I: IntoIterator<Item = (String, IpChange)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
