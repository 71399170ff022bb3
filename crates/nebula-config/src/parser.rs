//! Network config parser and fleet-wide validation

use crate::{ConfigError, NetworkConfig, REQUIRED_KEYS, Result, resolver::expand_home};
use ipnet::IpNet;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Parse a network config file
pub fn parse_file(path: impl AsRef<Path>) -> Result<NetworkConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "parsing network config");
    parse_str(&content)
}

/// Parse a network config from a string.
///
/// The document goes through [`Value`] first, which refuses duplicate mapping
/// keys anywhere in the file.
pub fn parse_str(content: &str) -> Result<NetworkConfig> {
    let value: Value = serde_yaml::from_str(content)?;
    check_required_keys(&value)?;

    let mut config: NetworkConfig = serde_yaml::from_value(value)?;
    for (_, spec) in config.hosts.iter_mut().chain(config.lighthouses.iter_mut()) {
        dedupe_in_place(&mut spec.groups);
    }
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_required_keys(value: &Value) -> Result<()> {
    let mapping = value.as_mapping().ok_or_else(|| {
        ConfigError::ValidationError("network config must be a mapping".to_string())
    })?;
    for key in REQUIRED_KEYS {
        if !mapping.contains_key(key) {
            return Err(ConfigError::MissingKey(key));
        }
    }
    Ok(())
}

fn expand_paths(config: &mut NetworkConfig) {
    config.config_output_dir = expand_home(&config.config_output_dir);
    if let Some(certs) = &mut config.certs {
        certs.ca_cert = expand_home(&certs.ca_cert);
        certs.ca_key = expand_home(&certs.ca_key);
        certs.output_dir = expand_home(&certs.output_dir);
    }
}

/// Validate fleet-wide uniqueness and addressing
fn validate_config(config: &NetworkConfig) -> Result<()> {
    for name in config.hosts.keys() {
        if config.lighthouses.contains_key(name) {
            return Err(ConfigError::ValidationError(format!(
                "Duplicate hostname '{}' (declared as host and lighthouse)",
                name
            )));
        }
    }

    let mut seen = HashMap::new();
    let mut duplicates = Vec::new();
    for (_, name, spec) in config.entries() {
        if let Some(first) = seen.insert(spec.nebula_ip, name) {
            duplicates.push(format!("{} ({} and {})", spec.nebula_ip, first, name));
        }
        IpNet::new(spec.nebula_ip, config.subnet_prefix_size).map_err(|_| {
            ConfigError::ValidationError(format!(
                "subnet_prefix_size {} is not valid for {} ({})",
                config.subnet_prefix_size, name, spec.nebula_ip
            ))
        })?;
    }
    if !duplicates.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Duplicate nebula IPs: {}",
            duplicates.join(", ")
        )));
    }

    Ok(())
}

fn dedupe_in_place(items: &mut Vec<String>) {
    let mut kept: Vec<String> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if !kept.contains(&item) {
            kept.push(item);
        }
    }
    *items = kept;
}
