//! Source store for the layered template documents
//!
//! Layout under the files root:
//!
//! ```text
//! configs/base/base.yaml
//! configs/base/default.yaml          (optional)
//! configs/base/host-base.yaml
//! configs/base/lighthouse-base.yaml
//! configs/firewall/*.yaml            {group: {outbound: [...], inbound: [...]}}
//! configs/extra/*.yaml               {groups: [...], extra: {...}}
//! configs/override/*.yaml            named by file stem
//! certs/
//! ```
//!
//! Loading only reads and parses. Shape checks on fragments happen during
//! composition so a bad fragment fails the hosts that use it, not the run.

use crate::{ConfigError, Result, Role};
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Locations of every source document
#[derive(Debug, Clone)]
pub struct SourcePaths {
    /// Files root
    pub root: PathBuf,
    /// Shared foundation layer
    pub base: PathBuf,
    /// Operator defaults, not part of composition
    pub default: PathBuf,
    /// Layer for regular hosts
    pub host_base: PathBuf,
    /// Layer for lighthouses
    pub lighthouse_base: PathBuf,
    /// Firewall fragments
    pub firewall_dir: PathBuf,
    /// Extra fragments
    pub extra_dir: PathBuf,
    /// Named override fragments
    pub override_dir: PathBuf,
    /// Default certificate output directory
    pub certs_dir: PathBuf,
}

impl SourcePaths {
    /// Standard layout under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let configs = root.join("configs");
        let base_dir = configs.join("base");
        Self {
            base: base_dir.join("base.yaml"),
            default: base_dir.join("default.yaml"),
            host_base: base_dir.join("host-base.yaml"),
            lighthouse_base: base_dir.join("lighthouse-base.yaml"),
            firewall_dir: configs.join("firewall"),
            extra_dir: configs.join("extra"),
            override_dir: configs.join("override"),
            certs_dir: root.join("certs"),
            root,
        }
    }
}

/// An extra fragment as loaded, shape unchecked
#[derive(Debug, Clone)]
pub struct ExtraFragment {
    /// File the fragment came from
    pub source: String,
    /// Raw document
    pub document: Value,
}

/// All template layers, loaded once per run and never mutated afterwards
#[derive(Debug, Clone, Default)]
pub struct SourceStore {
    base: Value,
    host_base: Value,
    lighthouse_base: Value,
    defaults: Option<Value>,
    firewalls: IndexMap<String, Vec<Value>>,
    extras: Vec<ExtraFragment>,
    overrides: IndexMap<String, Value>,
}

impl SourceStore {
    /// Build a store from the three base layers
    pub fn new(base: Value, host_base: Value, lighthouse_base: Value) -> Self {
        Self {
            base,
            host_base,
            lighthouse_base,
            ..Self::default()
        }
    }

    /// Read every layer from disk
    pub fn load(paths: &SourcePaths) -> Result<Self> {
        let mut store = Self::new(
            read_layer(&paths.base)?,
            read_layer(&paths.host_base)?,
            read_layer(&paths.lighthouse_base)?,
        );

        if paths.default.is_file() {
            store.defaults = Some(read_layer(&paths.default)?);
        }
        for path in fragment_files(&paths.firewall_dir)? {
            store.add_firewall_fragment(&file_name(&path), read_layer(&path)?)?;
        }
        for path in fragment_files(&paths.extra_dir)? {
            store.add_extra_fragment(file_name(&path), read_layer(&path)?);
        }
        for path in fragment_files(&paths.override_dir)? {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            store.add_override(name, read_layer(&path)?);
        }

        debug!(
            firewall_groups = store.firewalls.len(),
            extras = store.extras.len(),
            overrides = store.overrides.len(),
            "loaded config sources"
        );
        Ok(store)
    }

    /// Register a firewall fragment document. Rules for a group accumulate
    /// across fragments in the order they are added.
    pub fn add_firewall_fragment(&mut self, source: &str, document: Value) -> Result<()> {
        let groups = match document {
            Value::Null => return Ok(()),
            Value::Mapping(groups) => groups,
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "firewall fragment {} must map group names to rules",
                    source
                )));
            }
        };
        for (group, rules) in groups {
            let group = scalar_key(&group).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "firewall fragment {} has a non-scalar group name",
                    source
                ))
            })?;
            self.firewalls.entry(group).or_default().push(rules);
        }
        Ok(())
    }

    /// Register an extra fragment
    pub fn add_extra_fragment(&mut self, source: impl Into<String>, document: Value) {
        self.extras.push(ExtraFragment {
            source: source.into(),
            document,
        });
    }

    /// Register a named override. A later fragment with the same name wins.
    pub fn add_override(&mut self, name: impl Into<String>, document: Value) {
        self.overrides.insert(name.into(), document);
    }

    /// The shared foundation layer
    pub fn base(&self) -> &Value {
        &self.base
    }

    /// The layer for `role`
    pub fn role_base(&self, role: Role) -> &Value {
        match role {
            Role::Host => &self.host_base,
            Role::Lighthouse => &self.lighthouse_base,
        }
    }

    /// `default.yaml`, when present
    pub fn defaults(&self) -> Option<&Value> {
        self.defaults.as_ref()
    }

    /// Firewall rule blocks registered for `group`
    pub fn firewall_rules(&self, group: &str) -> &[Value] {
        self.firewalls.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Extra fragments in load order
    pub fn extras(&self) -> &[ExtraFragment] {
        &self.extras
    }

    /// A named override
    pub fn override_named(&self, name: &str) -> Option<&Value> {
        self.overrides.get(name)
    }
}

fn scalar_key(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read one YAML document; an empty file is an empty mapping
pub fn read_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    let value: Value =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::FileYamlError {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(match value {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other,
    })
}

/// YAML files in `dir`, sorted by name. A missing directory has none.
fn fragment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::ReadError {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| ConfigError::ReadError {
                path: dir.to_path_buf(),
                source,
            })?
            .path();
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
