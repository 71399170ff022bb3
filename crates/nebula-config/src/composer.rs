//! Per-host config composition
//!
//! Layers apply in a fixed order:
//!
//! 1. `base` deep-merged with the role layer (`host-base` or `lighthouse-base`)
//! 2. extra fragments for the host's groups, merged additively
//! 3. firewall rules for the host's groups, appended to `firewall.outbound`
//!    and `firewall.inbound`
//! 4. named overrides, deep-merged in the order the host lists them
//! 5. `preferred_ranges` collapsed to unique entries
//!
//! Groups are visited in the host's declared order, so rules from an earlier
//! group always precede rules from a later one. Firewall rules are never
//! deduplicated.

use crate::merge::{additive_merge, deep_merge, dedupe_key};
use crate::source::{ExtraFragment, SourceStore};
use crate::{ConfigError, HostSpec, Result, Role};
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

/// Key whose sequence is kept free of duplicates
pub const PREFERRED_RANGES: &str = "preferred_ranges";

/// One host's fully merged config
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedConfig {
    hostname: String,
    role: Role,
    document: Value,
}

impl ComposedConfig {
    /// Host the config belongs to
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Role the host plays
    pub fn role(&self) -> Role {
        self.role
    }

    /// The merged document
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Look up a value by a path of mapping keys
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.document, |node, key| node.get(*key))
    }

    /// Serialize the document to YAML text
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.document)?)
    }
}

/// Builds host configs from a loaded [`SourceStore`]
#[derive(Debug, Clone, Copy)]
pub struct Composer<'a> {
    store: &'a SourceStore,
}

impl<'a> Composer<'a> {
    /// Compose against `store`
    pub fn new(store: &'a SourceStore) -> Self {
        Self { store }
    }

    /// Compose the config for one host. Source layers are only read.
    pub fn compose(&self, hostname: &str, role: Role, host: &HostSpec) -> Result<ComposedConfig> {
        let fail = |reason: String| ConfigError::Composition {
            host: hostname.to_string(),
            reason,
        };

        let mut document = self.store.base().clone();
        deep_merge(&mut document, self.store.role_base(role));
        if !document.is_mapping() {
            return Err(fail("base layers must be mappings".to_string()));
        }

        self.apply_extras(&mut document, host).map_err(&fail)?;
        self.apply_firewall(&mut document, host).map_err(&fail)?;

        for name in &host.overrides {
            match self.store.override_named(name) {
                Some(layer) => deep_merge(&mut document, layer),
                None => warn!(host = %hostname, name = %name, "override not found, skipping"),
            }
        }

        dedupe_key(&mut document, PREFERRED_RANGES);

        debug!(host = %hostname, role = %role, "composed config");
        Ok(ComposedConfig {
            hostname: hostname.to_string(),
            role,
            document,
        })
    }

    fn apply_extras(&self, document: &mut Value, host: &HostSpec) -> std::result::Result<(), String> {
        let mut applied = vec![false; self.store.extras().len()];
        for group in &host.groups {
            for (index, fragment) in self.store.extras().iter().enumerate() {
                if applied[index] || !declares_group(fragment, group)? {
                    continue;
                }
                let extra = fragment.document.get("extra").ok_or_else(|| {
                    format!("extra fragment {} has no 'extra' section", fragment.source)
                })?;
                additive_merge(document, extra);
                applied[index] = true;
            }
        }
        Ok(())
    }

    fn apply_firewall(&self, document: &mut Value, host: &HostSpec) -> std::result::Result<(), String> {
        let firewall = child_mapping(document, "firewall")?;
        for direction in ["outbound", "inbound"] {
            let rules = child_sequence(firewall, direction)?;
            for group in &host.groups {
                for block in self.store.firewall_rules(group) {
                    match block.get(direction) {
                        None | Some(Value::Null) => {}
                        Some(Value::Sequence(entries)) => rules.extend(entries.iter().cloned()),
                        Some(_) => {
                            return Err(format!(
                                "firewall rules for group '{}' must list {} entries",
                                group, direction
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn declares_group(fragment: &ExtraFragment, group: &str) -> std::result::Result<bool, String> {
    match fragment.document.get("groups") {
        Some(Value::Sequence(groups)) => Ok(groups.iter().any(|g| g.as_str() == Some(group))),
        Some(Value::String(single)) => Ok(single == group),
        _ => Err(format!(
            "extra fragment {} has no 'groups' list",
            fragment.source
        )),
    }
}

/// The mapping at `key`, created when absent or null
fn child_mapping<'v>(parent: &'v mut Value, key: &str) -> std::result::Result<&'v mut Mapping, String> {
    let Value::Mapping(mapping) = parent else {
        return Err(format!("cannot place '{}' in a non-mapping", key));
    };
    let slot = mapping
        .entry(Value::String(key.to_string()))
        .or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Mapping(Mapping::new());
    }
    match slot {
        Value::Mapping(child) => Ok(child),
        _ => Err(format!("'{}' must be a mapping", key)),
    }
}

/// The sequence at `key`, created when absent or null
fn child_sequence<'m>(
    parent: &'m mut Mapping,
    key: &str,
) -> std::result::Result<&'m mut Vec<Value>, String> {
    let slot = parent
        .entry(Value::String(key.to_string()))
        .or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Sequence(Vec::new());
    }
    match slot {
        Value::Sequence(items) => Ok(items),
        _ => Err(format!("firewall.{} must be a list", key)),
    }
}
