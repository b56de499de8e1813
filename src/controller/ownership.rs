//! Ownership resolution
//!
//! Maps a watched object to the DeviceConfig governing it through
//! `metadata.ownerReferences`. Pure lookup, no API calls.

use std::fmt;

use kube::{Resource, ResourceExt};

use crate::crd::DeviceConfig;
use crate::error::{Error, Result};

/// Identity of a DeviceConfig, the key reconcile signals are deduplicated on
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParentKey {
    pub namespace: String,
    pub name: String,
}

impl ParentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(
            config.namespace().unwrap_or_else(|| "default".to_string()),
            config.name_any(),
        )
    }
}

impl fmt::Display for ParentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Name of the single owner of `kind` listed on `obj`.
///
/// Owners of other kinds are ignored. Two distinct owners of `kind` are
/// rejected with [`Error::AmbiguousOwner`] instead of silently picking one.
pub fn owning_parent<K>(obj: &K, kind: &str) -> Result<Option<String>>
where
    K: Resource,
{
    let mut owners: Vec<String> = Vec::new();
    for owner in obj.owner_references() {
        if owner.kind == kind && !owners.contains(&owner.name) {
            owners.push(owner.name.clone());
        }
    }

    match owners.len() {
        0 => Ok(None),
        1 => Ok(owners.pop()),
        _ => Err(Error::AmbiguousOwner {
            kind: kind.to_string(),
            object: format!(
                "{}/{}",
                obj.namespace().unwrap_or_default(),
                obj.name_any()
            ),
            owners,
        }),
    }
}

/// Resolve the owning DeviceConfig of a namespaced object.
///
/// Owner references cannot cross namespaces, so the owner lives next to `obj`.
pub fn owning_device_config<K>(obj: &K) -> Result<Option<ParentKey>>
where
    K: Resource,
{
    let kind = DeviceConfig::kind(&());
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    Ok(owning_parent(obj, &kind)?.map(|name| ParentKey::new(namespace, name)))
}
