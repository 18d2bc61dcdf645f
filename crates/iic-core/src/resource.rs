//! Resource registry: the named physical units sequences lock.
//!
//! Resource names follow a `kind:unit` convention (`arm:b1`, `lamp:halogen`,
//! `hexapod:sm1`, `shutter:sm1`) with a few singletons (`fps`, `mcs`). The
//! registry is built once from configuration and is immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ResourceConfig;
use crate::error::{SeqResult, SequenceError};

/// Name of a physical resource.
///
/// Ordering is lexicographic; the resource manager uses it as the single
/// global acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(String);

impl ResourceName {
    /// Wraps an arbitrary name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Camera of one spectrograph arm, e.g. `arm:b1`.
    pub fn arm(camera: &str) -> Self {
        Self(format!("arm:{camera}"))
    }

    /// Calibration lamp, e.g. `lamp:argon`.
    pub fn lamp(lamp: &str) -> Self {
        Self(format!("lamp:{lamp}"))
    }

    /// Slit hexapod of a spectrograph module, e.g. `hexapod:sm1`.
    pub fn hexapod(spec_num: u8) -> Self {
        Self(format!("hexapod:sm{spec_num}"))
    }

    /// Shutter of a spectrograph module, e.g. `shutter:sm1`.
    pub fn shutter(spec_num: u8) -> Self {
        Self(format!("shutter:sm{spec_num}"))
    }

    /// Fiber illuminator, e.g. `illuminator:bia`.
    pub fn illuminator(kind: &str) -> Self {
        Self(format!("illuminator:{kind}"))
    }

    /// Fiber-positioner stage.
    pub fn fps() -> Self {
        Self("fps".to_string())
    }

    /// Metrology camera.
    pub fn mcs() -> Self {
        Self("mcs".to_string())
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Part before the first `:`, or the whole name for singletons.
    pub fn kind(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Which lock modes a resource admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SharingClass {
    /// Only one holder at a time.
    #[default]
    Exclusive,
    /// Either one exclusive holder or any number of shared readers.
    Shared,
}

/// Mode in which a lock is requested or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Reader lock; compatible with other shared locks.
    Shared,
    /// Writer lock; compatible with nothing.
    Exclusive,
}

impl LockMode {
    /// Whether a lock held in `self` may coexist with another in `other`.
    pub fn compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }

    /// Whether holding `self` already grants what `wanted` asks for.
    pub fn covers(self, wanted: LockMode) -> bool {
        self >= wanted
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// One resource requested in a given mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceClaim {
    /// Resource requested.
    pub name: ResourceName,
    /// Requested mode.
    pub mode: LockMode,
}

impl ResourceClaim {
    /// Exclusive claim on `name`.
    pub fn exclusive(name: ResourceName) -> Self {
        Self {
            name,
            mode: LockMode::Exclusive,
        }
    }

    /// Shared claim on `name`.
    pub fn shared(name: ResourceName) -> Self {
        Self {
            name,
            mode: LockMode::Shared,
        }
    }
}

/// Normalizes a claim set into global order, dropping duplicate shared claims.
///
/// A resource claimed twice where either claim is exclusive can never be
/// granted to a single requester and is rejected as self-conflicting.
pub fn normalize_claims(claims: &[ResourceClaim]) -> SeqResult<Vec<ResourceClaim>> {
    let mut merged: BTreeMap<&ResourceName, LockMode> = BTreeMap::new();
    for claim in claims {
        match merged.get(&claim.name) {
            None => {
                merged.insert(&claim.name, claim.mode);
            }
            Some(existing) if existing.compatible_with(claim.mode) => {}
            Some(existing) => {
                return Err(SequenceError::invalid(format!(
                    "self-conflicting claim set: '{}' requested as {} and {}",
                    claim.name, existing, claim.mode
                )));
            }
        }
    }
    Ok(merged
        .into_iter()
        .map(|(name, mode)| ResourceClaim {
            name: name.clone(),
            mode,
        })
        .collect())
}

/// A registered physical resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique name.
    pub name: ResourceName,
    /// Admitted lock modes.
    pub class: SharingClass,
}

impl Resource {
    /// Whether a claim in `mode` is admissible for this resource.
    pub fn admits(&self, mode: LockMode) -> bool {
        match self.class {
            SharingClass::Shared => true,
            SharingClass::Exclusive => mode == LockMode::Exclusive,
        }
    }
}

/// Immutable set of known resources.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    resources: BTreeMap<ResourceName, Resource>,
}

impl ResourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from configuration entries.
    ///
    /// Duplicate names are rejected.
    pub fn from_config(entries: &[ResourceConfig]) -> SeqResult<Self> {
        let mut registry = Self::new();
        for entry in entries {
            registry.insert(Resource {
                name: ResourceName::new(entry.name.clone()),
                class: entry.class,
            })?;
        }
        Ok(registry)
    }

    fn insert(&mut self, resource: Resource) -> SeqResult<()> {
        if self.resources.contains_key(&resource.name) {
            return Err(SequenceError::invalid(format!(
                "resource '{}' defined twice",
                resource.name
            )));
        }
        self.resources.insert(resource.name.clone(), resource);
        Ok(())
    }

    /// Adds an exclusive-only resource.
    pub fn with_exclusive(mut self, name: impl Into<String>) -> Self {
        let name = ResourceName::new(name);
        self.resources.insert(
            name.clone(),
            Resource {
                name,
                class: SharingClass::Exclusive,
            },
        );
        self
    }

    /// Adds a resource admitting shared readers.
    pub fn with_shared(mut self, name: impl Into<String>) -> Self {
        let name = ResourceName::new(name);
        self.resources.insert(
            name.clone(),
            Resource {
                name,
                class: SharingClass::Shared,
            },
        );
        self
    }

    /// Looks up a resource.
    pub fn get(&self, name: &ResourceName) -> Option<&Resource> {
        self.resources.get(name)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &ResourceName) -> bool {
        self.resources.contains_key(name)
    }

    /// Iterates resources in global order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    /// Number of registered resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Validates a claim set against the registry and normalizes it.
    ///
    /// Fails with [`SequenceError::Invalid`] for unknown resources, modes the
    /// sharing class does not admit, and self-conflicting sets.
    pub fn validate(&self, claims: &[ResourceClaim]) -> SeqResult<Vec<ResourceClaim>> {
        let normalized = normalize_claims(claims)?;
        for claim in &normalized {
            let resource = self.get(&claim.name).ok_or_else(|| {
                SequenceError::invalid(format!("unknown resource '{}'", claim.name))
            })?;
            if !resource.admits(claim.mode) {
                return Err(SequenceError::invalid(format!(
                    "resource '{}' does not admit {} locks",
                    claim.name, claim.mode
                )));
            }
        }
        Ok(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new()
            .with_exclusive("arm:b1")
            .with_shared("lamp:halogen")
    }

    #[test]
    fn names_and_kinds() {
        assert_eq!(ResourceName::arm("b1").as_str(), "arm:b1");
        assert_eq!(ResourceName::hexapod(2).as_str(), "hexapod:sm2");
        assert_eq!(ResourceName::lamp("argon").kind(), "lamp");
        assert_eq!(ResourceName::fps().kind(), "fps");
    }

    #[test]
    fn mode_compatibility() {
        assert!(LockMode::Shared.compatible_with(LockMode::Shared));
        assert!(!LockMode::Shared.compatible_with(LockMode::Exclusive));
        assert!(!LockMode::Exclusive.compatible_with(LockMode::Exclusive));
        assert!(LockMode::Exclusive.covers(LockMode::Shared));
        assert!(!LockMode::Shared.covers(LockMode::Exclusive));
    }

    #[test]
    fn normalize_sorts_and_dedups_shared() {
        let claims = vec![
            ResourceClaim::shared(ResourceName::lamp("halogen")),
            ResourceClaim::exclusive(ResourceName::arm("b1")),
            ResourceClaim::shared(ResourceName::lamp("halogen")),
        ];
        let normalized = normalize_claims(&claims).unwrap();
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].name.as_str(), "arm:b1");
        assert_eq!(normalized[1].name.as_str(), "lamp:halogen");
    }

    #[test]
    fn normalize_rejects_self_conflict() {
        let claims = vec![
            ResourceClaim::exclusive(ResourceName::arm("b1")),
            ResourceClaim::shared(ResourceName::arm("b1")),
        ];
        let err = normalize_claims(&claims).unwrap_err();
        assert!(matches!(err, SequenceError::Invalid { .. }));
    }

    #[test]
    fn validate_rejects_unknown_and_inadmissible() {
        let reg = registry();
        let unknown = reg
            .validate(&[ResourceClaim::exclusive(ResourceName::arm("r1"))])
            .unwrap_err();
        assert!(unknown.to_string().contains("unknown resource 'arm:r1'"));

        let shared_on_exclusive = reg
            .validate(&[ResourceClaim::shared(ResourceName::arm("b1"))])
            .unwrap_err();
        assert!(shared_on_exclusive.to_string().contains("does not admit"));

        assert!(reg
            .validate(&[ResourceClaim::shared(ResourceName::lamp("halogen"))])
            .is_ok());
    }

    #[test]
    fn from_config_rejects_duplicates() {
        let entries = vec![
            ResourceConfig {
                name: "fps".into(),
                class: SharingClass::Exclusive,
            },
            ResourceConfig {
                name: "fps".into(),
                class: SharingClass::Exclusive,
            },
        ];
        assert!(ResourceRegistry::from_config(&entries).is_err());
    }
}
