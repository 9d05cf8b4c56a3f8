use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::builtin;
use super::{Capability, CapabilityGroup};

/// Bumped whenever a builtin is added, removed or changes signature.
pub const REGISTRY_VERSION: u32 = 1;

/// Immutable name → capability table.
///
/// Built once through [`RegistryBuilder`] and shared by reference
/// (`Arc`) across every session; there is no way to mutate it after
/// `build()`.
pub struct CapabilityRegistry {
    entries: HashMap<String, Box<dyn Capability>>,
    /// Registration order, for stable listings
    order: Vec<String>,
    version: u32,
}

/// Listing entry for hosts and tooling.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityInfo {
    pub name: String,
    pub group: CapabilityGroup,
    pub signature: String,
    pub description: String,
}

impl CapabilityRegistry {
    /// The builtin table: navigation, aggregation, analysis, utility and
    /// core helpers.
    pub fn standard() -> Arc<Self> {
        RegistryBuilder::with_builtins().build()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Capability> {
        self.entries.get(name).map(|c| c.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn list(&self) -> Vec<CapabilityInfo> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|c| CapabilityInfo {
                name: c.name().to_string(),
                group: c.group(),
                signature: c.signature(),
                description: c.description().to_string(),
            })
            .collect()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, Box<dyn Capability>>,
    order: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        builtin::all()
            .into_iter()
            .fold(Self::new(), |builder, cap| builder.register(Box::new(cap)))
    }

    /// Adds a capability. A later registration under the same name
    /// replaces the earlier one.
    pub fn register(mut self, capability: Box<dyn Capability>) -> Self {
        let name = capability.name().to_string();
        if self.entries.insert(name.clone(), capability).is_some() {
            warn!("Capability '{name}' registered twice, keeping the latest");
        } else {
            self.order.push(name);
        }
        self
    }

    pub fn build(self) -> Arc<CapabilityRegistry> {
        debug!("Capability registry frozen with {} entries", self.entries.len());
        Arc::new(CapabilityRegistry {
            entries: self.entries,
            order: self.order,
            version: REGISTRY_VERSION,
        })
    }
}
