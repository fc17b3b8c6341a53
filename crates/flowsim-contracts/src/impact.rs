//! The set of resources touched by a proposed change.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resource::{ResourceId, ResourceKind, KNP_NAME_PREFIX};

/// How a proposed change touches one resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Impact {
    pub deleted: bool,
    /// Logged hits for a modified policy cannot be trusted in the after pass.
    pub modified: bool,
}

/// Impacted resources, keyed by resource identity.
///
/// Previewing a staged policy also enforces it, so staged resources in this
/// set are compiled as enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpactedResources {
    impacts: HashMap<ResourceId, Impact>,
}

impl ImpactedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an impact. A Kubernetes network policy is also recorded under
    /// its converted network-policy identity.
    pub fn add(&mut self, id: ResourceId, impact: Impact) {
        if id.kind == ResourceKind::KubernetesNetworkPolicy {
            let converted = ResourceId::new(
                ResourceKind::NetworkPolicy,
                id.namespace.clone(),
                format!("{KNP_NAME_PREFIX}{}", id.name),
            );
            self.impacts.insert(converted, impact);
        }
        self.impacts.insert(id, impact);
    }

    pub fn impact(&self, id: &ResourceId) -> Option<Impact> {
        self.impacts.get(id).copied()
    }

    pub fn is_modified(&self, id: &ResourceId) -> bool {
        self.impacts.get(id).is_some_and(|i| i.modified)
    }

    pub fn is_deleted(&self, id: &ResourceId) -> bool {
        self.impacts.get(id).is_some_and(|i| i.deleted)
    }

    pub fn len(&self) -> usize {
        self.impacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.impacts.is_empty()
    }
}
