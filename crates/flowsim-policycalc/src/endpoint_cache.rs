//! Cached endpoint data used to fill gaps in stored flow records.
//!
//! Stored flows identify workloads by aggregated name (`pod-abc-*`), so
//! entries are keyed by namespace and aggregated name. The cache is fed by
//! an external synchronization source and only read by the calculator.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowsim_contracts::flow::NamedPort;

/// An endpoint as delivered by the synchronization feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointResource {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Set for pods created by a controller.
    #[serde(default)]
    pub generate_name: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub service_account: Option<String>,
    #[serde(default)]
    pub named_ports: Vec<NamedPort>,
}

impl EndpointResource {
    /// The name flows are aggregated under: the generate name followed by
    /// `*` for controller-managed pods, otherwise the name itself.
    pub fn aggregated_name(&self) -> String {
        match &self.generate_name {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}*"),
            _ => self.name.clone(),
        }
    }
}

/// The cached view of an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointData {
    pub labels: BTreeMap<String, String>,
    pub service_account: Option<String>,
    pub named_ports: Vec<NamedPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EndpointUpdate {
    Set(EndpointResource),
    Deleted { namespace: String, name: String, generate_name: Option<String> },
}

type EndpointKey = (String, String);

/// Endpoint data keyed by (namespace, aggregated name). Each aggregated
/// entry tracks its individual endpoints; lookups return the first by name.
#[derive(Debug, Default)]
pub struct EndpointCache {
    endpoints: RwLock<HashMap<EndpointKey, BTreeMap<String, EndpointData>>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, update: EndpointUpdate) {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        match update {
            EndpointUpdate::Set(res) => {
                let key = (res.namespace.clone(), res.aggregated_name());
                debug!(namespace = %key.0, name = %key.1, "caching endpoint");
                endpoints.entry(key).or_default().insert(
                    res.name,
                    EndpointData {
                        labels: res.labels,
                        service_account: res.service_account,
                        named_ports: res.named_ports,
                    },
                );
            }
            EndpointUpdate::Deleted { namespace, name, generate_name } => {
                let aggregated = EndpointResource {
                    namespace,
                    name,
                    generate_name,
                    ..Default::default()
                };
                let key = (aggregated.namespace.clone(), aggregated.aggregated_name());
                if let Some(group) = endpoints.get_mut(&key) {
                    group.remove(&aggregated.name);
                    if group.is_empty() {
                        endpoints.remove(&key);
                    }
                }
            }
        }
    }

    pub fn get(&self, namespace: &str, aggregated_name: &str) -> Option<EndpointData> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints
            .get(&(namespace.to_string(), aggregated_name.to_string()))
            .and_then(|group| group.values().next().cloned())
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
