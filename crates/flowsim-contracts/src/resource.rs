//! Policy resources and the configuration snapshot they are compiled from.
//!
//! Kubernetes network policies are carried already converted to the tiered
//! policy shape; their tiered name is `knp.default.<name>` in the `default`
//! tier.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FlowsimError, FlowsimResult};
use crate::flow::protocol_number;
use crate::policy_hit::flow_log_name;

pub const DEFAULT_TIER: &str = "default";
pub const KNP_NAME_PREFIX: &str = "knp.default.";

/// The resource kinds a policy preview understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    NetworkPolicy,
    GlobalNetworkPolicy,
    StagedNetworkPolicy,
    StagedGlobalNetworkPolicy,
    StagedKubernetesNetworkPolicy,
    KubernetesNetworkPolicy,
}

impl ResourceKind {
    pub fn is_staged(self) -> bool {
        matches!(
            self,
            ResourceKind::StagedNetworkPolicy
                | ResourceKind::StagedGlobalNetworkPolicy
                | ResourceKind::StagedKubernetesNetworkPolicy
        )
    }

    pub fn is_kubernetes(self) -> bool {
        matches!(
            self,
            ResourceKind::KubernetesNetworkPolicy | ResourceKind::StagedKubernetesNetworkPolicy
        )
    }

    /// The kind a staged resource replaces when it is enforced.
    pub fn enforced_kind(self) -> Option<ResourceKind> {
        match self {
            ResourceKind::StagedNetworkPolicy => Some(ResourceKind::NetworkPolicy),
            ResourceKind::StagedGlobalNetworkPolicy => Some(ResourceKind::GlobalNetworkPolicy),
            ResourceKind::StagedKubernetesNetworkPolicy => Some(ResourceKind::KubernetesNetworkPolicy),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Stable identity of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}({})", self.kind, self.name)
        } else {
            write!(f, "{}({}/{})", self.kind, self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyType {
    Ingress,
    Egress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    Allow,
    Deny,
    Pass,
    /// Logs and continues with the next rule.
    Log,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StagedAction {
    #[default]
    Set,
    Delete,
}

/// A protocol given by number or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Protocol {
    Number(u8),
    Name(String),
}

impl Protocol {
    pub fn number(&self) -> Option<u8> {
        match self {
            Protocol::Number(n) => Some(*n),
            Protocol::Name(name) => protocol_number(name),
        }
    }
}

/// A port range, or a named port resolved against the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PortRepr", into = "PortRepr")]
pub enum Port {
    Range { min: u16, max: u16 },
    Named(String),
}

impl Port {
    pub fn single(port: u16) -> Self {
        Port::Range { min: port, max: port }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Number(u16),
    Text(String),
}

impl TryFrom<PortRepr> for Port {
    type Error = String;

    fn try_from(repr: PortRepr) -> Result<Self, Self::Error> {
        let text = match repr {
            PortRepr::Number(p) => return Ok(Port::single(p)),
            PortRepr::Text(text) => text,
        };
        if let Some((lo, hi)) = text.split_once(':') {
            let min = lo.parse::<u16>().map_err(|e| format!("invalid port range '{text}': {e}"))?;
            let max = hi.parse::<u16>().map_err(|e| format!("invalid port range '{text}': {e}"))?;
            if min > max {
                return Err(format!("invalid port range '{text}': min > max"));
            }
            return Ok(Port::Range { min, max });
        }
        match text.parse::<u16>() {
            Ok(p) => Ok(Port::single(p)),
            Err(_) if !text.is_empty() => Ok(Port::Named(text)),
            Err(_) => Err("empty port".to_string()),
        }
    }
}

impl From<Port> for PortRepr {
    fn from(port: Port) -> Self {
        match port {
            Port::Range { min, max } if min == max => PortRepr::Number(min),
            Port::Range { min, max } => PortRepr::Text(format!("{min}:{max}")),
            Port::Named(name) => PortRepr::Text(name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IcmpFields {
    #[serde(rename = "type", default)]
    pub icmp_type: Option<u8>,
    #[serde(default)]
    pub code: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpMatch {
    pub methods: Vec<String>,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceAccountMatch {
    pub names: Vec<String>,
    pub selector: String,
}

impl ServiceAccountMatch {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.selector.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceMatch {
    pub name: String,
    pub namespace: String,
}

/// One side of a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityRule {
    /// CIDRs; unparsable entries are dropped when the rule is compiled.
    pub nets: Vec<String>,
    pub not_nets: Vec<String>,
    pub selector: String,
    pub not_selector: String,
    pub namespace_selector: String,
    pub ports: Vec<Port>,
    pub not_ports: Vec<Port>,
    pub service_accounts: Option<ServiceAccountMatch>,
    pub services: Option<ServiceMatch>,
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub action: RuleAction,
    #[serde(default)]
    pub ip_version: Option<u8>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub not_protocol: Option<Protocol>,
    #[serde(default)]
    pub icmp: Option<IcmpFields>,
    #[serde(default)]
    pub not_icmp: Option<IcmpFields>,
    #[serde(default)]
    pub source: EntityRule,
    #[serde(default)]
    pub destination: EntityRule,
    #[serde(default)]
    pub http: Option<HttpMatch>,
}

impl Rule {
    /// A rule with the given action and no match criteria.
    pub fn with_action(action: RuleAction) -> Self {
        Self {
            action,
            ip_version: None,
            protocol: None,
            not_protocol: None,
            icmp: None,
            not_icmp: None,
            source: EntityRule::default(),
            destination: EntityRule::default(),
            http: None,
        }
    }
}

fn default_tier() -> String {
    DEFAULT_TIER.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default)]
    pub order: Option<f64>,
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub namespace_selector: String,
    #[serde(default)]
    pub service_account_selector: String,
    /// Empty means ingress, plus egress when egress rules exist.
    #[serde(default)]
    pub types: Vec<PolicyType>,
    #[serde(default)]
    pub ingress: Vec<Rule>,
    #[serde(default)]
    pub egress: Vec<Rule>,
    #[serde(default)]
    pub staged_action: StagedAction,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            tier: default_tier(),
            order: None,
            selector: String::new(),
            namespace_selector: String::new(),
            service_account_selector: String::new(),
            types: Vec::new(),
            ingress: Vec::new(),
            egress: Vec::new(),
            staged_action: StagedAction::Set,
        }
    }
}

impl PolicySpec {
    /// The directions this policy applies to.
    pub fn effective_types(&self) -> Vec<PolicyType> {
        if !self.types.is_empty() {
            return self.types.clone();
        }
        let mut types = vec![PolicyType::Ingress];
        if !self.egress.is_empty() {
            types.push(PolicyType::Egress);
        }
        types
    }
}

/// A policy resource of any supported kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResource {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub spec: PolicySpec,
}

impl PolicyResource {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind, self.namespace.clone(), self.name.clone())
    }

    /// The tiered policy name used in flow logs.
    pub fn calico_name(&self) -> String {
        if self.kind.is_kubernetes() {
            format!("{KNP_NAME_PREFIX}{}", self.name)
        } else {
            self.name.clone()
        }
    }

    pub fn tier(&self) -> &str {
        if self.kind.is_kubernetes() {
            DEFAULT_TIER
        } else {
            &self.spec.tier
        }
    }

    /// The enforced resource that this staged resource stands in for.
    pub fn enforced_counterpart(&self) -> Option<PolicyResource> {
        let kind = self.kind.enforced_kind()?;
        let mut spec = self.spec.clone();
        spec.staged_action = StagedAction::Set;
        Some(PolicyResource {
            kind,
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            spec,
        })
    }
}

/// A policy placed in a tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub resource: PolicyResource,
    pub resource_id: ResourceId,
    #[serde(default)]
    pub staged: bool,
}

impl Policy {
    pub fn new(resource: PolicyResource) -> Self {
        let resource_id = resource.id();
        let staged = resource.kind.is_staged();
        Self {
            resource,
            resource_id,
            staged,
        }
    }

    /// The name that correlates this policy with logged policy hits.
    pub fn flow_log_name(&self) -> String {
        flow_log_name(&self.resource.namespace, &self.resource.calico_name(), self.staged)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    #[serde(default)]
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// One consistent configuration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    #[serde(default)]
    pub tiers: Vec<Tier>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccount>,
}

impl ResourceData {
    pub fn find(&self, id: &ResourceId) -> Option<&Policy> {
        self.tiers
            .iter()
            .flat_map(|t| t.policies.iter())
            .find(|p| &p.resource_id == id)
    }
}

/// The action of a proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn parse(action: &str) -> FlowsimResult<Self> {
        match action {
            "create" => Ok(ChangeAction::Create),
            "update" => Ok(ChangeAction::Update),
            "delete" => Ok(ChangeAction::Delete),
            other => Err(FlowsimError::InvalidChange {
                reason: format!("invalid action in preview request: {other}"),
            }),
        }
    }
}

/// A proposed change to one policy resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub action: String,
    pub resource: PolicyResource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_parse_from_numbers_ranges_and_names() {
        let ports: Vec<Port> = serde_json::from_str(r#"[80, "8080:8090", "http", "443"]"#).unwrap();
        assert_eq!(
            ports,
            vec![
                Port::single(80),
                Port::Range { min: 8080, max: 8090 },
                Port::Named("http".to_string()),
                Port::single(443),
            ]
        );
        assert!(serde_json::from_str::<Port>(r#""90:80""#).is_err());
    }

    #[test]
    fn kubernetes_policies_use_default_tier_name() {
        let knp = PolicyResource {
            kind: ResourceKind::KubernetesNetworkPolicy,
            name: "x".to_string(),
            namespace: "ns2".to_string(),
            spec: PolicySpec { tier: "ignored".to_string(), ..Default::default() },
        };
        assert_eq!(knp.calico_name(), "knp.default.x");
        assert_eq!(knp.tier(), "default");
        assert_eq!(Policy::new(knp).flow_log_name(), "ns2/knp.default.x");
    }

    #[test]
    fn staged_policy_names_and_counterparts() {
        let staged = PolicyResource {
            kind: ResourceKind::StagedNetworkPolicy,
            name: "tier1.np".to_string(),
            namespace: "ns1".to_string(),
            spec: PolicySpec { tier: "tier1".to_string(), ..Default::default() },
        };
        let policy = Policy::new(staged.clone());
        assert!(policy.staged);
        assert_eq!(policy.flow_log_name(), "ns1/tier1.staged:np");

        let enforced = staged.enforced_counterpart().unwrap();
        assert_eq!(enforced.id(), ResourceId::new(ResourceKind::NetworkPolicy, "ns1", "tier1.np"));
    }

    #[test]
    fn policy_types_default_from_rules() {
        let mut spec = PolicySpec::default();
        assert_eq!(spec.effective_types(), vec![PolicyType::Ingress]);
        spec.egress.push(Rule::with_action(RuleAction::Allow));
        assert_eq!(spec.effective_types(), vec![PolicyType::Ingress, PolicyType::Egress]);
        spec.types = vec![PolicyType::Egress];
        assert_eq!(spec.effective_types(), vec![PolicyType::Egress]);
    }
}
