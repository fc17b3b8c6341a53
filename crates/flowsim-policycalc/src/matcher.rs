//! Rule compilation into three-valued predicates.
//!
//! A compiled rule is a conjunction of `FlowMatcher`s. Matchers that look
//! at one end of the flow wrap an `EndpointMatcher` together with the `Side`
//! they inspect. Data a flow record never carries (HTTP, domains, services)
//! always yields `Uncertain`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::warn;

use flowsim_contracts::{
    action::ActionFlags,
    config::PreviewConfig,
    flow::{EndpointType, Flow, FlowEndpointData, PROTO_ICMP, PROTO_ICMPV6},
    resource::{EntityRule, IcmpFields, Port, Rule, RuleAction},
};

use crate::match_type::MatchType;
use crate::namespace::{NamespaceHandler, NamespaceSelectorMatcher};
use crate::selector::{EndpointSelectorHandler, Selector, SelectorMatcher};

/// Which end of a flow a matcher inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Destination,
}

impl Side {
    pub fn endpoint(self, flow: &Flow) -> &FlowEndpointData {
        match self {
            Side::Source => &flow.source,
            Side::Destination => &flow.destination,
        }
    }
}

/// Per-flow evaluation state: selector results for each end and the policy
/// actions computed by the before pass.
///
/// One instance is owned by one flow evaluation and never shared.
#[derive(Debug, Default)]
pub struct FlowCache {
    source_selectors: Option<Vec<Option<bool>>>,
    destination_selectors: Option<Vec<Option<bool>>>,
    pub(crate) policies: HashMap<String, ActionFlags>,
}

impl FlowCache {
    /// Selector caches are only allocated for ends whose labels are known.
    pub fn new(flow: &Flow, selectors: &EndpointSelectorHandler) -> Self {
        Self {
            source_selectors: flow.source.labels.as_ref().map(|_| selectors.create_selector_cache()),
            destination_selectors: flow.destination.labels.as_ref().map(|_| selectors.create_selector_cache()),
            policies: HashMap::new(),
        }
    }

    fn selectors_mut(&mut self, side: Side) -> Option<&mut Vec<Option<bool>>> {
        match side {
            Side::Source => self.source_selectors.as_mut(),
            Side::Destination => self.destination_selectors.as_mut(),
        }
    }

    pub fn policy_actions(&self, flow_log_name: &str) -> Option<ActionFlags> {
        self.policies.get(flow_log_name).copied()
    }
}

/// A predicate over one end of a flow.
#[derive(Debug, Clone)]
pub enum EndpointMatcher {
    /// Every endpoint IP lies in one of the nets.
    Nets { nets: Vec<IpNet>, missing_ips: MatchType },
    /// No endpoint IP lies in any of the nets.
    NotNets { nets: Vec<IpNet>, missing_ips: MatchType },
    Ports(Vec<Port>),
    NotPorts(Vec<Port>),
    Selector(SelectorMatcher),
    NotSelector(SelectorMatcher),
    NamespaceName(String),
    NamespaceSelector(NamespaceSelectorMatcher),
    ServiceAccounts {
        names: Vec<String>,
        selector: Option<Selector>,
        namespaces: Arc<NamespaceHandler>,
    },
    /// Match criteria the flow record cannot answer.
    Unknowable,
}

impl EndpointMatcher {
    pub fn matches(&self, flow: &Flow, side: Side, cache: &mut FlowCache) -> MatchType {
        let ep = side.endpoint(flow);
        match self {
            EndpointMatcher::Nets { nets, missing_ips } => match ips_in_nets(ep, nets) {
                Some(r) => r,
                None if ep.is_calico_managed() => *missing_ips,
                None => MatchType::Uncertain,
            },
            EndpointMatcher::NotNets { nets, missing_ips } => match ips_in_nets(ep, nets) {
                // Any IP inside the nets is a definite non-match.
                Some(MatchType::True) | Some(MatchType::Uncertain) => MatchType::False,
                Some(MatchType::False) => MatchType::True,
                None if ep.is_calico_managed() => *missing_ips,
                None => MatchType::Uncertain,
            },
            EndpointMatcher::Ports(ports) => ports_match(flow, ep, ports),
            EndpointMatcher::NotPorts(ports) => ports_match(flow, ep, ports).negate(),
            EndpointMatcher::Selector(m) => selector_match(m, ep, side, cache),
            EndpointMatcher::NotSelector(m) => selector_match(m, ep, side, cache).negate(),
            EndpointMatcher::NamespaceName(ns) => MatchType::from_bool(&ep.namespace == ns),
            EndpointMatcher::NamespaceSelector(m) => m.matches(&ep.namespace),
            EndpointMatcher::ServiceAccounts { names, selector, namespaces } => {
                if ep.endpoint_type != EndpointType::Wep {
                    return MatchType::False;
                }
                let Some(sa) = &ep.service_account else {
                    return MatchType::Uncertain;
                };
                let mut result = MatchType::True;
                if !names.is_empty() {
                    result = result.and(MatchType::from_bool(names.contains(sa)));
                }
                if let Some(sel) = selector {
                    result = result.and(namespaces.service_account_selector_matches(sel, &ep.namespace, sa));
                }
                result
            }
            EndpointMatcher::Unknowable => MatchType::Uncertain,
        }
    }
}

/// `None` when the endpoint IPs are unknown. Mixed membership is uncertain.
fn ips_in_nets(ep: &FlowEndpointData, nets: &[IpNet]) -> Option<MatchType> {
    let ips = ep.ips.as_ref().filter(|ips| !ips.is_empty())?;
    let inside = ips.iter().filter(|ip| nets.iter().any(|n| n.contains(*ip))).count();
    Some(if inside == ips.len() {
        MatchType::True
    } else if inside == 0 {
        MatchType::False
    } else {
        MatchType::Uncertain
    })
}

fn ports_match(flow: &Flow, ep: &FlowEndpointData, ports: &[Port]) -> MatchType {
    MatchType::any(ports.iter().map(|p| port_match(flow, ep, p)))
}

fn port_match(flow: &Flow, ep: &FlowEndpointData, port: &Port) -> MatchType {
    let Some(actual) = ep.port else {
        return MatchType::Uncertain;
    };
    match port {
        Port::Range { min, max } => MatchType::from_bool((*min..=*max).contains(&actual)),
        Port::Named(name) => {
            let (Some(named_ports), Some(proto)) = (&ep.named_ports, flow.proto) else {
                return MatchType::Uncertain;
            };
            MatchType::from_bool(
                named_ports
                    .iter()
                    .any(|np| &np.name == name && np.protocol == proto && np.port == actual),
            )
        }
    }
}

fn selector_match(m: &SelectorMatcher, ep: &FlowEndpointData, side: Side, cache: &mut FlowCache) -> MatchType {
    if ep.endpoint_type == EndpointType::Net {
        return MatchType::False;
    }
    let Some(labels) = &ep.labels else {
        return MatchType::Uncertain;
    };
    let matched = match cache.selectors_mut(side) {
        Some(results) => m.evaluate_cached(labels, results),
        None => m.selector().evaluate(labels),
    };
    MatchType::from_bool(matched)
}

/// A predicate over the whole flow.
#[derive(Debug, Clone)]
pub enum FlowMatcher {
    Protocol(u8),
    NotProtocol(u8),
    IpVersion(u8),
    Icmp { fields: IcmpFields, negated: bool },
    /// HTTP match criteria, which flow records never carry.
    Http,
    Endpoint(Side, EndpointMatcher),
}

impl FlowMatcher {
    pub fn matches(&self, flow: &Flow, cache: &mut FlowCache) -> MatchType {
        match self {
            FlowMatcher::Protocol(p) => flow.proto.map_or(MatchType::Uncertain, |a| MatchType::from_bool(a == *p)),
            FlowMatcher::NotProtocol(p) => flow.proto.map_or(MatchType::Uncertain, |a| MatchType::from_bool(a != *p)),
            FlowMatcher::IpVersion(v) => flow.ip_version.map_or(MatchType::Uncertain, |a| MatchType::from_bool(a == *v)),
            FlowMatcher::Icmp { fields, negated } => {
                let Some(proto) = flow.proto else {
                    return MatchType::Uncertain;
                };
                let result = if proto != PROTO_ICMP && proto != PROTO_ICMPV6 {
                    MatchType::False
                } else if fields.icmp_type.is_some() || fields.code.is_some() {
                    // Type and code are not recorded.
                    MatchType::Uncertain
                } else {
                    MatchType::True
                };
                if *negated {
                    result.negate()
                } else {
                    result
                }
            }
            FlowMatcher::Http => MatchType::Uncertain,
            FlowMatcher::Endpoint(side, m) => m.matches(flow, *side, cache),
        }
    }
}

/// One rule: an action and the conjunction of its predicates.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub action: ActionFlags,
    pub matchers: Vec<FlowMatcher>,
}

impl CompiledRule {
    pub fn matches(&self, flow: &Flow, cache: &mut FlowCache) -> MatchType {
        let mut result = MatchType::True;
        for m in &self.matchers {
            result = result.and(m.matches(flow, cache));
            if result == MatchType::False {
                break;
            }
        }
        result
    }
}

/// Builds matchers for one configuration snapshot.
pub struct MatcherFactory<'a> {
    selectors: &'a mut EndpointSelectorHandler,
    namespaces: Arc<NamespaceHandler>,
    missing_ips: MatchType,
}

impl<'a> MatcherFactory<'a> {
    pub fn new(config: &PreviewConfig, namespaces: Arc<NamespaceHandler>, selectors: &'a mut EndpointSelectorHandler) -> Self {
        let missing_ips = if config.calico_endpoint_net_match_always {
            MatchType::Uncertain
        } else {
            MatchType::False
        };
        Self { selectors, namespaces, missing_ips }
    }

    /// Compile a rule. `Log` rules never decide anything and compile to
    /// `None`.
    pub fn compile_rule(&mut self, rule: &Rule, policy_namespace: &str) -> Option<CompiledRule> {
        let action = match rule.action {
            RuleAction::Allow => ActionFlags::ALLOW,
            RuleAction::Deny => ActionFlags::DENY,
            RuleAction::Pass => ActionFlags::PASS,
            RuleAction::Log => return None,
        };

        let mut matchers = Vec::new();
        if let Some(v) = rule.ip_version {
            matchers.push(FlowMatcher::IpVersion(v));
        }
        if let Some(p) = &rule.protocol {
            match p.number() {
                Some(n) => matchers.push(FlowMatcher::Protocol(n)),
                None => warn!(protocol = ?p, "omitting unknown protocol"),
            }
        }
        if let Some(p) = &rule.not_protocol {
            match p.number() {
                Some(n) => matchers.push(FlowMatcher::NotProtocol(n)),
                None => warn!(protocol = ?p, "omitting unknown protocol"),
            }
        }
        if let Some(fields) = &rule.icmp {
            matchers.push(FlowMatcher::Icmp { fields: fields.clone(), negated: false });
        }
        if let Some(fields) = &rule.not_icmp {
            matchers.push(FlowMatcher::Icmp { fields: fields.clone(), negated: true });
        }
        if rule.http.as_ref().is_some_and(|h| !h.methods.is_empty() || !h.paths.is_empty()) {
            matchers.push(FlowMatcher::Http);
        }
        self.compile_entity(Side::Source, &rule.source, policy_namespace, &mut matchers);
        self.compile_entity(Side::Destination, &rule.destination, policy_namespace, &mut matchers);

        Some(CompiledRule { action, matchers })
    }

    fn compile_entity(&mut self, side: Side, entity: &EntityRule, policy_namespace: &str, out: &mut Vec<FlowMatcher>) {
        let mut push = |m: EndpointMatcher| out.push(FlowMatcher::Endpoint(side, m));

        if !entity.nets.is_empty() {
            if let Some(nets) = parse_nets(&entity.nets) {
                push(EndpointMatcher::Nets { nets, missing_ips: self.missing_ips });
            }
        }
        if !entity.not_nets.is_empty() {
            if let Some(nets) = parse_nets(&entity.not_nets) {
                push(EndpointMatcher::NotNets { nets, missing_ips: self.missing_ips });
            }
        }
        if !entity.ports.is_empty() {
            push(EndpointMatcher::Ports(entity.ports.clone()));
        }
        if !entity.not_ports.is_empty() {
            push(EndpointMatcher::NotPorts(entity.not_ports.clone()));
        }

        let sa = entity.service_accounts.as_ref().filter(|sa| !sa.is_empty());
        let selects_endpoints = !entity.selector.is_empty() || !entity.not_selector.is_empty() || sa.is_some();

        if !entity.namespace_selector.is_empty() {
            if let Some(m) = self.namespace_selector(&entity.namespace_selector) {
                push(m);
            }
        } else if !policy_namespace.is_empty() && selects_endpoints {
            // Selectors in a namespaced policy are scoped to its namespace.
            push(EndpointMatcher::NamespaceName(policy_namespace.to_string()));
        }

        if !entity.selector.is_empty() {
            if let Some(m) = self.selector(&entity.selector) {
                push(EndpointMatcher::Selector(m));
            }
        }
        if !entity.not_selector.is_empty() {
            if let Some(m) = self.selector(&entity.not_selector) {
                push(EndpointMatcher::NotSelector(m));
            }
        }
        if let Some(sa) = sa {
            let selector = if sa.selector.is_empty() {
                None
            } else {
                match Selector::parse(&sa.selector) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(selector = %sa.selector, error = %e, "omitting unparsable service account selector");
                        None
                    }
                }
            };
            if !sa.names.is_empty() || selector.is_some() {
                push(EndpointMatcher::ServiceAccounts {
                    names: sa.names.clone(),
                    selector,
                    namespaces: Arc::clone(&self.namespaces),
                });
            }
        }

        if entity.services.is_some() || !entity.domains.is_empty() {
            push(EndpointMatcher::Unknowable);
        }
    }

    /// A registered endpoint selector, or `None` if it does not parse.
    pub fn selector(&mut self, selector: &str) -> Option<SelectorMatcher> {
        match self.selectors.get_selector_matcher(selector) {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(selector, error = %e, "omitting unparsable selector");
                None
            }
        }
    }

    pub fn namespace_selector(&self, selector: &str) -> Option<EndpointMatcher> {
        match self.namespaces.namespace_selector_matcher(selector) {
            Ok(m) => Some(EndpointMatcher::NamespaceSelector(m)),
            Err(e) => {
                warn!(selector, error = %e, "omitting unparsable namespace selector");
                None
            }
        }
    }

    pub fn service_account_selector(&self, selector: &str) -> Option<EndpointMatcher> {
        match Selector::parse(selector) {
            Ok(s) => Some(EndpointMatcher::ServiceAccounts {
                names: Vec::new(),
                selector: Some(s),
                namespaces: Arc::clone(&self.namespaces),
            }),
            Err(e) => {
                warn!(selector, error = %e, "omitting unparsable service account selector");
                None
            }
        }
    }
}

/// Parse CIDRs and bare addresses. Unparsable entries are dropped; `None`
/// if nothing usable remains.
fn parse_nets(nets: &[String]) -> Option<Vec<IpNet>> {
    let parsed: Vec<IpNet> = nets
        .iter()
        .filter_map(|n| {
            n.parse::<IpNet>()
                .or_else(|_| n.parse::<IpAddr>().map(IpNet::from))
                .map_err(|e| warn!(net = %n, error = %e, "omitting unparsable net"))
                .ok()
        })
        .collect();
    (!parsed.is_empty()).then_some(parsed)
}
