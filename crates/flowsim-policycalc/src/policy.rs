//! Compiled policies.

use tracing::debug;

use flowsim_contracts::{
    action::ActionFlags,
    flow::Flow,
    impact::Impact,
    resource::{Policy, PolicyType, Rule},
};

use crate::match_type::MatchType;
use crate::matcher::{CompiledRule, EndpointMatcher, FlowCache, MatcherFactory, Side};

/// A policy compiled for one direction.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub tier: String,
    /// Empty for global policies.
    pub namespace: String,
    /// Tiered policy name, without namespace or staged marker.
    pub calico_name: String,
    /// The name correlating this policy with logged hits and cached actions.
    pub flow_log_name: String,
    /// The endpoint the policy is applied to: source for egress,
    /// destination for ingress.
    pub side: Side,
    pub enforced: bool,
    pub modified: bool,
    pub selectors: Vec<EndpointMatcher>,
    pub rules: Vec<CompiledRule>,
}

impl CompiledPolicy {
    /// Whether the policy selects the endpoint it is applied to.
    pub fn applies(&self, flow: &Flow, cache: &mut FlowCache) -> MatchType {
        let mut result = MatchType::True;
        for m in &self.selectors {
            result = result.and(m.matches(flow, self.side, cache));
            if result == MatchType::False {
                break;
            }
        }
        result
    }

    /// Evaluate the rules. The first exact match decides; uncertain matches
    /// add their action as a possibility. Without an exact match the result
    /// includes `NO_MATCH`.
    pub fn action(&self, flow: &Flow, cache: &mut FlowCache) -> ActionFlags {
        let mut actions = ActionFlags::empty();
        for rule in &self.rules {
            match rule.matches(flow, cache) {
                MatchType::True => return actions | rule.action,
                MatchType::Uncertain => actions |= rule.action,
                MatchType::False => {}
            }
        }
        actions | ActionFlags::NO_MATCH
    }
}

/// Compile `policy` into its ingress and egress forms, as its types
/// require.
///
/// `previewing` enforces a policy whose change is being previewed, which is
/// how a staged policy is evaluated as if it were enforced.
pub fn compile_policy(
    factory: &mut MatcherFactory<'_>,
    policy: &Policy,
    impact: Impact,
    previewing: bool,
) -> (Option<CompiledPolicy>, Option<CompiledPolicy>) {
    let res = &policy.resource;
    let spec = &res.spec;
    let namespace = res.namespace.clone();
    let enforced = previewing || !policy.staged;

    debug!(
        policy = %policy.resource_id,
        enforced,
        modified = impact.modified,
        "compiling policy"
    );

    // Endpoint selection is shared by both directions; each direction gets
    // its own copy bound to the endpoint it protects.
    let mut selectors = Vec::new();
    if !spec.selector.trim().is_empty() {
        if let Some(m) = factory.selector(&spec.selector) {
            selectors.push(EndpointMatcher::Selector(m));
        }
    }
    if !namespace.is_empty() {
        selectors.push(EndpointMatcher::NamespaceName(namespace.clone()));
    } else if !spec.namespace_selector.trim().is_empty() {
        if let Some(m) = factory.namespace_selector(&spec.namespace_selector) {
            selectors.push(m);
        }
    }
    if !spec.service_account_selector.trim().is_empty() {
        if let Some(m) = factory.service_account_selector(&spec.service_account_selector) {
            selectors.push(m);
        }
    }

    let types = spec.effective_types();
    let mut build = |side: Side, rules: &[Rule]| CompiledPolicy {
        tier: res.tier().to_string(),
        namespace: namespace.clone(),
        calico_name: res.calico_name(),
        flow_log_name: policy.flow_log_name(),
        side,
        enforced,
        modified: impact.modified,
        selectors: selectors.clone(),
        rules: rules.iter().filter_map(|r| factory.compile_rule(r, &namespace)).collect(),
    };

    let ingress = types
        .contains(&PolicyType::Ingress)
        .then(|| build(Side::Destination, &spec.ingress));
    let egress = types
        .contains(&PolicyType::Egress)
        .then(|| build(Side::Source, &spec.egress));
    (ingress, egress)
}
