//! The before/after policy calculator.
//!
//! Construction compiles both configuration snapshots once. Per flow the
//! calculator:
//!
//! 1. Fills missing endpoint data on managed endpoints from the endpoint cache.
//! 2. Skips flows no impacted policy selects, returning the logged outcome.
//! 3. Recalculates the before outcome and keeps it when it agrees with the
//!    logged action and hits, otherwise falls back to the logged data unless
//!    configured to always recalculate.
//! 4. Calculates the after outcome, reusing cached results for unmodified
//!    policies.

use std::sync::Arc;

use tracing::debug;

use flowsim_contracts::{
    action::ActionFlags,
    config::PreviewConfig,
    flow::{Flow, FlowEndpointData},
    impact::ImpactedResources,
    policy_hit::{compare_policy_hits, flow_log_strings},
    resource::ResourceData,
};
use flowsim_core::traits::{BeforeAfter, EndpointResponse, PolicyCalculator};

use crate::endpoint_cache::EndpointCache;
use crate::hits::{policy_hits_equal_ignoring_order_duplicates_and_staged, policy_hits_equal_ignoring_staged};
use crate::matcher::FlowCache;
use crate::selector::EndpointSelectorHandler;
use crate::tier::{compile_tiers, CompiledTiersAndImpactedPolicies};

/// Before and after compiled tiers for one direction.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub before: CompiledTiersAndImpactedPolicies,
    pub after: CompiledTiersAndImpactedPolicies,
}

impl ChangeSet {
    /// Whether an impacted policy selects the flow in either snapshot.
    pub fn flow_selected_by_impacted_policies(&self, flow: &Flow, cache: &mut FlowCache) -> bool {
        self.before.flow_selected_by_impacted_policies(flow, cache)
            || self.after.flow_selected_by_impacted_policies(flow, cache)
    }
}

/// `PolicyCalculator` over compiled tiered policies.
#[derive(Debug)]
pub struct FlowPolicyCalculator {
    config: PreviewConfig,
    // Shared by both snapshots; endpoint labels do not change between them.
    selectors: EndpointSelectorHandler,
    endpoints: Arc<EndpointCache>,
    ingress: ChangeSet,
    egress: ChangeSet,
}

impl FlowPolicyCalculator {
    pub fn new(
        config: PreviewConfig,
        endpoints: Arc<EndpointCache>,
        before: &ResourceData,
        after: &ResourceData,
        impacted: &ImpactedResources,
    ) -> Self {
        let mut selectors = EndpointSelectorHandler::new();
        let (ingress_before, egress_before) = compile_tiers(&config, before, impacted, &mut selectors, false);
        let (ingress_after, egress_after) = compile_tiers(&config, after, impacted, &mut selectors, true);
        debug!(selectors = selectors.len(), impacted = impacted.len(), "policy calculator ready");

        Self {
            config,
            selectors,
            endpoints,
            ingress: ChangeSet { before: ingress_before, after: ingress_after },
            egress: ChangeSet { before: egress_before, after: egress_after },
        }
    }

    fn calculate_before_after(
        &self,
        flow: &Flow,
        changeset: &ChangeSet,
        is_src: bool,
        before_src_action: ActionFlags,
        after_src_action: ActionFlags,
    ) -> BeforeAfter {
        let span = tracing::debug_span!(
            "calculate",
            reporter = flow.reporter.as_str(),
            source_namespace = %flow.source.namespace,
            source_name = %flow.source.name,
            dest_namespace = %flow.destination.namespace,
            dest_name = %flow.destination.name,
            before_src_action = ?before_src_action,
            after_src_action = ?after_src_action,
        );
        let _enter = span.enter();

        let mut flow = flow.clone();
        self.augment_endpoint(&mut flow.source);
        self.augment_endpoint(&mut flow.destination);
        let mut cache = FlowCache::new(&flow, &self.selectors);

        let calc_before = is_src || before_src_action.contains(ActionFlags::ALLOW);
        let calc_after = is_src || after_src_action.contains(ActionFlags::ALLOW);

        // A leg with no logged action was synthesized from a source action
        // change and has nothing to fall back to.
        if !flow.action.is_empty() && !changeset.flow_selected_by_impacted_policies(&flow, &mut cache) {
            debug!("flow unaffected");
            return BeforeAfter {
                modified: before_src_action != after_src_action,
                before: if calc_before { unchanged_response(&flow) } else { EndpointResponse::default() },
                after: if calc_after { unchanged_response(&flow) } else { EndpointResponse::default() },
            };
        }

        let mut before = EndpointResponse::default();
        let mut calculated_before = EndpointResponse::default();
        let mut using_calculated_before = false;
        if calc_before {
            // Always calculated: it fills the cache the after pass reads.
            calculated_before = changeset.before.calculate(&flow, &mut cache, true);

            let actions_agree =
                calculated_before.action.actual_flow_action() == flow.action.actual_flow_action();
            let policies_agree = flow.policies.is_empty()
                || policy_hits_equal_ignoring_order_duplicates_and_staged(&flow.policies, &calculated_before.policies);

            if actions_agree && policies_agree {
                debug!("calculated before matches logged flow");
                before = calculated_before.clone();
                using_calculated_before = true;
            } else if !self.config.calculate_original_action {
                debug!("using logged flow data for before response");
                before = unchanged_response(&flow);
                before.policies.sort_by(compare_policy_hits);
            } else {
                debug!("calculated before disagrees with logged flow, keeping calculation");
                before = calculated_before.clone();
                using_calculated_before = true;
            }
        }

        let after = if calc_after {
            changeset.after.calculate(&flow, &mut cache, false)
        } else {
            EndpointResponse::default()
        };

        let modified = before.include != after.include
            || before.action.actual_flow_action() != after.action.actual_flow_action()
            || !policy_hits_equal_ignoring_staged(&before.policies, &after.policies);

        if modified {
            debug!(
                source = %format!("{}/{}", flow.source.namespace, flow.source.name),
                destination = %format!("{}/{}", flow.destination.namespace, flow.destination.name),
                before_included = before.include,
                before_actions = ?before.action.action_strings(),
                before_policies = ?flow_log_strings(&before.policies),
                calculated_before_policies = ?(!using_calculated_before && calculated_before.include)
                    .then(|| flow_log_strings(&calculated_before.policies)),
                after_included = after.include,
                after_actions = ?after.action.action_strings(),
                after_policies = ?flow_log_strings(&after.policies),
                "impacted flow"
            );
        }

        BeforeAfter { modified, before, after }
    }

    fn augment_endpoint(&self, ep: &mut FlowEndpointData) {
        if !ep.is_calico_managed() {
            return;
        }
        let Some(cached) = self.endpoints.get(&ep.namespace, &ep.name) else {
            return;
        };
        debug!(namespace = %ep.namespace, name = %ep.name, "augmenting endpoint from cache");

        if ep.service_account.is_none() {
            ep.service_account = cached.service_account;
        }
        // An empty cached list says nothing about named ports; leave them unknown.
        if ep.named_ports.is_none() && !cached.named_ports.is_empty() {
            ep.named_ports = Some(cached.named_ports);
        }
        if ep.labels.as_ref().map_or(true, |l| l.is_empty()) {
            ep.labels = Some(cached.labels);
        }
    }
}

impl PolicyCalculator for FlowPolicyCalculator {
    fn calculate_source(&self, flow: &Flow) -> BeforeAfter {
        self.calculate_before_after(flow, &self.egress, true, ActionFlags::empty(), ActionFlags::empty())
    }

    fn calculate_dest(&self, flow: &Flow, source_action_before: ActionFlags, source_action_after: ActionFlags) -> BeforeAfter {
        self.calculate_before_after(flow, &self.ingress, false, source_action_before, source_action_after)
    }
}

/// The logged outcome of `flow`, without staged hits.
fn unchanged_response(flow: &Flow) -> EndpointResponse {
    EndpointResponse {
        include: true,
        action: flow.action,
        policies: flow.policies.iter().filter(|p| !p.staged).cloned().collect(),
    }
}
