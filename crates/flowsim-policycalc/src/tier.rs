//! Tiered evaluation.
//!
//! Tiers are walked in order. Inside a tier the first enforced policy with
//! an exact rule match decides; `PASS` moves on to the next tier. An
//! enforced policy that selects the endpoint but matches no rule ends the
//! tier with an end-of-tier deny. Falling off the last tier hits the
//! profile: allow for workloads, deny for everything else.
//!
//! The before pass cross-checks each policy against the hits logged with
//! the flow and caches the outcome; the after pass reuses cached outcomes
//! for unmodified policies.

use std::sync::Arc;

use tracing::debug;

use flowsim_contracts::{
    action::ActionFlags,
    config::PreviewConfig,
    flow::{EndpointType, Flow, Reporter},
    impact::{Impact, ImpactedResources},
    policy_hit::{HitAction, PolicyHit},
    resource::ResourceData,
};
use flowsim_core::traits::EndpointResponse;

use crate::match_type::MatchType;
use crate::matcher::{FlowCache, MatcherFactory, Side};
use crate::namespace::NamespaceHandler;
use crate::policy::{compile_policy, CompiledPolicy};
use crate::selector::EndpointSelectorHandler;

pub const PROFILE_TIER: &str = "__PROFILE__";
pub const NO_MATCH_PROFILE: &str = "__PROFILE__.__NO_MATCH__";

fn namespace_profile(namespace: &str) -> String {
    format!("{PROFILE_TIER}.kns.{namespace}")
}

/// Compiled tiers for one direction, plus the policies the proposed change
/// touches.
#[derive(Debug, Clone, Default)]
pub struct CompiledTiersAndImpactedPolicies {
    pub tiers: CompiledTiers,
    /// (tier, policy) positions of impacted policies in `tiers`.
    impacted: Vec<(usize, usize)>,
}

impl CompiledTiersAndImpactedPolicies {
    pub fn impacted_policies(&self) -> impl Iterator<Item = &CompiledPolicy> {
        self.impacted.iter().map(|&(t, p)| &self.tiers.0[t].0[p])
    }

    pub fn flow_selected_by_impacted_policies(&self, flow: &Flow, cache: &mut FlowCache) -> bool {
        self.impacted_policies().any(|p| {
            debug!(policy = %p.flow_log_name, "checking impacted policy");
            p.applies(flow, cache) == MatchType::True
        })
    }

    /// Egress at the source for source-reported legs, ingress at the
    /// destination for destination-reported legs. Anything else, such as a
    /// leg whose reporting endpoint is not managed, is not included.
    pub fn calculate(&self, flow: &Flow, cache: &mut FlowCache, before: bool) -> EndpointResponse {
        match flow.reporter {
            Reporter::Source if flow.source.is_calico_managed() => {
                debug!("calculating egress action");
                self.tiers.calculate(flow, Side::Source, cache, before)
            }
            Reporter::Destination if flow.destination.is_calico_managed() => {
                debug!("calculating ingress action");
                self.tiers.calculate(flow, Side::Destination, cache, before)
            }
            _ => EndpointResponse::default(),
        }
    }
}

/// Compile one configuration snapshot into ingress and egress tiers.
///
/// When `changes_applied` is set this is the after snapshot: impacted
/// policies carry their impact and are always enforced.
pub fn compile_tiers(
    config: &PreviewConfig,
    data: &ResourceData,
    impacted: &ImpactedResources,
    selectors: &mut EndpointSelectorHandler,
    changes_applied: bool,
) -> (CompiledTiersAndImpactedPolicies, CompiledTiersAndImpactedPolicies) {
    debug!(
        namespaces = data.namespaces.len(),
        service_accounts = data.service_accounts.len(),
        changes_applied,
        "compiling tiers"
    );
    let namespaces = Arc::new(NamespaceHandler::new(&data.namespaces, &data.service_accounts));
    let mut factory = MatcherFactory::new(config, namespaces, selectors);

    let mut ingress = CompiledTiersAndImpactedPolicies::default();
    let mut egress = CompiledTiersAndImpactedPolicies::default();

    for tier in &data.tiers {
        let mut ingress_tier = Vec::new();
        let mut egress_tier = Vec::new();

        for policy in &tier.policies {
            let impact = impacted.impact(&policy.resource_id);
            let actual_impact = if changes_applied { impact.unwrap_or_default() } else { Impact::default() };
            let previewing = changes_applied && impact.is_some();

            let (ingress_pol, egress_pol) = compile_policy(&mut factory, policy, actual_impact, previewing);
            if let Some(p) = ingress_pol {
                if impact.is_some() {
                    debug!(policy = %p.flow_log_name, "impacted ingress policy");
                    ingress.impacted.push((ingress.tiers.0.len(), ingress_tier.len()));
                }
                ingress_tier.push(p);
            }
            if let Some(p) = egress_pol {
                if impact.is_some() {
                    debug!(policy = %p.flow_log_name, "impacted egress policy");
                    egress.impacted.push((egress.tiers.0.len(), egress_tier.len()));
                }
                egress_tier.push(p);
            }
        }

        if !ingress_tier.is_empty() {
            ingress.tiers.0.push(CompiledTier(ingress_tier));
        }
        if !egress_tier.is_empty() {
            egress.tiers.0.push(CompiledTier(egress_tier));
        }
    }

    (ingress, egress)
}

/// Ordered compiled tiers for one direction.
#[derive(Debug, Clone, Default)]
pub struct CompiledTiers(pub Vec<CompiledTier>);

impl CompiledTiers {
    /// Determine the action and policy path for the endpoint on `side`.
    pub fn calculate(&self, flow: &Flow, side: Side, cache: &mut FlowCache, before: bool) -> EndpointResponse {
        let mut response = EndpointResponse { include: true, ..Default::default() };
        let mut af = ActionFlags::empty();

        for tier in &self.0 {
            af |= if before {
                tier.action_before(flow, &mut response, cache)
            } else {
                tier.action_after(flow, &mut response, cache)
            };

            if af.is_indeterminate() {
                debug!("indeterminate action from tier, stopping");
                response.action = af;
                return response;
            }
            if !af.contains(ActionFlags::PASS) {
                response.action = af;
                return response;
            }
            af.remove(ActionFlags::PASS);
        }

        // ── End of tiers ─────────────────────────────────────────────────────
        let ep = side.endpoint(flow);
        let (name, mut flag) = if ep.endpoint_type == EndpointType::Wep {
            (namespace_profile(&ep.namespace), ActionFlags::ALLOW)
        } else {
            (NO_MATCH_PROFILE.to_string(), ActionFlags::DENY)
        };
        debug!(profile = %name, "hit end of tiers");

        if af.intersects(ActionFlags::VERIFIED) {
            if let Some(logged) = get_flags_from_flow_log(&name, flow) {
                flag |= if logged.intersects(flag) {
                    ActionFlags::MATCHES_MEASURED
                } else {
                    ActionFlags::CONFLICTS_WITH_MEASURED
                };
            }
        }

        add_policy_to_response(&mut response, PROFILE_TIER, "", &name, flag, true, &mut af);
        response.action = af;
        response
    }
}

/// The policies of one tier for one direction, in order.
#[derive(Debug, Clone, Default)]
pub struct CompiledTier(pub Vec<CompiledPolicy>);

impl CompiledTier {
    /// The tier's action against the original configuration, corroborated
    /// by the flow's logged hits.
    ///
    /// No-match results are held as unverified until a later policy's
    /// logged hit confirms the path through the tier. If the logs disagree
    /// with the calculation, every possible hit is reported instead.
    pub fn action_before(&self, flow: &Flow, r: &mut EndpointResponse, cache: &mut FlowCache) -> ActionFlags {
        let mut unverified: Vec<&CompiledPolicy> = Vec::new();
        let mut inconsistent = false;
        let mut last_enforced: Option<(&CompiledPolicy, ActionFlags)> = None;
        let mut combined = ActionFlags::empty();

        for p in &self.0 {
            if p.applies(flow, cache) != MatchType::True {
                continue;
            }

            let mut actions = p.action(flow, cache);
            if let Some(mut logged) = get_flags_from_flow_log(&p.flow_log_name, flow) {
                // A logged end-of-tier deny means this policy did not match.
                if logged == ActionFlags::END_OF_TIER_DENY
                    || (logged == ActionFlags::DENY
                        && !actions.contains(ActionFlags::DENY)
                        && actions.contains(ActionFlags::NO_MATCH))
                {
                    logged = ActionFlags::NO_MATCH;
                }

                if !logged.intersects(actions) {
                    debug!(policy = %p.flow_log_name, ?logged, ?actions, "logged action conflicts with calculated");
                    actions |= ActionFlags::CONFLICTS_WITH_MEASURED;
                } else if actions & ActionFlags::ALL_CALCULATED_POLICY_ACTIONS == logged {
                    actions |= ActionFlags::MATCHES_MEASURED;
                } else {
                    debug!(policy = %p.flow_log_name, "logged action resolves uncertainty");
                    actions = logged | ActionFlags::RESOLVED_FROM_MEASURED;
                }
            }

            cache.policies.insert(p.flow_log_name.clone(), actions);
            if p.enforced {
                last_enforced = Some((p, actions));
            }

            if inconsistent {
                add_policy(r, p, actions, p.enforced, &mut combined);
            } else if actions.intersects(ActionFlags::VERIFIED) {
                confirm_no_matches(&unverified, cache);
                unverified.clear();
                add_policy(r, p, actions, p.enforced, &mut combined);
            } else if actions.contains(ActionFlags::NO_MATCH) {
                unverified.push(p);
            } else {
                debug!(policy = %p.flow_log_name, "match not corroborated by logged hits");
                inconsistent = true;
                for n in unverified.drain(..) {
                    let cached = cache.policy_actions(&n.flow_log_name).unwrap_or_default();
                    add_policy(r, n, cached, n.enforced, &mut combined);
                }
                add_policy(r, p, actions, p.enforced, &mut combined);
            }

            if p.enforced && !actions.contains(ActionFlags::NO_MATCH) {
                break;
            }
        }

        let Some((last, last_actions)) = last_enforced else {
            // Only staged policies applied, so their no-matches stand.
            confirm_no_matches(&unverified, cache);
            return ActionFlags::PASS;
        };

        for n in &unverified {
            let cached = cache.policy_actions(&n.flow_log_name).unwrap_or_default();
            add_policy_to_response(r, &last.tier, &n.namespace, &n.calico_name, cached, n.enforced, &mut combined);
        }

        if last_actions.contains(ActionFlags::NO_MATCH) {
            let measured = cache.policy_actions(&last.flow_log_name).unwrap_or_default() & ActionFlags::MEASURED;
            add_policy(r, last, ActionFlags::END_OF_TIER_DENY | measured, true, &mut combined);
        }

        combined
    }

    /// The tier's action against the changed configuration. Unmodified
    /// policies reuse the before pass's cached outcome.
    pub fn action_after(&self, flow: &Flow, r: &mut EndpointResponse, cache: &mut FlowCache) -> ActionFlags {
        let mut last_enforced: Option<(&CompiledPolicy, ActionFlags)> = None;
        let mut combined = ActionFlags::empty();

        for p in &self.0 {
            if p.applies(flow, cache) != MatchType::True {
                continue;
            }

            let actions = match cache.policy_actions(&p.flow_log_name) {
                Some(cached) if !p.modified => cached,
                _ => p.action(flow, cache),
            };
            add_policy(r, p, actions, p.enforced, &mut combined);

            if p.enforced {
                last_enforced = Some((p, actions));
                if !actions.contains(ActionFlags::NO_MATCH) {
                    break;
                }
            }
        }

        let Some((last, last_actions)) = last_enforced else {
            return ActionFlags::PASS;
        };

        if last_actions.contains(ActionFlags::NO_MATCH) {
            let measured = if last.modified {
                ActionFlags::empty()
            } else {
                cache.policy_actions(&last.flow_log_name).unwrap_or_default() & ActionFlags::MEASURED
            };
            add_policy(r, last, ActionFlags::END_OF_TIER_DENY | measured, true, &mut combined);
        }

        combined
    }
}

fn confirm_no_matches(unverified: &[&CompiledPolicy], cache: &mut FlowCache) {
    for n in unverified {
        let confirmed = if cache.policy_actions(&n.flow_log_name) == Some(ActionFlags::NO_MATCH) {
            ActionFlags::NO_MATCH | ActionFlags::MATCHES_MEASURED
        } else {
            ActionFlags::NO_MATCH | ActionFlags::RESOLVED_FROM_MEASURED
        };
        debug!(policy = %n.flow_log_name, "confirming no match");
        cache.policies.insert(n.flow_log_name.clone(), confirmed);
    }
}

fn add_policy(r: &mut EndpointResponse, p: &CompiledPolicy, flags: ActionFlags, enforced: bool, combined: &mut ActionFlags) {
    add_policy_to_response(r, &p.tier, &p.namespace, &p.calico_name, flags, enforced, combined);
}

/// Append one hit per concrete action in `flags` and fold the flags into
/// `combined`. Only enforced policies contribute actions; every policy
/// contributes measurement bits.
pub fn add_policy_to_response(
    r: &mut EndpointResponse,
    tier: &str,
    namespace: &str,
    name: &str,
    flags: ActionFlags,
    enforced: bool,
    combined: &mut ActionFlags,
) {
    if !flags.intersects(ActionFlags::ALL_POLICY_ACTIONS) {
        return;
    }

    if combined.is_empty() {
        *combined |= flags & ActionFlags::MEASURED;
    }
    if enforced {
        *combined |= flags & ActionFlags::ALL_POLICY_ACTIONS;
    }

    if combined.contains(ActionFlags::CONFLICTS_WITH_MEASURED) {
        // Already conflicting; nothing can upgrade it.
    } else if flags.contains(ActionFlags::CONFLICTS_WITH_MEASURED) {
        combined.remove(ActionFlags::VERIFIED);
        combined.insert(ActionFlags::CONFLICTS_WITH_MEASURED);
    } else if !flags.intersects(ActionFlags::VERIFIED) {
        combined.remove(ActionFlags::VERIFIED);
    } else if flags.contains(ActionFlags::RESOLVED_FROM_MEASURED) && combined.contains(ActionFlags::MATCHES_MEASURED) {
        combined.remove(ActionFlags::VERIFIED);
        combined.insert(ActionFlags::RESOLVED_FROM_MEASURED);
    }

    // An enforced staged policy is previewed as enforced, so it is not
    // reported as staged.
    let staged = !enforced;

    // Hits for the same policy share a match index.
    let index = match r.policies.last() {
        Some(last) => {
            let same = last.tier == tier && last.namespace == namespace && last.name == name && last.staged == staged;
            if same {
                last.index
            } else {
                last.index + 1
            }
        }
        None => 0,
    };

    for action in flags.policy_actions() {
        if let Some(hit_action) = HitAction::from_flag(action) {
            r.policies.push(PolicyHit::new(hit_action, 0, index, staged, name, namespace, tier));
        }
    }
}

/// The action logged for `flow_log_name`, or `None` when the flow has no
/// hit for it or logged conflicting actions for it.
pub fn get_flags_from_flow_log(flow_log_name: &str, flow: &Flow) -> Option<ActionFlags> {
    let mut found: Option<HitAction> = None;
    for hit in flow.policies.iter().filter(|h| h.flow_log_name() == flow_log_name) {
        match found {
            Some(action) if action != hit.action => return None,
            _ => found = Some(hit.action),
        }
    }
    found.map(HitAction::flags)
}
