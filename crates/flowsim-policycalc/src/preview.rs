//! Applying proposed policy changes to a configuration snapshot.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use flowsim_contracts::{
    error::{FlowsimError, FlowsimResult},
    impact::{Impact, ImpactedResources},
    resource::{ChangeAction, Policy, PolicyResource, ResourceChange, ResourceData, ResourceId, StagedAction, Tier, DEFAULT_TIER},
};

/// Apply `changes` in order on top of `data`, returning the changed snapshot
/// and the resources the changes touch.
///
/// Creating or updating a staged policy previews it as enforced, so its
/// enforced counterpart is removed from the snapshot. A staged delete only
/// removes the counterpart.
pub fn apply_policy_changes(
    data: &ResourceData,
    changes: &[ResourceChange],
) -> FlowsimResult<(ResourceData, ImpactedResources)> {
    let mut after = data.clone();
    let mut impacted = ImpactedResources::new();

    for change in changes {
        let action = ChangeAction::parse(&change.action)?;
        let resource = &change.resource;
        let id = resource.id();
        debug!(resource = %id, ?action, "applying resource change");

        let staged = resource.kind.is_staged();
        let enforced = resource.enforced_counterpart();

        let modified = match after.find(&id) {
            Some(existing) => is_resource_modified(&existing.resource, resource)?,
            None => true,
        };

        match action {
            ChangeAction::Create | ChangeAction::Update => {
                if staged && resource.spec.staged_action == StagedAction::Delete {
                    info!(resource = %id, "staged delete");
                } else {
                    debug!(resource = %id, modified, "upserting resource");
                    impacted.add(id.clone(), Impact { modified, deleted: false });
                    upsert_policy(&mut after, resource)?;
                }

                if let Some(enforced) = enforced {
                    let enforced_id = enforced.id();
                    debug!(resource = %enforced_id, "removing enforced counterpart");
                    remove_policy(&mut after, &enforced_id);
                    impacted.add(enforced_id, Impact { modified: false, deleted: true });
                }
            }
            ChangeAction::Delete => {
                debug!(resource = %id, "deleting resource");
                impacted.add(id.clone(), Impact { modified: false, deleted: true });
                remove_policy(&mut after, &id);
            }
        }
    }

    Ok((after, impacted))
}

/// Whether `after` differs from `before` in a way that changes what the
/// policy matches. Order is ignored: it moves the policy but does not change
/// its matches, so logged hits for it stay usable.
pub fn is_resource_modified(before: &PolicyResource, after: &PolicyResource) -> FlowsimResult<bool> {
    if before.kind != after.kind {
        warn!(before = %before.kind, after = %after.kind, "resource kinds do not match");
        return Err(FlowsimError::ResourceMismatch {
            before: before.kind.to_string(),
            after: after.kind.to_string(),
        });
    }

    let mut b = before.spec.clone();
    let mut a = after.spec.clone();
    b.order = None;
    a.order = None;
    Ok(b != a)
}

fn remove_policy(data: &mut ResourceData, id: &ResourceId) {
    for tier in &mut data.tiers {
        tier.policies.retain(|p| &p.resource_id != id);
    }
}

/// Replace or insert `resource` in its tier, keeping the tier ordered.
fn upsert_policy(data: &mut ResourceData, resource: &PolicyResource) -> FlowsimResult<()> {
    let id = resource.id();
    remove_policy(data, &id);

    let tier_name = resource.tier();
    let tier = match data.tiers.iter().position(|t| t.name == tier_name) {
        Some(idx) => &mut data.tiers[idx],
        None if tier_name == DEFAULT_TIER => {
            data.tiers.push(Tier { name: DEFAULT_TIER.to_string(), policies: Vec::new() });
            let last = data.tiers.len() - 1;
            &mut data.tiers[last]
        }
        None => {
            return Err(FlowsimError::InvalidChange {
                reason: format!("invalid resource in preview request: {id}: tier '{tier_name}' does not exist"),
            })
        }
    };

    let policy = Policy::new(resource.clone());
    let pos = tier
        .policies
        .iter()
        .position(|p| policy_order(&policy, p) == Ordering::Less)
        .unwrap_or(tier.policies.len());
    tier.policies.insert(pos, policy);
    Ok(())
}

/// Lower order first; policies without an order come last; ties by name.
fn policy_order(a: &Policy, b: &Policy) -> Ordering {
    let by_order = match (a.resource.spec.order, b.resource.spec.order) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_order.then_with(|| a.resource.calico_name().cmp(&b.resource.calico_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsim_contracts::resource::{PolicySpec, ResourceKind};

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn np(kind: ResourceKind, name: &str, tier: &str, order: Option<f64>) -> PolicyResource {
        PolicyResource {
            kind,
            name: name.to_string(),
            namespace: if matches!(kind, ResourceKind::GlobalNetworkPolicy | ResourceKind::StagedGlobalNetworkPolicy) {
                String::new()
            } else {
                "ns1".to_string()
            },
            spec: PolicySpec {
                tier: tier.to_string(),
                order,
                selector: "all()".to_string(),
                ..Default::default()
            },
        }
    }

    fn data(policies: Vec<PolicyResource>) -> ResourceData {
        ResourceData {
            tiers: vec![
                Tier { name: "tier1".to_string(), policies: policies.into_iter().map(Policy::new).collect() },
                Tier { name: DEFAULT_TIER.to_string(), policies: Vec::new() },
            ],
            ..Default::default()
        }
    }

    fn change(action: &str, resource: PolicyResource) -> ResourceChange {
        ResourceChange { action: action.to_string(), resource }
    }

    fn names(data: &ResourceData, tier: usize) -> Vec<String> {
        data.tiers[tier].policies.iter().map(|p| p.resource.name.clone()).collect()
    }

    // ── 1. Create, update and delete ─────────────────────────────────────────

    #[test]
    fn create_inserts_by_order_then_name() {
        let before = data(vec![
            np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(10.0)),
            np(ResourceKind::NetworkPolicy, "tier1.z", "tier1", None),
        ]);
        let changes = [
            change("create", np(ResourceKind::NetworkPolicy, "tier1.c", "tier1", Some(10.0))),
            change("create", np(ResourceKind::NetworkPolicy, "tier1.b", "tier1", Some(5.0))),
            change("create", np(ResourceKind::NetworkPolicy, "tier1.y", "tier1", None)),
        ];
        let (after, impacted) = apply_policy_changes(&before, &changes).unwrap();

        assert_eq!(names(&after, 0), vec!["tier1.b", "tier1.a", "tier1.c", "tier1.y", "tier1.z"]);
        let id = ResourceId::new(ResourceKind::NetworkPolicy, "ns1", "tier1.c");
        assert_eq!(impacted.impact(&id), Some(Impact { modified: true, deleted: false }));
        // The input snapshot is untouched.
        assert_eq!(names(&before, 0), vec!["tier1.a", "tier1.z"]);
    }

    #[test]
    fn order_only_update_is_not_modified() {
        let before = data(vec![np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(10.0))]);
        let (_, impacted) =
            apply_policy_changes(&before, &[change("update", np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(1.0)))])
                .unwrap();
        let id = ResourceId::new(ResourceKind::NetworkPolicy, "ns1", "tier1.a");
        assert!(!impacted.is_modified(&id));
        assert!(!impacted.is_deleted(&id));

        let mut changed = np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(10.0));
        changed.spec.selector = "app == 'web'".to_string();
        let (_, impacted) = apply_policy_changes(&before, &[change("update", changed)]).unwrap();
        assert!(impacted.is_modified(&id));
    }

    #[test]
    fn delete_removes_policy() {
        let before = data(vec![np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(10.0))]);
        let res = np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(10.0));
        let (after, impacted) = apply_policy_changes(&before, &[change("delete", res.clone())]).unwrap();
        assert!(after.tiers[0].policies.is_empty());
        assert!(impacted.is_deleted(&res.id()));
    }

    // ── 2. Staged policies ───────────────────────────────────────────────────

    #[test]
    fn staged_create_replaces_enforced_counterpart() {
        let before = data(vec![np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(10.0))]);
        let staged = np(ResourceKind::StagedNetworkPolicy, "tier1.a", "tier1", Some(10.0));
        let (after, impacted) = apply_policy_changes(&before, &[change("create", staged.clone())]).unwrap();

        assert_eq!(after.tiers[0].policies.len(), 1);
        assert!(after.tiers[0].policies[0].staged);
        assert_eq!(impacted.impact(&staged.id()), Some(Impact { modified: true, deleted: false }));
        let enforced = ResourceId::new(ResourceKind::NetworkPolicy, "ns1", "tier1.a");
        assert!(impacted.is_deleted(&enforced));
    }

    #[test]
    fn staged_delete_only_removes_enforced_counterpart() {
        let before = data(vec![np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", Some(10.0))]);
        let mut staged = np(ResourceKind::StagedNetworkPolicy, "tier1.a", "tier1", Some(10.0));
        staged.spec.staged_action = StagedAction::Delete;
        let (after, impacted) = apply_policy_changes(&before, &[change("create", staged.clone())]).unwrap();

        assert!(after.tiers[0].policies.is_empty());
        assert_eq!(impacted.impact(&staged.id()), None);
        assert_eq!(impacted.len(), 1);
    }

    // ── 3. Errors ────────────────────────────────────────────────────────────

    #[test]
    fn invalid_action_is_rejected() {
        let before = data(Vec::new());
        let res = np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", None);
        assert!(matches!(
            apply_policy_changes(&before, &[change("patch", res)]),
            Err(FlowsimError::InvalidChange { .. })
        ));
    }

    #[test]
    fn unknown_tier_is_rejected_except_default() {
        let before = ResourceData::default();
        let res = np(ResourceKind::NetworkPolicy, "tier9.a", "tier9", None);
        assert!(matches!(
            apply_policy_changes(&before, &[change("create", res)]),
            Err(FlowsimError::InvalidChange { .. })
        ));

        let res = np(ResourceKind::NetworkPolicy, "default.a", DEFAULT_TIER, None);
        let (after, _) = apply_policy_changes(&before, &[change("create", res)]).unwrap();
        assert_eq!(after.tiers[0].name, DEFAULT_TIER);
        assert_eq!(names(&after, 0), vec!["default.a"]);
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let a = np(ResourceKind::NetworkPolicy, "tier1.a", "tier1", None);
        let b = np(ResourceKind::GlobalNetworkPolicy, "tier1.a", "tier1", None);
        assert!(matches!(is_resource_modified(&a, &b), Err(FlowsimError::ResourceMismatch { .. })));
    }
}
