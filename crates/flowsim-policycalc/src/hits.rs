//! Policy hit comparisons used to decide whether a calculation agrees with
//! the logged data, and whether before and after differ.

use std::collections::HashMap;

use tracing::debug;

use flowsim_contracts::{action::ActionFlags, policy_hit::PolicyHit};

fn hit_action(hit: &PolicyHit) -> ActionFlags {
    hit.action.flags().actual_policy_hit_action()
}

/// True when every non-staged calculated hit appears in the logged hits with
/// the same action. Order and duplicates are ignored. Logged hits naming
/// one policy with two different actions never compare equal.
pub fn policy_hits_equal_ignoring_order_duplicates_and_staged(logged: &[PolicyHit], calculated: &[PolicyHit]) -> bool {
    let mut logged_actions: HashMap<String, ActionFlags> = HashMap::new();
    for hit in logged.iter().filter(|h| !h.staged) {
        let name = hit.flow_log_name();
        let action = hit_action(hit);
        match logged_actions.get(&name) {
            Some(existing) if *existing != action => {
                debug!(policy = %name, "logged hits disagree for one policy");
                return false;
            }
            Some(_) => {}
            None => {
                logged_actions.insert(name, action);
            }
        }
    }

    calculated.iter().filter(|h| !h.staged).all(|hit| {
        let name = hit.flow_log_name();
        match logged_actions.get(&name) {
            Some(action) if *action == hit_action(hit) => true,
            Some(action) => {
                debug!(policy = %name, logged = ?action, calculated = ?hit_action(hit), "no matching action");
                false
            }
            None => {
                debug!(policy = %name, "no matching logged policy");
                false
            }
        }
    })
}

/// Pairwise comparison of the non-staged hits of two ordered lists by name
/// and action.
pub fn policy_hits_equal_ignoring_staged(before: &[PolicyHit], after: &[PolicyHit]) -> bool {
    let mut before = before.iter().filter(|h| !h.staged);
    let mut after = after.iter().filter(|h| !h.staged);
    loop {
        match (before.next(), after.next()) {
            (None, None) => return true,
            (Some(b), Some(a)) => {
                if hit_action(b) != hit_action(a) || b.flow_log_name() != a.flow_log_name() {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
