//! Action flags: the set of possible outcomes for a flow, policy or tier.
//!
//! A single set bit is a definite outcome. Several concrete bits set at once
//! mean "one of these, we could not tell which" because data required to
//! decide was missing from the flow. The verification bits record how the
//! calculated outcome compares to the policy hits logged with the flow.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Possible outcomes plus measurement bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ActionFlags: u16 {
        const ALLOW = 1 << 0;
        const DENY = 1 << 1;
        const END_OF_TIER_DENY = 1 << 2;
        /// Continue evaluation at the next tier.
        const PASS = 1 << 3;
        /// The policy applied but none of its rules matched.
        const NO_MATCH = 1 << 4;

        /// The logged hit agrees exactly with the single calculated action.
        const MATCHES_MEASURED = 1 << 5;
        /// The logged hit picked one of several speculative actions.
        const RESOLVED_FROM_MEASURED = 1 << 6;
        /// The logged hit names an action that was never a calculated possibility.
        const CONFLICTS_WITH_MEASURED = 1 << 7;

        const ALLOW_AND_DENY = Self::ALLOW.bits() | Self::DENY.bits();

        /// Actions that produce a policy hit.
        const ALL_POLICY_ACTIONS = Self::ALLOW.bits()
            | Self::DENY.bits()
            | Self::PASS.bits()
            | Self::END_OF_TIER_DENY.bits();

        /// Actions a single policy calculation can produce.
        const ALL_CALCULATED_POLICY_ACTIONS = Self::ALLOW.bits()
            | Self::DENY.bits()
            | Self::PASS.bits()
            | Self::NO_MATCH.bits();

        const VERIFIED = Self::MATCHES_MEASURED.bits() | Self::RESOLVED_FROM_MEASURED.bits();

        const MEASURED = Self::MATCHES_MEASURED.bits()
            | Self::RESOLVED_FROM_MEASURED.bits()
            | Self::CONFLICTS_WITH_MEASURED.bits();
    }
}

impl ActionFlags {
    /// True when the flags hold both an allow and a deny possibility.
    ///
    /// End-of-tier deny counts as a deny.
    pub fn is_indeterminate(self) -> bool {
        self.contains(Self::ALLOW) && self.intersects(Self::DENY | Self::END_OF_TIER_DENY)
    }

    /// Collapse to the action an enforcement point would report for the flow.
    ///
    /// Returns `ALLOW`, `DENY`, `ALLOW_AND_DENY` (indeterminate) or empty.
    pub fn actual_flow_action(self) -> ActionFlags {
        if self.is_indeterminate() {
            Self::ALLOW_AND_DENY
        } else if self.contains(Self::ALLOW) {
            Self::ALLOW
        } else if self.intersects(Self::DENY | Self::END_OF_TIER_DENY) {
            Self::DENY
        } else {
            Self::empty()
        }
    }

    /// The policy-hit action with end-of-tier deny folded into deny.
    pub fn actual_policy_hit_action(self) -> ActionFlags {
        let mut actual = self & (Self::ALLOW | Self::DENY | Self::PASS);
        if self.contains(Self::END_OF_TIER_DENY) {
            actual |= Self::DENY;
        }
        actual
    }

    /// The concrete policy actions set in these flags, in a fixed order.
    pub fn policy_actions(self) -> Vec<ActionFlags> {
        [Self::ALLOW, Self::DENY, Self::PASS, Self::END_OF_TIER_DENY]
            .into_iter()
            .filter(|a| self.contains(*a))
            .collect()
    }

    /// Human readable names for every concrete action set.
    pub fn action_strings(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (flag, name) in [
            (Self::ALLOW, "allow"),
            (Self::DENY, "deny"),
            (Self::PASS, "pass"),
            (Self::END_OF_TIER_DENY, "end-of-tier-deny"),
            (Self::NO_MATCH, "no-match"),
        ] {
            if self.contains(flag) {
                out.push(name);
            }
        }
        out
    }

    /// The action value used in aggregation bucket keys.
    pub fn flow_action_str(self) -> &'static str {
        let actual = self.actual_flow_action();
        if actual == Self::ALLOW {
            "allow"
        } else if actual == Self::DENY {
            "deny"
        } else {
            "unknown"
        }
    }

    /// Parse a recorded flow or policy action.
    pub fn from_action_str(s: &str) -> Option<ActionFlags> {
        match s {
            "allow" => Some(Self::ALLOW),
            "deny" => Some(Self::DENY),
            "pass" => Some(Self::PASS),
            "end-of-tier-deny" | "eot-deny" => Some(Self::END_OF_TIER_DENY),
            _ => None,
        }
    }
}
