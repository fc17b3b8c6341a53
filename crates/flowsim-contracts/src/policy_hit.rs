//! Policy hits: one policy decision recorded against a flow.
//!
//! The flow-log form is `index|tier|[namespace/]name|action[|ruleIdIndex]`.
//! A rule id index of `-` means "not recorded"; `deny` with `-1` is the
//! end-of-tier deny of the policy's tier.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::action::ActionFlags;
use crate::error::{FlowsimError, FlowsimResult};

/// Rule id index that marks an end-of-tier deny.
pub const RULE_ID_INDEX_END_OF_TIER_DENY: i32 = -1;

const STAGED_MARKER: &str = "staged:";
const KNP_PREFIX: &str = "knp.default.";

/// The action recorded by a single policy hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HitAction {
    Allow,
    Deny,
    Pass,
    EndOfTierDeny,
}

impl HitAction {
    pub fn flags(self) -> ActionFlags {
        match self {
            HitAction::Allow => ActionFlags::ALLOW,
            HitAction::Deny => ActionFlags::DENY,
            HitAction::Pass => ActionFlags::PASS,
            HitAction::EndOfTierDeny => ActionFlags::END_OF_TIER_DENY,
        }
    }

    /// Map a single concrete policy action flag to a hit action.
    pub fn from_flag(flag: ActionFlags) -> Option<HitAction> {
        if flag == ActionFlags::ALLOW {
            Some(HitAction::Allow)
        } else if flag == ActionFlags::DENY {
            Some(HitAction::Deny)
        } else if flag == ActionFlags::PASS {
            Some(HitAction::Pass)
        } else if flag == ActionFlags::END_OF_TIER_DENY {
            Some(HitAction::EndOfTierDeny)
        } else {
            None
        }
    }

    /// The action as written in the flow log. End-of-tier deny logs as `deny`.
    pub fn as_log_str(self) -> &'static str {
        match self {
            HitAction::Allow => "allow",
            HitAction::Deny | HitAction::EndOfTierDeny => "deny",
            HitAction::Pass => "pass",
        }
    }
}

/// Build the flow-log name of a policy: `[namespace/]name` with the staged
/// marker inserted after the tier prefix for staged policies.
pub fn flow_log_name(namespace: &str, name: &str, staged: bool) -> String {
    let name = if staged { staged_name(name) } else { name.to_string() };
    if namespace.is_empty() {
        name
    } else {
        format!("{namespace}/{name}")
    }
}

fn staged_name(name: &str) -> String {
    if name.starts_with(KNP_PREFIX) {
        return format!("{STAGED_MARKER}{name}");
    }
    match name.split_once('.') {
        Some((tier, rest)) => format!("{tier}.{STAGED_MARKER}{rest}"),
        None => format!("{STAGED_MARKER}{name}"),
    }
}

/// One recorded or calculated policy hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyHit {
    /// Match index within the flow. Hits for the same policy share an index.
    pub index: usize,
    pub tier: String,
    /// Calico v3 name, without namespace or staged marker.
    pub name: String,
    /// Empty for global policies and profiles.
    pub namespace: String,
    pub action: HitAction,
    pub staged: bool,
    pub rule_id_index: Option<i32>,
    pub count: i64,
}

impl PolicyHit {
    pub fn new(
        action: HitAction,
        count: i64,
        index: usize,
        staged: bool,
        name: impl Into<String>,
        namespace: impl Into<String>,
        tier: impl Into<String>,
    ) -> Self {
        let rule_id_index = match action {
            HitAction::EndOfTierDeny => Some(RULE_ID_INDEX_END_OF_TIER_DENY),
            _ => None,
        };
        Self {
            index,
            tier: tier.into(),
            name: name.into(),
            namespace: namespace.into(),
            action,
            staged,
            rule_id_index,
            count,
        }
    }

    /// Parse a flow-log policy string.
    pub fn from_flow_log_str(s: &str, count: i64) -> FlowsimResult<Self> {
        let invalid = |reason: &str| FlowsimError::InvalidPolicyHit {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split('|').collect();
        if parts.len() != 4 && parts.len() != 5 {
            return Err(invalid("expected 4 or 5 '|' separated fields"));
        }

        let index: usize = parts[0].parse().map_err(|_| invalid("invalid match index"))?;
        let tier = parts[1].to_string();

        let (namespace, full_name) = match parts[2].split_once('/') {
            Some((ns, name)) => (ns.to_string(), name),
            None => (String::new(), parts[2]),
        };
        if full_name.is_empty() {
            return Err(invalid("empty policy name"));
        }
        let staged = full_name.contains(STAGED_MARKER);
        let name = full_name.replacen(STAGED_MARKER, "", 1);

        let rule_id_index = match parts.get(4) {
            None | Some(&"-") => None,
            Some(v) => Some(v.parse::<i32>().map_err(|_| invalid("invalid rule id index"))?),
        };

        let action = match parts[3] {
            "allow" => HitAction::Allow,
            "pass" => HitAction::Pass,
            "deny" if rule_id_index == Some(RULE_ID_INDEX_END_OF_TIER_DENY) => HitAction::EndOfTierDeny,
            "deny" => HitAction::Deny,
            _ => return Err(invalid("invalid action")),
        };

        Ok(Self {
            index,
            tier,
            name,
            namespace,
            action,
            staged,
            rule_id_index,
            count,
        })
    }

    /// The name used to correlate calculated and logged hits.
    pub fn flow_log_name(&self) -> String {
        flow_log_name(&self.namespace, &self.name, self.staged)
    }

    pub fn is_profile(&self) -> bool {
        self.tier == "__PROFILE__"
    }

    /// Render in flow-log form.
    pub fn to_flow_log_string(&self) -> String {
        let rule = match self.rule_id_index {
            Some(idx) => idx.to_string(),
            None => "-".to_string(),
        };
        format!(
            "{}|{}|{}|{}|{}",
            self.index,
            self.tier,
            self.flow_log_name(),
            self.action.as_log_str(),
            rule
        )
    }
}

impl fmt::Display for PolicyHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_flow_log_string())
    }
}

/// Ordering used to sort logged hits: match index, then name, then action.
pub fn compare_policy_hits(a: &PolicyHit, b: &PolicyHit) -> Ordering {
    a.index
        .cmp(&b.index)
        .then_with(|| a.flow_log_name().cmp(&b.flow_log_name()))
        .then_with(|| a.action.as_log_str().cmp(b.action.as_log_str()))
}

/// Render an ordered list of hits in flow-log form.
pub fn flow_log_strings(hits: &[PolicyHit]) -> Vec<String> {
    hits.iter().map(PolicyHit::to_flow_log_string).collect()
}
