//! Namespace and service account lookups for one configuration snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use flowsim_contracts::{
    error::FlowsimResult,
    resource::{Namespace, ServiceAccount},
};

use crate::match_type::MatchType;
use crate::selector::Selector;

/// Namespace and service account labels, indexed for matcher compilation.
#[derive(Debug, Default)]
pub struct NamespaceHandler {
    namespaces: HashMap<String, BTreeMap<String, String>>,
    known: Arc<HashSet<String>>,
    service_accounts: HashMap<(String, String), BTreeMap<String, String>>,
}

impl NamespaceHandler {
    pub fn new(namespaces: &[Namespace], service_accounts: &[ServiceAccount]) -> Self {
        Self {
            namespaces: namespaces.iter().map(|n| (n.name.clone(), n.labels.clone())).collect(),
            known: Arc::new(namespaces.iter().map(|n| n.name.clone()).collect()),
            service_accounts: service_accounts
                .iter()
                .map(|sa| ((sa.namespace.clone(), sa.name.clone()), sa.labels.clone()))
                .collect(),
        }
    }

    /// Evaluate `selector` against every known namespace up front.
    pub fn namespace_selector_matcher(&self, selector: &str) -> FlowsimResult<NamespaceSelectorMatcher> {
        let parsed = Selector::parse(selector)?;
        let matching: HashSet<String> = self
            .namespaces
            .iter()
            .filter(|(_, labels)| parsed.evaluate(labels))
            .map(|(name, _)| name.clone())
            .collect();
        debug!(selector, matching = matching.len(), "compiled namespace selector");
        Ok(NamespaceSelectorMatcher {
            global: parsed.is_global(),
            known: Arc::clone(&self.known),
            matching,
        })
    }

    /// Evaluate a service account selector for the account `name` in
    /// `namespace`. Unknown accounts are uncertain.
    pub fn service_account_selector_matches(&self, selector: &Selector, namespace: &str, name: &str) -> MatchType {
        match self.service_accounts.get(&(namespace.to_string(), name.to_string())) {
            Some(labels) => MatchType::from_bool(selector.evaluate(labels)),
            None => MatchType::Uncertain,
        }
    }
}

/// The precomputed result of a namespace selector.
#[derive(Debug, Clone)]
pub struct NamespaceSelectorMatcher {
    global: bool,
    known: Arc<HashSet<String>>,
    matching: HashSet<String>,
}

impl NamespaceSelectorMatcher {
    /// An empty `namespace` is a non-namespaced endpoint, which only
    /// `global()` selects.
    pub fn matches(&self, namespace: &str) -> MatchType {
        if namespace.is_empty() {
            return MatchType::from_bool(self.global);
        }
        if !self.known.contains(namespace) {
            return MatchType::Uncertain;
        }
        MatchType::from_bool(self.matching.contains(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> NamespaceHandler {
        let ns = |name: &str, team: &str| Namespace {
            name: name.to_string(),
            labels: [("team".to_string(), team.to_string())].into_iter().collect(),
        };
        let sa = ServiceAccount {
            name: "sa1".to_string(),
            namespace: "ns1".to_string(),
            labels: [("role".to_string(), "api".to_string())].into_iter().collect(),
        };
        NamespaceHandler::new(&[ns("ns1", "red"), ns("ns2", "blue")], &[sa])
    }

    #[test]
    fn namespace_selector_results_are_precomputed() {
        let m = handler().namespace_selector_matcher("team == 'red'").unwrap();
        assert_eq!(m.matches("ns1"), MatchType::True);
        assert_eq!(m.matches("ns2"), MatchType::False);
        assert_eq!(m.matches("ns3"), MatchType::Uncertain);
        assert_eq!(m.matches(""), MatchType::False);
    }

    #[test]
    fn global_selects_only_non_namespaced() {
        let m = handler().namespace_selector_matcher("global()").unwrap();
        assert_eq!(m.matches(""), MatchType::True);
        assert_eq!(m.matches("ns1"), MatchType::False);
    }

    #[test]
    fn service_account_selectors_use_account_labels() {
        let h = handler();
        let sel = Selector::parse("role == 'api'").unwrap();
        assert_eq!(h.service_account_selector_matches(&sel, "ns1", "sa1"), MatchType::True);
        assert_eq!(h.service_account_selector_matches(&sel, "ns1", "other"), MatchType::Uncertain);
    }
}
