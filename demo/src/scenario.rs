//! Scenario files: a configuration snapshot, proposed changes and the flow
//! records to replay against them.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use flowsim_contracts::{
    config::PreviewConfig,
    error::{FlowsimError, FlowsimResult},
    flow::FlowRecord,
    resource::{Namespace, Policy, PolicyResource, ResourceChange, ResourceData, ServiceAccount, Tier},
};
use flowsim_policycalc::EndpointUpdate;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Tiers as written in a scenario: ordered policy resources only.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioTier {
    pub name: String,
    #[serde(default)]
    pub policies: Vec<PolicyResource>,
}

/// Only records that started inside the window are replayed. Records
/// without a start time are always replayed.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn contains(&self, record: &FlowRecord) -> bool {
        let Some(start) = record.start_time else {
            return true;
        };
        self.from.map_or(true, |from| start >= from) && self.to.map_or(true, |to| start < to)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tiers: Vec<ScenarioTier>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccount>,
    #[serde(default)]
    pub changes: Vec<ResourceChange>,
    #[serde(default)]
    pub endpoints: Vec<EndpointUpdate>,
    #[serde(default)]
    pub records: Vec<FlowRecord>,
    #[serde(default)]
    pub window: Option<TimeWindow>,
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Stop after this many flows.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub impacted_only: bool,
    /// Used when no config file is given on the command line.
    #[serde(default)]
    pub config: Option<PreviewConfig>,
}

impl Scenario {
    pub fn from_json_str(s: &str) -> FlowsimResult<Self> {
        serde_json::from_str(s).map_err(|e| FlowsimError::ConfigError {
            reason: format!("failed to parse scenario JSON: {}", e),
        })
    }

    pub fn from_file(path: &Path) -> FlowsimResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| FlowsimError::ConfigError {
            reason: format!("failed to read scenario file '{}': {}", path.display(), e),
        })?;
        Self::from_json_str(&content)
    }

    /// The configuration before any proposed change.
    pub fn resource_data(&self) -> ResourceData {
        ResourceData {
            tiers: self
                .tiers
                .iter()
                .map(|t| Tier {
                    name: t.name.clone(),
                    policies: t.policies.iter().cloned().map(Policy::new).collect(),
                })
                .collect(),
            namespaces: self.namespaces.clone(),
            service_accounts: self.service_accounts.clone(),
        }
    }

    /// The records to replay, in the order they were written.
    pub fn windowed_records(&self) -> Vec<FlowRecord> {
        let window = self.window.unwrap_or_default();
        self.records.iter().filter(|r| window.contains(r)).cloned().collect()
    }

    pub fn page_size(&self) -> usize {
        self.page_size.filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../scenarios/new-default-deny.json");

    #[test]
    fn sample_scenario_parses() {
        let scenario = Scenario::from_json_str(SAMPLE).unwrap();
        let data = scenario.resource_data();
        assert_eq!(data.tiers.len(), 2);
        assert_eq!(scenario.changes.len(), 1);
        assert!(!scenario.records.is_empty());
        assert_eq!(scenario.page_size(), DEFAULT_PAGE_SIZE);
        assert!(scenario.impacted_only);
        assert_eq!(scenario.config.map(|c| c.calculate_original_action), Some(false));
    }

    #[test]
    fn window_keeps_records_without_start_time() {
        let scenario = Scenario::from_json_str(
            r#"{
                "window": { "from": "2024-01-01T00:00:00Z", "to": "2024-01-02T00:00:00Z" },
                "records": [
                    { "reporter": "src", "action": "allow", "protocol": "tcp",
                      "source": { "type": "wep" }, "destination": { "type": "wep" },
                      "start_time": "2024-01-01T12:00:00Z" },
                    { "reporter": "src", "action": "allow", "protocol": "tcp",
                      "source": { "type": "wep" }, "destination": { "type": "wep" },
                      "start_time": "2024-01-02T00:00:00Z" },
                    { "reporter": "src", "action": "deny", "protocol": "tcp",
                      "source": { "type": "wep" }, "destination": { "type": "wep" } }
                ]
            }"#,
        )
        .unwrap();

        let records = scenario.windowed_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].action, "deny");
    }

    #[test]
    fn malformed_scenario_is_config_error() {
        assert!(matches!(
            Scenario::from_json_str("{ \"tiers\": 3 }"),
            Err(FlowsimError::ConfigError { .. })
        ));
    }
}
