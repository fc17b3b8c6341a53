//! # flowsim-contracts
//!
//! Shared types and error definitions for the flowsim policy-impact
//! simulator.
//!
//! All crates in the workspace import from here. Flow records, policy
//! resources, action flags, policy hits and aggregation buckets live in this
//! crate; the evaluation engine and the pipeline live elsewhere.

pub mod action;
pub mod bucket;
pub mod config;
pub mod error;
pub mod flow;
pub mod impact;
pub mod policy_hit;
pub mod resource;

#[cfg(test)]
mod tests {
    use super::*;
    use action::ActionFlags;
    use config::PreviewConfig;
    use error::FlowsimError;
    use flow::{EndpointType, FlowEndpointData};
    use policy_hit::{compare_policy_hits, PolicyHit};

    // ── PreviewConfig ────────────────────────────────────────────────────────

    #[test]
    fn config_defaults_from_empty_toml() {
        let cfg = PreviewConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PreviewConfig::default());
        assert!(!cfg.calico_endpoint_net_match_always);
        assert_eq!(cfg.result_channel_capacity, 1000);
    }

    #[test]
    fn config_overrides_and_errors() {
        let cfg = PreviewConfig::from_toml_str(
            "calculate_original_action = true\nresult_channel_capacity = 5\n",
        )
        .unwrap();
        assert!(cfg.calculate_original_action);
        assert_eq!(cfg.result_channel_capacity, 5);

        let err = PreviewConfig::from_toml_str("result_channel_capacity = 0").unwrap_err();
        assert!(matches!(err, FlowsimError::ConfigError { .. }));

        let err = PreviewConfig::from_toml_str("calculate_original_action = 'yes'").unwrap_err();
        assert!(matches!(err, FlowsimError::ConfigError { .. }));
    }

    #[test]
    fn config_missing_file_is_config_error() {
        let err = PreviewConfig::from_file(std::path::Path::new("/nonexistent/flowsim.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    // ── Endpoints ────────────────────────────────────────────────────────────

    #[test]
    fn only_workload_and_host_endpoints_are_managed() {
        for (t, managed) in [
            (EndpointType::Wep, true),
            (EndpointType::Hep, true),
            (EndpointType::Ns, false),
            (EndpointType::Net, false),
            (EndpointType::Unknown, false),
        ] {
            let ep = FlowEndpointData { endpoint_type: t, ..Default::default() };
            assert_eq!(ep.is_calico_managed(), managed, "{t:?}");
        }
    }

    // ── Policy hits ──────────────────────────────────────────────────────────

    #[test]
    fn logged_hits_sort_by_index_then_name() {
        let mut hits: Vec<PolicyHit> = [
            "1|t|t.b|allow|0",
            "0|t|t.z|pass|-",
            "1|t|t.a|deny|1",
        ]
        .iter()
        .map(|s| PolicyHit::from_flow_log_str(s, 1).unwrap())
        .collect();
        hits.sort_by(compare_policy_hits);
        assert_eq!(
            policy_hit::flow_log_strings(&hits),
            vec!["0|t|t.z|pass|-", "1|t|t.a|deny|1", "1|t|t.b|allow|0"]
        );
    }

    #[test]
    fn end_of_tier_hit_folds_to_deny() {
        let hit = PolicyHit::from_flow_log_str("0|t|t.p|deny|-1", 1).unwrap();
        assert_eq!(hit.action.flags(), ActionFlags::END_OF_TIER_DENY);
        assert_eq!(hit.action.flags().actual_policy_hit_action(), ActionFlags::DENY);
    }
}
