//! # flowsim-core
//!
//! The collaborator traits and the streaming aggregation pipeline of the
//! flowsim policy-impact simulator.
//!
//! This crate provides:
//! - The three collaborator traits (`PolicyCalculator`, `FlowPager`, `FlowFilter`)
//! - `FlowPipeline`, which correlates the legs of each connection, calculates
//!   them and emits aggregated before/after buckets per flow
//! - `InMemoryPager`, a `FlowPager` over records already in memory
//!
//! ## Usage
//!
//! ```rust,ignore
//! use flowsim_core::{FlowPipeline, InMemoryPager};
//!
//! let handle = FlowPipeline::new(calculator, config).spawn(Box::new(InMemoryPager::new(records, 100)));
//! ```

pub mod pager;
pub mod pipeline;
pub mod traits;

pub use pager::InMemoryPager;
pub use pipeline::{FlowPipeline, PipelineHandle, ProcessedFlows};
pub use traits::{BeforeAfter, EndpointResponse, FlowFilter, FlowPager, IncludeAllFilter, PolicyCalculator};

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use flowsim_contracts::{
        action::ActionFlags,
        bucket::AggregationBucket,
        config::PreviewConfig,
        error::{FlowsimError, FlowsimResult},
        flow::{EndpointType, Flow, FlowRecord, LogStats, RecordEndpoint, Reporter},
        policy_hit::PolicyHit,
    };

    use super::*;

    // ── Record helpers ───────────────────────────────────────────────────────

    fn wep(name: &str, namespace: &str, port: i64) -> RecordEndpoint {
        RecordEndpoint {
            endpoint_type: EndpointType::Wep,
            namespace: namespace.to_string(),
            aggregated_name: name.to_string(),
            port,
            ..Default::default()
        }
    }

    fn hep(name: &str, port: i64) -> RecordEndpoint {
        RecordEndpoint {
            endpoint_type: EndpointType::Hep,
            namespace: "-".to_string(),
            aggregated_name: name.to_string(),
            port,
            ..Default::default()
        }
    }

    fn record(reporter: Reporter, action: &str, proto: &str, source: RecordEndpoint, destination: RecordEndpoint) -> FlowRecord {
        FlowRecord {
            reporter,
            action: action.to_string(),
            protocol: proto.to_string(),
            source,
            destination,
            source_ips: vec!["0.0.0.0".to_string()],
            destination_ips: vec!["0.0.0.0".to_string()],
            policies: vec!["0|allow-cnx|calico-monitoring/allow-cnx.elasticsearch-access|allow".to_string()],
            log_stats: Some(LogStats { flow_log_count: 1, ..Default::default() }),
            ..Default::default()
        }
    }

    const SRC: Reporter = Reporter::Source;
    const DST: Reporter = Reporter::Destination;

    fn hits() -> Vec<PolicyHit> {
        ["0|tier1|tier1.policy1|pass", "1|default|default.policy1|allow"]
            .iter()
            .map(|s| PolicyHit::from_flow_log_str(s, 1).unwrap())
            .collect()
    }

    fn included(action: ActionFlags) -> EndpointResponse {
        EndpointResponse { include: true, action, policies: hits() }
    }

    // ── Calculator stubs ─────────────────────────────────────────────────────

    /// Leaves "before" as logged and allows everything "after".
    struct AlwaysAllow;

    impl PolicyCalculator for AlwaysAllow {
        fn calculate_source(&self, flow: &Flow) -> BeforeAfter {
            BeforeAfter {
                modified: flow.action != ActionFlags::ALLOW,
                before: included(flow.action),
                after: included(ActionFlags::ALLOW),
            }
        }

        fn calculate_dest(&self, flow: &Flow, before: ActionFlags, after: ActionFlags) -> BeforeAfter {
            BeforeAfter {
                modified: flow.action != ActionFlags::ALLOW,
                before: if before != ActionFlags::DENY { included(flow.action) } else { EndpointResponse::default() },
                after: if after != ActionFlags::DENY { included(ActionFlags::ALLOW) } else { EndpointResponse::default() },
            }
        }
    }

    /// Leaves "before" as logged and denies everything "after".
    struct AlwaysDeny;

    impl PolicyCalculator for AlwaysDeny {
        fn calculate_source(&self, flow: &Flow) -> BeforeAfter {
            BeforeAfter {
                modified: flow.action != ActionFlags::DENY,
                before: included(flow.action),
                after: included(ActionFlags::DENY),
            }
        }

        fn calculate_dest(&self, flow: &Flow, before: ActionFlags, after: ActionFlags) -> BeforeAfter {
            BeforeAfter {
                modified: flow.action != ActionFlags::DENY,
                before: if before != ActionFlags::DENY { included(flow.action) } else { EndpointResponse::default() },
                after: if after != ActionFlags::DENY { included(ActionFlags::DENY) } else { EndpointResponse::default() },
            }
        }
    }

    /// Reports every flow as unchanged.
    struct Unchanged;

    impl PolicyCalculator for Unchanged {
        fn calculate_source(&self, flow: &Flow) -> BeforeAfter {
            BeforeAfter { modified: false, before: included(flow.action), after: included(flow.action) }
        }

        fn calculate_dest(&self, flow: &Flow, before: ActionFlags, after: ActionFlags) -> BeforeAfter {
            BeforeAfter {
                modified: false,
                before: if before.contains(ActionFlags::ALLOW) { included(flow.action) } else { EndpointResponse::default() },
                after: if after.contains(ActionFlags::ALLOW) { included(flow.action) } else { EndpointResponse::default() },
            }
        }
    }

    struct HideAll;

    impl FlowFilter for HideAll {
        fn include_flow(&self, _bucket: &AggregationBucket) -> FlowsimResult<bool> {
            Ok(false)
        }

        fn modify_flow(&self, bucket: &mut AggregationBucket) -> FlowsimResult<()> {
            bucket.terms.policies.clear();
            Ok(())
        }
    }

    struct BrokenFilter {
        calls: AtomicUsize,
    }

    impl FlowFilter for BrokenFilter {
        fn include_flow(&self, _bucket: &AggregationBucket) -> FlowsimResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FlowsimError::FlowFilter { reason: "rbac lookup failed".to_string() })
        }

        fn modify_flow(&self, _bucket: &mut AggregationBucket) -> FlowsimResult<()> {
            Ok(())
        }
    }

    // ── Assertion helpers ────────────────────────────────────────────────────

    fn flatten(flows: &[ProcessedFlows]) -> (Vec<AggregationBucket>, Vec<AggregationBucket>) {
        let before = flows.iter().flat_map(|f| f.before.clone()).collect();
        let after = flows.iter().flat_map(|f| f.after.clone()).collect();
        (before, after)
    }

    #[track_caller]
    fn assert_bucket(
        b: &AggregationBucket,
        source: (&str, &str),
        reporter: Reporter,
        action: &str,
        source_action: &str,
        impacted: bool,
        doc_count: i64,
    ) {
        assert_eq!(b.key.flow.source_type, source.0);
        assert_eq!(b.key.flow.source_namespace, source.1);
        assert_eq!(b.key.flow.source_name, "hep1");
        assert_eq!(b.key.flow.dest_type, "hep");
        assert_eq!(b.key.flow.dest_namespace, "-");
        assert_eq!(b.key.flow.dest_name, "hep2");
        assert_eq!(b.key.reporter, reporter);
        assert_eq!(b.key.action, action);
        assert_eq!(b.key.source_action, source_action);
        assert_eq!(b.key.flow_impacted, impacted);
        assert_eq!(b.doc_count, doc_count);
    }

    const HEP: (&str, &str) = ("hep", "-");
    const WEP: (&str, &str) = ("wep", "ns1");

    async fn run(calc: impl PolicyCalculator + 'static, records: Vec<FlowRecord>) -> (Vec<ProcessedFlows>, Option<FlowsimError>) {
        FlowPipeline::new(Arc::new(calc), PreviewConfig::default())
            .with_limit(1000)
            .spawn(Box::new(InMemoryPager::new(records, 1)))
            .collect()
            .await
    }

    fn deny_to_allow_records() -> Vec<FlowRecord> {
        vec![
            record(DST, "deny", "udp", hep("hep1", 100), hep("hep2", 200)),
            record(DST, "allow", "tcp", hep("hep1", 500), hep("hep2", 600)),
            record(SRC, "deny", "tcp", hep("hep1", 100), hep("hep2", 200)),
            record(SRC, "allow", "udp", hep("hep1", 100), hep("hep2", 200)),
            record(SRC, "allow", "tcp", hep("hep1", 500), hep("hep2", 600)),
            record(SRC, "allow", "tcp", wep("hep1", "ns1", 100), hep("hep2", 200)),
        ]
    }

    // ── 1. unchanged actions aggregate per reporter ──────────────────────────

    #[tokio::test]
    async fn aggregates_flows_whose_action_does_not_change() {
        let records = vec![
            record(DST, "allow", "tcp", hep("hep1", 100), hep("hep2", 200)),
            record(DST, "allow", "udp", hep("hep1", 100), hep("hep2", 200)),
            record(DST, "allow", "tcp", hep("hep1", 500), hep("hep2", 600)),
            record(SRC, "allow", "tcp", hep("hep1", 100), hep("hep2", 200)),
            record(SRC, "allow", "udp", hep("hep1", 100), hep("hep2", 200)),
            record(SRC, "allow", "tcp", hep("hep1", 500), hep("hep2", 600)),
            record(SRC, "allow", "tcp", wep("hep1", "ns1", 100), hep("hep2", 200)),
        ];
        let (flows, error) = run(AlwaysAllow, records).await;
        assert!(error.is_none(), "unexpected error: {error:?}");
        assert_eq!(flows.len(), 2, "one result pair per flow key");

        let (before, after) = flatten(&flows);
        for buckets in [&before, &after] {
            assert_eq!(buckets.len(), 3);
            assert_bucket(&buckets[0], HEP, DST, "allow", "allow", false, 3);
            assert_bucket(&buckets[1], HEP, SRC, "allow", "allow", false, 3);
            assert_bucket(&buckets[2], WEP, SRC, "allow", "allow", false, 1);
        }

        // Calculated hits replace the logged policy terms.
        assert_eq!(before[0].terms.policies.get("1|default|default.policy1|allow|-"), Some(&3));
    }

    // ── 2. source deny → allow synthesizes destination legs ──────────────────

    #[tokio::test]
    async fn source_flows_changing_from_deny_to_allow() {
        let (flows, error) = run(AlwaysAllow, deny_to_allow_records()).await;
        assert!(error.is_none());

        let (before, after) = flatten(&flows);
        assert_eq!(before.len(), 5);
        assert_bucket(&before[0], HEP, DST, "allow", "allow", true, 1);
        assert_bucket(&before[1], HEP, DST, "deny", "allow", true, 1);
        assert_bucket(&before[2], HEP, SRC, "allow", "allow", true, 2);
        assert_bucket(&before[3], HEP, SRC, "deny", "deny", true, 1);
        assert_bucket(&before[4], WEP, SRC, "allow", "allow", false, 1);

        // The synthesized destination leg lands in the after dst/allow bucket.
        assert_eq!(after.len(), 3);
        assert_bucket(&after[0], HEP, DST, "allow", "allow", true, 3);
        assert_bucket(&after[1], HEP, SRC, "allow", "allow", true, 3);
        assert_bucket(&after[2], WEP, SRC, "allow", "allow", false, 1);
    }

    // ── 3. source allow → deny gates destination legs ────────────────────────

    #[tokio::test]
    async fn source_flows_changing_from_allow_to_deny() {
        let records = vec![
            record(DST, "deny", "udp", hep("hep1", 100), hep("hep2", 200)),
            record(SRC, "allow", "udp", hep("hep1", 100), hep("hep2", 200)),
            record(SRC, "deny", "tcp", hep("hep1", 100), hep("hep2", 200)),
            record(DST, "allow", "tcp", hep("hep1", 500), hep("hep2", 600)),
            record(SRC, "allow", "tcp", hep("hep1", 500), hep("hep2", 600)),
            record(SRC, "allow", "tcp", wep("hep1", "ns1", 100), hep("hep2", 200)),
        ];
        let (flows, _) = run(AlwaysDeny, records).await;

        let (before, after) = flatten(&flows);
        assert_eq!(before.len(), 5);
        assert_bucket(&before[0], HEP, DST, "allow", "allow", true, 1);
        assert_bucket(&before[1], HEP, DST, "deny", "allow", true, 1);
        assert_bucket(&before[2], HEP, SRC, "allow", "allow", true, 2);
        assert_bucket(&before[3], HEP, SRC, "deny", "deny", true, 1);
        assert_bucket(&before[4], WEP, SRC, "allow", "allow", true, 1);

        assert_eq!(after.len(), 2, "no destination legs once the source denies");
        assert_bucket(&after[0], HEP, SRC, "deny", "deny", true, 3);
        assert_bucket(&after[1], WEP, SRC, "deny", "deny", true, 1);
    }

    // ── 4. impacted-only ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn impacted_only_drops_unimpacted_flows() {
        let (flows, _) = FlowPipeline::new(Arc::new(AlwaysAllow), PreviewConfig::default())
            .impacted_only(true)
            .spawn(Box::new(InMemoryPager::new(deny_to_allow_records(), 1)))
            .collect()
            .await;

        let (before, _) = flatten(&flows);
        assert_eq!(before.len(), 4, "the unimpacted wep flow is dropped");
        assert!(before.iter().all(|b| b.key.flow_impacted));
    }

    // ── 5. connection groups ─────────────────────────────────────────────────

    #[tokio::test]
    async fn unrelated_legs_are_not_correlated() {
        // A source deny and a destination allow on different ports are
        // separate connections: the destination leg keeps an allow source
        // action instead of being gated by the unrelated deny.
        let records = vec![
            record(DST, "allow", "tcp", hep("hep1", 100), hep("hep2", 443)),
            record(SRC, "deny", "tcp", hep("hep1", 100), hep("hep2", 80)),
        ];
        let (flows, _) = run(Unchanged, records).await;
        assert_eq!(flows.len(), 1);
        let (before, after) = flatten(&flows);
        assert_eq!(before, after);
        assert_bucket(&before[0], HEP, DST, "allow", "allow", false, 1);
        assert_bucket(&before[1], HEP, SRC, "deny", "deny", false, 1);
    }

    #[tokio::test]
    async fn different_endpoints_emit_separate_pairs() {
        let records = vec![
            record(SRC, "deny", "tcp", hep("hep1", 100), hep("hep2", 80)),
            record(DST, "allow", "tcp", hep("hep1", 100), hep("hep3", 443)),
        ];
        let (flows, _) = run(Unchanged, records).await;
        assert_eq!(flows.len(), 2);
        assert_eq!(flows[0].before[0].key.flow.dest_name, "hep2");
        assert_eq!(flows[1].before[0].key.flow.dest_name, "hep3");
        assert_eq!(flows[1].before[0].key.source_action, "allow");
    }

    #[tokio::test]
    async fn legs_of_one_connection_share_the_source_action() {
        // The calculated source allow → deny gates the destination leg of
        // the same connection out of "after".
        let records = vec![
            record(DST, "allow", "tcp", hep("hep1", 100), hep("hep2", 80)),
            record(SRC, "allow", "tcp", hep("hep1", 100), hep("hep2", 80)),
        ];
        let (flows, _) = run(AlwaysDeny, records).await;
        let (before, after) = flatten(&flows);
        assert_eq!(before.len(), 2);
        assert_eq!(after.len(), 1);
        assert_bucket(&after[0], HEP, SRC, "deny", "deny", true, 1);

        let records = vec![record(SRC, "deny", "tcp", hep("hep1", 100), hep("hep2", 80))];
        let (flows, _) = run(Unchanged, records).await;
        let (before, after) = flatten(&flows);
        assert_eq!(before.len(), 1, "no synthesized leg when nothing changes to allow");
        assert_eq!(after.len(), 1);
    }

    // ── 6. limit ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stops_once_limit_is_reached() {
        let records: Vec<FlowRecord> = (0..5)
            .map(|i| record(SRC, "allow", "tcp", hep(&format!("hep1-{i}"), 100), hep("hep2", 80)))
            .collect();
        let (flows, error) = FlowPipeline::new(Arc::new(Unchanged), PreviewConfig::default())
            .with_limit(2)
            .spawn(Box::new(InMemoryPager::new(records, 2)))
            .collect()
            .await;
        assert!(error.is_none());
        assert_eq!(flows.len(), 2);
    }

    // ── 7. errors ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn page_error_is_forwarded_after_results() {
        let records = vec![record(SRC, "allow", "tcp", hep("hep1", 100), hep("hep2", 80))];
        let pager = InMemoryPager::new(records, 1).fail_with(FlowsimError::PageSource {
            reason: "linseed unavailable".to_string(),
        });
        let (flows, error) = FlowPipeline::new(Arc::new(Unchanged), PreviewConfig::default())
            .spawn(Box::new(pager))
            .collect()
            .await;
        assert_eq!(flows.len(), 1, "records read before the failure are still emitted");
        assert!(matches!(error, Some(FlowsimError::PageSource { .. })));
    }

    #[tokio::test]
    async fn filter_hides_unimpacted_flows_only() {
        let (flows, error) = FlowPipeline::new(Arc::new(AlwaysAllow), PreviewConfig::default())
            .with_filter(Arc::new(HideAll))
            .spawn(Box::new(InMemoryPager::new(deny_to_allow_records(), 3)))
            .collect()
            .await;
        assert!(error.is_none());
        assert_eq!(flows.len(), 1, "only the impacted hep flow is visible");
        assert!(flows[0].before.iter().all(|b| b.terms.policies.is_empty()), "policies redacted");
    }

    #[tokio::test]
    async fn filter_error_is_fatal() {
        let filter = Arc::new(BrokenFilter { calls: AtomicUsize::new(0) });
        let records = vec![
            record(SRC, "allow", "tcp", hep("hep1", 100), hep("hep2", 80)),
            record(SRC, "allow", "tcp", hep("hep3", 100), hep("hep2", 80)),
        ];
        let (flows, error) = FlowPipeline::new(Arc::new(Unchanged), PreviewConfig::default())
            .with_filter(filter.clone())
            .spawn(Box::new(InMemoryPager::new(records, 1)))
            .collect()
            .await;
        assert!(flows.is_empty());
        assert!(matches!(error, Some(FlowsimError::FlowFilter { .. })));
        assert_eq!(filter.calls.load(Ordering::SeqCst), 1, "run stops at the first failure");
    }

    // ── 8. cancellation ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_while_blocked_reports_cancelled() {
        let records: Vec<FlowRecord> = (0..5)
            .map(|i| record(SRC, "allow", "tcp", hep(&format!("hep1-{i}"), 100), hep("hep2", 80)))
            .collect();
        let config = PreviewConfig { result_channel_capacity: 1, ..Default::default() };
        let mut handle = FlowPipeline::new(Arc::new(Unchanged), config).spawn(Box::new(InMemoryPager::new(records, 1)));

        assert!(handle.next().await.is_some());
        handle.cancel();
        let error = handle.finish().await;
        assert!(matches!(error, Some(FlowsimError::Cancelled { .. })), "got {error:?}");
    }
}
