//! Collaborator traits for the flowsim pipeline.
//!
//! These three traits are the pipeline's boundary:
//!
//! - `PolicyCalculator`: computes before/after outcomes for one flow leg
//! - `FlowPager`: supplies ordered pages of stored flow records
//! - `FlowFilter`: decides visibility of, and redacts, emitted buckets
//!
//! The pipeline drives them in a fixed order per connection group and per
//! flow. None of them is called concurrently by a single pipeline run.

use async_trait::async_trait;

use flowsim_contracts::{
    action::ActionFlags,
    bucket::AggregationBucket,
    error::FlowsimResult,
    flow::{Flow, FlowRecord},
    policy_hit::{flow_log_strings, PolicyHit},
};

/// The calculated outcome for one flow leg at one endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointResponse {
    /// Whether the leg appears in the aggregated results at all. A
    /// destination leg whose source action was deny is not included.
    pub include: bool,

    /// The possible outcomes plus measurement bits.
    pub action: ActionFlags,

    /// Policy hits in match order.
    pub policies: Vec<PolicyHit>,
}

impl EndpointResponse {
    pub fn flow_log_policy_strings(&self) -> Vec<String> {
        flow_log_strings(&self.policies)
    }
}

/// Before and after responses for one flow leg.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeforeAfter {
    /// True when inclusion, action or the enforced policy path changed.
    pub modified: bool,
    pub before: EndpointResponse,
    pub after: EndpointResponse,
}

/// Computes the outcome of a flow leg before and after a proposed change.
///
/// Implementations must be safe to call from several tasks at once for
/// different flows. Compiled policy data is read-only after construction.
pub trait PolicyCalculator: Send + Sync {
    /// Calculate a source-reported leg (egress at the source endpoint).
    fn calculate_source(&self, flow: &Flow) -> BeforeAfter;

    /// Calculate a destination-reported leg (ingress at the destination).
    ///
    /// A before or after response is only produced when the matching source
    /// action includes allow; traffic denied at the source never reaches the
    /// destination.
    fn calculate_dest(
        &self,
        flow: &Flow,
        source_action_before: ActionFlags,
        source_action_after: ActionFlags,
    ) -> BeforeAfter;
}

/// Supplies stored flow records page by page.
///
/// Records must arrive ordered by source type, namespace and name, then
/// destination type, namespace and name, then protocol, addresses and ports,
/// then action and reporter. The pipeline relies on this order to detect
/// connection and flow boundaries.
#[async_trait]
pub trait FlowPager: Send {
    /// Return the next page, or `None` once the source is exhausted.
    ///
    /// An error ends the run; the pipeline forwards it after flushing the
    /// records it has already read.
    async fn next_page(&mut self) -> FlowsimResult<Option<Vec<FlowRecord>>>;
}

/// Visibility check and redaction for emitted buckets.
pub trait FlowFilter: Send + Sync {
    /// Whether the caller may see the flow described by `bucket`.
    ///
    /// Not called for impacted flows; those are always surfaced.
    fn include_flow(&self, bucket: &AggregationBucket) -> FlowsimResult<bool>;

    /// Redact fields the caller may not see.
    fn modify_flow(&self, bucket: &mut AggregationBucket) -> FlowsimResult<()>;
}

/// A `FlowFilter` that shows everything and redacts nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeAllFilter;

impl FlowFilter for IncludeAllFilter {
    fn include_flow(&self, _bucket: &AggregationBucket) -> FlowsimResult<bool> {
        Ok(true)
    }

    fn modify_flow(&self, _bucket: &mut AggregationBucket) -> FlowsimResult<()> {
        Ok(())
    }
}
