//! The flow aggregation pipeline.
//!
//! One background task reads ordered pages of flow records, groups the legs
//! of each connection, runs them through the `PolicyCalculator`, and folds
//! the responses into before/after aggregation buckets. Two clock events
//! drive it:
//!
//!   connection key changes → calculate the buffered legs
//!   flow key changes       → filter, sort and emit the flow's buckets
//!
//! Results go to a bounded channel; at most one terminal error goes to a
//! second channel of capacity one. Both close when the task exits.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use flowsim_contracts::{
    action::ActionFlags,
    bucket::{AggregationBucket, BucketKey, RawFlowBucket},
    config::PreviewConfig,
    error::{FlowsimError, FlowsimResult},
    flow::{ConnectionKey, Flow, FlowKey, FlowRecord, Reporter},
};

use crate::traits::{EndpointResponse, FlowFilter, FlowPager, IncludeAllFilter, PolicyCalculator};

/// The buckets of one flow, before and after the proposed change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedFlows {
    pub before: Vec<AggregationBucket>,
    pub after: Vec<AggregationBucket>,
}

/// Configures and starts a pipeline run.
///
/// ```rust,ignore
/// let handle = FlowPipeline::new(calculator, PreviewConfig::default())
///     .with_limit(100)
///     .spawn(Box::new(pager));
/// let (flows, error) = handle.collect().await;
/// ```
pub struct FlowPipeline {
    calculator: Arc<dyn PolicyCalculator>,
    filter: Arc<dyn FlowFilter>,
    config: PreviewConfig,
    limit: usize,
    impacted_only: bool,
}

impl FlowPipeline {
    pub fn new(calculator: Arc<dyn PolicyCalculator>, config: PreviewConfig) -> Self {
        Self {
            calculator,
            filter: Arc::new(IncludeAllFilter),
            config,
            limit: usize::MAX,
            impacted_only: false,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn FlowFilter>) -> Self {
        self.filter = filter;
        self
    }

    /// Stop once this many "before" buckets have been sent.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Drop flows the change does not impact.
    pub fn impacted_only(mut self, impacted_only: bool) -> Self {
        self.impacted_only = impacted_only;
        self
    }

    /// Start the background task. Must be called within a tokio runtime.
    pub fn spawn(self, pager: Box<dyn FlowPager>) -> PipelineHandle {
        let run_id = Uuid::new_v4();
        let (results_tx, results_rx) = mpsc::channel(self.config.result_channel_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(PreviewConfig::ERROR_CHANNEL_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let run = PipelineRun {
            calculator: self.calculator,
            filter: self.filter,
            limit: self.limit,
            impacted_only: self.impacted_only,
            results: results_tx,
            errors: errors_tx,
            cancel: cancel_rx,
            sent: 0,
            state: FlowState::default(),
        };

        let span = info_span!("flow_pipeline", run_id = %run_id);
        let task = tokio::spawn(run.run(pager).instrument(span));

        PipelineHandle {
            run_id,
            results: results_rx,
            errors: errors_rx,
            cancel: cancel_tx,
            task,
        }
    }
}

/// The caller's side of a running pipeline.
pub struct PipelineHandle {
    run_id: Uuid,
    results: mpsc::Receiver<ProcessedFlows>,
    errors: mpsc::Receiver<FlowsimError>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The next emitted flow, or `None` once the pipeline has finished.
    pub async fn next(&mut self) -> Option<ProcessedFlows> {
        self.results.recv().await
    }

    /// Ask the pipeline to stop. A send blocked at the time reports
    /// `FlowsimError::Cancelled`.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait for the task to exit and return its terminal error, if any.
    /// Undelivered results are discarded.
    pub async fn finish(mut self) -> Option<FlowsimError> {
        self.results.close();
        while self.results.recv().await.is_some() {}
        let error = self.errors.recv().await;
        if let Err(e) = self.task.await {
            warn!(run_id = %self.run_id, error = %e, "flow pipeline task failed");
        }
        error
    }

    /// Drain every result, then return them with the terminal error.
    pub async fn collect(mut self) -> (Vec<ProcessedFlows>, Option<FlowsimError>) {
        let mut flows = Vec::new();
        while let Some(f) = self.results.recv().await {
            flows.push(f);
        }
        let error = self.finish().await;
        (flows, error)
    }
}

// ── Per-run state ────────────────────────────────────────────────────────────

struct Leg {
    flow: Flow,
    raw: RawFlowBucket,
}

/// The up-to-four legs of one connection group.
#[derive(Default)]
struct ConnectionGroup {
    src_allow: Option<Leg>,
    src_deny: Option<Leg>,
    dst_allow: Option<Leg>,
    dst_deny: Option<Leg>,
}

#[derive(Default)]
struct FlowState {
    last_flow_key: Option<FlowKey>,
    last_connection_key: Option<ConnectionKey>,
    group: ConnectionGroup,
    before: Vec<AggregationBucket>,
    after: Vec<AggregationBucket>,
    impacted: bool,
}

impl FlowState {
    fn add_leg(&mut self, record: &FlowRecord) {
        let flow = Flow::from_record(record);
        let reporter = flow.reporter;
        let action = flow.action;
        let leg = Leg {
            flow,
            raw: RawFlowBucket::from_record(record),
        };

        let slot = match (reporter, action) {
            (Reporter::Source, a) if a == ActionFlags::ALLOW => &mut self.group.src_allow,
            (Reporter::Source, a) if a == ActionFlags::DENY => &mut self.group.src_deny,
            (Reporter::Destination, a) if a == ActionFlags::ALLOW => &mut self.group.dst_allow,
            (Reporter::Destination, a) if a == ActionFlags::DENY => &mut self.group.dst_deny,
            _ => {
                debug!(action = %record.action, "ignoring record with unrecognised action");
                return;
            }
        };
        *slot = Some(leg);
    }

    /// Calculate the buffered legs: source deny, source allow, destination
    /// deny, destination allow. Destination legs are gated on the source
    /// actions calculated here.
    fn process_connection_group(&mut self, calc: &dyn PolicyCalculator) {
        let Some(flow_key) = self.last_flow_key.clone() else {
            return;
        };

        if let Some(leg) = self.group.src_deny.take() {
            debug!("calculating source denied leg");
            let src = calc.calculate_source(&leg.flow);
            self.impacted |= src.modified;
            aggregate_raw_flow_bucket(&mut self.before, Reporter::Source, &flow_key, &leg.raw, src.before.action, &src.before);
            aggregate_raw_flow_bucket(&mut self.after, Reporter::Source, &flow_key, &leg.raw, src.after.action, &src.after);

            // No destination record can exist for a denied leg, so one is
            // synthesized when either configuration now allows it.
            if leg.flow.destination.is_calico_managed()
                && (src.before.action | src.after.action).contains(ActionFlags::ALLOW)
            {
                debug!("calculating synthesized destination leg");
                let dest_flow = Flow {
                    reporter: Reporter::Destination,
                    source: leg.flow.source.clone(),
                    destination: leg.flow.destination.clone(),
                    action: ActionFlags::empty(),
                    proto: leg.flow.proto,
                    ip_version: leg.flow.ip_version,
                    policies: Vec::new(),
                };
                let dst = calc.calculate_dest(&dest_flow, src.before.action, src.after.action);
                aggregate_raw_flow_bucket(&mut self.before, Reporter::Destination, &flow_key, &leg.raw, src.before.action, &dst.before);
                aggregate_raw_flow_bucket(&mut self.after, Reporter::Destination, &flow_key, &leg.raw, src.after.action, &dst.after);
            }
        }

        let mut src_action_before = ActionFlags::ALLOW;
        let mut src_action_after = ActionFlags::ALLOW;
        if let Some(leg) = self.group.src_allow.take() {
            debug!("calculating source allowed leg");
            let src = calc.calculate_source(&leg.flow);
            self.impacted |= src.modified;
            aggregate_raw_flow_bucket(&mut self.before, Reporter::Source, &flow_key, &leg.raw, src.before.action, &src.before);
            aggregate_raw_flow_bucket(&mut self.after, Reporter::Source, &flow_key, &leg.raw, src.after.action, &src.after);
            src_action_before = src.before.action;
            src_action_after = src.after.action;
        }

        for leg in [self.group.dst_deny.take(), self.group.dst_allow.take()].into_iter().flatten() {
            debug!(action = %leg.flow.action.flow_action_str(), "calculating destination leg");
            let dst = calc.calculate_dest(&leg.flow, src_action_before, src_action_after);
            self.impacted |= dst.modified;
            aggregate_raw_flow_bucket(&mut self.before, Reporter::Destination, &flow_key, &leg.raw, src_action_before, &dst.before);
            aggregate_raw_flow_bucket(&mut self.after, Reporter::Destination, &flow_key, &leg.raw, src_action_after, &dst.after);
        }
    }
}

/// Fold one raw bucket into the cache entry for (reporter, action, source
/// action), creating it if needed. Calculated policy hits replace the raw
/// policy terms.
fn aggregate_raw_flow_bucket(
    cache: &mut Vec<AggregationBucket>,
    reporter: Reporter,
    flow_key: &FlowKey,
    raw: &RawFlowBucket,
    source_action: ActionFlags,
    resp: &EndpointResponse,
) {
    if !resp.include {
        return;
    }
    let action = resp.action.flow_action_str();
    let source_action = source_action.flow_action_str();

    let idx = match cache.iter().position(|b| b.key.matches(reporter, action, source_action)) {
        Some(idx) => idx,
        None => {
            cache.push(AggregationBucket::new(BucketKey::new(
                flow_key.clone(),
                reporter,
                action,
                source_action,
            )));
            cache.len() - 1
        }
    };

    let policies = (!resp.policies.is_empty()).then(|| resp.flow_log_policy_strings());
    cache[idx].aggregate(raw, policies.as_deref());
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        // Handle dropped without cancelling; the closed result channel ends the run.
        std::future::pending::<()>().await;
    }
}

struct PipelineRun {
    calculator: Arc<dyn PolicyCalculator>,
    filter: Arc<dyn FlowFilter>,
    limit: usize,
    impacted_only: bool,
    results: mpsc::Sender<ProcessedFlows>,
    errors: mpsc::Sender<FlowsimError>,
    cancel: watch::Receiver<bool>,
    sent: usize,
    state: FlowState,
}

impl PipelineRun {
    async fn run(mut self, mut pager: Box<dyn FlowPager>) {
        info!(limit = self.limit, impacted_only = self.impacted_only, "flow pipeline started");
        let mut page_error = None;

        loop {
            let page = tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => {
                    debug!("cancelled while reading flow records");
                    break;
                }
                page = pager.next_page() => page,
            };
            let records = match page {
                Ok(Some(records)) => records,
                Ok(None) => break,
                Err(e) => {
                    page_error = Some(e);
                    break;
                }
            };
            for record in &records {
                if self.ingest(record).await.is_break() {
                    return;
                }
            }
        }

        // ── Flush whatever the last flow accumulated ─────────────────────────
        self.state.process_connection_group(self.calculator.as_ref());
        if self.send_result().await.is_break() {
            return;
        }

        if let Some(e) = page_error {
            warn!(error = %e, "flow record source failed");
            let _ = self.errors.try_send(e);
        }
        info!(sent = self.sent, "flow pipeline finished");
    }

    async fn ingest(&mut self, record: &FlowRecord) -> ControlFlow<()> {
        let connection_key = record.connection_key();

        if self.state.last_connection_key.as_ref() != Some(&connection_key) {
            debug!("clocked to next connection");
            self.state.process_connection_group(self.calculator.as_ref());
            self.state.last_connection_key = Some(connection_key.clone());
        }

        if self.state.last_flow_key.as_ref() != Some(&connection_key.flow) {
            debug!("clocked to next flow");
            if self.send_result().await.is_break() {
                return ControlFlow::Break(());
            }
            self.state.last_flow_key = Some(connection_key.flow);
        }

        self.state.add_leg(record);
        ControlFlow::Continue(())
    }

    /// Emit the current flow's buckets. Breaks when the run must stop.
    async fn send_result(&mut self) -> ControlFlow<()> {
        let result = match self.take_result() {
            Ok(Some(result)) => result,
            Ok(None) => return ControlFlow::Continue(()),
            Err(e) => {
                warn!(error = %e, "flow filter failed");
                let _ = self.errors.try_send(e);
                return ControlFlow::Break(());
            }
        };
        let count = result.before.len();

        tokio::select! {
            biased;
            _ = cancelled(&mut self.cancel) => {
                let _ = self.errors.try_send(FlowsimError::Cancelled {
                    reason: "cancelled while sending results".to_string(),
                });
                return ControlFlow::Break(());
            }
            sent = self.results.send(result) => {
                if sent.is_err() {
                    debug!("result receiver dropped");
                    return ControlFlow::Break(());
                }
            }
        }

        self.sent += count;
        if self.sent >= self.limit {
            debug!(sent = self.sent, limit = self.limit, "result limit reached");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Package the current flow for sending. The bucket caches are always
    /// cleared, whatever the outcome.
    fn take_result(&mut self) -> FlowsimResult<Option<ProcessedFlows>> {
        let result = self.package_result();
        self.state.before.clear();
        self.state.after.clear();
        self.state.impacted = false;
        result
    }

    fn package_result(&mut self) -> FlowsimResult<Option<ProcessedFlows>> {
        let state = &mut self.state;
        if state.before.is_empty() && state.after.is_empty() {
            return Ok(None);
        }
        if self.impacted_only && !state.impacted {
            debug!("flow not impacted, skipping");
            return Ok(None);
        }

        if state.impacted {
            for b in state.before.iter_mut().chain(state.after.iter_mut()) {
                b.key.flow_impacted = true;
            }
        } else if let Some(first) = state.before.first().or_else(|| state.after.first()) {
            // All buckets of a flow share its endpoints, so one check covers them.
            if !self.filter.include_flow(first)? {
                debug!("flow filtered out");
                return Ok(None);
            }
        }

        for b in state.before.iter_mut().chain(state.after.iter_mut()) {
            self.filter.modify_flow(b)?;
        }

        state.before.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        state.after.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(Some(ProcessedFlows {
            before: state.before.drain(..).collect(),
            after: state.after.drain(..).collect(),
        }))
    }
}
