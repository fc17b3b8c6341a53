//! Aggregation buckets returned to the caller.
//!
//! A raw bucket holds the statistics of one stored record. Raw buckets are
//! folded into aggregation buckets keyed by flow, reporter, calculated action
//! and source action.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flow::{FlowKey, FlowRecord, Reporter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatedSums {
    pub num_flows_started: f64,
    pub num_flows_completed: f64,
    pub packets_in: f64,
    pub packets_out: f64,
    pub bytes_in: f64,
    pub bytes_out: f64,
    pub http_requests_allowed_in: f64,
    pub http_requests_denied_in: f64,
}

impl AggregatedSums {
    fn add(&mut self, other: &AggregatedSums) {
        self.num_flows_started += other.num_flows_started;
        self.num_flows_completed += other.num_flows_completed;
        self.packets_in += other.packets_in;
        self.packets_out += other.packets_out;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.http_requests_allowed_in += other.http_requests_allowed_in;
        self.http_requests_denied_in += other.http_requests_denied_in;
    }
}

/// Frequency tables, term value to count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatedTerms {
    pub source_labels: BTreeMap<String, i64>,
    pub dest_labels: BTreeMap<String, i64>,
    pub policies: BTreeMap<String, i64>,
}

fn merge_terms(into: &mut BTreeMap<String, i64>, from: &BTreeMap<String, i64>) {
    for (term, count) in from {
        *into.entry(term.clone()).or_insert(0) += count;
    }
}

/// Statistics of one stored record, before aggregation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFlowBucket {
    pub doc_count: i64,
    pub sums: AggregatedSums,
    pub terms: AggregatedTerms,
}

impl RawFlowBucket {
    /// Labels are recorded as `key=value` terms. Policy terms start empty and
    /// are filled from the calculated response when it is aggregated.
    pub fn from_record(record: &FlowRecord) -> Self {
        let mut raw = RawFlowBucket::default();

        if let Some(stats) = record.log_stats {
            raw.doc_count = stats.flow_log_count;
            raw.sums.num_flows_started = stats.started as f64;
            raw.sums.num_flows_completed = stats.completed as f64;
        }
        if let Some(stats) = record.traffic_stats {
            raw.sums.packets_in = stats.packets_in as f64;
            raw.sums.packets_out = stats.packets_out as f64;
            raw.sums.bytes_in = stats.bytes_in as f64;
            raw.sums.bytes_out = stats.bytes_out as f64;
        }
        if let Some(stats) = record.http_stats {
            raw.sums.http_requests_allowed_in = stats.allowed_in as f64;
            raw.sums.http_requests_denied_in = stats.denied_in as f64;
        }

        for label in &record.source_labels {
            for v in &label.values {
                raw.terms.source_labels.insert(format!("{}={}", label.key, v.value), v.count);
            }
        }
        for label in &record.destination_labels {
            for v in &label.values {
                raw.terms.dest_labels.insert(format!("{}={}", label.key, v.value), v.count);
            }
        }
        raw
    }
}

/// Grouping key of an aggregation bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketKey {
    #[serde(flatten)]
    pub flow: FlowKey,
    pub reporter: Reporter,
    pub action: String,
    pub source_action: String,
    pub flow_impacted: bool,
}

impl BucketKey {
    pub fn new(flow: FlowKey, reporter: Reporter, action: &str, source_action: &str) -> Self {
        Self {
            flow,
            reporter,
            action: action.to_string(),
            source_action: source_action.to_string(),
            flow_impacted: false,
        }
    }

    /// Whether a raw bucket with these values belongs in this bucket.
    pub fn matches(&self, reporter: Reporter, action: &str, source_action: &str) -> bool {
        self.reporter == reporter && self.action == action && self.source_action == source_action
    }
}

/// An aggregated set of records sharing one bucket key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationBucket {
    pub key: BucketKey,
    pub doc_count: i64,
    pub sums: AggregatedSums,
    pub terms: AggregatedTerms,
}

impl AggregationBucket {
    pub fn new(key: BucketKey) -> Self {
        Self {
            key,
            doc_count: 0,
            sums: AggregatedSums::default(),
            terms: AggregatedTerms::default(),
        }
    }

    /// Fold a raw bucket in. When `policies` is given it replaces the raw
    /// bucket's policy terms, each counted once per raw document.
    pub fn aggregate(&mut self, raw: &RawFlowBucket, policies: Option<&[String]>) {
        self.doc_count += raw.doc_count;
        self.sums.add(&raw.sums);
        merge_terms(&mut self.terms.source_labels, &raw.terms.source_labels);
        merge_terms(&mut self.terms.dest_labels, &raw.terms.dest_labels);
        match policies {
            Some(policies) => {
                for p in policies {
                    *self.terms.policies.entry(p.clone()).or_insert(0) += raw.doc_count;
                }
            }
            None => merge_terms(&mut self.terms.policies, &raw.terms.policies),
        }
    }

    /// Sort key used when a flow's buckets are emitted.
    pub fn sort_key(&self) -> (&'static str, &str, &str) {
        (
            self.key.reporter.as_str(),
            self.key.action.as_str(),
            self.key.source_action.as_str(),
        )
    }
}
