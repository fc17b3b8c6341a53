//! Flow records and the in-memory flow model used by the calculator.
//!
//! A `FlowRecord` is one stored, already aggregated L3 flow leg as read from
//! the log store. `Flow` is the view the calculator works on: every endpoint
//! attribute is optional because stored records frequently omit data.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::action::ActionFlags;
use crate::policy_hit::PolicyHit;

/// The kind of endpoint at one end of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// Workload endpoint (pod).
    Wep,
    /// Host endpoint.
    Hep,
    /// Network set.
    Ns,
    /// Plain network address.
    Net,
    #[default]
    #[serde(other)]
    Unknown,
}

impl EndpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointType::Wep => "wep",
            EndpointType::Hep => "hep",
            EndpointType::Ns => "ns",
            EndpointType::Net => "net",
            EndpointType::Unknown => "",
        }
    }
}

/// Which side of the connection observed the flow leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Reporter {
    #[default]
    #[serde(rename = "src")]
    Source,
    #[serde(rename = "dst")]
    Destination,
}

impl Reporter {
    pub fn as_str(self) -> &'static str {
        match self {
            Reporter::Source => "src",
            Reporter::Destination => "dst",
        }
    }
}

/// A named port exposed by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedPort {
    pub name: String,
    pub protocol: u8,
    pub port: u16,
}

/// One side of a flow. `None` means "not known", which is different from empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEndpointData {
    pub endpoint_type: EndpointType,
    pub namespace: String,
    /// Aggregated name, e.g. `pod1-*`.
    pub name: String,
    pub labels: Option<BTreeMap<String, String>>,
    pub ips: Option<Vec<IpAddr>>,
    pub port: Option<u16>,
    pub service_account: Option<String>,
    pub named_ports: Option<Vec<NamedPort>>,
}

impl FlowEndpointData {
    /// Workload and host endpoints are the ones the simulated policies manage.
    pub fn is_calico_managed(&self) -> bool {
        matches!(self.endpoint_type, EndpointType::Wep | EndpointType::Hep)
    }
}

/// A flow leg as seen by the calculator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Flow {
    pub reporter: Reporter,
    pub source: FlowEndpointData,
    pub destination: FlowEndpointData,
    /// Logged action; empty for synthesized legs.
    pub action: ActionFlags,
    pub proto: Option<u8>,
    pub ip_version: Option<u8>,
    pub policies: Vec<PolicyHit>,
}

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;
pub const PROTO_SCTP: u8 = 132;
pub const PROTO_UDPLITE: u8 = 136;

/// Map a protocol name or number to its IANA number.
pub fn protocol_number(proto: &str) -> Option<u8> {
    match proto.to_ascii_lowercase().as_str() {
        "tcp" => Some(PROTO_TCP),
        "udp" => Some(PROTO_UDP),
        "icmp" => Some(PROTO_ICMP),
        "icmpv6" | "icmp6" => Some(PROTO_ICMPV6),
        "sctp" => Some(PROTO_SCTP),
        "udplite" => Some(PROTO_UDPLITE),
        other => other.parse().ok(),
    }
}

// ── Stored records ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEndpoint {
    #[serde(rename = "type")]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub aggregated_name: String,
    /// Full, non-aggregated name when the store kept it.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub service_account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelValue {
    pub value: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLabel {
    pub key: String,
    pub values: Vec<LabelValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStats {
    pub flow_log_count: i64,
    pub started: i64,
    pub completed: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficStats {
    pub packets_in: i64,
    pub packets_out: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStats {
    pub allowed_in: i64,
    pub denied_in: i64,
}

/// One stored L3 flow leg.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub reporter: Reporter,
    pub action: String,
    pub protocol: String,
    pub source: RecordEndpoint,
    pub destination: RecordEndpoint,
    #[serde(default)]
    pub source_ips: Vec<String>,
    #[serde(default)]
    pub destination_ips: Vec<String>,
    #[serde(default)]
    pub source_labels: Vec<RecordLabel>,
    #[serde(default)]
    pub destination_labels: Vec<RecordLabel>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub log_stats: Option<LogStats>,
    #[serde(default)]
    pub traffic_stats: Option<TrafficStats>,
    #[serde(default)]
    pub http_stats: Option<HttpStats>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

/// Identifies one flow: the endpoints, ignoring ports, reporter and action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub source_type: String,
    pub source_namespace: String,
    pub source_name: String,
    pub dest_type: String,
    pub dest_namespace: String,
    pub dest_name: String,
}

/// Identifies one connection group: the flow plus protocol, addresses and ports.
/// Legs for the same connection differ only in reporter and action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub flow: FlowKey,
    pub proto: String,
    pub source_ip: String,
    pub source_name: String,
    pub source_port: i64,
    pub dest_ip: String,
    pub dest_name: String,
    pub dest_port: i64,
}

/// Store convention for an absent namespace.
pub fn empty_to_dash(s: &str) -> String {
    if s.is_empty() {
        "-".to_string()
    } else {
        s.to_string()
    }
}

fn dash_to_empty(s: &str) -> String {
    if s == "-" {
        String::new()
    } else {
        s.to_string()
    }
}

impl FlowRecord {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            source_type: self.source.endpoint_type.as_str().to_string(),
            source_namespace: empty_to_dash(&self.source.namespace),
            source_name: self.source.aggregated_name.clone(),
            dest_type: self.destination.endpoint_type.as_str().to_string(),
            dest_namespace: empty_to_dash(&self.destination.namespace),
            dest_name: self.destination.aggregated_name.clone(),
        }
    }

    pub fn connection_key(&self) -> ConnectionKey {
        ConnectionKey {
            flow: self.flow_key(),
            proto: self.protocol.clone(),
            source_ip: self.source_ips.join(","),
            source_name: self.source.name.clone().unwrap_or_default(),
            source_port: self.source.port,
            dest_ip: self.destination_ips.join(","),
            dest_name: self.destination.name.clone().unwrap_or_default(),
            dest_port: self.destination.port,
        }
    }

    pub fn doc_count(&self) -> i64 {
        self.log_stats.map(|s| s.flow_log_count).unwrap_or(0)
    }
}

fn parse_ips(raw: &[String]) -> Option<Vec<IpAddr>> {
    let ips: Vec<IpAddr> = raw
        .iter()
        .filter_map(|s| match s.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(ip = %s, "skipping unparsable flow IP");
                None
            }
        })
        .collect();
    if ips.is_empty() {
        None
    } else {
        Some(ips)
    }
}

fn single_valued_labels(labels: &[RecordLabel]) -> Option<BTreeMap<String, String>> {
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .filter(|l| l.values.len() == 1)
            .map(|l| (l.key.clone(), l.values[0].value.clone()))
            .collect(),
    )
}

fn endpoint_from_record(
    ep: &RecordEndpoint,
    ips: &[String],
    labels: &[RecordLabel],
) -> FlowEndpointData {
    FlowEndpointData {
        endpoint_type: ep.endpoint_type,
        namespace: dash_to_empty(&ep.namespace),
        name: ep.aggregated_name.clone(),
        labels: single_valued_labels(labels),
        ips: parse_ips(ips),
        port: u16::try_from(ep.port).ok().filter(|p| *p != 0),
        service_account: ep.service_account.clone(),
        named_ports: None,
    }
}

impl Flow {
    /// Build the calculator view of a stored record.
    ///
    /// Labels that were aggregated to more than one value are dropped.
    /// Policy strings that fail to parse are skipped with a warning.
    pub fn from_record(record: &FlowRecord) -> Flow {
        let source = endpoint_from_record(&record.source, &record.source_ips, &record.source_labels);
        let destination = endpoint_from_record(
            &record.destination,
            &record.destination_ips,
            &record.destination_labels,
        );

        let ip_version = source
            .ips
            .iter()
            .chain(destination.ips.iter())
            .flatten()
            .next()
            .map(|ip| if ip.is_ipv4() { 4 } else { 6 });

        let policies = record
            .policies
            .iter()
            .filter_map(|p| match PolicyHit::from_flow_log_str(p, record.doc_count().max(1)) {
                Ok(hit) => Some(hit),
                Err(e) => {
                    warn!(error = %e, "skipping malformed policy hit");
                    None
                }
            })
            .collect();

        Flow {
            reporter: record.reporter,
            source,
            destination,
            action: ActionFlags::from_action_str(&record.action).unwrap_or_default(),
            proto: protocol_number(&record.protocol),
            ip_version,
            policies,
        }
    }
}
