//! # flowsim-policycalc
//!
//! The policy evaluation engine behind flowsim.
//!
//! A configuration snapshot (tiers of ordered policies plus namespaces and
//! service accounts) is compiled once into three-valued matchers. Each flow
//! leg is then evaluated against the snapshot before and after a proposed
//! change:
//!
//! - `selector`: label selector parsing and per-flow cached evaluation
//! - `namespace`: namespace and service account selector lookups
//! - `matcher`: rules compiled into `MatchType` predicates
//! - `policy`: compiled policies for one direction
//! - `tier`: tiered evaluation and logged-hit corroboration
//! - `calculator`: the `PolicyCalculator` used by the pipeline
//! - `preview`: applying proposed changes to a snapshot
//! - `endpoint_cache`: endpoint data used to complete flow records
//!
//! Missing flow data never fails a calculation. It widens the result to
//! several possible actions instead.

pub mod calculator;
pub mod endpoint_cache;
pub mod hits;
pub mod match_type;
pub mod matcher;
pub mod namespace;
pub mod policy;
pub mod preview;
pub mod selector;
pub mod tier;

pub use calculator::FlowPolicyCalculator;
pub use endpoint_cache::{EndpointCache, EndpointResource, EndpointUpdate};
pub use match_type::MatchType;
pub use preview::{apply_policy_changes, is_resource_modified};
