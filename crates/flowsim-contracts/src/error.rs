//! Error types for the flowsim simulator.
//!
//! All fallible operations return `FlowsimResult<T>`. Only two families of
//! error are fatal to a pipeline run (record source failures and flow filter
//! failures); the rest are reported to the caller that asked for the work.

use thiserror::Error;

/// The unified error type for flowsim.
#[derive(Debug, Error)]
pub enum FlowsimError {
    /// Reading the next page of flow records failed.
    #[error("flow record source failed: {reason}")]
    PageSource { reason: String },

    /// The RBAC visibility check or the redaction step failed for a bucket.
    #[error("flow filter failed: {reason}")]
    FlowFilter { reason: String },

    /// A logged policy hit string could not be parsed.
    #[error("invalid policy hit '{value}': {reason}")]
    InvalidPolicyHit { value: String, reason: String },

    /// A label selector expression could not be parsed.
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// Two resources of different kinds were compared for modification.
    #[error("resource kinds do not match: {before} != {after}")]
    ResourceMismatch { before: String, after: String },

    /// A proposed resource change cannot be applied.
    #[error("invalid resource change: {reason}")]
    InvalidChange { reason: String },

    /// A required configuration value is missing or invalid.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    /// The pipeline was cancelled while it had results left to deliver.
    #[error("pipeline cancelled: {reason}")]
    Cancelled { reason: String },
}

/// Convenience alias used throughout the flowsim crates.
pub type FlowsimResult<T> = Result<T, FlowsimError>;
