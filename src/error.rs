//! Error types for slicequery

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// A single slice's failure inside a fan-out operation.
#[derive(Debug)]
pub struct SliceFailure {
    /// Slice that failed
    pub slice: String,
    /// The error raised on that slice
    pub error: Error,
}

impl std::fmt::Display for SliceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.slice, self.error)
    }
}

fn join_failures(failures: &[SliceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in the query and slice layers
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Query Errors
    // =========================================================================
    /// Query text could not be translated
    #[error("Failed to compile query \"{query}\": {reason}")]
    Compile { query: String, reason: String },

    /// Supplied arguments do not fit the compiled placeholder layout
    #[error("Cannot rebind parameter {parameter}: {reason}")]
    RebindMismatch { parameter: String, reason: String },

    /// Entity type is not in the metadata repository
    #[error("Unknown entity type: {0}")]
    UnknownEntity(String),

    /// Field is not declared on the entity
    #[error("Unknown field {field} on entity {entity}")]
    UnknownField { entity: String, field: String },

    // =========================================================================
    // Slice Errors
    // =========================================================================
    /// Slice name is not configured
    #[error("Unknown slice: {0}")]
    UnknownSlice(String),

    /// Slice exists but is not active
    #[error("Slice is not active: {0}")]
    SliceInactive(String),

    /// A distribution/replication policy returned an unusable target set
    #[error(
        "Policy {policy} returned {returned:?} for {instance}; active slices are {active:?}"
    )]
    PolicyViolation {
        policy: String,
        instance: String,
        returned: Vec<String>,
        active: Vec<String>,
    },

    /// A user policy raised an error while routing an instance
    #[error("Policy {policy} failed for {instance}: {source}")]
    PolicyFailed {
        policy: String,
        instance: String,
        #[source]
        source: Box<Error>,
    },

    /// One or more slices failed during a fan-out operation
    #[error("{operation} failed on {} slice(s): {}", .failures.len(), join_failures(.failures))]
    CrossSliceFailure {
        operation: String,
        failures: Vec<SliceFailure>,
    },

    /// The slice executor refused the submission
    #[error("Executor rejected {requested} task(s); {available} permit(s) available")]
    ExecutorRejected { requested: usize, available: usize },

    /// Slice data store error
    #[error("Store error on slice {slice}: {reason}")]
    Store { slice: String, reason: String },

    /// Broker transaction misuse
    #[error("Transaction error: {0}")]
    TransactionState(String),
}

impl Error {
    /// Shorthand for a rebind mismatch on a named parameter.
    pub fn rebind(parameter: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Error::RebindMismatch {
            parameter: parameter.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a compile failure.
    pub fn compile(query: &str, reason: impl Into<String>) -> Self {
        Error::Compile {
            query: query.to_string(),
            reason: reason.into(),
        }
    }

    /// Per-slice failures carried by a cross-slice error (empty otherwise).
    pub fn slice_failures(&self) -> &[SliceFailure] {
        match self {
            Error::CrossSliceFailure { failures, .. } => failures,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_slice_failure_keeps_every_cause() {
        let err = Error::CrossSliceFailure {
            operation: "flush".to_string(),
            failures: vec![
                SliceFailure {
                    slice: "east".to_string(),
                    error: Error::Store {
                        slice: "east".to_string(),
                        reason: "disk full".to_string(),
                    },
                },
                SliceFailure {
                    slice: "west".to_string(),
                    error: Error::SliceInactive("west".to_string()),
                },
            ],
        };

        let msg = err.to_string();
        assert!(msg.contains("2 slice(s)"));
        assert!(msg.contains("disk full"));
        assert!(msg.contains("west"));
        assert_eq!(err.slice_failures().len(), 2);
    }

    #[test]
    fn test_policy_violation_names_policy_and_instance() {
        let err = Error::PolicyViolation {
            policy: "round-robin".to_string(),
            instance: "Person#1".to_string(),
            returned: vec!["nowhere".to_string()],
            active: vec!["east".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("round-robin"));
        assert!(msg.contains("Person#1"));
        assert!(msg.contains("nowhere"));
    }
}
