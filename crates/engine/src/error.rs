//! Engine-level error types (composition + execution).

use std::time::Duration;

use capabilities::CapabilityError;
use thiserror::Error;
use uuid::Uuid;

use crate::models::PatternType;

/// Errors raised at compose time, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// A node references a capability absent from the registry snapshot.
    #[error("workflow references unknown capability '{0}'")]
    UnresolvedCapability(String),

    /// A workflow needs at least one node to mean anything.
    #[error("{0} workflow requires at least one node")]
    EmptyWorkflow(PatternType),

    /// Loop workflows must carry an unconditional iteration ceiling.
    #[error("loop workflow requires max_iterations > 0")]
    MissingIterationBound,

    /// Orchestration workflows must carry a hard delegation ceiling.
    #[error("orchestration workflow requires max_delegations > 0")]
    MissingDelegationBound,

    /// The designated router capability is not registered.
    #[error("router capability '{0}' is not registered")]
    UnresolvedRouter(String),

    /// The threshold predicate capability is not registered.
    #[error("threshold predicate '{0}' is not registered")]
    UnresolvedPredicate(String),
}

/// Errors produced while driving an execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// No execution with this id was ever submitted.
    #[error("execution '{0}' not found")]
    ExecutionNotFound(Uuid),

    /// A referenced capability disappeared between compose and run time.
    /// Always fatal regardless of error policy — this is a
    /// definition-integrity failure, not a task failure.
    #[error("capability '{capability_id}' for node '{node_id}' is no longer registered")]
    CapabilityUnavailable {
        node_id: String,
        capability_id: String,
    },

    /// A node invocation failed terminally under the configured policy.
    #[error("node '{node_id}' failed: {error}")]
    NodeFailed {
        node_id: String,
        error: CapabilityError,
    },

    /// The orchestration router proposed an id outside the workflow's node
    /// set.  Always fatal.
    #[error("router proposed '{proposed}', which is not part of the workflow")]
    RouterContractViolation { proposed: String },

    /// The router itself failed to produce a decision.
    #[error("router failed: {0}")]
    RouterFailed(CapabilityError),

    /// The whole execution ran past its deadline.
    #[error("execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    /// A first-success or vote aggregate had nothing to work with.
    #[error("no parallel branch produced a successful result")]
    NoSuccessfulBranch,

    /// A vote aggregate ended with two or more outputs tied for the lead.
    #[error("parallel vote ended in a tie")]
    VoteTied,
}

impl EngineError {
    /// The node this error is pinned to, when there is one.  Surfaced in the
    /// execution trace so callers see exactly where a run died.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::CapabilityUnavailable { node_id, .. } | Self::NodeFailed { node_id, .. } => {
                Some(node_id)
            }
            _ => None,
        }
    }
}
