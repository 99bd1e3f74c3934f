//! Core domain models for workflow composition.
//!
//! These types are the source of truth for what a composed workflow looks
//! like in memory.  A [`WorkflowDefinition`] is immutable once composed and
//! serialisable, so an external persistence layer can snapshot it verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PatternType
// ---------------------------------------------------------------------------

/// The execution topology of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Sequential,
    Parallel,
    Loop,
    Orchestration,
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::Loop => write!(f, "loop"),
            Self::Orchestration => write!(f, "orchestration"),
        }
    }
}

// ---------------------------------------------------------------------------
// AggregationStrategy
// ---------------------------------------------------------------------------

/// How a parallel workflow folds its branch outputs into one result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// A mapping of node id to branch output.
    #[default]
    Combine,
    /// The first branch to succeed wins; later results are discarded.
    FirstSuccess,
    /// The majority-identical output among succeeded branches; a tie fails
    /// the aggregate.
    Vote,
}

// ---------------------------------------------------------------------------
// PatternConfig
// ---------------------------------------------------------------------------

/// Pattern-specific bounds and knobs, fixed at composition time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum PatternConfig {
    Sequential,
    Parallel {
        #[serde(default)]
        aggregation: AggregationStrategy,
    },
    Loop {
        /// Unconditional round ceiling; this is the termination guarantee.
        max_iterations: u32,
        /// Optional capability invoked with the last round's output; a
        /// truthy verdict ends the loop early.
        #[serde(default)]
        threshold_predicate: Option<String>,
    },
    Orchestration {
        /// The capability that decides the next delegation.
        router_capability: String,
        /// Hard delegation ceiling, enforced independently of the router.
        max_delegations: u32,
    },
}

impl PatternConfig {
    pub fn pattern_type(&self) -> PatternType {
        match self {
            Self::Sequential => PatternType::Sequential,
            Self::Parallel { .. } => PatternType::Parallel,
            Self::Loop { .. } => PatternType::Loop,
            Self::Orchestration { .. } => PatternType::Orchestration,
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityRef / NodeRef
// ---------------------------------------------------------------------------

/// A caller-supplied reference handed to the composer: which capability to
/// place in the workflow and (optionally) under what alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRef {
    pub capability_id: String,
    pub alias: Option<String>,
}

impl CapabilityRef {
    pub fn new(capability_id: impl Into<String>) -> Self {
        Self {
            capability_id: capability_id.into(),
            alias: None,
        }
    }

    pub fn aliased(capability_id: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            capability_id: capability_id.into(),
            alias: Some(alias.into()),
        }
    }
}

/// A resolved node inside a composed definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRef {
    /// The registered capability this node invokes.
    pub capability_id: String,
    /// Unique within the definition; collisions are suffixed at compose time.
    pub alias: String,
    /// Index in definition order (meaningful for sequential and loop).
    pub position: usize,
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A complete, validated workflow definition.
///
/// Immutable after composition — a later edit goes through
/// [`WorkflowComposer::revise`](crate::WorkflowComposer::revise) and produces
/// a new version, never an in-place mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: Uuid,
    pub name: String,
    pub version: u32,
    pub config: PatternConfig,
    pub nodes: Vec<NodeRef>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn pattern_type(&self) -> PatternType {
        self.config.pattern_type()
    }

    /// Find a node by alias, falling back to capability id.  This is the
    /// membership check applied to router decisions.
    pub fn node(&self, id: &str) -> Option<&NodeRef> {
        self.nodes
            .iter()
            .find(|n| n.alias == id)
            .or_else(|| self.nodes.iter().find(|n| n.capability_id == id))
    }
}
