//! Per-run execution state: the context record and node results.
//!
//! An [`ExecutionContext`] is exclusively owned by its coordinating task;
//! `status`/`trace` hand out point-in-time clones.  The whole record is
//! serialisable so a persistence layer can archive completed runs.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ExecutionStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Initialized,
    Running,
    Completed,
    /// Finished, but at least one node failed under `continue_on_error`.
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Initialized | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::CompletedWithErrors => write!(f, "completed_with_errors"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeStatus / NodeResult
// ---------------------------------------------------------------------------

/// Lifecycle of a single node within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// The settled record of one node invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// 1-based attempt count of the final invocation (0 for skipped nodes).
    pub attempt: u32,
}

impl NodeResult {
    pub fn succeeded(output: Value, started_at: DateTime<Utc>, attempt: u32) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            output: Some(output),
            error: None,
            started_at,
            ended_at: Some(Utc::now()),
            attempt,
        }
    }

    pub fn failed(error: String, started_at: DateTime<Utc>, attempt: u32) -> Self {
        Self {
            status: NodeStatus::Failed,
            output: None,
            error: Some(error),
            started_at,
            ended_at: Some(Utc::now()),
            attempt,
        }
    }

    pub fn skipped() -> Self {
        let now = Utc::now();
        Self {
            status: NodeStatus::Skipped,
            output: None,
            error: None,
            started_at: now,
            ended_at: Some(now),
            attempt: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable per-run record: global state, node outputs, and the path taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    /// Accumulated key/value state, written only by the coordinator.
    pub global_context: serde_json::Map<String, Value>,
    /// Settled node records, write-once per key.
    pub node_outputs: HashMap<String, NodeResult>,
    /// Every node invocation in start order, append-only.
    pub execution_path: Vec<String>,
    /// Nodes currently in flight.
    pub active_nodes: HashSet<String>,
    /// Final aggregate/last-node output of a completed run.
    pub output: Option<Value>,
    /// The most specific terminal error, when the run did not complete.
    pub error: Option<String>,
    /// The node the terminal error is pinned to, when there is one.
    pub failed_node: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Invocations seen per alias, used to suffix repeat visits.
    #[serde(skip)]
    invocation_counts: HashMap<String, u32>,
}

impl ExecutionContext {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Initialized,
            global_context: serde_json::Map::new(),
            node_outputs: HashMap::new(),
            execution_path: Vec::new(),
            active_nodes: HashSet::new(),
            output: None,
            error: None,
            failed_node: None,
            started_at: Utc::now(),
            ended_at: None,
            invocation_counts: HashMap::new(),
        }
    }

    /// The output key for the next visit to `alias`: the bare alias first,
    /// then `alias#2`, `alias#3`, … — this keeps `node_outputs` write-once
    /// per key when loop rounds or repeated delegations revisit a node.
    fn next_key(&mut self, alias: &str) -> String {
        let count = self.invocation_counts.entry(alias.to_owned()).or_insert(0);
        *count += 1;
        if *count == 1 {
            alias.to_owned()
        } else {
            format!("{alias}#{count}")
        }
    }

    /// Record that a node invocation is starting; returns its output key.
    pub fn begin_node(&mut self, alias: &str) -> String {
        let key = self.next_key(alias);
        self.active_nodes.insert(key.clone());
        self.execution_path.push(key.clone());
        key
    }

    /// Settle a node under its output key.  A second write to the same key
    /// is a coordinator bug; the first result wins.
    pub fn settle_node(&mut self, key: &str, result: NodeResult) {
        self.active_nodes.remove(key);
        if self.node_outputs.contains_key(key) {
            warn!(node = %key, "duplicate settle for node output key ignored");
            return;
        }
        self.node_outputs.insert(key.to_owned(), result);
    }

    /// Mark a node that will never start as skipped.
    pub fn skip_node(&mut self, alias: &str) {
        let key = self.next_key(alias);
        self.node_outputs.insert(key, NodeResult::skipped());
    }

    /// Fold an object output into the global context; scalars are carried
    /// between nodes but never pollute the shared map.
    pub fn merge_global(&mut self, value: &Value) {
        if let Some(obj) = value.as_object() {
            for (k, v) in obj {
                self.global_context.insert(k.clone(), v.clone());
            }
        }
    }
}
