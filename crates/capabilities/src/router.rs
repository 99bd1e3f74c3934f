//! The `OrchestratorRouter` contract and its capability-backed adapter.
//!
//! The engine is agnostic to the decision mechanism — a rule table and a
//! model-backed router look identical through this trait.  The engine only
//! validates the returned id against the workflow's catalog and enforces the
//! delegation ceiling; both of those live on the engine side.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{Capability, CapabilityError, InvocationContext};

/// One entry of the catalog handed to the router: a node the workflow is
/// allowed to delegate to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Node alias, unique within the workflow definition.
    pub alias: String,
    /// The registered capability this node resolves to.
    pub capability_id: String,
}

/// One completed delegation, appended to the history after every node
/// invocation so the router can see what already happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationRecord {
    /// Output key of the invoked node.
    pub node_id: String,
    /// Whether the invocation succeeded.
    pub succeeded: bool,
    /// The node's output (or an `{"error": …}` object on failure).
    pub output: Value,
}

/// What the router wants the engine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterDecision {
    /// Invoke the node identified by this alias or capability id.
    Delegate(String),
    /// The task is finished; stop delegating.
    Done,
}

/// Decides the next node of an orchestration workflow.
#[async_trait]
pub trait OrchestratorRouter: Send + Sync {
    /// Pick the next delegation for `task` given the allowed `catalog` and
    /// the `history` of delegations performed so far.
    async fn decide(
        &self,
        task: &Value,
        catalog: &[CatalogEntry],
        history: &[DelegationRecord],
    ) -> Result<RouterDecision, CapabilityError>;
}

/// Adapter that turns a registered capability into an [`OrchestratorRouter`].
///
/// The capability receives a `{"task", "catalog", "history"}` object and must
/// answer with `{"next": "<id>"}`, the string `"DONE"`, or `{"done": true}`.
/// Anything else is reported as an invocation error.
pub struct CapabilityRouter {
    handler: Arc<dyn Capability>,
    ctx: InvocationContext,
}

impl CapabilityRouter {
    pub fn new(handler: Arc<dyn Capability>, ctx: InvocationContext) -> Self {
        Self { handler, ctx }
    }

    fn parse_decision(value: &Value) -> Option<RouterDecision> {
        if value.as_str() == Some("DONE") {
            return Some(RouterDecision::Done);
        }
        if value.get("done").and_then(Value::as_bool) == Some(true) {
            return Some(RouterDecision::Done);
        }
        value
            .get("next")
            .and_then(Value::as_str)
            .map(|id| RouterDecision::Delegate(id.to_owned()))
    }
}

#[async_trait]
impl OrchestratorRouter for CapabilityRouter {
    async fn decide(
        &self,
        task: &Value,
        catalog: &[CatalogEntry],
        history: &[DelegationRecord],
    ) -> Result<RouterDecision, CapabilityError> {
        let payload = json!({
            "task": task,
            "catalog": catalog,
            "history": history,
        });

        let mut ctx = self.ctx.clone();
        ctx.attempt = history.len() as u32 + 1;

        let answer = self.handler.invoke(payload, &ctx).await?;

        Self::parse_decision(&answer).ok_or_else(|| {
            CapabilityError::Invocation(format!("malformed router decision: {answer}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_string_and_flag_both_parse() {
        assert_eq!(
            CapabilityRouter::parse_decision(&json!("DONE")),
            Some(RouterDecision::Done)
        );
        assert_eq!(
            CapabilityRouter::parse_decision(&json!({ "done": true })),
            Some(RouterDecision::Done)
        );
    }

    #[test]
    fn next_field_parses_to_delegate() {
        assert_eq!(
            CapabilityRouter::parse_decision(&json!({ "next": "cleaner" })),
            Some(RouterDecision::Delegate("cleaner".into()))
        );
    }

    #[test]
    fn malformed_decision_is_rejected() {
        assert_eq!(CapabilityRouter::parse_decision(&json!({ "done": false })), None);
        assert_eq!(CapabilityRouter::parse_decision(&json!(42)), None);
    }
}
