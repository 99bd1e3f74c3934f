//! The `Capability` trait — the contract every invocable unit must fulfil.

use async_trait::async_trait;
use serde_json::Value;

use crate::CapabilityError;

/// Per-invocation metadata passed to every capability.
///
/// Defined here (in the capabilities crate) so both the engine and individual
/// capability implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// ID of the workflow definition being executed.
    pub workflow_id: uuid::Uuid,
    /// ID of the current execution run.
    pub execution_id: uuid::Uuid,
    /// Output key of the node this invocation belongs to.
    pub node_id: String,
    /// 1-based attempt number (greater than 1 only under a retry policy).
    pub attempt: u32,
}

/// The core capability trait.
///
/// The contract is exactly `invoke(input, context) -> output | error`.  The
/// engine never cares whether the call stays in-process or crosses a
/// subprocess or network boundary.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Invoke the capability with the coordinator-prepared JSON `input` and
    /// return this capability's JSON output.
    async fn invoke(
        &self,
        input: Value,
        ctx: &InvocationContext,
    ) -> Result<Value, CapabilityError>;
}
