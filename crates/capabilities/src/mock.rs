//! `MockCapability` — a test double for `Capability`.
//!
//! Useful in unit and integration tests where a real capability (an HTTP
//! tool, a model-backed agent, …) is either unavailable or irrelevant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{Capability, CapabilityError, InvocationContext};

/// Behaviour injected into `MockCapability` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Return the scripted values in order, verbatim (the last one repeats).
    Script(Vec<Value>),
    /// Always fail with an invocation error.
    Fail(String),
    /// Fail the first `failures` calls, then succeed with `then`.
    FailTimes { failures: u32, then: Value },
    /// Sleep for `delay`, then succeed with `then`.
    Sleep { delay: Duration, then: Value },
}

/// A mock capability that records every call it receives and returns a
/// programmer-specified result.
pub struct MockCapability {
    /// Label used in test assertions; merged into object outputs.
    pub name: String,
    /// What the capability will do when `invoke` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this capability (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockCapability {
    fn with(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that answers successive calls with successive values.
    pub fn scripted(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self::with(name, MockBehaviour::Script(values))
    }

    /// Create a mock that always fails.
    pub fn failing(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with(name, MockBehaviour::Fail(msg.into()))
    }

    /// Create a mock that fails `failures` times, then succeeds with `then`.
    pub fn flaky(name: impl Into<String>, failures: u32, then: Value) -> Self {
        Self::with(name, MockBehaviour::FailTimes { failures, then })
    }

    /// Create a mock that sleeps before succeeding with `then`.
    pub fn sleeping(name: impl Into<String>, delay: Duration, then: Value) -> Self {
        Self::with(name, MockBehaviour::Sleep { delay, then })
    }

    /// Number of times this capability has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Tag object outputs with the capability name so tests can trace the
    /// data flowing through a workflow; non-object values pass through.
    fn tagged(&self, value: &Value) -> Value {
        match value.as_object() {
            Some(obj) => {
                let mut out = json!({ "capability": self.name });
                let out_obj = out.as_object_mut().unwrap();
                for (k, v) in obj {
                    out_obj.insert(k.clone(), v.clone());
                }
                out
            }
            None => value.clone(),
        }
    }
}

#[async_trait]
impl Capability for MockCapability {
    async fn invoke(&self, input: Value, _ctx: &InvocationContext) -> Result<Value, CapabilityError> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(input);
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(self.tagged(v)),
            MockBehaviour::Script(values) => {
                let value = values
                    .get(call_number - 1)
                    .or_else(|| values.last())
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(value)
            }
            MockBehaviour::Fail(msg) => Err(CapabilityError::Invocation(msg.clone())),
            MockBehaviour::FailTimes { failures, then } => {
                if call_number as u32 <= *failures {
                    Err(CapabilityError::Invocation(format!(
                        "{} transient failure {call_number}",
                        self.name
                    )))
                } else {
                    Ok(self.tagged(then))
                }
            }
            MockBehaviour::Sleep { delay, then } => {
                tokio::time::sleep(*delay).await;
                Ok(self.tagged(then))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InvocationContext {
        InvocationContext {
            workflow_id: uuid::Uuid::new_v4(),
            execution_id: uuid::Uuid::new_v4(),
            node_id: "test".into(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn flaky_mock_recovers_after_failures() {
        let cap = MockCapability::flaky("flaky", 2, json!({ "ok": true }));
        let ctx = ctx();

        assert!(cap.invoke(json!({}), &ctx).await.is_err());
        assert!(cap.invoke(json!({}), &ctx).await.is_err());

        let out = cap.invoke(json!({}), &ctx).await.expect("third call succeeds");
        assert_eq!(out["ok"], true);
        assert_eq!(out["capability"], "flaky");
        assert_eq!(cap.call_count(), 3);
    }

    #[tokio::test]
    async fn scripted_mock_replays_values_in_order() {
        let cap = MockCapability::scripted("seq", vec![json!(false), json!(true)]);
        let ctx = ctx();

        assert_eq!(cap.invoke(json!({}), &ctx).await.unwrap(), json!(false));
        assert_eq!(cap.invoke(json!({}), &ctx).await.unwrap(), json!(true));
        // Past the end of the script the last value repeats.
        assert_eq!(cap.invoke(json!({}), &ctx).await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn non_object_outputs_pass_through_untagged() {
        let cap = MockCapability::returning("scalar", json!(41));
        let out = cap.invoke(json!({}), &ctx()).await.unwrap();
        assert_eq!(out, json!(41));
    }
}
