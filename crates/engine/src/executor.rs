//! The workflow execution engine.
//!
//! `WorkflowEngine` accepts composed definitions and drives them to a
//! terminal status:
//! 1. `submit` spawns one coordinating task per execution and returns its id
//!    immediately.
//! 2. The coordinator walks the definition according to its pattern,
//!    dispatching each node through the `Capability` trait.
//! 3. Sequential and loop keep exactly one node in flight; parallel fans out
//!    one semaphore-bounded task per branch and joins them; orchestration
//!    re-queries the router between delegations.
//! 4. Failures are recovered per the configured `ErrorPolicy`, with
//!    exponential backoff under `Retry`.
//! 5. Cancellation is cooperative: a watch signal makes every suspension
//!    point stop waiting, and late handler results are discarded instead of
//!    written to the trace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use capabilities::router::CatalogEntry;
use capabilities::{
    Capability, CapabilityError, CapabilityRouter, DelegationRecord, InvocationContext,
    OrchestratorRouter, RouterDecision,
};
use registry::CapabilityRegistry;

use crate::context::{ExecutionContext, ExecutionStatus, NodeResult, NodeStatus};
use crate::error::EngineError;
use crate::models::{AggregationStrategy, NodeRef, PatternConfig, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How an execution reacts to a failing node.  One uniform contract across
/// all four patterns.
#[derive(Debug, Clone)]
pub enum ErrorPolicy {
    /// First failure ends the execution; remaining nodes are skipped.
    StopOnError,
    /// Record the failure as that node's output and keep going; the final
    /// status becomes `CompletedWithErrors`.
    ContinueOnError,
    /// Re-invoke the failing node with exponential backoff, then stop once
    /// the budget is exhausted.
    Retry {
        max_retries: u32,
        base_delay: Duration,
    },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::StopOnError
    }
}

impl ErrorPolicy {
    fn continues_after_failure(&self) -> bool {
        matches!(self, Self::ContinueOnError)
    }

    fn retry_budget(&self) -> (u32, Duration) {
        match self {
            Self::Retry {
                max_retries,
                base_delay,
            } => (*max_retries, *base_delay),
            _ => (0, Duration::ZERO),
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub error_policy: ErrorPolicy,
    /// Deadline for the whole execution.
    pub timeout: Option<Duration>,
    /// Deadline for each individual node invocation.
    pub node_timeout: Option<Duration>,
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ceiling on concurrently running parallel branches, across all
    /// executions sharing this engine.
    pub max_parallel_branches: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_branches: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct ExecutionHandle {
    ctx: Arc<Mutex<ExecutionContext>>,
    cancel: watch::Sender<bool>,
}

/// Drives workflow executions; owns the per-execution state machines.
///
/// The registry is read-shared: every node resolution goes through a
/// lock-free snapshot, so a concurrent `reload` never blocks executions.
pub struct WorkflowEngine {
    registry: Arc<CapabilityRegistry>,
    executions: Arc<RwLock<HashMap<Uuid, ExecutionHandle>>>,
    branch_permits: Arc<Semaphore>,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<CapabilityRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            executions: Arc::new(RwLock::new(HashMap::new())),
            branch_permits: Arc::new(Semaphore::new(config.max_parallel_branches)),
        }
    }

    /// Start an execution asynchronously and return its id immediately.
    #[instrument(skip(self, definition, input, options), fields(workflow_id = %definition.id))]
    pub fn submit(
        &self,
        definition: WorkflowDefinition,
        input: Value,
        options: ExecuteOptions,
    ) -> Uuid {
        let ctx = ExecutionContext::new(definition.id);
        let execution_id = ctx.execution_id;
        let ctx = Arc::new(Mutex::new(ctx));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        self.executions
            .write()
            .expect("executions lock poisoned")
            .insert(
                execution_id,
                ExecutionHandle {
                    ctx: Arc::clone(&ctx),
                    cancel: cancel_tx,
                },
            );

        let coordinator = Coordinator {
            registry: Arc::clone(&self.registry),
            ctx,
            cancel: cancel_rx,
            permits: Arc::clone(&self.branch_permits),
            execution_id,
            definition,
            input,
            options,
        };
        tokio::spawn(coordinator.run());

        info!(%execution_id, "execution submitted");
        execution_id
    }

    /// Cooperatively cancel an execution.  Handlers already invoked are not
    /// force-killed; their eventual results are discarded.
    pub fn cancel(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let guard = self.executions.read().expect("executions lock poisoned");
        let handle = guard
            .get(&execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        handle.cancel.send_replace(true);
        info!(%execution_id, "cancellation requested");
        Ok(())
    }

    /// Point-in-time copy of an execution's full context; safe to call while
    /// the execution is running.
    pub fn trace(&self, execution_id: Uuid) -> Result<ExecutionContext, EngineError> {
        let guard = self.executions.read().expect("executions lock poisoned");
        let handle = guard
            .get(&execution_id)
            .ok_or(EngineError::ExecutionNotFound(execution_id))?;
        let ctx = handle.ctx.lock().expect("execution context poisoned");
        Ok(ctx.clone())
    }

    /// Current status of an execution.
    pub fn status(&self, execution_id: Uuid) -> Result<ExecutionStatus, EngineError> {
        Ok(self.trace(execution_id)?.status)
    }

    /// Block until the execution reaches a terminal status and return its
    /// final trace.
    pub async fn wait(&self, execution_id: Uuid) -> Result<ExecutionContext, EngineError> {
        loop {
            let trace = self.trace(execution_id)?;
            if trace.status.is_terminal() {
                return Ok(trace);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator — one per execution
// ---------------------------------------------------------------------------

/// What a finished pattern driver hands back to `finalize`.
struct Outcome {
    status: ExecutionStatus,
    output: Option<Value>,
}

impl Outcome {
    fn cancelled() -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            output: None,
        }
    }

    fn finished(any_failed: bool, output: Value) -> Self {
        let status = if any_failed {
            ExecutionStatus::CompletedWithErrors
        } else {
            ExecutionStatus::Completed
        };
        Self {
            status,
            output: Some(output),
        }
    }
}

/// How one sequence pass (the whole workflow, or one loop round) ended.
enum SequenceOutcome {
    Finished { carry: Value, any_failed: bool },
    Cancelled,
}

/// How a single node invocation settled.
enum NodeOutcome {
    Succeeded(Value),
    Failed { key: String, error: CapabilityError },
    Cancelled,
}

struct Coordinator {
    registry: Arc<CapabilityRegistry>,
    ctx: Arc<Mutex<ExecutionContext>>,
    cancel: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
    execution_id: Uuid,
    definition: WorkflowDefinition,
    input: Value,
    options: ExecuteOptions,
}

impl Coordinator {
    #[instrument(
        skip(self),
        fields(execution_id = %self.execution_id, pattern = %self.definition.pattern_type())
    )]
    async fn run(self) {
        {
            let mut ctx = self.ctx.lock().expect("execution context poisoned");
            ctx.status = ExecutionStatus::Running;
        }

        let result = match self.options.timeout {
            Some(limit) => match timeout(limit, self.drive()).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::ExecutionTimeout(limit)),
            },
            None => self.drive().await,
        };

        self.finalize(result);
    }

    async fn drive(&self) -> Result<Outcome, EngineError> {
        match self.definition.config.clone() {
            PatternConfig::Sequential => {
                match self.run_sequence(&self.definition.nodes, self.input.clone()).await? {
                    SequenceOutcome::Cancelled => Ok(Outcome::cancelled()),
                    SequenceOutcome::Finished { carry, any_failed } => {
                        Ok(Outcome::finished(any_failed, carry))
                    }
                }
            }
            PatternConfig::Parallel { aggregation } => self.run_parallel(aggregation).await,
            PatternConfig::Loop {
                max_iterations,
                threshold_predicate,
            } => self.run_loop(max_iterations, threshold_predicate.as_deref()).await,
            PatternConfig::Orchestration {
                router_capability,
                max_delegations,
            } => self.run_orchestration(&router_capability, max_delegations).await,
        }
    }

    fn finalize(&self, result: Result<Outcome, EngineError>) {
        let mut ctx = self.ctx.lock().expect("execution context poisoned");
        if ctx.status.is_terminal() {
            return;
        }
        ctx.active_nodes.clear();
        ctx.ended_at = Some(Utc::now());

        match result {
            Ok(outcome) => {
                ctx.status = outcome.status;
                ctx.output = outcome.output;
                info!(execution_id = %self.execution_id, status = %ctx.status, "execution finished");
            }
            Err(err) => {
                ctx.status = ExecutionStatus::Failed;
                ctx.failed_node = err.node_id().map(str::to_owned);
                ctx.error = Some(err.to_string());
                error!(execution_id = %self.execution_id, %err, "execution failed");
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Build a node's input: an object carry is merged over the global
    /// context (carry wins); anything else passes through verbatim.
    fn node_input(&self, carry: &Value) -> Value {
        match carry.as_object() {
            Some(obj) => {
                let ctx = self.ctx.lock().expect("execution context poisoned");
                let mut merged = ctx.global_context.clone();
                for (k, v) in obj {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            None => carry.clone(),
        }
    }

    fn lookup_handler(
        &self,
        node_id: &str,
        capability_id: &str,
    ) -> Result<Arc<dyn Capability>, EngineError> {
        self.registry
            .lookup(capability_id)
            .map(|descriptor| descriptor.handler)
            .map_err(|_| EngineError::CapabilityUnavailable {
                node_id: node_id.to_owned(),
                capability_id: capability_id.to_owned(),
            })
    }

    // -----------------------------------------------------------------------
    // Single-node invocation with retry (sequential / loop / orchestration)
    // -----------------------------------------------------------------------

    async fn invoke_node(&self, node: &NodeRef, input: Value) -> Result<NodeOutcome, EngineError> {
        let handler = self.lookup_handler(&node.alias, &node.capability_id)?;
        let key = {
            let mut ctx = self.ctx.lock().expect("execution context poisoned");
            ctx.begin_node(&node.alias)
        };

        let (max_retries, base_delay) = self.options.error_policy.retry_budget();
        let node_timeout = self.options.node_timeout;
        let started = Utc::now();
        let mut cancel = self.cancel.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let ictx = InvocationContext {
                workflow_id: self.definition.id,
                execution_id: self.execution_id,
                node_id: key.clone(),
                attempt,
            };

            let call = handler.invoke(input.clone(), &ictx);
            let guarded = async {
                match node_timeout {
                    Some(limit) => match timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(CapabilityError::Timeout(limit)),
                    },
                    None => call.await,
                }
            };

            let result = tokio::select! {
                result = guarded => result,
                _ = cancel.wait_for(|c| *c) => {
                    // The handler keeps running but its result is discarded;
                    // nothing is written to node_outputs after this point.
                    return Ok(NodeOutcome::Cancelled);
                }
            };

            match result {
                Ok(output) => {
                    if self.is_cancelled() {
                        return Ok(NodeOutcome::Cancelled);
                    }
                    let mut ctx = self.ctx.lock().expect("execution context poisoned");
                    ctx.settle_node(&key, NodeResult::succeeded(output.clone(), started, attempt));
                    info!(node = %key, attempt, "node succeeded");
                    return Ok(NodeOutcome::Succeeded(output));
                }
                Err(err) if attempt <= max_retries => {
                    let delay = base_delay * 2u32.pow(attempt.saturating_sub(1));
                    warn!(
                        node = %key, attempt, max_retries, ?delay, %err,
                        "node failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    if self.is_cancelled() {
                        return Ok(NodeOutcome::Cancelled);
                    }
                    let mut ctx = self.ctx.lock().expect("execution context poisoned");
                    ctx.settle_node(&key, NodeResult::failed(err.to_string(), started, attempt));
                    error!(node = %key, attempt, %err, "node failed");
                    return Ok(NodeOutcome::Failed { key, error: err });
                }
            }
        }
    }

    fn skip_remaining(&self, nodes: &[NodeRef]) {
        if nodes.is_empty() {
            return;
        }
        let mut ctx = self.ctx.lock().expect("execution context poisoned");
        for node in nodes {
            ctx.skip_node(&node.alias);
        }
    }

    // -----------------------------------------------------------------------
    // SEQUENTIAL (also one LOOP round)
    // -----------------------------------------------------------------------

    async fn run_sequence(
        &self,
        nodes: &[NodeRef],
        mut carry: Value,
    ) -> Result<SequenceOutcome, EngineError> {
        let mut any_failed = false;

        for (idx, node) in nodes.iter().enumerate() {
            if self.is_cancelled() {
                return Ok(SequenceOutcome::Cancelled);
            }

            let input = self.node_input(&carry);
            match self.invoke_node(node, input).await? {
                NodeOutcome::Succeeded(output) => {
                    let mut ctx = self.ctx.lock().expect("execution context poisoned");
                    ctx.merge_global(&output);
                    drop(ctx);
                    carry = output;
                }
                NodeOutcome::Failed { key, error } => {
                    if self.options.error_policy.continues_after_failure() {
                        any_failed = true;
                        carry = json!({ "error": error.to_string(), "node": key });
                    } else {
                        self.skip_remaining(&nodes[idx + 1..]);
                        return Err(EngineError::NodeFailed { node_id: key, error });
                    }
                }
                NodeOutcome::Cancelled => return Ok(SequenceOutcome::Cancelled),
            }
        }

        Ok(SequenceOutcome::Finished { carry, any_failed })
    }

    // -----------------------------------------------------------------------
    // PARALLEL
    // -----------------------------------------------------------------------

    async fn run_parallel(
        &self,
        aggregation: AggregationStrategy,
    ) -> Result<Outcome, EngineError> {
        let input = self.node_input(&self.input);
        let (sibling_tx, sibling_rx) = watch::channel(false);

        // Resolve every branch before spawning anything; a missing capability
        // is a definition-integrity failure, not a task failure.
        let mut branches = Vec::with_capacity(self.definition.nodes.len());
        for node in &self.definition.nodes {
            let handler = self.lookup_handler(&node.alias, &node.capability_id)?;
            branches.push((node.alias.clone(), handler));
        }

        let mut join = JoinSet::new();
        for (alias, handler) in branches {
            let key = {
                let mut ctx = self.ctx.lock().expect("execution context poisoned");
                ctx.begin_node(&alias)
            };
            let task = BranchTask {
                handler,
                input: input.clone(),
                key,
                workflow_id: self.definition.id,
                execution_id: self.execution_id,
                policy: self.options.error_policy.clone(),
                node_timeout: self.options.node_timeout,
                exec_cancel: self.cancel.clone(),
                sibling_cancel: sibling_rx.clone(),
                permits: Arc::clone(&self.permits),
            };
            join.spawn(task.run());
        }

        // Fan-in join: block this coordinator (and only this coordinator)
        // until every branch settles or the execution is cancelled.
        let mut settled: Vec<(String, NodeResult)> = Vec::new();
        let mut first_failure: Option<(String, CapabilityError)> = None;
        let mut cancel = self.cancel.clone();

        loop {
            let next = tokio::select! {
                next = join.join_next() => next,
                _ = cancel.wait_for(|c| *c) => {
                    join.abort_all();
                    return Ok(Outcome::cancelled());
                }
            };
            let Some(next) = next else { break };
            let branch = match next {
                Ok(branch) => branch,
                Err(err) => {
                    warn!(%err, "parallel branch task aborted");
                    continue;
                }
            };
            if self.is_cancelled() {
                join.abort_all();
                return Ok(Outcome::cancelled());
            }

            {
                let mut ctx = self.ctx.lock().expect("execution context poisoned");
                ctx.settle_node(&branch.key, branch.result.clone());
            }

            if branch.result.status == NodeStatus::Failed {
                if !self.options.error_policy.continues_after_failure() {
                    // Remaining siblings stop waiting and settle as skipped.
                    sibling_tx.send_replace(true);
                }
                if first_failure.is_none() {
                    let error = branch.error.clone().unwrap_or_else(|| {
                        CapabilityError::Invocation("branch failed".into())
                    });
                    first_failure = Some((branch.key.clone(), error));
                }
            }

            settled.push((branch.key, branch.result));
        }

        if let Some((node_id, error)) = first_failure {
            if !self.options.error_policy.continues_after_failure() {
                return Err(EngineError::NodeFailed { node_id, error });
            }
        }

        let any_failed = settled.iter().any(|(_, r)| r.status == NodeStatus::Failed);
        let aggregate = aggregate_branches(aggregation, &settled)?;
        Ok(Outcome::finished(any_failed, aggregate))
    }

    // -----------------------------------------------------------------------
    // LOOP
    // -----------------------------------------------------------------------

    async fn run_loop(
        &self,
        max_iterations: u32,
        predicate: Option<&str>,
    ) -> Result<Outcome, EngineError> {
        let mut carry = self.input.clone();
        let mut any_failed = false;

        // The ceiling is unconditional: even a predicate that never fires
        // cannot keep this loop alive past max_iterations.
        for round in 1..=max_iterations {
            info!(round, max_iterations, "loop round starting");

            match self.run_sequence(&self.definition.nodes, carry.clone()).await? {
                SequenceOutcome::Cancelled => return Ok(Outcome::cancelled()),
                SequenceOutcome::Finished {
                    carry: round_carry,
                    any_failed: round_failed,
                } => {
                    any_failed |= round_failed;
                    carry = round_carry;
                }
            }

            if let Some(predicate_id) = predicate {
                if self.threshold_reached(predicate_id, &carry).await? {
                    info!(round, "threshold predicate satisfied, loop terminating");
                    break;
                }
            }
        }

        Ok(Outcome::finished(any_failed, carry))
    }

    /// Evaluate the threshold predicate against the last round's output.
    /// Truthy means stop: JSON `true`, or an object with `"stop": true`.
    async fn threshold_reached(
        &self,
        predicate_id: &str,
        last_output: &Value,
    ) -> Result<bool, EngineError> {
        let handler = self.lookup_handler(predicate_id, predicate_id)?;
        let ictx = InvocationContext {
            workflow_id: self.definition.id,
            execution_id: self.execution_id,
            node_id: predicate_id.to_owned(),
            attempt: 1,
        };
        let verdict = handler
            .invoke(last_output.clone(), &ictx)
            .await
            .map_err(|error| EngineError::NodeFailed {
                node_id: predicate_id.to_owned(),
                error,
            })?;

        Ok(verdict.as_bool() == Some(true)
            || verdict.get("stop").and_then(Value::as_bool) == Some(true))
    }

    // -----------------------------------------------------------------------
    // ORCHESTRATION
    // -----------------------------------------------------------------------

    async fn run_orchestration(
        &self,
        router_capability: &str,
        max_delegations: u32,
    ) -> Result<Outcome, EngineError> {
        let router_handler = self.lookup_handler(router_capability, router_capability)?;
        let router = CapabilityRouter::new(
            router_handler,
            InvocationContext {
                workflow_id: self.definition.id,
                execution_id: self.execution_id,
                node_id: format!("router:{router_capability}"),
                attempt: 1,
            },
        );

        let catalog: Vec<CatalogEntry> = self
            .definition
            .nodes
            .iter()
            .map(|n| CatalogEntry {
                alias: n.alias.clone(),
                capability_id: n.capability_id.clone(),
            })
            .collect();

        let mut history: Vec<DelegationRecord> = Vec::new();
        let mut carry = self.input.clone();
        let mut any_failed = false;

        // The ceiling is enforced here, independent of router decisions —
        // this is the sole termination guarantee.
        for delegation in 1..=max_delegations {
            if self.is_cancelled() {
                return Ok(Outcome::cancelled());
            }

            let decision = router
                .decide(&self.input, &catalog, &history)
                .await
                .map_err(EngineError::RouterFailed)?;

            let next = match decision {
                RouterDecision::Done => {
                    info!(delegation, "router reported done");
                    break;
                }
                RouterDecision::Delegate(id) => id,
            };

            let node = self
                .definition
                .node(&next)
                .ok_or(EngineError::RouterContractViolation { proposed: next })?
                .clone();
            info!(delegation, max_delegations, node = %node.alias, "router delegated");

            let input = self.node_input(&carry);
            match self.invoke_node(&node, input).await? {
                NodeOutcome::Succeeded(output) => {
                    let mut ctx = self.ctx.lock().expect("execution context poisoned");
                    ctx.merge_global(&output);
                    drop(ctx);
                    history.push(DelegationRecord {
                        node_id: node.alias.clone(),
                        succeeded: true,
                        output: output.clone(),
                    });
                    carry = output;
                }
                NodeOutcome::Failed { key, error } => {
                    if self.options.error_policy.continues_after_failure() {
                        any_failed = true;
                        let failure = json!({ "error": error.to_string(), "node": key });
                        history.push(DelegationRecord {
                            node_id: key,
                            succeeded: false,
                            output: failure.clone(),
                        });
                        carry = failure;
                    } else {
                        return Err(EngineError::NodeFailed { node_id: key, error });
                    }
                }
                NodeOutcome::Cancelled => return Ok(Outcome::cancelled()),
            }
        }

        Ok(Outcome::finished(any_failed, carry))
    }
}

// ---------------------------------------------------------------------------
// Parallel branch task
// ---------------------------------------------------------------------------

struct BranchOutcome {
    key: String,
    result: NodeResult,
    error: Option<CapabilityError>,
}

struct BranchTask {
    handler: Arc<dyn Capability>,
    input: Value,
    key: String,
    workflow_id: Uuid,
    execution_id: Uuid,
    policy: ErrorPolicy,
    node_timeout: Option<Duration>,
    exec_cancel: watch::Receiver<bool>,
    sibling_cancel: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
}

impl BranchTask {
    async fn run(self) -> BranchOutcome {
        let BranchTask {
            handler,
            input,
            key,
            workflow_id,
            execution_id,
            policy,
            node_timeout,
            mut exec_cancel,
            mut sibling_cancel,
            permits,
        } = self;

        let skipped = |key: String| BranchOutcome {
            key,
            result: NodeResult::skipped(),
            error: None,
        };

        // The bounded pool: a branch only starts once a permit frees up.
        let _permit = tokio::select! {
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return skipped(key),
            },
            _ = exec_cancel.wait_for(|c| *c) => return skipped(key),
            _ = sibling_cancel.wait_for(|c| *c) => return skipped(key),
        };

        let (max_retries, base_delay) = policy.retry_budget();
        let started = Utc::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let ictx = InvocationContext {
                workflow_id,
                execution_id,
                node_id: key.clone(),
                attempt,
            };

            let call = handler.invoke(input.clone(), &ictx);
            let guarded = async {
                match node_timeout {
                    Some(limit) => match timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => Err(CapabilityError::Timeout(limit)),
                    },
                    None => call.await,
                }
            };

            let result = tokio::select! {
                result = guarded => result,
                _ = exec_cancel.wait_for(|c| *c) => return skipped(key),
                _ = sibling_cancel.wait_for(|c| *c) => return skipped(key),
            };

            match result {
                Ok(output) => {
                    return BranchOutcome {
                        key,
                        result: NodeResult::succeeded(output, started, attempt),
                        error: None,
                    };
                }
                Err(err) if attempt <= max_retries => {
                    let delay = base_delay * 2u32.pow(attempt.saturating_sub(1));
                    warn!(node = %key, attempt, max_retries, ?delay, %err, "branch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return BranchOutcome {
                        key,
                        result: NodeResult::failed(err.to_string(), started, attempt),
                        error: Some(err),
                    };
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Fold settled branch results (in completion order) into one output.
fn aggregate_branches(
    strategy: AggregationStrategy,
    settled: &[(String, NodeResult)],
) -> Result<Value, EngineError> {
    let succeeded: Vec<(&str, &Value)> = settled
        .iter()
        .filter(|(_, r)| r.status == NodeStatus::Succeeded)
        .filter_map(|(k, r)| r.output.as_ref().map(|o| (k.as_str(), o)))
        .collect();

    match strategy {
        AggregationStrategy::Combine => {
            let mut combined = serde_json::Map::new();
            for (key, result) in settled {
                let entry = match result.status {
                    NodeStatus::Succeeded => result.output.clone().unwrap_or(Value::Null),
                    NodeStatus::Failed => json!({
                        "error": result.error.clone().unwrap_or_default(),
                    }),
                    _ => Value::Null,
                };
                combined.insert(key.clone(), entry);
            }
            Ok(Value::Object(combined))
        }
        AggregationStrategy::FirstSuccess => succeeded
            .first()
            .map(|(_, output)| (*output).clone())
            .ok_or(EngineError::NoSuccessfulBranch),
        AggregationStrategy::Vote => {
            if succeeded.is_empty() {
                return Err(EngineError::NoSuccessfulBranch);
            }
            // Tally by canonical JSON text; identical outputs serialise
            // identically because object key order is preserved per branch.
            let mut tally: HashMap<String, (usize, &Value)> = HashMap::new();
            for (_, output) in &succeeded {
                let ballot = output.to_string();
                let entry = tally.entry(ballot).or_insert((0, *output));
                entry.0 += 1;
            }
            let top = tally.values().map(|(count, _)| *count).max().unwrap_or(0);
            let mut leaders = tally.values().filter(|(count, _)| *count == top);
            let winner = leaders.next().map(|(_, output)| (*output).clone());
            if leaders.next().is_some() {
                return Err(EngineError::VoteTied);
            }
            winner.ok_or(EngineError::NoSuccessfulBranch)
        }
    }
}
