//! Workflow composition — run this before anything reaches the engine.
//!
//! Composition validates every capability reference against a single registry
//! snapshot, so a definition is all-or-nothing: either every node resolves or
//! no definition exists at all.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use registry::CapabilityRegistry;
use tracing::info;
use uuid::Uuid;

use crate::error::DefinitionError;
use crate::models::{CapabilityRef, NodeRef, PatternConfig, WorkflowDefinition};

/// Validates capability references plus a pattern into an immutable
/// [`WorkflowDefinition`].
pub struct WorkflowComposer {
    registry: Arc<CapabilityRegistry>,
}

impl WorkflowComposer {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    /// Compose a new workflow at version 1.
    ///
    /// # Errors
    /// [`DefinitionError`] for unresolved references, missing mandatory
    /// termination bounds, or an invalid pattern config.  On error nothing
    /// is produced — there is no partial definition.
    pub fn compose(
        &self,
        name: impl Into<String>,
        refs: Vec<CapabilityRef>,
        config: PatternConfig,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        self.build(Uuid::new_v4(), name.into(), 1, refs, config)
    }

    /// Produce the next version of an existing definition: same workflow id,
    /// `version + 1`, freshly validated.  The previous definition is never
    /// mutated.
    pub fn revise(
        &self,
        previous: &WorkflowDefinition,
        refs: Vec<CapabilityRef>,
        config: PatternConfig,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        self.build(
            previous.id,
            previous.name.clone(),
            previous.version + 1,
            refs,
            config,
        )
    }

    fn build(
        &self,
        id: Uuid,
        name: String,
        version: u32,
        refs: Vec<CapabilityRef>,
        config: PatternConfig,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        // One snapshot for the whole composition; a concurrent reload cannot
        // make the definition half-valid.
        let snapshot = self.registry.snapshot();

        if refs.is_empty() {
            return Err(DefinitionError::EmptyWorkflow(config.pattern_type()));
        }

        match &config {
            PatternConfig::Loop {
                max_iterations,
                threshold_predicate,
            } => {
                if *max_iterations == 0 {
                    return Err(DefinitionError::MissingIterationBound);
                }
                if let Some(predicate) = threshold_predicate {
                    if !snapshot.contains_key(predicate) {
                        return Err(DefinitionError::UnresolvedPredicate(predicate.clone()));
                    }
                }
            }
            PatternConfig::Orchestration {
                router_capability,
                max_delegations,
            } => {
                if *max_delegations == 0 {
                    return Err(DefinitionError::MissingDelegationBound);
                }
                if !snapshot.contains_key(router_capability) {
                    return Err(DefinitionError::UnresolvedRouter(router_capability.clone()));
                }
            }
            PatternConfig::Sequential | PatternConfig::Parallel { .. } => {}
        }

        for r in &refs {
            if !snapshot.contains_key(&r.capability_id) {
                return Err(DefinitionError::UnresolvedCapability(r.capability_id.clone()));
            }
        }

        // Alias collisions resolve deterministically: first occurrence keeps
        // the base name, later ones get `_2`, `_3`, …
        let mut taken: HashSet<String> = HashSet::new();
        let nodes: Vec<NodeRef> = refs
            .iter()
            .enumerate()
            .map(|(position, r)| {
                let base = r.alias.clone().unwrap_or_else(|| r.capability_id.clone());
                let mut alias = base.clone();
                let mut n = 2;
                while !taken.insert(alias.clone()) {
                    alias = format!("{base}_{n}");
                    n += 1;
                }
                NodeRef {
                    capability_id: r.capability_id.clone(),
                    alias,
                    position,
                }
            })
            .collect();

        info!(
            workflow = %name,
            version,
            pattern = %config.pattern_type(),
            nodes = nodes.len(),
            "workflow composed"
        );

        Ok(WorkflowDefinition {
            id,
            name,
            version,
            config,
            nodes,
            created_at: Utc::now(),
        })
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use capabilities::mock::MockCapability;
    use registry::{CapabilityDescriptor, CapabilityKind};
    use serde_json::json;

    use super::*;
    use crate::models::AggregationStrategy;

    fn registry_with(ids: &[&str]) -> Arc<CapabilityRegistry> {
        let registry = CapabilityRegistry::new();
        for id in ids {
            let handler = Arc::new(MockCapability::returning(*id, json!({})));
            registry
                .register(
                    CapabilityDescriptor::new(*id, CapabilityKind::Tool, "Test", handler),
                    false,
                )
                .unwrap();
        }
        Arc::new(registry)
    }

    #[test]
    fn unresolved_reference_aborts_composition() {
        let composer = WorkflowComposer::new(registry_with(&["a"]));
        let err = composer
            .compose(
                "bad",
                vec![CapabilityRef::new("a"), CapabilityRef::new("ghost")],
                PatternConfig::Sequential,
            )
            .unwrap_err();
        assert_eq!(err, DefinitionError::UnresolvedCapability("ghost".into()));
    }

    #[test]
    fn alias_collisions_are_suffixed_deterministically() {
        let composer = WorkflowComposer::new(registry_with(&["a"]));
        let definition = composer
            .compose(
                "repeats",
                vec![
                    CapabilityRef::new("a"),
                    CapabilityRef::new("a"),
                    CapabilityRef::new("a"),
                ],
                PatternConfig::Sequential,
            )
            .unwrap();

        let aliases: Vec<&str> = definition.nodes.iter().map(|n| n.alias.as_str()).collect();
        assert_eq!(aliases, vec!["a", "a_2", "a_3"]);
        assert_eq!(
            definition.nodes.iter().map(|n| n.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn loop_requires_a_positive_iteration_ceiling() {
        let composer = WorkflowComposer::new(registry_with(&["a"]));
        let err = composer
            .compose(
                "unbounded",
                vec![CapabilityRef::new("a")],
                PatternConfig::Loop {
                    max_iterations: 0,
                    threshold_predicate: None,
                },
            )
            .unwrap_err();
        assert_eq!(err, DefinitionError::MissingIterationBound);
    }

    #[test]
    fn loop_predicate_must_resolve() {
        let composer = WorkflowComposer::new(registry_with(&["a"]));
        let err = composer
            .compose(
                "looped",
                vec![CapabilityRef::new("a")],
                PatternConfig::Loop {
                    max_iterations: 3,
                    threshold_predicate: Some("missing_pred".into()),
                },
            )
            .unwrap_err();
        assert_eq!(err, DefinitionError::UnresolvedPredicate("missing_pred".into()));
    }

    #[test]
    fn orchestration_requires_resolving_router_and_ceiling() {
        let composer = WorkflowComposer::new(registry_with(&["a", "router"]));

        let err = composer
            .compose(
                "routed",
                vec![CapabilityRef::new("a")],
                PatternConfig::Orchestration {
                    router_capability: "ghost_router".into(),
                    max_delegations: 3,
                },
            )
            .unwrap_err();
        assert_eq!(err, DefinitionError::UnresolvedRouter("ghost_router".into()));

        let err = composer
            .compose(
                "routed",
                vec![CapabilityRef::new("a")],
                PatternConfig::Orchestration {
                    router_capability: "router".into(),
                    max_delegations: 0,
                },
            )
            .unwrap_err();
        assert_eq!(err, DefinitionError::MissingDelegationBound);
    }

    #[test]
    fn empty_workflow_is_rejected() {
        let composer = WorkflowComposer::new(registry_with(&[]));
        let err = composer
            .compose("empty", vec![], PatternConfig::Parallel {
                aggregation: AggregationStrategy::Combine,
            })
            .unwrap_err();
        assert!(matches!(err, DefinitionError::EmptyWorkflow(_)));
    }

    #[test]
    fn revise_bumps_version_and_keeps_identity() {
        let composer = WorkflowComposer::new(registry_with(&["a", "b"]));
        let v1 = composer
            .compose("pipeline", vec![CapabilityRef::new("a")], PatternConfig::Sequential)
            .unwrap();
        let v2 = composer
            .revise(
                &v1,
                vec![CapabilityRef::new("a"), CapabilityRef::new("b")],
                PatternConfig::Sequential,
            )
            .unwrap();

        assert_eq!(v2.id, v1.id);
        assert_eq!(v2.version, 2);
        assert_eq!(v1.version, 1);
        assert_eq!(v1.nodes.len(), 1);
        assert_eq!(v2.nodes.len(), 2);
    }
}
