//! `engine` crate — domain models, workflow composition, and the execution
//! engine that drives the four pattern topologies.

pub mod composer;
pub mod context;
pub mod error;
pub mod executor;
pub mod models;

pub use composer::WorkflowComposer;
pub use context::{ExecutionContext, ExecutionStatus, NodeResult, NodeStatus};
pub use error::{DefinitionError, EngineError};
pub use executor::{EngineConfig, ErrorPolicy, ExecuteOptions, WorkflowEngine};
pub use models::{
    AggregationStrategy, CapabilityRef, NodeRef, PatternConfig, PatternType, WorkflowDefinition,
};
