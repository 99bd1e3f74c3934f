//! `capabilities` crate — the `Capability` trait and the router contract.
//!
//! Every invocable unit — tool and agent alike — must implement
//! [`Capability`].  The engine crate dispatches execution through this trait
//! object and stays indifferent to what boundary the call crosses.

pub mod error;
pub mod mock;
pub mod router;
pub mod traits;

pub use error::CapabilityError;
pub use router::{CapabilityRouter, DelegationRecord, OrchestratorRouter, RouterDecision};
pub use traits::{Capability, InvocationContext};
