//! `registry` crate — the concurrency-safe capability registry.
//!
//! Discovery layers feed [`CapabilityDescriptor`]s in; the composer and the
//! engine read them back through cheap copy-on-write snapshots.

pub mod descriptor;
pub mod error;
pub mod registry;

pub use descriptor::{CapabilityDescriptor, CapabilityKind, FilterCriteria};
pub use error::RegistryError;
pub use registry::{CapabilityRegistry, RegistrySnapshot};
