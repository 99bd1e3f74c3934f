//! Typed error type for the registry crate.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A capability with this id is already registered.
    #[error("capability '{0}' is already registered")]
    DuplicateCapability(String),

    /// No capability with this id exists.
    #[error("capability '{0}' is not registered")]
    NotFound(String),
}
