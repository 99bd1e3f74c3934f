//! Capability-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a capability's `invoke` method.
///
/// The engine recovers from these according to the configured error policy;
/// `Timeout` is a dedicated variant so policies can tell a slow capability
/// apart from a broken one.
#[derive(Debug, Error, Clone)]
pub enum CapabilityError {
    /// The handler raised; the message is whatever the handler reported.
    #[error("capability invocation failed: {0}")]
    Invocation(String),

    /// The handler did not settle within the per-node deadline.
    #[error("capability timed out after {0:?}")]
    Timeout(Duration),
}

impl CapabilityError {
    /// True when this error came from a per-node deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
