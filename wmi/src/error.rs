//! WMI error codes

use crate::guid::Guid;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = core::result::Result<T, WmiError>;

/// WMI error codes
///
/// `BufferTooSmall` is a retryable result rather than a failure and
/// always carries the size the caller must supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WmiError {
    /// Guid is not known to the catalog
    #[error("guid {0} not found")]
    GuidNotFound(Guid),
    /// Instance name or index does not resolve
    #[error("instance not found")]
    InstanceNotFound,
    /// No data source is registered for the provider id
    #[error("provider {0} not found")]
    ProviderNotFound(u32),
    /// Malformed or out-of-bounds input
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// Allocation failed
    #[error("insufficient resources")]
    InsufficientResources,
    /// Caller buffer cannot hold the result
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    /// Guid is known but no provider currently backs it
    #[error("guid {0} has no registered providers")]
    Disconnected(Guid),
    /// Capability check refused the request
    #[error("access denied")]
    AccessDenied,
    /// Provider is already registered or registering
    #[error("provider {0} already registered")]
    AlreadyRegistered(u32),
    /// Provider registration has not finished yet
    #[error("provider {0} registration in progress")]
    RegistrationInProgress(u32),
    /// Instance name mangling ran out of suffixes
    #[error("instance name collision could not be resolved")]
    NameCollision,
    /// Handle is closed or stale
    #[error("invalid handle")]
    InvalidHandle,
    /// Provider transport reported a failure or answered out of bounds
    #[error("provider request failed")]
    ProviderFailure,
    /// Guid has no user-mode provider to take a mailbox message
    #[error("guid {0} has no user-mode providers")]
    NoUserProviders(Guid),
}

impl WmiError {
    /// Required size carried by a `BufferTooSmall` result
    pub fn required_size(&self) -> Option<usize> {
        match self {
            WmiError::BufferTooSmall { required } => Some(*required),
            _ => None,
        }
    }
}
