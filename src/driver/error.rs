//! Error taxonomy shared by all drivers.

use thiserror::Error;

/// Errors raised by driver operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DriverError {
    /// Raised when the driver cannot be constructed from configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Raised when the backend cannot allocate an instance.
    #[error("failed to provision instance: {message}")]
    Provisioning {
        /// Description of the backend failure.
        message: String,
    },
    /// Raised when the isolated environment fails to start.
    #[error("failed to start kernel on instance {instance_id}: {message}")]
    KernelStart {
        /// Instance the kernel was meant to run on.
        instance_id: String,
        /// Description of the backend failure.
        message: String,
    },
    /// Raised when the release of a resource cannot be confirmed.
    ///
    /// Callers should treat this as a possible leak rather than a fatal
    /// condition.
    #[error("teardown of {resource} unconfirmed: {message}")]
    Teardown {
        /// Identifier of the instance or kernel being released.
        resource: String,
        /// Description of the backend failure.
        message: String,
    },
    /// Raised when an instance is unknown to the driver.
    #[error("instance {0} not found")]
    InstanceNotFound(String),
    /// Raised when a kernel is unknown to the driver, including after it has
    /// already been destroyed.
    #[error("kernel {0} not found")]
    KernelNotFound(String),
}

impl DriverError {
    /// Returns `true` for the not-found conditions, which teardown callers
    /// treat as already released.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound(_) | Self::KernelNotFound(_))
    }
}
