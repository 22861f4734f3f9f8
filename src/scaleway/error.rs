//! Failures raised while provisioning kernel hosts on Scaleway.

use std::fmt::Display;

use crate::config::ConfigError;
use crate::vm::VmRequestError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Why a Scaleway machine could not be provisioned or released.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayProviderError {
    /// The `[scaleway]` settings are incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// A machine request lacks a field.
    #[error("invalid instance request: {0}")]
    Validation(String),
    /// No public image matches the label and architecture.
    #[error("no {arch} image labelled '{label}' in {zone}")]
    ImageNotFound {
        /// Image label, e.g. `Docker`.
        label: String,
        /// CPU architecture.
        arch: String,
        /// Zone searched.
        zone: String,
    },
    /// The zone refused the commercial type.
    #[error("commercial type '{instance_type}' is not offered in {zone}")]
    InstanceTypeUnavailable {
        /// Commercial type from the request.
        instance_type: String,
        /// Zone the machine was requested in.
        zone: String,
    },
    /// Polling gave up before the machine reached the wanted state.
    #[error("gave up waiting for {action} on machine {instance_id}")]
    Timeout {
        /// What was awaited, e.g. `public address`.
        action: String,
        /// Server id.
        instance_id: String,
    },
    /// The machine runs but never got a routed IPv4 address.
    #[error("machine {instance_id} is running without a public IPv4 address")]
    MissingPublicIp {
        /// Server id.
        instance_id: String,
    },
    /// The API still lists the machine after deletion.
    #[error("machine {instance_id} is still listed after deletion")]
    ResidualResource {
        /// Server id.
        instance_id: String,
    },
    /// The stopped machine cannot be started.
    #[error("machine {instance_id} is {state} and offers no poweron action")]
    PowerOnNotAllowed {
        /// Server id.
        instance_id: String,
        /// State reported by the API.
        state: String,
    },
    /// Transport or API failure.
    #[error("provider error: {message}")]
    Provider {
        /// Rendered cause.
        message: String,
    },
}

impl ScalewayProviderError {
    pub(crate) fn provider(cause: impl Display) -> Self {
        Self::Provider {
            message: cause.to_string(),
        }
    }
}

impl From<ScalewayError> for ScalewayProviderError {
    fn from(value: ScalewayError) -> Self {
        Self::provider(value)
    }
}

impl From<VmRequestError> for ScalewayProviderError {
    fn from(value: VmRequestError) -> Self {
        let VmRequestError::Validation(field) = value;
        Self::Validation(field)
    }
}

impl From<ConfigError> for ScalewayProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
