//! Provider abstraction for the virtual machines behind the cloud driver.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::driver::InstanceSpec;

/// Parameters required to create a new virtual machine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmRequest {
    /// Human readable label used for the boot image. The provider resolves
    /// this to a provider specific image identifier.
    pub image_label: String,
    /// Commercial type or flavour to request (for example `DEV1-S`).
    pub instance_type: String,
    /// Target availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Project identifier used for billing and ownership.
    pub project_id: String,
    /// Optional organisation identifier when the provider requires one.
    pub organisation_id: Option<String>,
    /// CPU architecture requested for the machine.
    pub architecture: String,
    /// Optional cloud-init user-data used to bootstrap the container host.
    pub user_data: Option<String>,
}

impl VmRequest {
    /// Starts a builder for a [`VmRequest`].
    #[must_use]
    pub fn builder() -> VmRequestBuilder {
        VmRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`VmRequestError::Validation`] when any required field is
    /// empty or when user-data is present but blank.
    pub fn validate(&self) -> Result<(), VmRequestError> {
        let required = [
            ("image_label", &self.image_label),
            ("instance_type", &self.instance_type),
            ("zone", &self.zone),
            ("project_id", &self.project_id),
            ("architecture", &self.architecture),
        ];
        if let Some((field, _)) = required.iter().find(|(_, value)| value.is_empty()) {
            return Err(VmRequestError::Validation((*field).to_owned()));
        }
        if self
            .user_data
            .as_deref()
            .is_some_and(|data| data.trim().is_empty())
        {
            return Err(VmRequestError::Validation(String::from("user_data")));
        }
        Ok(())
    }

    /// Returns a copy of the request with the overrides from `spec` applied.
    #[must_use]
    pub fn with_spec(&self, spec: Option<&InstanceSpec>) -> Self {
        let mut request = self.clone();
        if let Some(overrides) = spec {
            if let Some(instance_type) = &overrides.instance_type {
                instance_type.trim().clone_into(&mut request.instance_type);
            }
            if let Some(image_label) = &overrides.image_label {
                image_label.trim().clone_into(&mut request.image_label);
            }
        }
        request
    }
}

/// Builder for [`VmRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VmRequestBuilder {
    image_label: String,
    instance_type: String,
    zone: String,
    project_id: String,
    organisation_id: Option<String>,
    architecture: String,
    user_data: Option<String>,
}

impl VmRequestBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image label.
    #[must_use]
    pub fn image_label(mut self, value: impl Into<String>) -> Self {
        self.image_label = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the project identifier.
    #[must_use]
    pub fn project_id(mut self, value: impl Into<String>) -> Self {
        self.project_id = value.into();
        self
    }

    /// Sets the optional organisation identifier.
    #[must_use]
    pub fn organisation_id(mut self, value: Option<String>) -> Self {
        self.organisation_id = value;
        self
    }

    /// Sets the architecture.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Sets optional cloud-init user-data.
    #[must_use]
    pub fn user_data(mut self, value: Option<String>) -> Self {
        self.user_data = value;
        self
    }

    /// Builds and validates the [`VmRequest`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`VmRequestError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<VmRequest, VmRequestError> {
        let request = VmRequest {
            image_label: self.image_label.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            project_id: self.project_id.trim().to_owned(),
            organisation_id: self.organisation_id.map(|value| value.trim().to_owned()),
            architecture: self.architecture.trim().to_owned(),
            user_data: self.user_data,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Handle returned by a provider once a machine has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmHandle {
    /// Provider specific identifier for the machine.
    pub id: String,
    /// Zone in which the machine was created.
    pub zone: String,
}

/// Connection details for reaching a machine once it is ready.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmNetworking {
    /// Public address assigned by the provider.
    pub public_ip: IpAddr,
    /// Port of the container-management endpoint on the machine.
    pub control_port: u16,
}

/// Errors raised while building requests.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum VmRequestError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by provider operations.
pub type VmFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud providers.
pub trait VmProvider: Send + Sync {
    /// Provider specific error type returned by the provider.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new machine and returns a handle used for subsequent calls.
    fn create<'a>(&'a self, request: &'a VmRequest) -> VmFuture<'a, VmHandle, Self::Error>;

    /// Blocks until the machine and its container endpoint are reachable.
    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a VmHandle,
    ) -> VmFuture<'a, VmNetworking, Self::Error>;

    /// Destroys the machine and confirms no provider resources remain.
    fn destroy(&self, handle: VmHandle) -> VmFuture<'_, (), Self::Error>;
}
