//! Scaleway implementation of the VM provider.
//!
//! Machines are created stopped so cloud-init user-data is in place for the
//! first boot, then powered on. Readiness means a public address is assigned
//! and the container control port accepts TCP connections.

mod error;
mod lifecycle;
mod types;

use std::time::Duration;

use crate::config::ScalewayConfig;
use crate::vm::{VmFuture, VmHandle, VmNetworking, VmProvider, VmRequest};
use lifecycle::InstanceSnapshot;
use scaleway_rs::ScalewayApi;
use tracing::info;
use types::{Action, Zone};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Tags applied to every machine created by this provider.
pub const INSTANCE_TAGS: [&str; 2] = ["kerneld", "ephemeral"];

pub use error::ScalewayProviderError;

/// Provider that manages machines through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
    control_port: u16,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl std::fmt::Debug for ScalewayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScalewayProvider")
            .field("zone", &self.config.default_zone)
            .field("control_port", &self.control_port)
            .finish_non_exhaustive()
    }
}

impl ScalewayProvider {
    fn is_instance_type_error(
        api_err: &scaleway_rs::ScalewayApiError,
        request: &VmRequest,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == request.instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    /// Constructs a provider from configuration. `control_port` is the port
    /// the container endpoint listens on inside each machine.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when the provided
    /// configuration fails validation.
    pub fn new(config: ScalewayConfig, control_port: u16) -> Result<Self, ScalewayProviderError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            config,
            control_port,
            poll_interval: POLL_INTERVAL,
            wait_timeout: WAIT_TIMEOUT,
        })
    }

    /// Overrides the polling interval used by readiness and teardown waits.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the deadline used by readiness and teardown waits.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Builds a machine request using the configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when configuration
    /// validation fails.
    pub fn default_request(&self) -> Result<VmRequest, ScalewayProviderError> {
        self.config.as_request().map_err(ScalewayProviderError::from)
    }

    /// Returns the zone used when a handle has to be rebuilt from an id.
    #[must_use]
    pub fn default_zone(&self) -> &str {
        &self.config.default_zone
    }
}

impl VmProvider for ScalewayProvider {
    type Error = ScalewayProviderError;

    fn create<'a>(&'a self, request: &'a VmRequest) -> VmFuture<'a, VmHandle, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let image_id = self.resolve_image_id(request).await?;
            let server = self.create_instance_stopped(request, &image_id).await?;

            let snapshot = InstanceSnapshot {
                id: server.id.clone().into(),
                state: server.state.clone().into(),
                allowed_actions: server
                    .allowed_actions
                    .clone()
                    .into_iter()
                    .map(Action::from)
                    .collect(),
                public_ip: server.public_ip.as_ref().map(|ip| ip.address.clone()),
            };

            let zone = Zone::from(request.zone.as_str());
            self.power_on_if_needed(&zone, &snapshot).await?;
            info!(instance_id = %server.id, zone = %request.zone, "scaleway instance created");

            Ok(VmHandle {
                id: server.id,
                zone: request.zone.clone(),
            })
        })
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a VmHandle,
    ) -> VmFuture<'a, VmNetworking, Self::Error> {
        Box::pin(async move {
            let networking = self.wait_for_public_ip(handle).await?;
            self.wait_for_control_port(handle, &networking).await?;
            Ok(networking)
        })
    }

    fn destroy(&self, handle: VmHandle) -> VmFuture<'_, (), Self::Error> {
        Box::pin(async move {
            self.api
                .delete_instance_async(&handle.zone, &handle.id)
                .await?;
            self.wait_until_gone(&handle).await?;
            info!(instance_id = %handle.id, "scaleway instance deleted");
            Ok(())
        })
    }
}
