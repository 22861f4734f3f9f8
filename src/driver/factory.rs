//! Backend selection by name.

use std::fmt;
use std::str::FromStr;

use super::cloud::{CloudDriver, ContainerSettings};
use super::local::{AgentCommand, LocalDriver};
use super::{Driver, DriverError, DriverFuture, Instance, InstanceSpec, Kernel};
use crate::config::{DaemonConfig, ScalewayConfig};
use crate::scaleway::ScalewayProvider;

/// The closed set of backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendKind {
    /// Agent processes on this machine.
    Local,
    /// Containers on Scaleway machines.
    Cloud,
}

impl BackendKind {
    /// Returns the configuration name of the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = DriverError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            other => Err(DriverError::Configuration(format!(
                "unknown backend '{other}', expected 'local' or 'cloud'"
            ))),
        }
    }
}

/// Everything needed to construct any backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DriverSettings {
    /// Agent command for the local backend.
    pub agent: AgentCommand,
    /// Container image for the cloud backend.
    pub kernel_image: String,
    /// Docker engine port for the cloud backend.
    pub docker_port: u16,
    /// Provider configuration, required by the cloud backend only.
    pub scaleway: Option<ScalewayConfig>,
}

impl DriverSettings {
    /// Derives settings from the daemon configuration.
    #[must_use]
    pub fn from_config(config: &DaemonConfig, scaleway: Option<ScalewayConfig>) -> Self {
        Self {
            agent: AgentCommand::new(config.agent_program.trim()),
            kernel_image: config.kernel_image.trim().to_owned(),
            docker_port: config.docker_port,
            scaleway,
        }
    }
}

/// A driver of any backend.
#[derive(Debug)]
pub enum AnyDriver {
    /// Local process backend.
    Local(LocalDriver),
    /// Cloud VM and container backend.
    Cloud(CloudDriver<ScalewayProvider>),
}

impl AnyDriver {
    /// Returns which backend this driver uses.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Local,
            Self::Cloud(_) => BackendKind::Cloud,
        }
    }
}

/// Builds the driver registered under `name`.
///
/// # Errors
///
/// Returns [`DriverError::Configuration`] for unknown names and when the
/// selected backend lacks required settings.
pub fn create_driver(name: &str, settings: &DriverSettings) -> Result<AnyDriver, DriverError> {
    match name.parse::<BackendKind>()? {
        BackendKind::Local => Ok(AnyDriver::Local(LocalDriver::new(settings.agent.clone()))),
        BackendKind::Cloud => {
            let config = settings.scaleway.clone().ok_or_else(|| {
                DriverError::Configuration(String::from(
                    "the cloud backend needs Scaleway settings (SCW_* or [scaleway] in kerneld.toml)",
                ))
            })?;
            if settings.kernel_image.is_empty() {
                return Err(DriverError::Configuration(String::from(
                    "missing kernel image: set KERNELD_KERNEL_IMAGE or add kernel_image to [kerneld] in kerneld.toml",
                )));
            }
            let provider = ScalewayProvider::new(config, settings.docker_port)
                .map_err(|err| DriverError::Configuration(err.to_string()))?;
            let defaults = provider
                .default_request()
                .map_err(|err| DriverError::Configuration(err.to_string()))?;
            Ok(AnyDriver::Cloud(CloudDriver::new(
                provider,
                defaults,
                ContainerSettings {
                    image: settings.kernel_image.clone(),
                    control_port: settings.docker_port,
                },
            )))
        }
    }
}

impl Driver for AnyDriver {
    fn launch_instance<'a>(&'a self, spec: Option<&'a InstanceSpec>) -> DriverFuture<'a, Instance> {
        match self {
            Self::Local(driver) => driver.launch_instance(spec),
            Self::Cloud(driver) => driver.launch_instance(spec),
        }
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> DriverFuture<'a, ()> {
        match self {
            Self::Local(driver) => driver.destroy_instance(instance_id),
            Self::Cloud(driver) => driver.destroy_instance(instance_id),
        }
    }

    fn create_kernel<'a>(
        &'a self,
        instance: &'a Instance,
        agent_port: u16,
    ) -> DriverFuture<'a, Kernel> {
        match self {
            Self::Local(driver) => driver.create_kernel(instance, agent_port),
            Self::Cloud(driver) => driver.create_kernel(instance, agent_port),
        }
    }

    fn destroy_kernel<'a>(&'a self, kernel: &'a Kernel) -> DriverFuture<'a, ()> {
        match self {
            Self::Local(driver) => driver.destroy_kernel(kernel),
            Self::Cloud(driver) => driver.destroy_kernel(kernel),
        }
    }
}
