//! Layered configuration loaded via `ortho-config`.
//!
//! Two structures are exposed: [`DaemonConfig`] for the daemon itself and
//! [`ScalewayConfig`] for the cloud backend. Both merge defaults,
//! `kerneld.toml`, and environment variables.

use std::ffi::OsString;
use std::net::SocketAddr;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::vm::VmRequest;

/// Name used for discovery and as `argv[0]` when loading without a CLI.
pub const APP_NAME: &str = "kerneld";

/// Scaleway credentials and machine defaults for the cloud backend.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SCW",
    discovery(
        app_name = "kerneld",
        env_var = "KERNELD_CONFIG_PATH",
        config_file_name = "kerneld.toml",
        dotfile_name = ".kerneld.toml",
        project_file_name = "kerneld.toml"
    )
)]
pub struct ScalewayConfig {
    /// Access key of the Scaleway application. Not needed for API calls.
    pub access_key: Option<String>,
    /// Secret key used for authentication. Required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project identifier used for billing and image scoping.
    pub default_project_id: String,
    /// Availability zone for new machines.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Commercial type for new machines.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub default_instance_type: String,
    /// Image label for new machines. The image must run a Docker engine
    /// reachable on the configured control port.
    #[ortho_config(default = "Docker".to_owned())]
    pub default_image: String,
    /// CPU architecture used to pick the image variant.
    #[ortho_config(default = "x86_64".to_owned())]
    pub default_architecture: String,
    /// Optional cloud-init user-data applied on first boot.
    pub cloud_init_user_data: Option<String>,
}

/// Daemon wide settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "KERNELD",
    discovery(
        app_name = "kerneld",
        env_var = "KERNELD_CONFIG_PATH",
        config_file_name = "kerneld.toml",
        dotfile_name = ".kerneld.toml",
        project_file_name = "kerneld.toml"
    )
)]
pub struct DaemonConfig {
    /// Driver backend name, `local` or `cloud`.
    #[ortho_config(default = "local".to_owned())]
    pub backend: String,
    /// Address the remote event listener binds to.
    #[ortho_config(default = "0.0.0.0:5002".to_owned())]
    pub events_bind: String,
    /// Connection URL of the Redis server holding instance leases.
    #[ortho_config(default = "redis://127.0.0.1:6379/".to_owned())]
    pub redis_url: String,
    /// Redis logical database holding instance leases.
    #[ortho_config(default = 0)]
    pub instance_db: u32,
    /// Whether to enable expired-key notifications on the server at startup.
    #[ortho_config(default = true)]
    pub configure_keyspace_events: bool,
    /// Agent program spawned for each local kernel.
    #[ortho_config(default = "kernel-agent".to_owned())]
    pub agent_program: String,
    /// Container image used for cloud kernels.
    #[ortho_config(default = "kernel-runtime:latest".to_owned())]
    pub kernel_image: String,
    /// Port of the Docker engine API on cloud machines.
    #[ortho_config(default = 2375)]
    pub docker_port: u16,
    /// Seconds between janitor sweeps of unconfirmed teardowns.
    #[ortho_config(default = 60)]
    pub janitor_interval_secs: u64,
}

/// Metadata for a configuration field, used to build actionable messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in kerneld.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

impl ScalewayConfig {
    /// Loads configuration from defaults, files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)]).map_err(ConfigError::from)
    }

    /// Builds a [`VmRequest`] from the configured defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn as_request(&self) -> Result<VmRequest, ConfigError> {
        self.validate()?;
        VmRequest::builder()
            .image_label(&self.default_image)
            .instance_type(&self.default_instance_type)
            .zone(&self.default_zone)
            .project_id(&self.default_project_id)
            .organisation_id(self.default_organization_id.clone())
            .architecture(&self.default_architecture)
            .user_data(self.cloud_init_user_data.clone())
            .build()
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks required fields, naming the variable or key that fixes each.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (
                &self.secret_key,
                FieldMetadata::new("Scaleway API secret key", "SCW_SECRET_KEY", "secret_key", "scaleway"),
            ),
            (
                &self.default_project_id,
                FieldMetadata::new(
                    "Scaleway project ID",
                    "SCW_DEFAULT_PROJECT_ID",
                    "default_project_id",
                    "scaleway",
                ),
            ),
            (
                &self.default_image,
                FieldMetadata::new("machine image", "SCW_DEFAULT_IMAGE", "default_image", "scaleway"),
            ),
            (
                &self.default_instance_type,
                FieldMetadata::new(
                    "instance type",
                    "SCW_DEFAULT_INSTANCE_TYPE",
                    "default_instance_type",
                    "scaleway",
                ),
            ),
            (
                &self.default_zone,
                FieldMetadata::new("availability zone", "SCW_DEFAULT_ZONE", "default_zone", "scaleway"),
            ),
            (
                &self.default_architecture,
                FieldMetadata::new(
                    "CPU architecture",
                    "SCW_DEFAULT_ARCHITECTURE",
                    "default_architecture",
                    "scaleway",
                ),
            ),
        ];
        for (value, metadata) in &required {
            require_field(value, metadata)?;
        }
        if self
            .cloud_init_user_data
            .as_deref()
            .is_some_and(|data| data.trim().is_empty())
        {
            return Err(FieldMetadata::new(
                "cloud-init user-data",
                "SCW_CLOUD_INIT_USER_DATA",
                "cloud_init_user_data",
                "scaleway",
            )
            .missing());
        }
        Ok(())
    }
}

impl DaemonConfig {
    /// Loads configuration from defaults, files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)]).map_err(ConfigError::from)
    }

    /// Checks the settings the daemon cannot start without.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a value is empty or malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.backend,
            &FieldMetadata::new("driver backend", "KERNELD_BACKEND", "backend", "kerneld"),
        )?;
        require_field(
            &self.redis_url,
            &FieldMetadata::new("Redis URL", "KERNELD_REDIS_URL", "redis_url", "kerneld"),
        )?;
        require_field(
            &self.agent_program,
            &FieldMetadata::new(
                "kernel agent program",
                "KERNELD_AGENT_PROGRAM",
                "agent_program",
                "kerneld",
            ),
        )?;
        self.events_addr()?;
        if self.janitor_interval_secs == 0 {
            return Err(ConfigError::Parse(String::from(
                "janitor_interval_secs must be greater than zero",
            )));
        }
        Ok(())
    }

    /// Parses the configured event listener address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the value is not `host:port`.
    pub fn events_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.events_bind.trim().parse().map_err(|err| {
            ConfigError::Parse(format!("invalid events_bind '{}': {err}", self.events_bind))
        })
    }

    /// Returns the janitor sweep interval.
    #[must_use]
    pub const fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces loader failures and malformed values.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<std::sync::Arc<ortho_config::OrthoError>> for ConfigError {
    fn from(value: std::sync::Arc<ortho_config::OrthoError>) -> Self {
        Self::Parse(value.to_string())
    }
}
