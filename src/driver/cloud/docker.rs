//! Minimal client for the Docker engine API exposed on cloud machines.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_GRACE_SECS: u32 = 10;

/// Container label recording the hosting instance.
pub const INSTANCE_LABEL: &str = "io.kerneld.instance";

/// Environment variable telling the containerised agent which port to bind.
pub const AGENT_PORT_ENV: &str = "KERNEL_AGENT_PORT";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Errors raised by the Docker engine API.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DockerError {
    /// Raised when the engine cannot be reached.
    #[error("docker engine unreachable: {0}")]
    Transport(String),
    /// Raised when the engine rejects a request.
    #[error("docker engine returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Body returned by the engine.
        message: String,
    },
    /// Raised when the engine reports the container does not exist.
    #[error("container {0} not found")]
    NoSuchContainer(String),
}

impl From<reqwest::Error> for DockerError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainer<'a> {
    image: &'a str,
    env: Vec<String>,
    exposed_ports: HashMap<String, Empty>,
    host_config: HostConfig,
    labels: HashMap<&'static str, String>,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    port_bindings: HashMap<String, Vec<PortBinding>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_port: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCreated {
    id: String,
}

/// Client bound to one Docker engine endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DockerClient {
    base_url: String,
}

impl DockerClient {
    /// Creates a client for the engine at `base_url`, for example
    /// `http://51.15.0.7:2375`.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let url: String = base_url.into();
        Self {
            base_url: url.trim_end_matches('/').to_owned(),
        }
    }

    /// Returns the engine endpoint.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&CreateContainer<'_>>,
    ) -> Result<(StatusCode, String), DockerError> {
        let mut request = HTTP_CLIENT.request(method, format!("{}{path}", self.base_url));
        if let Some(payload) = body {
            request = request.json(payload);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        Ok((status, text))
    }

    /// Creates a container from `image` that publishes `agent_port` on the
    /// host, labels it with `instance_id`, and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`DockerError`] when the engine is unreachable or rejects the
    /// request.
    pub async fn create_container(
        &self,
        image: &str,
        agent_port: u16,
        instance_id: &str,
    ) -> Result<String, DockerError> {
        let port_key = format!("{agent_port}/tcp");
        let payload = CreateContainer {
            image,
            env: vec![format!("{AGENT_PORT_ENV}={agent_port}")],
            exposed_ports: HashMap::from([(port_key.clone(), Empty {})]),
            host_config: HostConfig {
                port_bindings: HashMap::from([(
                    port_key,
                    vec![PortBinding {
                        host_port: agent_port.to_string(),
                    }],
                )]),
            },
            labels: HashMap::from([(INSTANCE_LABEL, instance_id.to_owned())]),
        };

        let (status, body) = self
            .send(Method::POST, "/containers/create", Some(&payload))
            .await?;
        if !status.is_success() {
            return Err(DockerError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        let created: ContainerCreated =
            serde_json::from_str(&body).map_err(|err| DockerError::Api {
                status: status.as_u16(),
                message: format!("unreadable create response: {err}"),
            })?;
        Ok(created.id)
    }

    /// Starts a created container. Already running containers are accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DockerError`] when the engine is unreachable or rejects the
    /// request.
    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        let (status, body) = self
            .send(Method::POST, &format!("/containers/{id}/start"), None)
            .await?;
        Self::expect_done(id, status, body)
    }

    /// Asks the container to stop, killing it after a grace period.
    ///
    /// # Errors
    ///
    /// Returns [`DockerError::NoSuchContainer`] when the container is gone
    /// and [`DockerError`] for other failures.
    pub async fn stop_container(&self, id: &str) -> Result<(), DockerError> {
        let path = format!("/containers/{id}/stop?t={STOP_GRACE_SECS}");
        let (status, body) = self.send(Method::POST, &path, None).await?;
        Self::expect_done(id, status, body)
    }

    /// Removes the container, killing it first if it still runs.
    ///
    /// # Errors
    ///
    /// Returns [`DockerError::NoSuchContainer`] when the container is gone
    /// and [`DockerError`] for other failures.
    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let path = format!("/containers/{id}?force=true");
        let (status, body) = self.send(Method::DELETE, &path, None).await?;
        Self::expect_done(id, status, body)
    }

    fn expect_done(id: &str, status: StatusCode, body: String) -> Result<(), DockerError> {
        match status {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(DockerError::NoSuchContainer(id.to_owned())),
            other => Err(DockerError::Api {
                status: other.as_u16(),
                message: body,
            }),
        }
    }
}
