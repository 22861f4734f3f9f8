//! Readiness and teardown polling for the Scaleway provider.

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::debug;

use crate::scaleway::types::Action;
use crate::vm::{VmHandle, VmNetworking};

use super::super::{ScalewayProvider, ScalewayProviderError};
use super::InstanceSnapshot;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// What one poll of the instance says about its readiness.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(in crate::scaleway) enum Readiness {
    /// Not listed, or not yet running.
    Pending,
    /// Running but without a usable public address.
    RunningWithoutAddress,
    /// Running with a public address.
    Reachable(IpAddr),
}

impl Readiness {
    pub(in crate::scaleway) fn of(snapshot: Option<&InstanceSnapshot>) -> Self {
        let Some(server) = snapshot.filter(|server| server.state.is_running()) else {
            return Self::Pending;
        };
        server
            .public_ip
            .as_deref()
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .map_or(Self::RunningWithoutAddress, Self::Reachable)
    }
}

impl ScalewayProvider {
    pub(in crate::scaleway) async fn fetch_instance(
        &self,
        handle: &VmHandle,
    ) -> Result<Option<InstanceSnapshot>, ScalewayProviderError> {
        let servers = self
            .api
            .list_instances(&handle.zone)
            .servers(&handle.id)
            .per_page(1)
            .run_async()
            .await?;

        Ok(servers.into_iter().next().map(|server| InstanceSnapshot {
            id: server.id.into(),
            state: server.state.into(),
            allowed_actions: server.allowed_actions.into_iter().map(Action::from).collect(),
            public_ip: server.public_ip.map(|ip| ip.address),
        }))
    }

    pub(in crate::scaleway) async fn wait_for_public_ip(
        &self,
        handle: &VmHandle,
    ) -> Result<VmNetworking, ScalewayProviderError> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut last = Readiness::Pending;

        while Instant::now() <= deadline {
            let snapshot = self.fetch_instance(handle).await?;
            last = Readiness::of(snapshot.as_ref());
            if let Readiness::Reachable(public_ip) = last {
                debug!(instance_id = %handle.id, %public_ip, "instance has a public address");
                return Ok(VmNetworking {
                    public_ip,
                    control_port: self.control_port,
                });
            }
            sleep(self.poll_interval).await;
        }

        match last {
            Readiness::RunningWithoutAddress => Err(ScalewayProviderError::MissingPublicIp {
                instance_id: handle.id.clone(),
            }),
            Readiness::Pending | Readiness::Reachable(_) => Err(ScalewayProviderError::Timeout {
                action: String::from("public address"),
                instance_id: handle.id.clone(),
            }),
        }
    }

    /// Polls until the container control port accepts a TCP connection.
    pub(in crate::scaleway) async fn wait_for_control_port(
        &self,
        handle: &VmHandle,
        networking: &VmNetworking,
    ) -> Result<(), ScalewayProviderError> {
        let target = (networking.public_ip, networking.control_port);
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            if let Ok(Ok(_stream)) = timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(target)).await
            {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(ScalewayProviderError::Timeout {
                    action: format!("control port {}", networking.control_port),
                    instance_id: handle.id.clone(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    pub(in crate::scaleway) async fn wait_until_gone(
        &self,
        handle: &VmHandle,
    ) -> Result<(), ScalewayProviderError> {
        let deadline = Instant::now() + self.wait_timeout;
        while Instant::now() <= deadline {
            if self.fetch_instance(handle).await?.is_none() {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }

        Err(ScalewayProviderError::ResidualResource {
            instance_id: handle.id.clone(),
        })
    }
}
