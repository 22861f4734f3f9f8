//! Driver that runs kernels as containers on freshly provisioned VMs.
//!
//! Each instance is one VM created through a [`VmProvider`]. Kernels are
//! containers started through the Docker engine the VM exposes on its control
//! port.

mod docker;

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;

use tokio::sync::Mutex;
use tracing::{info, warn};

pub use docker::{AGENT_PORT_ENV, DockerClient, DockerError, INSTANCE_LABEL};

use super::{Driver, DriverError, DriverFuture, Instance, InstanceSpec, Kernel, agent_socket};
use crate::vm::{VmHandle, VmProvider, VmRequest};

/// Container settings applied to every kernel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContainerSettings {
    /// Image every kernel container runs.
    pub image: String,
    /// Port of the Docker engine API on each VM.
    pub control_port: u16,
}

#[derive(Clone, Debug)]
struct ContainerRef {
    instance_id: String,
    client: DockerClient,
    container_id: String,
}

/// Driver backed by a VM provider and per-VM Docker engines.
#[derive(Debug)]
pub struct CloudDriver<P: VmProvider> {
    provider: P,
    defaults: VmRequest,
    containers: ContainerSettings,
    instances: Mutex<HashMap<String, VmHandle>>,
    kernels: Mutex<HashMap<String, ContainerRef>>,
}

impl<P: VmProvider> CloudDriver<P> {
    /// Creates a driver that provisions machines shaped like `defaults`.
    #[must_use]
    pub fn new(provider: P, defaults: VmRequest, containers: ContainerSettings) -> Self {
        Self {
            provider,
            defaults,
            containers,
            instances: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the underlying provider.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the number of instances the driver still owns.
    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Returns `true` when the driver still tracks `kernel_id`.
    pub async fn is_tracking(&self, kernel_id: &str) -> bool {
        self.kernels.lock().await.contains_key(kernel_id)
    }

    fn client_for(&self, instance: &Instance) -> DockerClient {
        let port = instance.control_port.unwrap_or(self.containers.control_port);
        DockerClient::new(format!("http://{}", SocketAddr::new(instance.ip, port)))
    }

    async fn release_vm<E: Display>(&self, handle: &VmHandle, cause: &E) -> String {
        match self.provider.destroy(handle.clone()).await {
            Ok(()) => cause.to_string(),
            Err(teardown) => format!("{cause} (teardown also failed: {teardown})"),
        }
    }

    async fn remove_container(reference: &ContainerRef) -> Result<(), DockerError> {
        match reference.client.stop_container(&reference.container_id).await {
            Ok(()) | Err(DockerError::NoSuchContainer(_)) => {}
            Err(err) => warn!(container_id = %reference.container_id, error = %err, "stop failed, forcing removal"),
        }
        match reference.client.remove_container(&reference.container_id).await {
            Ok(()) | Err(DockerError::NoSuchContainer(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl<P: VmProvider> Driver for CloudDriver<P> {
    fn launch_instance<'a>(&'a self, spec: Option<&'a InstanceSpec>) -> DriverFuture<'a, Instance> {
        Box::pin(async move {
            let request = self.defaults.with_spec(spec);
            let handle = self
                .provider
                .create(&request)
                .await
                .map_err(|err| DriverError::Provisioning {
                    message: err.to_string(),
                })?;

            let networking = match self.provider.wait_for_ready(&handle).await {
                Ok(networking) => networking,
                Err(err) => {
                    let message = self.release_vm(&handle, &err).await;
                    return Err(DriverError::Provisioning { message });
                }
            };

            info!(instance_id = %handle.id, ip = %networking.public_ip, "cloud instance ready");
            let instance = Instance {
                id: handle.id.clone(),
                ip: networking.public_ip,
                control_port: Some(networking.control_port),
            };
            self.instances.lock().await.insert(handle.id.clone(), handle);
            Ok(instance)
        })
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let known = self.instances.lock().await.remove(instance_id);
            let handle = known.clone().unwrap_or_else(|| VmHandle {
                id: instance_id.to_owned(),
                zone: self.defaults.zone.clone(),
            });

            if let Err(err) = self.provider.destroy(handle.clone()).await {
                if let Some(restored) = known {
                    self.instances
                        .lock()
                        .await
                        .insert(instance_id.to_owned(), restored);
                }
                return Err(DriverError::Teardown {
                    resource: instance_id.to_owned(),
                    message: err.to_string(),
                });
            }
            let mut kernels = self.kernels.lock().await;
            let before = kernels.len();
            kernels.retain(|_, reference| reference.instance_id != instance_id);
            let dropped = before - kernels.len();
            if dropped > 0 {
                warn!(instance_id, dropped, "forgot kernels of destroyed instance");
            }
            info!(instance_id, "cloud instance destroyed");
            Ok(())
        })
    }

    fn create_kernel<'a>(
        &'a self,
        instance: &'a Instance,
        agent_port: u16,
    ) -> DriverFuture<'a, Kernel> {
        Box::pin(async move {
            if !self.instances.lock().await.contains_key(&instance.id) {
                return Err(DriverError::InstanceNotFound(instance.id.clone()));
            }

            let start_error = |err: DockerError| DriverError::KernelStart {
                instance_id: instance.id.clone(),
                message: err.to_string(),
            };
            let client = self.client_for(instance);
            let container_id = client
                .create_container(&self.containers.image, agent_port, &instance.id)
                .await
                .map_err(start_error)?;
            let reference = ContainerRef {
                instance_id: instance.id.clone(),
                client,
                container_id,
            };

            if let Err(err) = reference.client.start_container(&reference.container_id).await {
                if let Err(cleanup) = Self::remove_container(&reference).await {
                    warn!(container_id = %reference.container_id, error = %cleanup, "failed to remove unstarted container");
                }
                return Err(start_error(err));
            }

            let kernel_id = format!("docker-{}/{}", instance.ip, reference.container_id);
            {
                let instances = self.instances.lock().await;
                if !instances.contains_key(&instance.id) {
                    drop(instances);
                    if let Err(cleanup) = Self::remove_container(&reference).await {
                        warn!(
                            %kernel_id,
                            error = %cleanup,
                            "failed to remove container of destroyed instance"
                        );
                    }
                    return Err(DriverError::InstanceNotFound(instance.id.clone()));
                }
                self.kernels.lock().await.insert(kernel_id.clone(), reference);
            }
            info!(%kernel_id, agent_port, "kernel container started");

            Ok(Kernel {
                id: kernel_id,
                instance: instance.clone(),
                agent_sock: agent_socket(instance.ip, agent_port),
            })
        })
    }

    fn destroy_kernel<'a>(&'a self, kernel: &'a Kernel) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let reference = self
                .kernels
                .lock()
                .await
                .get(&kernel.id)
                .cloned()
                .ok_or_else(|| DriverError::KernelNotFound(kernel.id.clone()))?;

            Self::remove_container(&reference)
                .await
                .map_err(|err| DriverError::Teardown {
                    resource: kernel.id.clone(),
                    message: err.to_string(),
                })?;

            if self.kernels.lock().await.remove(&kernel.id).is_none() {
                return Err(DriverError::KernelNotFound(kernel.id.clone()));
            }
            info!(kernel_id = %kernel.id, "kernel container removed");
            Ok(())
        })
    }
}
