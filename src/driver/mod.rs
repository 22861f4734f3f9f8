//! Driver contract for instance and kernel lifecycle.
//!
//! A driver is the pluggable adapter for one deployment target. It knows how
//! to provision compute instances and how to start and stop isolated kernels
//! on them, but it is agnostic to the policy deciding when to do either.

mod error;
mod factory;

pub mod cloud;
pub mod local;

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;

pub use error::DriverError;
pub use factory::{AnyDriver, BackendKind, DriverSettings, create_driver};

/// A provisioned compute host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Backend specific identifier.
    pub id: String,
    /// Address the instance is reachable on.
    pub ip: IpAddr,
    /// Port of the container-management endpoint, for backends that have one.
    pub control_port: Option<u16>,
}

/// An isolated execution environment bound to a single [`Instance`].
///
/// The process or container backing the kernel is private to the driver that
/// created it and never appears on this type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Kernel {
    /// Globally unique, backend-namespaced identifier.
    pub id: String,
    /// The instance hosting this kernel.
    pub instance: Instance,
    /// Address used to reach the kernel agent out of band.
    pub agent_sock: String,
}

impl Kernel {
    /// Returns the identifier of the hosting instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }
}

/// Optional overrides for a single `launch_instance` call.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Commercial type or flavour to request instead of the default.
    pub instance_type: Option<String>,
    /// Image label to boot instead of the default.
    pub image_label: Option<String>,
}

/// Future returned by driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DriverError>> + Send + 'a>>;

/// Lifecycle operations every backend implements.
pub trait Driver: Send + Sync {
    /// Provisions an instance and returns once it is network-reachable.
    ///
    /// Readiness of any agent process inside the instance is not implied.
    fn launch_instance<'a>(&'a self, spec: Option<&'a InstanceSpec>) -> DriverFuture<'a, Instance>;

    /// Releases the instance. Safe to call after partial provisioning.
    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> DriverFuture<'a, ()>;

    /// Starts a kernel on `instance` whose agent listens on `agent_port`.
    fn create_kernel<'a>(
        &'a self,
        instance: &'a Instance,
        agent_port: u16,
    ) -> DriverFuture<'a, Kernel>;

    /// Tears the kernel down and forgets its handle.
    ///
    /// Calling this twice for the same kernel returns
    /// [`DriverError::KernelNotFound`].
    fn destroy_kernel<'a>(&'a self, kernel: &'a Kernel) -> DriverFuture<'a, ()>;
}

/// Formats the agent socket descriptor for `ip` and `port`.
#[must_use]
pub fn agent_socket(ip: IpAddr, port: u16) -> String {
    format!("tcp://{}", SocketAddr::new(ip, port))
}
