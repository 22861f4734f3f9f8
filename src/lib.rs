//! Provisioning daemon core for remote execution kernels.
//!
//! The crate provisions compute instances and the isolated kernels that run
//! on them through pluggable [`driver`] backends, routes named events through
//! an in-process [`events`] bus with a TCP ingress, and watches agent leases
//! in Redis so that instances whose agent disappears are reaped.

pub mod config;
pub mod driver;
pub mod events;
pub mod janitor;
pub mod lease;
pub mod reaper;
pub mod scaleway;
pub mod test_support;
pub mod vm;

pub use config::{ConfigError, DaemonConfig, ScalewayConfig};
pub use driver::{
    AnyDriver, BackendKind, Driver, DriverError, DriverSettings, Instance, InstanceSpec, Kernel,
    create_driver,
};
pub use events::{Event, EventBus, EventBusBuilder, Handler};
pub use janitor::{Janitor, JanitorError, LeakLedger, LeakedResource, SweepSummary};
pub use lease::{LeaseMonitor, MonitorError, RedisExpirySource};
pub use reaper::{InstanceReaper, ReapOutcome};
pub use scaleway::{ScalewayProvider, ScalewayProviderError};
pub use vm::{VmHandle, VmNetworking, VmProvider, VmRequest, VmRequestBuilder};
