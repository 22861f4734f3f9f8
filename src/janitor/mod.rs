//! Leak ledger and janitor for unconfirmed teardowns.
//!
//! When a driver cannot confirm that a kernel or instance was released, the
//! resource is recorded in a [`LeakLedger`]. The [`Janitor`] drains the ledger
//! periodically, retries each teardown, and re-records whatever still refuses
//! to go.

use std::mem;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::{Driver, Kernel};

/// A resource whose release could not be confirmed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LeakedResource {
    /// A kernel that may still be running.
    Kernel(Kernel),
    /// An instance that may still be provisioned.
    Instance {
        /// Backend identifier of the instance.
        instance_id: String,
    },
}

impl LeakedResource {
    /// Returns the identifier of the leaked resource.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Kernel(kernel) => &kernel.id,
            Self::Instance { instance_id } => instance_id,
        }
    }
}

/// Shared record of possibly leaked resources.
#[derive(Clone, Debug, Default)]
pub struct LeakLedger {
    entries: Arc<Mutex<Vec<LeakedResource>>>,
}

impl LeakLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<LeakedResource>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a resource. A resource already on the ledger is not added
    /// twice.
    pub fn record(&self, resource: LeakedResource) {
        let mut entries = self.entries();
        if entries.contains(&resource) {
            return;
        }
        warn!(resource = resource.id(), "teardown unconfirmed, recorded as possible leak");
        entries.push(resource);
    }

    /// Removes and returns every recorded resource.
    #[must_use]
    pub fn drain(&self) -> Vec<LeakedResource> {
        mem::take(&mut *self.entries())
    }

    /// Returns a copy of the current entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LeakedResource> {
        self.entries().clone()
    }

    /// Returns the number of recorded resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` when nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Summary of one janitor sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Kernels confirmed released.
    pub released_kernels: usize,
    /// Instances confirmed released.
    pub released_instances: usize,
}

/// Errors returned by the janitor.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JanitorError {
    /// Raised when resources remain on the ledger after the sweep.
    #[error("resources remain after janitor sweep: {message}")]
    NotClean {
        /// Human-readable description of what remains.
        message: String,
        /// What the sweep did manage to release.
        released: SweepSummary,
    },
}

/// Retries teardowns recorded in a [`LeakLedger`].
#[derive(Debug)]
pub struct Janitor<D> {
    driver: Arc<D>,
    ledger: LeakLedger,
}

impl<D: Driver> Janitor<D> {
    /// Creates a janitor that retries through `driver`.
    #[must_use]
    pub const fn new(driver: Arc<D>, ledger: LeakLedger) -> Self {
        Self { driver, ledger }
    }

    /// Drains the ledger and retries each teardown, kernels before instances.
    /// Not-found answers count as released. Failures are recorded again.
    ///
    /// # Errors
    ///
    /// Returns [`JanitorError::NotClean`] when any resource is still
    /// unconfirmed after the sweep.
    pub async fn sweep(&self) -> Result<SweepSummary, JanitorError> {
        let (kernels, instances): (Vec<_>, Vec<_>) = self
            .ledger
            .drain()
            .into_iter()
            .partition(|resource| matches!(resource, LeakedResource::Kernel(_)));

        let mut summary = SweepSummary::default();
        let mut remaining = Vec::new();

        for resource in kernels.into_iter().chain(instances) {
            let outcome = match &resource {
                LeakedResource::Kernel(kernel) => self.driver.destroy_kernel(kernel).await,
                LeakedResource::Instance { instance_id } => {
                    self.driver.destroy_instance(instance_id).await
                }
            };
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(resource = resource.id(), "leaked resource already gone");
                }
                Err(err) => {
                    warn!(resource = resource.id(), error = %err, "janitor retry failed");
                    remaining.push(resource);
                    continue;
                }
            }
            match resource {
                LeakedResource::Kernel(_) => summary.released_kernels += 1,
                LeakedResource::Instance { .. } => summary.released_instances += 1,
            }
        }

        if remaining.is_empty() {
            return Ok(summary);
        }

        let message = remaining
            .iter()
            .map(LeakedResource::id)
            .collect::<Vec<_>>()
            .join(", ");
        for resource in remaining {
            self.ledger.record(resource);
        }
        Err(JanitorError::NotClean {
            message,
            released: summary,
        })
    }

    /// Sweeps every `period` until `cancel` fires.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.ledger.is_empty() {
                continue;
            }
            match self.sweep().await {
                Ok(summary) => info!(
                    kernels = summary.released_kernels,
                    instances = summary.released_instances,
                    "janitor released leaked resources"
                ),
                Err(err) => warn!(error = %err, "janitor sweep incomplete"),
            }
        }
        debug!("janitor stopped");
    }
}
