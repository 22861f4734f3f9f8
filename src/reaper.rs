//! Tears down instances whose agent has been lost.
//!
//! The reaper keeps the kernels started on each instance so that an
//! `instance_terminated` event can release everything bound to the instance
//! before the instance itself. Repeated events for the same instance are
//! no-ops. Teardowns that cannot be confirmed go to the leak ledger.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::driver::{Driver, Kernel};
use crate::events::{Event, Handler, HandlerError};
use crate::janitor::{LeakLedger, LeakedResource};

/// Result of a reap request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReapOutcome {
    /// The instance was torn down by this call.
    Reaped {
        /// Kernels confirmed released.
        kernels: usize,
        /// Whether the instance release was confirmed.
        instance_released: bool,
    },
    /// The instance had already been reaped.
    Duplicate,
}

/// Number of reaped instance ids remembered for duplicate detection.
pub const REAPED_MEMORY: usize = 4096;

/// Most recently reaped ids, oldest evicted first.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    members: HashSet<String>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    /// Returns `false` when `id` is already remembered.
    fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(id.to_owned());
        self.members.insert(id.to_owned());
        true
    }
}

/// Reacts to lost agents by releasing their kernels and instance.
#[derive(Debug)]
pub struct InstanceReaper<D> {
    driver: Arc<D>,
    kernels: Mutex<HashMap<String, Vec<Kernel>>>,
    reaped: Mutex<RecentIds>,
    ledger: LeakLedger,
}

impl<D: Driver + 'static> InstanceReaper<D> {
    /// Creates a reaper that tears down through `driver` and records
    /// unconfirmed teardowns in `ledger`.
    #[must_use]
    pub fn new(driver: Arc<D>, ledger: LeakLedger) -> Self {
        Self::with_memory(driver, ledger, REAPED_MEMORY)
    }

    /// Like [`Self::new`], remembering at most `capacity` reaped instances
    /// when telling duplicates apart.
    #[must_use]
    pub fn with_memory(driver: Arc<D>, ledger: LeakLedger, capacity: usize) -> Self {
        Self {
            driver,
            kernels: Mutex::new(HashMap::new()),
            reaped: Mutex::new(RecentIds::new(capacity)),
            ledger,
        }
    }

    /// Remembers `kernel` so it is released with its instance.
    pub async fn track_kernel(&self, kernel: Kernel) {
        self.kernels
            .lock()
            .await
            .entry(kernel.instance_id().to_owned())
            .or_default()
            .push(kernel);
    }

    /// Stops tracking a kernel released by other means. Returns `true` when
    /// it was tracked.
    pub async fn forget_kernel(&self, kernel_id: &str) -> bool {
        let mut kernels = self.kernels.lock().await;
        let mut found = false;
        kernels.retain(|_, bound| {
            let before = bound.len();
            bound.retain(|kernel| kernel.id != kernel_id);
            found |= bound.len() != before;
            !bound.is_empty()
        });
        found
    }

    /// Returns the kernels currently tracked for `instance_id`.
    pub async fn kernels_on(&self, instance_id: &str) -> Vec<Kernel> {
        self.kernels
            .lock()
            .await
            .get(instance_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Releases every kernel tracked on `instance_id`, then the instance.
    pub async fn reap(&self, instance_id: &str, reason: &str) -> ReapOutcome {
        if !self.reaped.lock().await.insert(instance_id) {
            info!(instance_id, reason, "instance already reaped");
            return ReapOutcome::Duplicate;
        }
        info!(instance_id, reason, "reaping instance");

        let bound = self
            .kernels
            .lock()
            .await
            .remove(instance_id)
            .unwrap_or_default();

        let mut released = 0;
        for kernel in bound {
            match self.driver.destroy_kernel(&kernel).await {
                Ok(()) => released += 1,
                Err(err) if err.is_not_found() => released += 1,
                Err(err) => {
                    warn!(kernel_id = %kernel.id, error = %err, "kernel teardown failed");
                    self.ledger.record(LeakedResource::Kernel(kernel));
                }
            }
        }

        let instance_released = match self.driver.destroy_instance(instance_id).await {
            Ok(()) => true,
            Err(err) if err.is_not_found() => true,
            Err(err) => {
                warn!(instance_id, error = %err, "instance teardown failed");
                self.ledger.record(LeakedResource::Instance {
                    instance_id: instance_id.to_owned(),
                });
                false
            }
        };

        ReapOutcome::Reaped {
            kernels: released,
            instance_released,
        }
    }

    /// Returns a bus handler for `instance_terminated` events carrying
    /// `(reason, instance_id)`.
    #[must_use]
    pub fn handler(self: &Arc<Self>) -> Handler {
        let reaper = Arc::clone(self);
        Handler::from_async(move |event: Event| {
            let target = Arc::clone(&reaper);
            async move {
                let (reason, instance_id) = terminated_args(&event)?;
                target.reap(instance_id, reason).await;
                Ok(())
            }
        })
    }
}

fn terminated_args(event: &Event) -> Result<(&str, &str), HandlerError> {
    match (event.str_arg(0), event.str_arg(1)) {
        (Some(reason), Some(instance_id)) if !instance_id.is_empty() => Ok((reason, instance_id)),
        _ => Err(format!(
            "{} expects (reason, instance_id), got {:?}",
            event.name, event.args
        )
        .into()),
    }
}
