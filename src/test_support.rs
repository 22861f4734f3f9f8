//! Test doubles shared by unit and integration tests.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use tokio::time::{Instant, timeout_at};

use crate::driver::{Driver, DriverError, DriverFuture, Instance, InstanceSpec, Kernel, agent_socket};
use crate::events::{Event, Handler};
use crate::lease::{ExpirySource, KeyEvent, LeaseFuture, MonitorError};
use crate::vm::{VmFuture, VmHandle, VmNetworking, VmProvider, VmRequest};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collects every event delivered to its handlers.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    arrived: Arc<Notify>,
}

impl Recorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handler that records into this recorder.
    #[must_use]
    pub fn handler(&self) -> Handler {
        let events = Arc::clone(&self.events);
        let arrived = Arc::clone(&self.arrived);
        Handler::sync(move |event| {
            locked(&events).push(event.clone());
            arrived.notify_one();
            Ok(())
        })
    }

    /// Returns the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        locked(&self.events).clone()
    }

    /// Waits until at least `count` events arrived or `within` elapsed, then
    /// returns what was recorded.
    pub async fn wait_for(&self, count: usize, within: Duration) -> Vec<Event> {
        let deadline = Instant::now() + within;
        loop {
            let seen = self.events();
            if seen.len() >= count {
                return seen;
            }
            if timeout_at(deadline, self.arrived.notified()).await.is_err() {
                return self.events();
            }
        }
    }
}

/// What a [`ScriptedExpirySource`] does once its events run out.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ScriptEnd {
    /// Block until cancelled.
    #[default]
    Pending,
    /// Report a closed subscription.
    Closed,
    /// Report lost connectivity.
    Fail(String),
}

/// Expiry source that replays a fixed list of notifications.
#[derive(Debug, Default)]
pub struct ScriptedExpirySource {
    events: VecDeque<KeyEvent>,
    end: ScriptEnd,
    closed: Arc<AtomicBool>,
}

impl ScriptedExpirySource {
    /// Creates a source that yields `events` and then blocks.
    #[must_use]
    pub fn new(events: impl IntoIterator<Item = KeyEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Sets what happens after the scripted events.
    #[must_use]
    pub fn then(mut self, end: ScriptEnd) -> Self {
        self.end = end;
        self
    }

    /// Returns a flag set once `close` has run.
    #[must_use]
    pub fn close_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl ExpirySource for ScriptedExpirySource {
    fn next_event(&mut self) -> LeaseFuture<'_, Option<KeyEvent>> {
        Box::pin(async move {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            match &self.end {
                ScriptEnd::Pending => std::future::pending().await,
                ScriptEnd::Closed => Ok(None),
                ScriptEnd::Fail(message) => Err(MonitorError::Connectivity(message.clone())),
            }
        })
    }

    fn close(&mut self) -> LeaseFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[derive(Debug, Default)]
struct DriverState {
    next_id: u32,
    instances: HashSet<String>,
    kernels: HashSet<String>,
    failing: HashSet<String>,
    destroyed_kernels: Vec<String>,
    destroyed_instances: Vec<String>,
}

/// In-memory driver whose teardowns can be made to fail per resource.
#[derive(Debug, Default)]
pub struct ScriptedDriver {
    state: Mutex<DriverState>,
}

impl ScriptedDriver {
    /// Creates a driver with no resources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes teardown of `resource_id` fail until [`Self::heal`] is called.
    pub fn fail_teardown(&self, resource_id: &str) {
        locked(&self.state).failing.insert(resource_id.to_owned());
    }

    /// Lets teardown of `resource_id` succeed again.
    pub fn heal(&self, resource_id: &str) {
        locked(&self.state).failing.remove(resource_id);
    }

    /// Returns the kernels destroyed so far, in order.
    #[must_use]
    pub fn destroyed_kernels(&self) -> Vec<String> {
        locked(&self.state).destroyed_kernels.clone()
    }

    /// Returns the instances destroyed so far, in order.
    #[must_use]
    pub fn destroyed_instances(&self) -> Vec<String> {
        locked(&self.state).destroyed_instances.clone()
    }

    fn teardown(&self, resource_id: &str) -> Result<(), DriverError> {
        if locked(&self.state).failing.contains(resource_id) {
            return Err(DriverError::Teardown {
                resource: resource_id.to_owned(),
                message: String::from("scripted teardown failure"),
            });
        }
        Ok(())
    }
}

impl Driver for ScriptedDriver {
    fn launch_instance<'a>(&'a self, _spec: Option<&'a InstanceSpec>) -> DriverFuture<'a, Instance> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.next_id += 1;
            let id = format!("scripted-{}", state.next_id);
            state.instances.insert(id.clone());
            Ok(Instance {
                id,
                ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
                control_port: None,
            })
        })
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.teardown(instance_id)?;
            let mut state = locked(&self.state);
            state.instances.remove(instance_id);
            state.destroyed_instances.push(instance_id.to_owned());
            Ok(())
        })
    }

    fn create_kernel<'a>(&'a self, instance: &'a Instance, agent_port: u16) -> DriverFuture<'a, Kernel> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if !state.instances.contains(&instance.id) {
                return Err(DriverError::InstanceNotFound(instance.id.clone()));
            }
            state.next_id += 1;
            let id = format!("scripted/{}", state.next_id);
            state.kernels.insert(id.clone());
            Ok(Kernel {
                id,
                instance: instance.clone(),
                agent_sock: agent_socket(instance.ip, agent_port),
            })
        })
    }

    fn destroy_kernel<'a>(&'a self, kernel: &'a Kernel) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.teardown(&kernel.id)?;
            let mut state = locked(&self.state);
            if !state.kernels.remove(&kernel.id) {
                return Err(DriverError::KernelNotFound(kernel.id.clone()));
            }
            state.destroyed_kernels.push(kernel.id.clone());
            Ok(())
        })
    }
}

/// Error returned by [`ScriptedProvider`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("scripted provider failure: {0}")]
pub struct ScriptedProviderError(pub String);

#[derive(Debug)]
struct ProviderState {
    networking: VmNetworking,
    fail_create: Option<String>,
    fail_ready: Option<String>,
    destroy_failures: usize,
    next_id: u32,
    created: Vec<VmRequest>,
    destroyed: Vec<String>,
}

/// VM provider double with scripted outcomes. Clones share state.
#[derive(Clone, Debug)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl ScriptedProvider {
    /// Creates a provider whose machines report `networking` when ready.
    #[must_use]
    pub fn new(networking: VmNetworking) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState {
                networking,
                fail_create: None,
                fail_ready: None,
                destroy_failures: 0,
                next_id: 0,
                created: Vec::new(),
                destroyed: Vec::new(),
            })),
        }
    }

    /// Makes every `create` fail with `message`.
    #[must_use]
    pub fn failing_create(self, message: &str) -> Self {
        locked(&self.state).fail_create = Some(message.to_owned());
        self
    }

    /// Makes every `wait_for_ready` fail with `message`.
    #[must_use]
    pub fn failing_ready(self, message: &str) -> Self {
        locked(&self.state).fail_ready = Some(message.to_owned());
        self
    }

    /// Makes the next `count` destroys fail.
    #[must_use]
    pub fn failing_destroys(self, count: usize) -> Self {
        locked(&self.state).destroy_failures = count;
        self
    }

    /// Returns every request passed to `create`.
    #[must_use]
    pub fn created(&self) -> Vec<VmRequest> {
        locked(&self.state).created.clone()
    }

    /// Returns the ids of machines destroyed so far.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        locked(&self.state).destroyed.clone()
    }
}

impl VmProvider for ScriptedProvider {
    type Error = ScriptedProviderError;

    fn create<'a>(&'a self, request: &'a VmRequest) -> VmFuture<'a, VmHandle, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.created.push(request.clone());
            if let Some(message) = &state.fail_create {
                return Err(ScriptedProviderError(message.clone()));
            }
            state.next_id += 1;
            Ok(VmHandle {
                id: format!("vm-{}", state.next_id),
                zone: request.zone.clone(),
            })
        })
    }

    fn wait_for_ready<'a>(&'a self, _handle: &'a VmHandle) -> VmFuture<'a, VmNetworking, Self::Error> {
        Box::pin(async move {
            let state = locked(&self.state);
            state
                .fail_ready
                .as_ref()
                .map_or_else(|| Ok(state.networking.clone()), |message| {
                    Err(ScriptedProviderError(message.clone()))
                })
        })
    }

    fn destroy(&self, handle: VmHandle) -> VmFuture<'_, (), Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if state.destroy_failures > 0 {
                state.destroy_failures -= 1;
                return Err(ScriptedProviderError(format!("{} still listed", handle.id)));
            }
            state.destroyed.push(handle.id);
            Ok(())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets `pairs` and removes `unset` while holding [`ENV_LOCK`].
    pub async fn set_vars(pairs: &[(&str, &str)], unset: &[&str]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs
                    .iter()
                    .map(|(key, _)| *key)
                    .chain(unset.iter().copied())
                    .all(|key| seen.insert(key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + unset.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
        }
        for key in unset {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::remove_var(key) };
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
