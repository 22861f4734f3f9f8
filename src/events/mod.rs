//! In-process event bus with a remote ingress.
//!
//! Handlers are registered by event name on an [`EventBusBuilder`] and frozen
//! once the bus is built. Each dispatch spawns one task per matching handler,
//! so the caller never waits on handler work. Handler failures are logged and
//! never reach the caller or other handlers.

mod server;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

pub use server::{EventClient, EventServer, EventServerError, MAX_EVENT_LINE};

/// Event emitted when an instance must be torn down.
pub const INSTANCE_TERMINATED: &str = "instance_terminated";

/// Reason attached to [`INSTANCE_TERMINATED`] when an agent lease expires.
pub const AGENT_LOST: &str = "agent-lost";

/// A named event with positional and keyword arguments.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Event {
    /// Name handlers are registered under.
    pub name: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Event {
    /// Creates an event with no arguments.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Returns the positional argument at `index` when it is a string.
    #[must_use]
    pub fn str_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }

    /// Builds the event announcing that `instance_id` lost its agent.
    #[must_use]
    pub fn agent_lost(instance_id: &str) -> Self {
        Self::new(INSTANCE_TERMINATED).arg(AGENT_LOST).arg(instance_id)
    }
}

/// Error type returned by handlers.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Future returned by asynchronous handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

type SyncFn = dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync;
type AsyncFn = dyn Fn(Event) -> HandlerFuture + Send + Sync;

/// A callback registered for an event name.
#[derive(Clone)]
pub enum Handler {
    /// Called directly inside its dispatch task.
    Sync(Arc<SyncFn>),
    /// Awaited inside its dispatch task.
    Async(Arc<AsyncFn>),
}

impl Handler {
    /// Wraps a synchronous callback.
    pub fn sync<F>(callback: F) -> Self
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(callback))
    }

    /// Wraps an asynchronous callback.
    pub fn from_async<F, Fut>(callback: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self::Async(Arc::new(move |event| Box::pin(callback(event))))
    }

    async fn invoke(self, event: Event) {
        let name = event.name.clone();
        let outcome = match self {
            Self::Sync(callback) => {
                AssertUnwindSafe(async move { callback(&event) })
                    .catch_unwind()
                    .await
            }
            Self::Async(callback) => AssertUnwindSafe(callback(event)).catch_unwind().await,
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(event = %name, error = %err, "event handler failed"),
            Err(_) => error!(event = %name, "event handler panicked"),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Handler::Sync"),
            Self::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// Collects handlers before the bus goes into service.
#[derive(Debug, Default)]
pub struct EventBusBuilder {
    handlers: HashMap<String, Vec<Handler>>,
}

impl EventBusBuilder {
    /// Creates a builder with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name`. Registering the same handler twice
    /// makes it run twice per dispatch.
    #[must_use]
    pub fn add_handler(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.handlers.entry(name.into()).or_default().push(handler);
        self
    }

    /// Registers a synchronous callback for `name`.
    #[must_use]
    pub fn on<F>(self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.add_handler(name, Handler::sync(callback))
    }

    /// Registers an asynchronous callback for `name`.
    #[must_use]
    pub fn on_async<F, Fut>(self, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.add_handler(name, Handler::from_async(callback))
    }

    /// Freezes the handler table.
    #[must_use]
    pub fn build(self) -> EventBus {
        EventBus {
            inner: Arc::new(BusInner {
                handlers: self.handlers,
                tasks: TaskTracker::new(),
            }),
        }
    }
}

#[derive(Debug)]
struct BusInner {
    handlers: HashMap<String, Vec<Handler>>,
    tasks: TaskTracker,
}

/// Cheaply cloneable handle to a built bus.
#[derive(Clone, Debug)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::new()
    }

    /// Returns the number of handlers registered for `name`.
    #[must_use]
    pub fn handler_count(&self, name: &str) -> usize {
        self.inner.handlers.get(name).map_or(0, Vec::len)
    }

    /// Spawns one task per handler registered for the event's name, in
    /// registration order, and returns how many were spawned.
    ///
    /// Must be called from within a Tokio runtime. An event nobody listens
    /// for is traced and dropped.
    pub fn dispatch(&self, event: Event) -> usize {
        let Some(handlers) = self.inner.handlers.get(&event.name) else {
            debug!(event = %event.name, "no handlers registered");
            return 0;
        };
        for handler in handlers {
            self.inner
                .tasks
                .spawn(handler.clone().invoke(event.clone()));
        }
        debug!(event = %event.name, handlers = handlers.len(), "event dispatched");
        handlers.len()
    }

    /// Returns the number of handler invocations still running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Waits for every in-flight handler invocation. Later dispatches are
    /// still accepted and tracked.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }
}
