//! Shared fixtures for event bus scenarios.

use kerneld::events::{EventBus, Handler};
use kerneld::test_support::Recorder;
use rstest::fixture;

#[derive(Clone, Debug, Default)]
pub struct BusContext {
    pub handlers: Vec<(String, Handler)>,
    pub recorders: Vec<Recorder>,
    pub spawned: Option<usize>,
}

impl BusContext {
    pub fn register(&mut self, name: &str, handler: Handler) {
        self.handlers.push((name.to_owned(), handler));
    }

    pub fn record(&mut self, name: &str) {
        let recorder = Recorder::new();
        self.register(name, recorder.handler());
        self.recorders.push(recorder);
    }

    pub fn build_bus(&self) -> EventBus {
        self.handlers
            .iter()
            .fold(EventBus::builder(), |builder, (name, handler)| {
                builder.add_handler(name.clone(), handler.clone())
            })
            .build()
    }
}

#[fixture]
pub fn bus_context() -> BusContext {
    BusContext::default()
}
