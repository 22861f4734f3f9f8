//! BDD scenarios for event dispatch.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BusContext, bus_context};

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "Every registered handler receives the event"
)]
fn scenario_every_handler_receives(bus_context: BusContext) {
    let _ = bus_context;
}

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "Dispatching an event nobody listens for is a no-op"
)]
fn scenario_unheard_event(bus_context: BusContext) {
    let _ = bus_context;
}

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "A failing handler does not stop the others"
)]
fn scenario_failing_handler_isolated(bus_context: BusContext) {
    let _ = bus_context;
}

#[scenario(
    path = "tests/features/event_bus.feature",
    name = "Remote peers deliver events over TCP"
)]
fn scenario_remote_delivery(bus_context: BusContext) {
    let _ = bus_context;
}
