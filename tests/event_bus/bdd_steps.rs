//! BDD step definitions for event bus behaviour.

use std::net::SocketAddr;
use std::time::Duration;

use kerneld::events::{Event, EventServer, Handler, HandlerError};
use rstest_bdd_macros::{given, then, when};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;

use super::test_helpers::BusContext;

const DELIVERY_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

#[given("handlers \"{first}\" and \"{second}\" registered for \"{name}\"")]
fn two_handlers(
    mut bus_context: BusContext,
    first: String,
    second: String,
    name: String,
) -> BusContext {
    assert_ne!(first, second, "handler labels should differ");
    bus_context.record(&name);
    bus_context.record(&name);
    bus_context
}

#[given("a bus with no handlers")]
fn no_handlers(bus_context: BusContext) -> BusContext {
    bus_context
}

#[given("a failing handler and a recording handler registered for \"{name}\"")]
fn failing_then_recording(mut bus_context: BusContext, name: String) -> BusContext {
    bus_context.register(
        &name,
        Handler::sync(|_| Err(String::from("handler refused the event").into())),
    );
    bus_context.register(
        &name,
        Handler::from_async(|event: Event| async move {
            assert!(event.name.is_empty(), "handler blew up on {}", event.name);
            Ok::<(), HandlerError>(())
        }),
    );
    bus_context.record(&name);
    bus_context
}

#[given("a recording handler registered for \"{name}\"")]
fn one_recorder(mut bus_context: BusContext, name: String) -> BusContext {
    bus_context.record(&name);
    bus_context
}

#[when("I dispatch \"{name}\" with argument \"{arg}\"")]
fn dispatch_locally(
    mut bus_context: BusContext,
    name: String,
    arg: String,
) -> Result<BusContext, StepError> {
    let bus = bus_context.build_bus();
    let spawned = runtime()?.block_on(async move {
        let spawned = bus.dispatch(Event::new(name).arg(arg));
        bus.shutdown().await;
        spawned
    });
    bus_context.spawned = Some(spawned);
    Ok(bus_context)
}

#[when("a remote peer sends a malformed line and then \"{name}\" with argument \"{arg}\"")]
fn dispatch_remotely(
    bus_context: BusContext,
    name: String,
    arg: String,
) -> Result<BusContext, StepError> {
    let bus = bus_context.build_bus();
    let recorders = bus_context.recorders.clone();
    runtime()?.block_on(async move {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = EventServer::bind(addr, bus.clone())
            .await
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        let mut stream = TcpStream::connect(server.local_addr())
            .await
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        let line = serde_json::to_string(&Event::new(name).arg(arg))
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        let payload = format!("{{not json\n\n{line}\n");
        stream
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        for recorder in &recorders {
            recorder.wait_for(1, DELIVERY_WAIT).await;
        }
        drop(stream);
        server.shutdown().await;
        bus.shutdown().await;
        Ok::<(), StepError>(())
    })?;
    Ok(bus_context)
}

#[then("each handler ran once with argument \"{arg}\"")]
fn each_handler_ran(bus_context: &BusContext, arg: String) -> Result<(), StepError> {
    if bus_context.spawned != Some(bus_context.recorders.len()) {
        return Err(StepError::Assertion(format!(
            "expected {} handler tasks, got {:?}",
            bus_context.recorders.len(),
            bus_context.spawned
        )));
    }
    for recorder in &bus_context.recorders {
        let events = recorder.events();
        let [event] = events.as_slice() else {
            return Err(StepError::Assertion(format!(
                "expected one delivery, got {events:?}"
            )));
        };
        if event.str_arg(0) != Some(arg.as_str()) {
            return Err(StepError::Assertion(format!(
                "expected argument {arg}, got {:?}",
                event.args
            )));
        }
    }
    Ok(())
}

#[then("no handler task was spawned")]
fn nothing_spawned(bus_context: &BusContext) -> Result<(), StepError> {
    match bus_context.spawned {
        Some(0) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected no handler tasks, got {other:?}"
        ))),
    }
}

#[then("the recording handler ran once")]
fn recorder_ran_once(bus_context: &BusContext) -> Result<(), StepError> {
    let Some(recorder) = bus_context.recorders.first() else {
        return Err(StepError::Assertion(String::from("missing recorder")));
    };
    let events = recorder.events();
    if events.len() == 1 && events.first().and_then(|event| event.str_arg(0)) == Some("x") {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a single delivery of \"x\", got {events:?}"
        )))
    }
}
