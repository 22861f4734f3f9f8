//! BDD step definitions for lease monitor behaviour.

use std::sync::atomic::Ordering;
use std::time::Duration;

use kerneld::events::{EventBus, INSTANCE_TERMINATED};
use kerneld::lease::{KeyEvent, LeaseMonitor, MonitorError, MonitorExit};
use kerneld::test_support::{Recorder, ScriptEnd, ScriptedExpirySource};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::test_helpers::LeaseContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn run_monitor(
    mut lease_context: LeaseContext,
    cancel_after: Option<Duration>,
) -> Result<LeaseContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let recorder = Recorder::new();
    let bus = EventBus::builder()
        .add_handler(INSTANCE_TERMINATED, recorder.handler())
        .build();
    let source =
        ScriptedExpirySource::new(lease_context.script.clone()).then(lease_context.end.clone());
    let closed = source.close_flag();

    let outcome = runtime.block_on(async move {
        let cancel = CancellationToken::new();
        let monitor = LeaseMonitor::new(source, bus.clone()).spawn(cancel.clone());
        if let Some(delay) = cancel_after {
            tokio::time::sleep(delay).await;
            cancel.cancel();
        }
        let outcome = monitor.await;
        bus.shutdown().await;
        outcome
    });

    lease_context.outcome = Some(match outcome {
        Ok(result) => result.map_err(|err: MonitorError| err.to_string()),
        Err(join) => Err(join.to_string()),
    });
    lease_context.closed = closed.load(Ordering::SeqCst);
    lease_context.delivered = recorder.events();
    Ok(lease_context)
}

#[given("the lease store reports the expiry of \"{key}\"")]
fn store_reports_expiry(mut lease_context: LeaseContext, key: String) -> LeaseContext {
    lease_context.script.push(KeyEvent::expired(key));
    lease_context.end = ScriptEnd::Closed;
    lease_context
}

#[given("the lease store stays silent")]
fn store_stays_silent(mut lease_context: LeaseContext) -> LeaseContext {
    lease_context.script.clear();
    lease_context.end = ScriptEnd::Pending;
    lease_context
}

#[given("the lease store loses its connection with \"{reason}\"")]
fn store_loses_connection(mut lease_context: LeaseContext, reason: String) -> LeaseContext {
    lease_context.script.clear();
    lease_context.end = ScriptEnd::Fail(reason);
    lease_context
}

#[when("the monitor runs until the subscription closes")]
fn monitor_runs_to_close(lease_context: LeaseContext) -> Result<LeaseContext, StepError> {
    run_monitor(lease_context, None)
}

#[when("the monitor is cancelled")]
fn monitor_is_cancelled(lease_context: LeaseContext) -> Result<LeaseContext, StepError> {
    run_monitor(lease_context, Some(Duration::from_millis(20)))
}

#[then("exactly one \"{name}\" event names \"{instance_id}\"")]
fn one_event_names_instance(
    lease_context: &LeaseContext,
    name: String,
    instance_id: String,
) -> Result<(), StepError> {
    let [event] = lease_context.delivered.as_slice() else {
        return Err(StepError::Assertion(format!(
            "expected one event, got {:?}",
            lease_context.delivered
        )));
    };
    if event.name == name && event.str_arg(1) == Some(instance_id.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {name} for {instance_id}, got {event:?}"
        )))
    }
}

#[then("no event is emitted")]
fn no_event(lease_context: &LeaseContext) -> Result<(), StepError> {
    if lease_context.delivered.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no events, got {:?}",
            lease_context.delivered
        )))
    }
}

#[then("the monitor ends with a closed subscription")]
fn ends_with_closed_subscription(lease_context: &LeaseContext) -> Result<(), StepError> {
    let expected = MonitorError::SubscriptionClosed.to_string();
    match &lease_context.outcome {
        Some(Err(message)) if *message == expected => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected \"{expected}\", got {other:?}"
        ))),
    }
}

#[then("the monitor reports lost connectivity with \"{reason}\"")]
fn reports_lost_connectivity(
    lease_context: &LeaseContext,
    reason: String,
) -> Result<(), StepError> {
    let expected = MonitorError::Connectivity(reason).to_string();
    match &lease_context.outcome {
        Some(Err(message)) if *message == expected => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected \"{expected}\", got {other:?}"
        ))),
    }
}

#[then("the monitor stops cleanly")]
fn stops_cleanly(lease_context: &LeaseContext) -> Result<(), StepError> {
    match &lease_context.outcome {
        Some(Ok(MonitorExit::Cancelled)) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a cancelled exit, got {other:?}"
        ))),
    }
}

#[then("the subscription is released")]
fn subscription_released(lease_context: &LeaseContext) -> Result<(), StepError> {
    if lease_context.closed {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "expected the expiry source to be closed",
        )))
    }
}
