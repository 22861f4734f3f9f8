//! BDD step definitions for reaper behaviour.

use std::sync::Arc;

use kerneld::driver::Driver;
use kerneld::events::{Event, EventBus, INSTANCE_TERMINATED};
use kerneld::janitor::Janitor;
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::ReaperContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

#[given("an instance with {count:u32} tracked kernels")]
fn instance_with_kernels(
    mut reaper_context: ReaperContext,
    count: u32,
) -> Result<ReaperContext, StepError> {
    let driver = Arc::clone(&reaper_context.driver);
    let reaper = Arc::clone(&reaper_context.reaper);
    let (instance_id, kernel_ids) = runtime()?.block_on(async move {
        let instance = driver
            .launch_instance(None)
            .await
            .map_err(|err| StepError::Assertion(err.to_string()))?;
        let mut kernel_ids = Vec::new();
        for port in (5003..).take(count as usize) {
            let kernel = driver
                .create_kernel(&instance, port)
                .await
                .map_err(|err| StepError::Assertion(err.to_string()))?;
            kernel_ids.push(kernel.id.clone());
            reaper.track_kernel(kernel).await;
        }
        Ok::<_, StepError>((instance.id, kernel_ids))
    })?;
    reaper_context.instance_id = Some(instance_id);
    reaper_context.kernel_ids = kernel_ids;
    Ok(reaper_context)
}

#[given("instance teardown fails until healed")]
fn instance_teardown_fails(reaper_context: ReaperContext) -> ReaperContext {
    reaper_context
        .driver
        .fail_teardown(reaper_context.instance_id());
    reaper_context
}

#[when("the agent of that instance is reported lost twice")]
fn agent_reported_lost_twice(reaper_context: ReaperContext) -> Result<ReaperContext, StepError> {
    let bus = EventBus::builder()
        .add_handler(INSTANCE_TERMINATED, reaper_context.reaper.handler())
        .build();
    let event = Event::agent_lost(reaper_context.instance_id());
    runtime()?.block_on(async move {
        bus.dispatch(event.clone());
        bus.dispatch(event);
        bus.shutdown().await;
    });
    Ok(reaper_context)
}

#[when("the backend heals and the janitor sweeps")]
fn backend_heals_and_janitor_sweeps(
    mut reaper_context: ReaperContext,
) -> Result<ReaperContext, StepError> {
    reaper_context.driver.heal(reaper_context.instance_id());
    let janitor = Janitor::new(
        Arc::clone(&reaper_context.driver),
        reaper_context.ledger.clone(),
    );
    let outcome = runtime()?.block_on(async move { janitor.sweep().await });
    reaper_context.sweep = Some(outcome.map_err(|err| err.to_string()));
    Ok(reaper_context)
}

#[then("every tracked kernel is destroyed once")]
fn kernels_destroyed_once(reaper_context: &ReaperContext) -> Result<(), StepError> {
    let mut destroyed = reaper_context.driver.destroyed_kernels();
    destroyed.sort();
    let mut expected = reaper_context.kernel_ids.clone();
    expected.sort();
    if destroyed == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected kernels {expected:?} destroyed once, got {destroyed:?}"
        )))
    }
}

#[then("the instance is destroyed once")]
fn instance_destroyed_once(reaper_context: &ReaperContext) -> Result<(), StepError> {
    let destroyed = reaper_context.driver.destroyed_instances();
    if destroyed == [reaper_context.instance_id()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a single teardown of {}, got {destroyed:?}",
            reaper_context.instance_id()
        )))
    }
}

#[then("the instance is recorded as a possible leak")]
fn instance_recorded_as_leak(reaper_context: &ReaperContext) -> Result<(), StepError> {
    let leaks = reaper_context.ledger.snapshot();
    let ids: Vec<&str> = leaks.iter().map(|leak| leak.id()).collect();
    if ids == [reaper_context.instance_id()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only the instance on the ledger, got {ids:?}"
        )))
    }
}

#[then("the leak ledger is empty")]
fn ledger_is_empty(reaper_context: &ReaperContext) -> Result<(), StepError> {
    match &reaper_context.sweep {
        Some(Ok(summary)) if summary.released_instances == 1 => {}
        other => {
            return Err(StepError::Assertion(format!(
                "expected the sweep to release the instance, got {other:?}"
            )));
        }
    }
    if reaper_context.ledger.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected an empty ledger, got {:?}",
            reaper_context.ledger.snapshot()
        )))
    }
}
