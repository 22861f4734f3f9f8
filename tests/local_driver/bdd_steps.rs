//! BDD step definitions for local driver behaviour.

use kerneld::driver::local::{AgentCommand, LocalDriver};
use kerneld::driver::{Driver, DriverError};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{KernelRun, LocalContext};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[given("a local driver running a sleeping agent")]
fn sleeping_agent(mut local_context: LocalContext) -> LocalContext {
    local_context.agent = Some(
        AgentCommand::new("/bin/sh")
            .arg("-c")
            .arg("exec sleep 30")
            .arg("kernel-agent"),
    );
    local_context
}

#[when("I launch an instance and run a kernel on port {port:u16} to completion")]
fn kernel_lifecycle(mut local_context: LocalContext, port: u16) -> Result<LocalContext, StepError> {
    let driver = LocalDriver::new(local_context.agent());
    let run = Runtime::new()?.block_on(async move {
        let instance = driver.launch_instance(None).await?;
        let kernel = driver.create_kernel(&instance, port).await?;
        let pid = driver.process_id(&kernel.id).await;
        driver.destroy_kernel(&kernel).await?;
        let second_destroy = driver
            .destroy_kernel(&kernel)
            .await
            .err()
            .map(|err| format!("{err:?}"));
        Ok::<_, StepError>(KernelRun {
            instance_ip: instance.ip.to_string(),
            tracked_after_destroy: driver.is_tracking(&kernel.id).await,
            kernel_id: kernel.id,
            agent_sock: kernel.agent_sock,
            pid,
            second_destroy,
        })
    })?;
    local_context.run = Some(run);
    Ok(local_context)
}

#[when("I launch and destroy an instance")]
fn launch_and_destroy(mut local_context: LocalContext) -> Result<LocalContext, StepError> {
    let driver = LocalDriver::new(local_context.agent());
    let outcome = Runtime::new()?.block_on(async move {
        let instance = driver.launch_instance(None).await?;
        driver.destroy_instance(&instance.id).await
    });
    local_context.instance_teardown = Some(outcome.map_err(|err| err.to_string()));
    Ok(local_context)
}

#[then("the instance address is \"{address}\"")]
fn instance_address(local_context: &LocalContext, address: String) -> Result<(), StepError> {
    let run = local_context.run();
    if run.instance_ip == address {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {address}, got {}",
            run.instance_ip
        )))
    }
}

#[then("the kernel id starts with \"{prefix}\"")]
fn kernel_id_prefix(local_context: &LocalContext, prefix: String) -> Result<(), StepError> {
    let run = local_context.run();
    match run.kernel_id.strip_prefix(prefix.as_str()) {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(StepError::Assertion(format!(
            "expected an id under {prefix}, got {}",
            run.kernel_id
        ))),
    }
}

#[then("the agent socket is \"{socket}\"")]
fn agent_socket(local_context: &LocalContext, socket: String) -> Result<(), StepError> {
    let run = local_context.run();
    if run.agent_sock == socket {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {socket}, got {}",
            run.agent_sock
        )))
    }
}

#[then("the agent process is gone after destroy")]
fn agent_process_gone(local_context: &LocalContext) -> Result<(), StepError> {
    let run = local_context.run();
    let Some(pid) = run.pid else {
        return Err(StepError::Assertion(String::from(
            "the agent should have had a process id while running",
        )));
    };
    if run.tracked_after_destroy {
        return Err(StepError::Assertion(format!(
            "{} is still tracked after destroy",
            run.kernel_id
        )));
    }
    if std::path::Path::new(&format!("/proc/{pid}")).exists() {
        return Err(StepError::Assertion(format!(
            "agent process {pid} is still present"
        )));
    }
    Ok(())
}

#[then("destroying the kernel again reports it missing")]
fn second_destroy_missing(local_context: &LocalContext) -> Result<(), StepError> {
    let run = local_context.run();
    let expected = format!("{:?}", DriverError::KernelNotFound(run.kernel_id.clone()));
    if run.second_destroy.as_deref() == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected}, got {:?}",
            run.second_destroy
        )))
    }
}

#[then("the instance teardown succeeded")]
fn instance_teardown_succeeded(local_context: &LocalContext) -> Result<(), StepError> {
    match &local_context.instance_teardown {
        Some(Ok(())) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a clean teardown, got {other:?}"
        ))),
    }
}
