//! Binary entry point for the `kerneld` daemon.

mod cli;

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cli::{Cli, SendCommand, ServeCommand};
use kerneld::config::{ConfigError, DaemonConfig, ScalewayConfig};
use kerneld::driver::{BackendKind, DriverError, DriverSettings, create_driver};
use kerneld::events::{Event, EventBus, EventClient, EventServer, EventServerError, INSTANCE_TERMINATED};
use kerneld::janitor::{Janitor, LeakLedger};
use kerneld::lease::{LeaseMonitor, MonitorError, MonitorExit, RedisExpirySource};
use kerneld::reaper::InstanceReaper;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Events(#[from] EventServerError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Serve(command) => serve(command).await,
        Cli::Send(command) => send(command).await,
    }
}

fn load_config(args: ServeCommand) -> Result<DaemonConfig, ConfigError> {
    let mut config = DaemonConfig::load_without_cli_args()?;
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(events_bind) = args.events_bind {
        config.events_bind = events_bind;
    }
    config.validate()?;
    Ok(config)
}

async fn serve(args: ServeCommand) -> Result<i32, CliError> {
    let config = load_config(args)?;
    let kind = config.backend.parse::<BackendKind>()?;
    let scaleway = match kind {
        BackendKind::Cloud => Some(ScalewayConfig::load_without_cli_args()?),
        BackendKind::Local => None,
    };
    let settings = DriverSettings::from_config(&config, scaleway);
    let driver = Arc::new(create_driver(kind.as_str(), &settings)?);
    info!(backend = %kind, "driver ready");

    let ledger = LeakLedger::new();
    let reaper = Arc::new(InstanceReaper::new(Arc::clone(&driver), ledger.clone()));
    let bus = EventBus::builder()
        .add_handler(INSTANCE_TERMINATED, reaper.handler())
        .build();

    let server = EventServer::bind(config.events_addr()?, bus.clone()).await?;
    let source = RedisExpirySource::connect(
        &config.redis_url,
        config.instance_db,
        config.configure_keyspace_events,
    )
    .await?;

    let cancel = CancellationToken::new();
    let mut monitor = LeaseMonitor::new(source, bus.clone()).spawn(cancel.clone());
    let janitor = Janitor::new(Arc::clone(&driver), ledger);
    let janitor_task = tokio::spawn({
        let token = cancel.clone();
        let period = config.janitor_interval();
        async move { janitor.run(period, token).await }
    });

    let monitor_result = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown requested");
            cancel.cancel();
            (&mut monitor).await
        }
        finished = &mut monitor => {
            cancel.cancel();
            finished
        }
    };

    if let Err(err) = janitor_task.await {
        warn!(error = %err, "janitor task ended abnormally");
    }
    server.shutdown().await;
    bus.shutdown().await;

    Ok(monitor_exit_code(monitor_result))
}

fn monitor_exit_code(result: Result<Result<MonitorExit, MonitorError>, JoinError>) -> i32 {
    match result {
        Ok(Ok(MonitorExit::Cancelled)) => 0,
        Ok(Err(err)) => {
            error!(error = %err, "lease monitor died");
            1
        }
        Err(err) => {
            error!(error = %err, "lease monitor task failed");
            1
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        warn!("SIGTERM handler unavailable, waiting for Ctrl-C only");
        wait_for_ctrl_c().await;
        return;
    };
    tokio::select! {
        () = wait_for_ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Ctrl-C handler unavailable");
        std::future::pending::<()>().await;
    }
}

async fn send(args: SendCommand) -> Result<i32, CliError> {
    let event = args
        .args
        .into_iter()
        .fold(Event::new(args.event), |event, value| event.arg(value));
    let mut client = EventClient::connect(args.to.as_str()).await?;
    client.dispatch(&event).await?;
    client.close().await?;
    writeln!(io::stdout(), "sent {} to {}", event.name, args.to).ok();
    Ok(0)
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "kerneld: {err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_prefixes_the_program_name() {
        let mut buffer = Vec::new();
        let err = CliError::Driver(DriverError::Configuration(String::from("bad backend")));
        write_error(&mut buffer, &err);
        let text = String::from_utf8(buffer).expect("utf8");
        assert_eq!(text, "kerneld: configuration error: bad backend\n");
    }

    #[test]
    fn monitor_failure_maps_to_exit_one() {
        assert_eq!(monitor_exit_code(Ok(Ok(MonitorExit::Cancelled))), 0);
        assert_eq!(
            monitor_exit_code(Ok(Err(MonitorError::SubscriptionClosed))),
            1
        );
    }
}
