//! Command-line interface definitions for the `kerneld` binary.
//!
//! Shared by the binary and the build script, which renders the manual page
//! from these definitions.

use clap::Parser;

/// Top-level CLI for the `kerneld` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kerneld",
    about = "Provision compute instances and kernels, and reap them when their agent is lost",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run the daemon.
    #[command(name = "serve", about = "Run the provisioning daemon")]
    Serve(ServeCommand),
    /// Send one event to a running daemon.
    #[command(name = "send", about = "Send an event to a running daemon")]
    Send(SendCommand),
}

/// Arguments for `kerneld serve`.
#[derive(Debug, Parser)]
pub(crate) struct ServeCommand {
    /// Driver backend to use, `local` or `cloud`. Overrides `KERNELD_BACKEND`.
    #[arg(long, value_name = "NAME")]
    pub(crate) backend: Option<String>,
    /// Address for the remote event endpoint. Overrides `KERNELD_EVENTS_BIND`.
    #[arg(long, value_name = "ADDR")]
    pub(crate) events_bind: Option<String>,
}

/// Arguments for `kerneld send`.
#[derive(Debug, Parser)]
pub(crate) struct SendCommand {
    /// Address of the daemon's event endpoint.
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:5002")]
    pub(crate) to: String,
    /// Event name, for example `instance_terminated`.
    #[arg(value_name = "EVENT")]
    pub(crate) event: String,
    /// Positional string arguments carried by the event.
    #[arg(value_name = "ARGS", trailing_var_arg = true)]
    pub(crate) args: Vec<String>,
}
