//! Shared fixtures for local driver scenarios.

use kerneld::driver::local::AgentCommand;
use rstest::fixture;

/// What a kernel lifecycle run observed.
#[derive(Clone, Debug, Default)]
pub struct KernelRun {
    pub instance_ip: String,
    pub kernel_id: String,
    pub agent_sock: String,
    pub pid: Option<u32>,
    pub tracked_after_destroy: bool,
    pub second_destroy: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LocalContext {
    pub agent: Option<AgentCommand>,
    pub run: Option<KernelRun>,
    pub instance_teardown: Option<Result<(), String>>,
}

impl LocalContext {
    pub fn agent(&self) -> AgentCommand {
        self.agent
            .clone()
            .unwrap_or_else(|| panic!("test setup requires an agent command"))
    }

    pub fn run(&self) -> &KernelRun {
        self.run
            .as_ref()
            .unwrap_or_else(|| panic!("scenario should have run a kernel"))
    }
}

#[fixture]
pub fn local_context() -> LocalContext {
    LocalContext::default()
}
