//! Driver that runs kernels as child processes on the local machine.
//!
//! There is no real instance here: `launch_instance` only mints an id and
//! reports the loopback address. Each kernel is an agent process spawned with
//! `--kernel-id` and `--agent-port` appended to the configured command.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Driver, DriverError, DriverFuture, Instance, InstanceSpec, Kernel, agent_socket};

/// Prefix applied to every local kernel identifier.
pub const LOCAL_KERNEL_PREFIX: &str = "local/";

/// Program and leading arguments used to start a kernel agent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentCommand {
    program: Utf8PathBuf,
    args: Vec<String>,
}

impl AgentCommand {
    /// Creates a command for `program` with no leading arguments.
    #[must_use]
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends a leading argument placed before the kernel-specific flags.
    #[must_use]
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Returns the program path.
    #[must_use]
    pub fn program(&self) -> &Utf8PathBuf {
        &self.program
    }

    fn command_for(&self, kernel_id: &str, agent_port: u16) -> Command {
        let mut command = Command::new(self.program.as_str());
        command
            .args(&self.args)
            .arg("--kernel-id")
            .arg(kernel_id)
            .arg("--agent-port")
            .arg(agent_port.to_string())
            .kill_on_drop(true);
        command
    }
}

#[derive(Clone, Debug)]
struct AgentProcess {
    instance_id: String,
    pid: Option<u32>,
    child: Arc<Mutex<Child>>,
}

/// Driver backed by local agent processes.
///
/// Registry locks are only held for lookups and updates. Waiting for an
/// agent to exit holds that agent's own lock, so a slow agent stalls nothing
/// but the call tearing it down.
#[derive(Debug)]
pub struct LocalDriver {
    agent: AgentCommand,
    instances: Mutex<HashSet<String>>,
    agents: Mutex<HashMap<String, AgentProcess>>,
}

impl LocalDriver {
    /// Creates a driver that starts kernels with `agent`.
    #[must_use]
    pub fn new(agent: AgentCommand) -> Self {
        Self {
            agent,
            instances: Mutex::new(HashSet::new()),
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of kernels currently tracked by the driver.
    pub async fn kernel_count(&self) -> usize {
        self.agents.lock().await.len()
    }

    /// Returns `true` when the driver still tracks `kernel_id`.
    pub async fn is_tracking(&self, kernel_id: &str) -> bool {
        self.agents.lock().await.contains_key(kernel_id)
    }

    /// Returns the OS process id of a tracked kernel.
    pub async fn process_id(&self, kernel_id: &str) -> Option<u32> {
        self.agents
            .lock()
            .await
            .get(kernel_id)
            .and_then(|agent| agent.pid)
    }

    async fn bound_to(&self, instance_id: &str) -> Vec<(String, AgentProcess)> {
        self.agents
            .lock()
            .await
            .iter()
            .filter(|(_, agent)| agent.instance_id == instance_id)
            .map(|(kernel_id, agent)| (kernel_id.clone(), agent.clone()))
            .collect()
    }

    async fn terminate(&self, kernel_id: &str, agent: &AgentProcess) -> Result<(), DriverError> {
        let teardown = |message: String| DriverError::Teardown {
            resource: kernel_id.to_owned(),
            message,
        };
        let status = {
            let mut child = agent.child.lock().await;
            request_termination(&mut child).map_err(teardown)?;
            child.wait().await.map_err(|err| teardown(err.to_string()))?
        };

        // The entry only goes once the exit has been observed.
        if self.agents.lock().await.remove(kernel_id).is_none() {
            return Err(DriverError::KernelNotFound(kernel_id.to_owned()));
        }
        debug!(kernel_id, %status, "kernel agent exited");
        Ok(())
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped; `wait` returns the cached status.
        return Ok(());
    };
    let raw = i32::try_from(pid).map_err(|err| err.to_string())?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.to_string()),
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> Result<(), String> {
    child.start_kill().map_err(|err| err.to_string())
}

impl Driver for LocalDriver {
    fn launch_instance<'a>(
        &'a self,
        _spec: Option<&'a InstanceSpec>,
    ) -> DriverFuture<'a, Instance> {
        Box::pin(async move {
            let id = Uuid::new_v4().to_string();
            self.instances.lock().await.insert(id.clone());
            debug!(instance_id = %id, "local instance registered");
            Ok(Instance {
                id,
                ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                control_port: None,
            })
        })
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            if !self.instances.lock().await.contains(instance_id) {
                debug!(instance_id, "destroy requested for unknown local instance");
            }

            loop {
                for (kernel_id, agent) in self.bound_to(instance_id).await {
                    warn!(
                        instance_id,
                        %kernel_id,
                        "terminating kernel left on destroyed instance"
                    );
                    match self.terminate(&kernel_id, &agent).await {
                        Ok(()) | Err(DriverError::KernelNotFound(_)) => {}
                        Err(err) => return Err(err),
                    }
                }

                // Kernels created while the others were terminating keep
                // the instance alive for another round.
                let mut instances = self.instances.lock().await;
                let agents = self.agents.lock().await;
                if agents.values().all(|agent| agent.instance_id != instance_id) {
                    instances.remove(instance_id);
                    return Ok(());
                }
            }
        })
    }

    fn create_kernel<'a>(
        &'a self,
        instance: &'a Instance,
        agent_port: u16,
    ) -> DriverFuture<'a, Kernel> {
        Box::pin(async move {
            if !self.instances.lock().await.contains(&instance.id) {
                return Err(DriverError::InstanceNotFound(instance.id.clone()));
            }

            let kernel_id = format!("{LOCAL_KERNEL_PREFIX}{}", Uuid::new_v4());
            let mut child = self
                .agent
                .command_for(&kernel_id, agent_port)
                .spawn()
                .map_err(|err| DriverError::KernelStart {
                    instance_id: instance.id.clone(),
                    message: format!("failed to spawn {}: {err}", self.agent.program),
                })?;
            let pid = child.id();

            {
                let instances = self.instances.lock().await;
                if !instances.contains(&instance.id) {
                    drop(instances);
                    if let Err(err) = child.kill().await {
                        warn!(
                            %kernel_id,
                            error = %err,
                            "failed to stop agent of destroyed instance"
                        );
                    }
                    return Err(DriverError::InstanceNotFound(instance.id.clone()));
                }
                self.agents.lock().await.insert(
                    kernel_id.clone(),
                    AgentProcess {
                        instance_id: instance.id.clone(),
                        pid,
                        child: Arc::new(Mutex::new(child)),
                    },
                );
            }
            info!(%kernel_id, ?pid, agent_port, "kernel agent started");

            Ok(Kernel {
                id: kernel_id,
                instance: instance.clone(),
                agent_sock: agent_socket(instance.ip, agent_port),
            })
        })
    }

    fn destroy_kernel<'a>(&'a self, kernel: &'a Kernel) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let agent = self
                .agents
                .lock()
                .await
                .get(&kernel.id)
                .cloned()
                .ok_or_else(|| DriverError::KernelNotFound(kernel.id.clone()))?;
            self.terminate(&kernel.id, &agent).await?;
            info!(kernel_id = %kernel.id, "kernel destroyed");
            Ok(())
        })
    }
}
