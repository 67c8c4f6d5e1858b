//! # Worker Launchers
//!
//! How a supervised worker comes to life and how it is stopped.
//!
//! - [`ProcessLauncher`]: a child process of the current binary running
//!   `worker --channel <name>`; stopped with SIGTERM, killed with SIGKILL.
//!   A crashing lane cannot take the others down.
//! - [`InProcessLauncher`]: a tokio task with its own [`ShutdownSignal`], for
//!   development and tests.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SupervisorError;
use crate::config::LanesConfig;
use crate::messaging::Broker;
use crate::routing::Channel;
use crate::worker::{build_consumer, ConsumerSummary, ShutdownSignal};

/// A running worker bound to one channel
#[async_trait]
pub trait WorkerHandle: Send {
    /// OS process id, for process-isolated workers
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Ask the worker to finish its in-flight delivery and exit
    fn request_stop(&mut self) -> Result<(), SupervisorError>;

    /// Wait up to `grace` for the worker to exit; `true` if it did
    async fn wait_for_exit(&mut self, grace: Duration) -> bool;

    /// Forcibly stop the worker
    async fn terminate(&mut self) -> Result<(), SupervisorError>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Isolation mode name for logging
    fn mode(&self) -> &'static str;

    async fn launch(&self, channel: &Channel) -> Result<Box<dyn WorkerHandle>, SupervisorError>;
}

/// Launches workers as child processes of a `tasker-lanes` binary
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
}

impl ProcessLauncher {
    /// Re-executes the current binary
    pub fn current_exe(config_path: Option<PathBuf>) -> Result<Self, SupervisorError> {
        let program = std::env::current_exe()
            .map_err(|e| SupervisorError::launcher(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(program, config_path))
    }

    pub fn new(program: impl Into<PathBuf>, config_path: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path,
        }
    }

    fn command(&self, channel: &Channel) -> Command {
        let mut command = Command::new(&self.program);
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command
            .arg("worker")
            .arg("--channel")
            .arg(channel.name())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    fn mode(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, channel: &Channel) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let child = self
            .command(channel)
            .spawn()
            .map_err(|e| SupervisorError::spawn(channel.name(), e.to_string()))?;
        info!(channel = %channel.name(), pid = ?child.id(), "Spawned worker process");
        Ok(Box::new(ProcessHandle {
            channel: channel.name().to_string(),
            child,
        }))
    }
}

#[derive(Debug)]
pub struct ProcessHandle {
    channel: String,
    child: Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(channel = %self.channel, %status, "Worker process exited");
                false
            }
            Err(e) => {
                warn!(channel = %self.channel, error = %e, "Cannot query worker process");
                false
            }
        }
    }

    #[cfg(unix)]
    fn request_stop(&mut self) -> Result<(), SupervisorError> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| SupervisorError::signal(&self.channel, format!("pid {pid} out of range")))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| SupervisorError::signal(&self.channel, e.to_string()))
    }

    #[cfg(not(unix))]
    fn request_stop(&mut self) -> Result<(), SupervisorError> {
        self.child
            .start_kill()
            .map_err(|e| SupervisorError::signal(&self.channel, e.to_string()))
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        matches!(tokio::time::timeout(grace, self.child.wait()).await, Ok(Ok(_)))
    }

    async fn terminate(&mut self) -> Result<(), SupervisorError> {
        self.child
            .kill()
            .await
            .map_err(|e| SupervisorError::signal(&self.channel, e.to_string()))
    }
}

/// Runs workers as tokio tasks sharing one broker
#[derive(Debug, Clone)]
pub struct InProcessLauncher<B: Broker + Clone> {
    config: Arc<LanesConfig>,
    broker: B,
}

impl<B: Broker + Clone> InProcessLauncher<B> {
    pub fn new(config: Arc<LanesConfig>, broker: B) -> Self {
        Self { config, broker }
    }
}

#[async_trait]
impl<B: Broker + Clone> WorkerLauncher for InProcessLauncher<B> {
    fn mode(&self) -> &'static str {
        "in_process"
    }

    async fn launch(&self, channel: &Channel) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let shutdown = ShutdownSignal::new();
        let consumer = build_consumer(&self.config, self.broker.clone(), channel.name(), shutdown.clone())
            .map_err(|e| SupervisorError::spawn(channel.name(), e.to_string()))?;
        let join = tokio::spawn(consumer.run());
        info!(channel = %channel.name(), "Spawned in-process worker");

        Ok(Box::new(InProcessHandle {
            shutdown,
            join: Some(join),
            summary: None,
        }))
    }
}

#[derive(Debug)]
pub struct InProcessHandle {
    shutdown: ShutdownSignal,
    join: Option<JoinHandle<ConsumerSummary>>,
    summary: Option<ConsumerSummary>,
}

impl InProcessHandle {
    /// Counters of the finished consumer loop
    pub fn summary(&self) -> Option<ConsumerSummary> {
        self.summary
    }
}

#[async_trait]
impl WorkerHandle for InProcessHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    fn request_stop(&mut self) -> Result<(), SupervisorError> {
        self.shutdown.trigger();
        Ok(())
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        let Some(join) = self.join.as_mut() else {
            return true;
        };
        match tokio::time::timeout(grace, join).await {
            Ok(result) => {
                self.summary = result.ok();
                self.join = None;
                true
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self) -> Result<(), SupervisorError> {
        if let Some(join) = self.join.take() {
            join.abort();
            let _ = join.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerProviderKind, IsolationMode};
    use crate::messaging::InMemoryBroker;

    fn in_process_config() -> Arc<LanesConfig> {
        let mut config = LanesConfig::default();
        config.broker.provider = BrokerProviderKind::InMemory;
        config.supervisor.isolation = IsolationMode::InProcess;
        config.worker.reconnect_delay_ms = 20;
        config.worker.poll_interval_ms = 10;
        Arc::new(config)
    }

    #[test]
    fn test_process_command_line() {
        let launcher = ProcessLauncher::new("/usr/bin/tasker-lanes", Some(PathBuf::from("lanes.toml")));
        let command = launcher.command(&Channel::new("fluxo_exames", "eventos"));
        let args: Vec<_> = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["--config", "lanes.toml", "worker", "--channel", "fluxo_exames"]);
    }

    #[tokio::test]
    async fn test_in_process_worker_stops_on_request() {
        let config = in_process_config();
        let broker = InMemoryBroker::with_queues(&config.channels, &config.queue_name);
        let launcher = InProcessLauncher::new(Arc::clone(&config), broker);

        let mut handle = launcher
            .launch(&Channel::new("fluxo_clinico", "eventos"))
            .await
            .unwrap();
        assert!(handle.is_alive());
        assert!(handle.pid().is_none());

        handle.request_stop().unwrap();
        assert!(handle.wait_for_exit(Duration::from_secs(2)).await);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_in_process_launch_rejects_unknown_channel() {
        let config = in_process_config();
        let launcher = InProcessLauncher::new(Arc::clone(&config), InMemoryBroker::new());
        let result = launcher.launch(&Channel::new("fluxo_antigo", "eventos")).await;
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_terminate_aborts_in_process_worker() {
        let config = in_process_config();
        let broker = InMemoryBroker::with_queues(&config.channels, &config.queue_name);
        let launcher = InProcessLauncher::new(Arc::clone(&config), broker);

        let mut handle = launcher
            .launch(&Channel::new("fluxo_opme", "eventos"))
            .await
            .unwrap();
        handle.terminate().await.unwrap();
        assert!(!handle.is_alive());
    }
}
