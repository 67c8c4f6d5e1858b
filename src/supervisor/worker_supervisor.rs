//! # Worker Supervisor
//!
//! Owns one worker per valid channel, keyed by channel name. A monitor cycle
//! replaces any worker that is no longer alive with a fresh one bound to the
//! same channel; there is no respawn limit and no backoff. Shutdown asks every
//! worker to stop, waits out the grace period per worker and terminates the
//! stragglers.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::launcher::{WorkerHandle, WorkerLauncher};
use super::SupervisorError;
use crate::config::SupervisorConfig;
use crate::routing::{Channel, ChannelRegistry};
use crate::worker::ShutdownSignal;

struct SupervisedWorker {
    channel: Channel,
    handle: Box<dyn WorkerHandle>,
    spawn_count: u32,
    last_spawned_at: DateTime<Utc>,
}

/// Externally visible view of one supervised worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub channel: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub spawn_count: u32,
    pub last_spawned_at: DateTime<Utc>,
}

/// Channels grouped by how their worker ended during shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub graceful: Vec<String>,
    pub terminated: Vec<String>,
}

pub struct WorkerSupervisor<L: WorkerLauncher> {
    launcher: L,
    channels: Vec<Channel>,
    workers: BTreeMap<String, SupervisedWorker>,
    monitor_interval: Duration,
    shutdown_grace: Duration,
}

impl<L: WorkerLauncher> std::fmt::Debug for WorkerSupervisor<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("mode", &self.launcher.mode())
            .field("channels", &self.channels)
            .field("workers", &self.workers.len())
            .field("monitor_interval", &self.monitor_interval)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}

impl<L: WorkerLauncher> WorkerSupervisor<L> {
    pub fn new(launcher: L, registry: &ChannelRegistry, settings: &SupervisorConfig) -> Self {
        Self {
            launcher,
            channels: registry.channels(),
            workers: BTreeMap::new(),
            monitor_interval: settings.monitor_interval(),
            shutdown_grace: settings.shutdown_grace(),
        }
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Spawn a worker for every channel that has none
    ///
    /// A failed spawn is logged and retried by the next monitor cycle.
    /// Returns the number of workers running afterwards.
    pub async fn start(&mut self) -> Result<usize, SupervisorError> {
        if self.channels.is_empty() {
            return Err(SupervisorError::NoChannels);
        }
        info!(
            mode = self.launcher.mode(),
            channels = self.channels.len(),
            "Starting channel workers"
        );

        for channel in self.channels.clone() {
            if !self.workers.contains_key(channel.name()) {
                self.spawn(&channel).await;
            }
        }
        Ok(self.workers.len())
    }

    /// One monitor cycle; returns the channels whose worker was (re)spawned
    pub async fn monitor_once(&mut self) -> Vec<String> {
        let mut respawned = Vec::new();
        for channel in self.channels.clone() {
            let alive = match self.workers.get_mut(channel.name()) {
                Some(worker) => {
                    let alive = worker.handle.is_alive();
                    if !alive {
                        warn!(
                            channel = %channel.name(),
                            pid = ?worker.handle.pid(),
                            spawn_count = worker.spawn_count,
                            "Worker is not alive; respawning"
                        );
                    }
                    alive
                }
                None => false,
            };

            if !alive && self.spawn(&channel).await {
                respawned.push(channel.name().to_string());
            }
        }
        respawned
    }

    /// Supervise until `shutdown` is triggered, then stop every worker
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> Result<ShutdownReport, SupervisorError> {
        self.start().await?;

        while shutdown.sleep(self.monitor_interval).await {
            self.monitor_once().await;
        }

        info!("Shutdown requested; stopping channel workers");
        Ok(self.shutdown_workers().await)
    }

    /// Broadcast the stop request, wait out the grace period, terminate the rest
    pub async fn shutdown_workers(&mut self) -> ShutdownReport {
        for (name, worker) in self.workers.iter_mut() {
            if let Err(e) = worker.handle.request_stop() {
                warn!(channel = %name, error = %e, "Stop request failed");
            }
        }

        let mut report = ShutdownReport::default();
        let workers = std::mem::take(&mut self.workers);
        for (name, mut worker) in workers {
            if worker.handle.wait_for_exit(self.shutdown_grace).await {
                info!(channel = %name, "Worker stopped");
                report.graceful.push(name);
                continue;
            }

            warn!(
                channel = %name,
                pid = ?worker.handle.pid(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Worker did not stop in time; terminating"
            );
            if let Err(e) = worker.handle.terminate().await {
                error!(channel = %name, error = %e, "Failed to terminate worker");
            }
            report.terminated.push(name);
        }
        report
    }

    pub fn worker_statuses(&mut self) -> Vec<WorkerStatus> {
        self.workers
            .values_mut()
            .map(|worker| WorkerStatus {
                channel: worker.channel.name().to_string(),
                pid: worker.handle.pid(),
                alive: worker.handle.is_alive(),
                spawn_count: worker.spawn_count,
                last_spawned_at: worker.last_spawned_at,
            })
            .collect()
    }

    async fn spawn(&mut self, channel: &Channel) -> bool {
        match self.launcher.launch(channel).await {
            Ok(handle) => {
                let spawn_count = self
                    .workers
                    .get(channel.name())
                    .map_or(1, |previous| previous.spawn_count + 1);
                self.workers.insert(
                    channel.name().to_string(),
                    SupervisedWorker {
                        channel: channel.clone(),
                        handle,
                        spawn_count,
                        last_spawned_at: Utc::now(),
                    },
                );
                true
            }
            Err(e) => {
                error!(channel = %channel.name(), error = %e, "Failed to spawn worker");
                false
            }
        }
    }
}
