//! Liveness monitor worker
//!
//! Periodically confirms that instances recorded as RUNNING still have a
//! live process and demotes the ones whose process is gone.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::deploy::executor::{apply_transition, InstanceLocks};
use crate::deploy::fsm::{InstanceEvent, InstanceState};
use crate::deploy::paths::InstancePaths;
use crate::errors::OrchestratorError;
use crate::models::machine::MachineId;
use crate::models::process::{Instance, InstanceId};
use crate::remote::host::RemoteHost;
use crate::store::{InstanceStore, MachineStore};

/// Monitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between passes
    pub interval: Duration,

    /// Delay before the first pass
    pub initial_delay: Duration,

    /// Instances whose state changed more recently than this are not checked
    pub grace_period: Duration,

    /// Log lines attached to a demotion
    pub log_tail_lines: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_delay: Duration::from_secs(30),
            grace_period: Duration::from_secs(120),
            log_tail_lines: 50,
        }
    }
}

/// An instance found dead
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemotedInstance {
    pub instance_id: InstanceId,
    pub machine_id: MachineId,
    pub pid: u32,
    /// Last lines of the instance log, empty when unreadable
    pub log_tail: String,
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Candidates considered (RUNNING with a pid)
    pub checked: usize,
    pub skipped_grace: Vec<InstanceId>,
    /// A task held the instance lock
    pub skipped_busy: Vec<InstanceId>,
    pub alive: Vec<InstanceId>,
    pub demoted: Vec<DemotedInstance>,
    /// Liveness could not be determined; left unchanged
    pub unknown: Vec<InstanceId>,
}

enum Verdict {
    Grace,
    Busy,
    Alive,
    Demoted(DemotedInstance),
    Unknown,
    /// State or pid changed under us
    Moved,
}

pub struct LivenessMonitor {
    machines: Arc<dyn MachineStore>,
    instances: Arc<dyn InstanceStore>,
    host: Arc<dyn RemoteHost>,
    locks: Arc<InstanceLocks>,
    options: Options,
}

impl LivenessMonitor {
    pub fn new(
        machines: Arc<dyn MachineStore>,
        instances: Arc<dyn InstanceStore>,
        host: Arc<dyn RemoteHost>,
        locks: Arc<InstanceLocks>,
        options: Options,
    ) -> Self {
        Self {
            machines,
            instances,
            host,
            locks,
            options,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Run a single pass over every running instance
    pub async fn check_once(&self) -> Result<MonitorReport, OrchestratorError> {
        let mut report = MonitorReport::default();
        let candidates: Vec<Instance> = self
            .instances
            .list_with_pid()
            .await?
            .into_iter()
            .filter(|i| i.state == InstanceState::Running)
            .collect();

        for instance in candidates {
            report.checked += 1;
            let id = instance.id;
            match self.check_instance(instance).await {
                Ok(Verdict::Grace) => report.skipped_grace.push(id),
                Ok(Verdict::Busy) => report.skipped_busy.push(id),
                Ok(Verdict::Alive) => report.alive.push(id),
                Ok(Verdict::Demoted(demoted)) => report.demoted.push(demoted),
                Ok(Verdict::Moved) => {}
                Ok(Verdict::Unknown) => report.unknown.push(id),
                Err(e) => {
                    error!(instance_id = id, "liveness check failed: {}", e);
                    report.unknown.push(id);
                }
            }
        }

        if !report.demoted.is_empty() {
            info!(
                checked = report.checked,
                demoted = report.demoted.len(),
                unknown = report.unknown.len(),
                "liveness pass finished"
            );
        } else {
            debug!(checked = report.checked, "liveness pass finished");
        }
        Ok(report)
    }

    async fn check_instance(&self, instance: Instance) -> Result<Verdict, OrchestratorError> {
        let age = Utc::now() - instance.state_changed_at;
        if age.to_std().map_or(true, |age| age < self.options.grace_period) {
            return Ok(Verdict::Grace);
        }

        let Some(_guard) = self.locks.try_lock(instance.id) else {
            return Ok(Verdict::Busy);
        };

        // Re-read under the lock: a task may have moved it since the scan
        let Some(current) = self.instances.get_instance(instance.id).await? else {
            return Ok(Verdict::Moved);
        };
        let Some(pid) = current.process_pid else {
            return Ok(Verdict::Moved);
        };
        if current.state != InstanceState::Running || Some(pid) != instance.process_pid {
            return Ok(Verdict::Moved);
        }

        let Some(machine) = self.machines.get_machine(current.machine_id).await? else {
            warn!(instance_id = current.id, machine_id = current.machine_id, "machine missing, liveness unknown");
            return Ok(Verdict::Unknown);
        };

        match self.host.process_alive(&machine, pid).await {
            Ok(true) => Ok(Verdict::Alive),
            Ok(false) => {
                let paths = InstancePaths::new(&current.deploy_path, current.id);
                let log_tail = self
                    .host
                    .tail_file(&machine, &paths.log_file(), self.options.log_tail_lines)
                    .await
                    .unwrap_or_default();

                apply_transition(self.instances.as_ref(), current.id, InstanceEvent::ProcessDied).await?;
                self.instances.update_pid(current.id, None).await?;

                warn!(
                    instance_id = current.id,
                    machine = %machine.name,
                    pid,
                    "process is gone, instance marked NOT_STARTED"
                );
                Ok(Verdict::Demoted(DemotedInstance {
                    instance_id: current.id,
                    machine_id: current.machine_id,
                    pid,
                    log_tail,
                }))
            }
            Err(e) => {
                debug!(instance_id = current.id, "liveness unknown: {}", e);
                Ok(Verdict::Unknown)
            }
        }
    }
}

/// Run the monitor worker until shutdown
pub async fn run<S, F>(
    monitor: &LivenessMonitor,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Liveness monitor starting...");
    let options = monitor.options().clone();

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Liveness monitor shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        if let Err(e) = monitor.check_once().await {
            error!("Liveness pass failed: {}", e);
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Liveness monitor shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
