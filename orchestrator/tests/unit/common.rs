//! Shared fixtures

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use logfleet::app::options::AppOptions;
use logfleet::app::state::AppState;
use logfleet::deploy::commands::CommandSettings;
use logfleet::fleet::{DeployTarget, FleetService};
use logfleet::models::machine::{Machine, MachineId};
use logfleet::models::process::{ConfigArtifacts, ProcessId};
use logfleet::models::task::{Task, TaskId};
use logfleet::remote::memory::MemoryHost;

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub state: AppState,
    pub host: Arc<MemoryHost>,
    pub package: PathBuf,
}

impl Harness {
    pub fn fleet(&self) -> &FleetService {
        &self.state.fleet
    }

    pub async fn machine(&self, id: MachineId) -> Machine {
        self.state.stores.machines.get_machine(id).await.unwrap().unwrap()
    }

    pub async fn wait(&self, task_id: &str) -> Task {
        self.fleet().await_task(task_id, WAIT).await.unwrap()
    }

    /// Deploy a fresh process to `machines` and wait for every task
    pub async fn deploy(&self, name: &str, machines: &[MachineId]) -> (ProcessId, Vec<TaskId>) {
        let process = self
            .fleet()
            .create_process(name, templates())
            .await
            .unwrap();
        let targets: Vec<DeployTarget> = machines.iter().map(|m| DeployTarget::new(*m)).collect();
        let tasks: Vec<TaskId> = self
            .fleet()
            .deploy(process.id, &targets)
            .await
            .unwrap()
            .into_values()
            .collect();
        for task in &tasks {
            self.wait(task).await;
        }
        (process.id, tasks)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.package);
    }
}

pub fn templates() -> ConfigArtifacts {
    ConfigArtifacts {
        main_config: "input { beats { port => 5044 } }\noutput { stdout {} }\n".to_string(),
        jvm_options: "-Xms512m\n-Xmx512m\n".to_string(),
        system_config: "pipeline.workers: 2\n".to_string(),
    }
}

/// Command timing with every wait set to zero
pub fn fast_commands(package: PathBuf) -> CommandSettings {
    CommandSettings {
        package_path: package,
        start_settle: Duration::ZERO,
        verify_attempts: 2,
        verify_interval: Duration::ZERO,
        stop_grace: Duration::ZERO,
        stop_force_wait: Duration::ZERO,
        stop_poll_interval: Duration::ZERO,
    }
}

/// A local package archive the upload step can find
pub fn package_file() -> PathBuf {
    let path = std::env::temp_dir().join(format!("logfleet-pkg-{}.tar.gz", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"not really a tarball").unwrap();
    path
}

pub fn options(package: PathBuf) -> AppOptions {
    let mut options = AppOptions::default();
    options.commands = fast_commands(package);
    options.deploy_base_dir = "/opt/logstash".to_string();
    options.worker_pool_size = 4;
    options.monitor.grace_period = Duration::ZERO;
    options
}

pub fn harness(machine_ids: &[MachineId]) -> Harness {
    harness_with(machine_ids, |_| {})
}

pub fn harness_with(machine_ids: &[MachineId], tweak: impl FnOnce(&mut AppOptions)) -> Harness {
    let package = package_file();
    let mut options = options(package.clone());
    tweak(&mut options);

    let host = Arc::new(MemoryHost::new());
    let machines = machine_ids
        .iter()
        .map(|id| Machine::new(*id, format!("m{}", id), format!("10.0.0.{}", id)))
        .collect();
    let state = AppState::build(&options, machines, host.clone());
    Harness {
        state,
        host,
        package,
    }
}
