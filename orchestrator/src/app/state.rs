//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::commands::CommandFactory;
use crate::deploy::executor::{InstanceExecutor, InstanceLocks};
use crate::deploy::paths::DeployPathResolver;
use crate::deploy::validator::ConnectionValidator;
use crate::errors::OrchestratorError;
use crate::fleet::FleetService;
use crate::models::machine::Machine;
use crate::remote::host::{RemoteHost, ShellHost};
use crate::remote::memory::MemoryHost;
use crate::remote::native::NativeSshChannel;
use crate::remote::tools::ToolValidator;
use crate::storage::inventory::load_inventory;
use crate::store::memory::MemoryStore;
use crate::store::Stores;
use crate::tasks::ledger::TaskLedger;
use crate::tasks::pool::WorkerPool;
use crate::workers::monitor::LivenessMonitor;

/// Main application state
pub struct AppState {
    /// Repositories
    pub stores: Stores,

    /// Backing store of `stores`, for registering machines
    pub store: Arc<MemoryStore>,

    /// How machines are reached
    pub host: Arc<dyn RemoteHost>,

    /// Per-instance locks shared by the executor and the monitor
    pub locks: Arc<InstanceLocks>,

    /// Task and step records
    pub ledger: Arc<TaskLedger>,

    /// Inbound operations
    pub fleet: Arc<FleetService>,

    /// Liveness checks over running instances
    pub monitor: Arc<LivenessMonitor>,
}

impl AppState {
    /// Initialize application state from the storage layout
    pub async fn init(options: &AppOptions) -> Result<Self, OrchestratorError> {
        info!("Initializing application state...");

        options.layout.setup().await?;
        let machines = load_inventory(&options.layout.inventory_file()).await?;
        info!("Loaded {} machine(s) from the inventory", machines.len());

        let host: Arc<dyn RemoteHost> = if options.dry_run {
            info!("Dry run: machines are simulated in memory");
            Arc::new(MemoryHost::new())
        } else {
            let channel = NativeSshChannel::new(options.ssh.clone(), Arc::new(ToolValidator::new()));
            Arc::new(ShellHost::new(Arc::new(channel)))
        };

        Ok(Self::build(options, machines, host))
    }

    /// Wire every component around the given host
    pub fn build(options: &AppOptions, machines: Vec<Machine>, host: Arc<dyn RemoteHost>) -> Self {
        let store = Arc::new(MemoryStore::new());
        for machine in machines {
            store.insert_machine(machine);
        }
        let stores = Stores::in_memory(store.clone());

        let locks = Arc::new(InstanceLocks::new());
        let ledger = Arc::new(TaskLedger::new(
            stores.tasks.clone(),
            stores.steps.clone(),
            WorkerPool::new(options.worker_pool_size),
        ));
        let executor = Arc::new(InstanceExecutor::new(
            stores.machines.clone(),
            stores.instances.clone(),
            host.clone(),
            ledger.clone(),
            CommandFactory::new(Arc::new(options.commands.clone())),
            locks.clone(),
            options.failure_policy,
        ));
        let fleet = Arc::new(FleetService::new(
            stores.clone(),
            ledger.clone(),
            executor,
            ConnectionValidator::new(stores.machines.clone(), host.clone()),
            DeployPathResolver::new(options.deploy_base_dir.clone()),
            options.fleet.clone(),
        ));
        let monitor = Arc::new(LivenessMonitor::new(
            stores.machines.clone(),
            stores.instances.clone(),
            host.clone(),
            locks.clone(),
            options.monitor.clone(),
        ));

        Self {
            stores,
            store,
            host,
            locks,
            ledger,
            fleet,
            monitor,
        }
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("Shutting down application state...");
        self.ledger.pool().close();
        Ok(())
    }
}
