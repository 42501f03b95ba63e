//! Application configuration options

use std::time::Duration;

use crate::deploy::commands::CommandSettings;
use crate::deploy::executor::FailurePolicy;
use crate::fleet::FleetOptions;
use crate::remote::channel::SshOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::monitor;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Simulate every machine in memory instead of using SSH
    pub dry_run: bool,

    /// Generated deploy paths are created under this directory
    pub deploy_base_dir: String,

    /// Tasks executed concurrently
    pub worker_pool_size: usize,

    pub failure_policy: FailurePolicy,

    pub fleet: FleetOptions,

    pub ssh: SshOptions,

    pub commands: CommandSettings,

    /// Enable the liveness monitor
    pub enable_monitor: bool,

    /// Liveness monitor options
    pub monitor: monitor::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), StorageLayout::default())
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            dry_run: false,
            deploy_base_dir: settings.deploy_base_dir.clone(),
            worker_pool_size: settings.worker_pool_size.max(1),
            failure_policy: settings.failure_policy,
            fleet: FleetOptions {
                retry_revalidates_skipped: settings.retry_revalidates_skipped,
            },
            ssh: settings.ssh_options(),
            commands: settings.command_settings(),
            enable_monitor: settings.monitor.enabled,
            monitor: settings.monitor_options(),
        }
    }
}

/// Lifecycle options for the orchestrator
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}
