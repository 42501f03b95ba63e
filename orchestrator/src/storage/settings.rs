//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::commands::CommandSettings;
use crate::deploy::executor::FailurePolicy;
use crate::logs::LogLevel;
use crate::remote::channel::SshOptions;
use crate::workers::monitor;

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Local archive of the log shipper
    #[serde(default = "default_package_path")]
    pub package_path: PathBuf,

    /// Directory generated deploy paths are created under. Relative values
    /// resolve against the target user's home.
    #[serde(default = "default_deploy_base_dir")]
    pub deploy_base_dir: String,

    /// SSH timeouts
    #[serde(default)]
    pub ssh: SshSettings,

    /// Liveness monitor
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Remote command timing
    #[serde(default)]
    pub commands: CommandTimingSettings,

    /// Tasks executed concurrently
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// On retry, re-run plan steps an earlier attempt skipped as already done
    #[serde(default)]
    pub retry_revalidates_skipped: bool,

    /// What happens to later phases of an operation after a step fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_true() -> bool {
    true
}

fn default_package_path() -> PathBuf {
    PathBuf::from("/opt/logfleet/packages/logstash.tar.gz")
}

fn default_deploy_base_dir() -> String {
    "logstash".to_string()
}

fn default_worker_pool_size() -> usize {
    8
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            package_path: default_package_path(),
            deploy_base_dir: default_deploy_base_dir(),
            ssh: SshSettings::default(),
            monitor: MonitorSettings::default(),
            commands: CommandTimingSettings::default(),
            worker_pool_size: default_worker_pool_size(),
            retry_revalidates_skipped: false,
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Settings {
    pub fn command_settings(&self) -> CommandSettings {
        let c = &self.commands;
        CommandSettings {
            package_path: self.package_path.clone(),
            start_settle: Duration::from_secs(c.start_settle_secs),
            verify_attempts: c.verify_attempts,
            verify_interval: Duration::from_secs(c.verify_interval_secs),
            stop_grace: Duration::from_secs(c.stop_grace_secs),
            stop_force_wait: Duration::from_secs(c.stop_force_wait_secs),
            stop_poll_interval: Duration::from_secs(c.stop_poll_interval_secs),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.ssh.command_timeout_secs),
            transfer_timeout: Duration::from_secs(self.ssh.transfer_timeout_secs),
        }
    }

    pub fn monitor_options(&self) -> monitor::Options {
        monitor::Options {
            interval: Duration::from_secs(self.monitor.interval_secs),
            initial_delay: Duration::from_secs(self.monitor.initial_delay_secs),
            grace_period: Duration::from_secs(self.monitor.grace_period_secs),
            log_tail_lines: self.monitor.log_tail_lines,
        }
    }
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Upper bound for a single upload or download
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    300
}

fn default_transfer_timeout() -> u64 {
    600
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

/// Liveness monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_monitor_initial_delay")]
    pub initial_delay_secs: u64,

    /// Instances that changed state more recently are left alone
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

fn default_monitor_interval() -> u64 {
    300
}

fn default_monitor_initial_delay() -> u64 {
    30
}

fn default_grace_period() -> u64 {
    120
}

fn default_log_tail_lines() -> usize {
    50
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
            initial_delay_secs: default_monitor_initial_delay(),
            grace_period_secs: default_grace_period(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

/// Remote command timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTimingSettings {
    #[serde(default = "default_start_settle")]
    pub start_settle_secs: u64,

    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,

    #[serde(default = "default_poll_interval")]
    pub verify_interval_secs: u64,

    /// Wait after SIGTERM before escalating
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Wait after SIGKILL before giving up
    #[serde(default = "default_stop_force_wait")]
    pub stop_force_wait_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub stop_poll_interval_secs: u64,
}

fn default_start_settle() -> u64 {
    3
}

fn default_verify_attempts() -> u32 {
    5
}

fn default_poll_interval() -> u64 {
    3
}

fn default_stop_grace() -> u64 {
    360
}

fn default_stop_force_wait() -> u64 {
    180
}

impl Default for CommandTimingSettings {
    fn default() -> Self {
        Self {
            start_settle_secs: default_start_settle(),
            verify_attempts: default_verify_attempts(),
            verify_interval_secs: default_poll_interval(),
            stop_grace_secs: default_stop_grace(),
            stop_force_wait_secs: default_stop_force_wait(),
            stop_poll_interval_secs: default_poll_interval(),
        }
    }
}
