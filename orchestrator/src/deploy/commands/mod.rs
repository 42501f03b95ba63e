//! Idempotent remote commands
//!
//! Every command first checks whether its goal already holds on the
//! machine and only acts when it does not. Failures come back as values so
//! one machine's failure never interrupts work on another.

pub mod config;
pub mod directory;
pub mod package;
pub mod process;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::deploy::paths::InstancePaths;
use crate::errors::OrchestratorError;
use crate::models::machine::Machine;
use crate::models::process::{ConfigArtifact, ConfigArtifacts, Instance};
use crate::models::task::{OperationType, StepKind};
use crate::remote::channel::SshError;
use crate::remote::host::RemoteHost;
use crate::store::InstanceStore;

use self::config::WriteConfig;
use self::directory::CreateRemoteDir;
use self::package::{ExtractPackage, UploadPackage};
use self::process::{StartProcess, StopProcess, VerifyProcess};

/// Timing and package settings for the command set
#[derive(Debug, Clone)]
pub struct CommandSettings {
    /// Local archive of the log shipper
    pub package_path: PathBuf,

    /// Wait between launching and reading back the pid
    pub start_settle: Duration,

    /// Liveness checks made by VERIFY_PROCESS
    pub verify_attempts: u32,

    /// Base delay between liveness checks
    pub verify_interval: Duration,

    /// How long a stop waits after SIGTERM
    pub stop_grace: Duration,

    /// How long a stop waits after SIGKILL
    pub stop_force_wait: Duration,

    /// Liveness polling interval while stopping
    pub stop_poll_interval: Duration,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            package_path: PathBuf::from("/opt/logfleet/packages/logstash.tar.gz"),
            start_settle: Duration::from_secs(3),
            verify_attempts: 5,
            verify_interval: Duration::from_secs(3),
            stop_grace: Duration::from_secs(360),
            stop_force_wait: Duration::from_secs(180),
            stop_poll_interval: Duration::from_secs(3),
        }
    }
}

impl CommandSettings {
    /// File name the archive is uploaded under
    pub fn archive_name(&self) -> String {
        self.package_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "logstash.tar.gz".to_string())
    }
}

/// Why a command failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub message: String,
    /// The orchestrator host itself is missing something
    pub environment: bool,
}

impl CommandFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            environment: false,
        }
    }

    pub fn environment(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            environment: true,
        }
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<SshError> for CommandFailure {
    fn from(err: SshError) -> Self {
        Self {
            environment: err.is_environment(),
            message: err.to_string(),
        }
    }
}

impl From<OrchestratorError> for CommandFailure {
    fn from(err: OrchestratorError) -> Self {
        Self {
            environment: matches!(err, OrchestratorError::EnvironmentError(_)),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Goal already held; nothing was done
    Satisfied,
    /// Action performed and postcondition verified
    Applied,
    Failed(CommandFailure),
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CommandOutcome::Failed(_))
    }
}

/// Everything a command needs about its target
pub struct CommandContext<'a> {
    pub machine: &'a Machine,
    pub instance: &'a Instance,
    pub paths: InstancePaths,
    pub host: &'a dyn RemoteHost,
    pub instances: &'a dyn InstanceStore,
    pub settings: &'a CommandSettings,
}

impl<'a> CommandContext<'a> {
    pub fn new(
        machine: &'a Machine,
        instance: &'a Instance,
        host: &'a dyn RemoteHost,
        instances: &'a dyn InstanceStore,
        settings: &'a CommandSettings,
    ) -> Self {
        Self {
            machine,
            instance,
            paths: InstancePaths::new(&instance.deploy_path, instance.id),
            host,
            instances,
            settings,
        }
    }
}

#[async_trait]
pub trait RemoteCommand: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the goal already holds on the machine
    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure>;

    /// Act, then verify the postcondition
    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure>;
}

/// Check, then act if needed. A failed check is logged and treated as
/// "not satisfied" unless it points at the local environment.
pub async fn run_command(command: &dyn RemoteCommand, ctx: &CommandContext<'_>) -> CommandOutcome {
    match command.is_satisfied(ctx).await {
        Ok(true) => {
            debug!(command = command.name(), instance_id = ctx.instance.id, "already satisfied");
            return CommandOutcome::Satisfied;
        }
        Ok(false) => {}
        Err(failure) if failure.environment => return CommandOutcome::Failed(failure),
        Err(failure) => {
            warn!(
                command = command.name(),
                instance_id = ctx.instance.id,
                "idempotency check failed, executing anyway: {}",
                failure
            );
        }
    }

    match command.apply(ctx).await {
        Ok(()) => CommandOutcome::Applied,
        Err(failure) => CommandOutcome::Failed(failure),
    }
}

/// Builds the command behind each step kind
#[derive(Debug, Clone)]
pub struct CommandFactory {
    settings: Arc<CommandSettings>,
}

impl CommandFactory {
    pub fn new(settings: Arc<CommandSettings>) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CommandSettings {
        &self.settings
    }

    /// `desired` is the config content the step should leave on disk
    pub fn command_for(
        &self,
        kind: StepKind,
        operation: OperationType,
        desired: &ConfigArtifacts,
    ) -> Box<dyn RemoteCommand> {
        let write = |artifacts: &[ConfigArtifact]| -> Box<dyn RemoteCommand> {
            Box::new(WriteConfig::new(
                kind,
                artifacts
                    .iter()
                    .map(|a| (*a, desired.get(*a).to_string()))
                    .collect(),
            ))
        };

        match kind {
            StepKind::CreateRemoteDir => Box::new(CreateRemoteDir),
            StepKind::UploadPackage => Box::new(UploadPackage),
            StepKind::ExtractPackage => Box::new(ExtractPackage),
            StepKind::CreateConfig | StepKind::UpdateMainConfig => write(&[ConfigArtifact::Main]),
            StepKind::UpdateJvmConfig => write(&[ConfigArtifact::Jvm]),
            StepKind::UpdateSystemConfig if operation == OperationType::Initialize => {
                write(&[ConfigArtifact::Jvm, ConfigArtifact::System])
            }
            StepKind::UpdateSystemConfig => write(&[ConfigArtifact::System]),
            StepKind::RefreshConfig => write(&ConfigArtifact::ALL),
            StepKind::StartProcess => Box::new(StartProcess),
            StepKind::VerifyProcess => Box::new(VerifyProcess),
            StepKind::StopProcess => Box::new(StopProcess),
        }
    }
}
