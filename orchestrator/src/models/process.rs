//! Logical processes and their deployed instances

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::InstanceState;
use crate::models::machine::MachineId;
use crate::models::task::StepKind;

pub type ProcessId = i64;
pub type InstanceId = i64;

/// The three configuration artifacts a log shipper runs with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigArtifacts {
    /// Pipeline configuration
    pub main_config: String,
    /// JVM options file
    pub jvm_options: String,
    /// System settings (logstash.yml)
    pub system_config: String,
}

impl ConfigArtifacts {
    pub fn get(&self, artifact: ConfigArtifact) -> &str {
        match artifact {
            ConfigArtifact::Main => &self.main_config,
            ConfigArtifact::Jvm => &self.jvm_options,
            ConfigArtifact::System => &self.system_config,
        }
    }

    /// Overlay the supplied parts of an update onto these artifacts
    pub fn merged(&self, update: &ConfigUpdate) -> ConfigArtifacts {
        ConfigArtifacts {
            main_config: update.main_config.clone().unwrap_or_else(|| self.main_config.clone()),
            jvm_options: update.jvm_options.clone().unwrap_or_else(|| self.jvm_options.clone()),
            system_config: update
                .system_config
                .clone()
                .unwrap_or_else(|| self.system_config.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigArtifact {
    Main,
    Jvm,
    System,
}

impl ConfigArtifact {
    pub const ALL: [ConfigArtifact; 3] =
        [ConfigArtifact::Main, ConfigArtifact::Jvm, ConfigArtifact::System];

    /// Step that writes this artifact during UPDATE_CONFIG
    pub fn update_step(&self) -> StepKind {
        match self {
            ConfigArtifact::Main => StepKind::UpdateMainConfig,
            ConfigArtifact::Jvm => StepKind::UpdateJvmConfig,
            ConfigArtifact::System => StepKind::UpdateSystemConfig,
        }
    }
}

/// Partial config change; absent parts are left as they are
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jvm_options: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_config: Option<String>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.artifacts().is_empty()
    }

    /// Artifacts carried by this update, in step order
    pub fn artifacts(&self) -> Vec<ConfigArtifact> {
        let mut artifacts = Vec::new();
        if self.main_config.is_some() {
            artifacts.push(ConfigArtifact::Main);
        }
        if self.jvm_options.is_some() {
            artifacts.push(ConfigArtifact::Jvm);
        }
        if self.system_config.is_some() {
            artifacts.push(ConfigArtifact::System);
        }
        artifacts
    }
}

/// A named log-shipping configuration template
#[derive(Debug, Clone)]
pub struct LogicalProcess {
    pub id: ProcessId,
    pub name: String,
    pub templates: ConfigArtifacts,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One deployment of a logical process on one machine
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub process_id: ProcessId,
    pub machine_id: MachineId,
    /// Absolute remote directory, fixed at creation
    pub deploy_path: String,
    pub config: ConfigArtifacts,
    pub process_pid: Option<u32>,
    pub state: InstanceState,
    pub state_changed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when an instance row is created
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub process_id: ProcessId,
    pub machine_id: MachineId,
    pub deploy_path: String,
    pub config: ConfigArtifacts,
}
