//! Deploy path resolution and per-instance file layout

use crate::errors::OrchestratorError;
use crate::models::machine::Machine;
use crate::models::process::{ConfigArtifact, InstanceId};
use crate::utils::short_suffix;

/// Computes the remote directory an instance lives in
#[derive(Debug, Clone)]
pub struct DeployPathResolver {
    base_dir: String,
}

impl DeployPathResolver {
    pub fn new(base_dir: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Resolve with precedence: persisted path, explicit path, generated default
    pub fn resolve(
        &self,
        persisted: Option<&str>,
        explicit: Option<&str>,
        machine: &Machine,
    ) -> Result<String, OrchestratorError> {
        if let Some(path) = persisted.filter(|p| !p.trim().is_empty()) {
            return Ok(path.to_string());
        }
        match explicit.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => normalize_user_path(path, &machine.home_dir()),
            None => self.generate_default(machine),
        }
    }

    /// Base directory plus a random suffix
    pub fn generate_default(&self, machine: &Machine) -> Result<String, OrchestratorError> {
        let base = normalize_user_path(&self.base_dir, &machine.home_dir())?;
        let base = base.trim_end_matches('/');
        Ok(format!("{}/logstash-{}", base, short_suffix()))
    }
}

/// Resolve `~`, relative and absolute forms against `home`, collapsing
/// `.` and `..` segments
pub fn normalize_user_path(path: &str, home: &str) -> Result<String, OrchestratorError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(OrchestratorError::ValidationError(
            "deploy path must not be empty".to_string(),
        ));
    }
    if path.contains('\0') || path.contains('\n') {
        return Err(OrchestratorError::ValidationError(format!(
            "deploy path contains control characters: {:?}",
            path
        )));
    }

    let joined = if path == "~" {
        home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{}/{}", home, rest)
    } else if path.starts_with('~') {
        return Err(OrchestratorError::ValidationError(format!(
            "deploy path '{}' refers to another user's home directory",
            path
        )));
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", home, path)
    };

    Ok(collapse(&joined))
}

fn collapse(absolute: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in absolute.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// File layout under one instance's deploy directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    deploy_dir: String,
    instance_id: InstanceId,
}

impl InstancePaths {
    pub fn new(deploy_dir: &str, instance_id: InstanceId) -> Self {
        Self {
            deploy_dir: deploy_dir.trim_end_matches('/').to_string(),
            instance_id,
        }
    }

    pub fn deploy_dir(&self) -> &str {
        &self.deploy_dir
    }

    pub fn config_dir(&self) -> String {
        format!("{}/config", self.deploy_dir)
    }

    pub fn log_dir(&self) -> String {
        format!("{}/logs", self.deploy_dir)
    }

    pub fn data_dir(&self) -> String {
        format!("{}/data", self.deploy_dir)
    }

    pub fn binary(&self) -> String {
        format!("{}/bin/logstash", self.deploy_dir)
    }

    pub fn main_config_file(&self) -> String {
        format!("{}/logstash-{}.conf", self.config_dir(), self.instance_id)
    }

    pub fn jvm_options_file(&self) -> String {
        format!("{}/jvm.options", self.config_dir())
    }

    pub fn system_config_file(&self) -> String {
        format!("{}/logstash.yml", self.config_dir())
    }

    pub fn config_file(&self, artifact: ConfigArtifact) -> String {
        match artifact {
            ConfigArtifact::Main => self.main_config_file(),
            ConfigArtifact::Jvm => self.jvm_options_file(),
            ConfigArtifact::System => self.system_config_file(),
        }
    }

    pub fn log_file(&self) -> String {
        format!("{}/logstash-{}.log", self.log_dir(), self.instance_id)
    }

    pub fn pid_file(&self) -> String {
        format!("{}/logstash-{}.pid", self.log_dir(), self.instance_id)
    }

    /// Where the uploaded archive lands before extraction
    pub fn archive_file(&self, archive_name: &str) -> String {
        format!("{}/{}", self.deploy_dir, archive_name)
    }
}
