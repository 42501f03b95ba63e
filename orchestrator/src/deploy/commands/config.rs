//! Config file commands

use async_trait::async_trait;
use tracing::{debug, info};

use crate::deploy::commands::{CommandContext, CommandFailure, RemoteCommand};
use crate::models::process::ConfigArtifact;
use crate::models::task::StepKind;
use crate::utils::sha256_hash;

/// Writes one or more config artifacts. Blank content leaves the file the
/// package shipped with in place.
pub struct WriteConfig {
    kind: StepKind,
    artifacts: Vec<(ConfigArtifact, String)>,
}

impl WriteConfig {
    pub fn new(kind: StepKind, artifacts: Vec<(ConfigArtifact, String)>) -> Self {
        Self {
            kind,
            artifacts: artifacts
                .into_iter()
                .filter(|(_, content)| !content.trim().is_empty())
                .collect(),
        }
    }

    pub fn artifacts(&self) -> impl Iterator<Item = ConfigArtifact> + '_ {
        self.artifacts.iter().map(|(a, _)| *a)
    }
}

#[async_trait]
impl RemoteCommand for WriteConfig {
    fn name(&self) -> &'static str {
        self.kind.display_name()
    }

    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        for (artifact, content) in &self.artifacts {
            let path = ctx.paths.config_file(*artifact);
            let remote = ctx.host.file_digest(ctx.machine, &path).await?;
            if remote.as_deref() != Some(sha256_hash(content.as_bytes()).as_str()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        for (artifact, content) in &self.artifacts {
            let path = ctx.paths.config_file(*artifact);
            let expected = sha256_hash(content.as_bytes());

            if ctx.host.file_digest(ctx.machine, &path).await?.as_deref() == Some(expected.as_str()) {
                debug!(path = %path, "config file unchanged");
                continue;
            }

            info!(machine = %ctx.machine.name, path = %path, "writing config file");
            ctx.host.write_file(ctx.machine, &path, content).await?;

            let written = ctx.host.file_digest(ctx.machine, &path).await?;
            if written.as_deref() != Some(expected.as_str()) {
                return Err(CommandFailure::new(format!(
                    "config file {} does not match the requested content after write",
                    path
                )));
            }
        }
        Ok(())
    }
}
