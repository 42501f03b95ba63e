//! Deploy directory commands

use async_trait::async_trait;
use tracing::info;

use crate::deploy::commands::{CommandContext, CommandFailure, RemoteCommand};

/// Creates the deploy directory with its config and log subdirectories
pub struct CreateRemoteDir;

#[async_trait]
impl RemoteCommand for CreateRemoteDir {
    fn name(&self) -> &'static str {
        "create remote directory"
    }

    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        let host = ctx.host;
        for dir in [ctx.paths.deploy_dir().to_string(), ctx.paths.config_dir(), ctx.paths.log_dir()] {
            if !host.dir_exists(ctx.machine, &dir).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        let deploy_dir = ctx.paths.deploy_dir();
        info!(machine = %ctx.machine.name, path = deploy_dir, "creating deploy directory");

        for dir in [deploy_dir.to_string(), ctx.paths.config_dir(), ctx.paths.log_dir()] {
            ctx.host.make_dir(ctx.machine, &dir).await?;
        }

        if !ctx.host.dir_exists(ctx.machine, deploy_dir).await? {
            return Err(CommandFailure::new(format!(
                "directory {} missing after creation",
                deploy_dir
            )));
        }
        Ok(())
    }
}

/// Removes the deploy directory and everything under it
pub struct DeleteDirectory;

#[async_trait]
impl RemoteCommand for DeleteDirectory {
    fn name(&self) -> &'static str {
        "delete remote directory"
    }

    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        Ok(!ctx.host.dir_exists(ctx.machine, ctx.paths.deploy_dir()).await?)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        let deploy_dir = ctx.paths.deploy_dir();
        if deploy_dir.is_empty() || deploy_dir == "/" || deploy_dir == ctx.machine.home_dir() {
            return Err(CommandFailure::new(format!(
                "refusing to remove {}",
                deploy_dir
            )));
        }

        info!(machine = %ctx.machine.name, path = deploy_dir, "removing deploy directory");
        ctx.host.remove_dir(ctx.machine, deploy_dir).await?;

        if ctx.host.dir_exists(ctx.machine, deploy_dir).await? {
            return Err(CommandFailure::new(format!(
                "directory {} still present after removal",
                deploy_dir
            )));
        }
        Ok(())
    }
}
