//! Package upload and extraction

use async_trait::async_trait;
use tracing::info;

use crate::deploy::commands::{CommandContext, CommandFailure, RemoteCommand};
use crate::filesys::file::File;

/// Copies the log shipper archive into the deploy directory.
///
/// Satisfied once the package has been extracted; a leftover archive from an
/// interrupted transfer is overwritten rather than trusted.
pub struct UploadPackage;

#[async_trait]
impl RemoteCommand for UploadPackage {
    fn name(&self) -> &'static str {
        "upload package"
    }

    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        Ok(ctx.host.file_exists(ctx.machine, &ctx.paths.binary()).await?)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        let package = File::new(&ctx.settings.package_path);
        if !package.exists().await {
            return Err(CommandFailure::environment(format!(
                "package archive {} not found on the orchestrator host",
                package.path().display()
            )));
        }

        let remote = ctx.paths.archive_file(&ctx.settings.archive_name());
        let size = package.size().await.unwrap_or(0);
        info!(machine = %ctx.machine.name, size, remote = %remote, "uploading package");
        ctx.host
            .upload_file(ctx.machine, package.path(), &remote)
            .await?;

        if !ctx.host.file_exists(ctx.machine, &remote).await? {
            return Err(CommandFailure::new(format!(
                "archive {} missing after upload",
                remote
            )));
        }
        Ok(())
    }
}

/// Unpacks the uploaded archive in place
pub struct ExtractPackage;

#[async_trait]
impl RemoteCommand for ExtractPackage {
    fn name(&self) -> &'static str {
        "extract package"
    }

    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        Ok(ctx.host.file_exists(ctx.machine, &ctx.paths.binary()).await?)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        let archive = ctx.paths.archive_file(&ctx.settings.archive_name());
        if !ctx.host.file_exists(ctx.machine, &archive).await? {
            return Err(CommandFailure::new(format!(
                "archive {} not found; upload the package first",
                archive
            )));
        }

        info!(machine = %ctx.machine.name, archive = %archive, "extracting package");
        ctx.host
            .extract_archive(ctx.machine, &archive, ctx.paths.deploy_dir())
            .await?;

        let binary = ctx.paths.binary();
        if !ctx.host.file_exists(ctx.machine, &binary).await? {
            return Err(CommandFailure::new(format!(
                "{} missing after extraction",
                binary
            )));
        }
        Ok(())
    }
}
