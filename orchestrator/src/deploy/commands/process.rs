//! Process lifecycle commands

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::commands::{CommandContext, CommandFailure, RemoteCommand};
use crate::remote::channel::SshError;
use crate::remote::host::{Launch, Signal};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Lines of the instance log attached to start failures
const FAILURE_LOG_LINES: usize = 10;

/// Read the pid the launcher recorded. Falls back to the pid stored on the
/// instance when the file is gone.
async fn current_pid(ctx: &CommandContext<'_>) -> Result<Option<u32>, SshError> {
    let from_file = ctx
        .host
        .read_file(ctx.machine, &ctx.paths.pid_file())
        .await?
        .and_then(|contents| contents.trim().parse::<u32>().ok());
    Ok(from_file.or(ctx.instance.process_pid))
}

async fn log_tail(ctx: &CommandContext<'_>) -> String {
    ctx.host
        .tail_file(ctx.machine, &ctx.paths.log_file(), FAILURE_LOG_LINES)
        .await
        .unwrap_or_default()
}

/// Poll until the process is gone or `within` elapses. True if it exited.
async fn wait_for_exit(
    ctx: &CommandContext<'_>,
    pid: u32,
    within: Duration,
) -> Result<bool, SshError> {
    let deadline = Instant::now() + within;
    loop {
        if !ctx.host.process_alive(ctx.machine, pid).await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(ctx.settings.stop_poll_interval.min(deadline - now)).await;
    }
}

/// Launches the shipper detached and records its pid
pub struct StartProcess;

impl StartProcess {
    fn launch(ctx: &CommandContext<'_>) -> Launch {
        Launch {
            workdir: ctx.paths.deploy_dir().to_string(),
            program: "./bin/logstash".to_string(),
            args: vec![
                "-f".to_string(),
                ctx.paths.main_config_file(),
                "--path.settings".to_string(),
                ctx.paths.config_dir(),
                "--path.data".to_string(),
                ctx.paths.data_dir(),
                "--path.logs".to_string(),
                ctx.paths.log_dir(),
            ],
            log_file: ctx.paths.log_file(),
            pid_file: ctx.paths.pid_file(),
        }
    }
}

#[async_trait]
impl RemoteCommand for StartProcess {
    fn name(&self) -> &'static str {
        "start process"
    }

    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        let Some(pid) = current_pid(ctx).await? else {
            return Ok(false);
        };
        if !ctx.host.process_alive(ctx.machine, pid).await? {
            return Ok(false);
        }
        if ctx.instance.process_pid != Some(pid) {
            ctx.instances.update_pid(ctx.instance.id, Some(pid)).await?;
        }
        Ok(true)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        let binary = ctx.paths.binary();
        if !ctx.host.file_exists(ctx.machine, &binary).await? {
            return Err(CommandFailure::new(format!(
                "{} not found; the package is not installed",
                binary
            )));
        }

        let pid_file = ctx.paths.pid_file();
        ctx.host.remove_file(ctx.machine, &pid_file).await?;

        info!(machine = %ctx.machine.name, instance_id = ctx.instance.id, "launching process");
        ctx.host.launch_detached(ctx.machine, &Self::launch(ctx)).await?;

        tokio::time::sleep(ctx.settings.start_settle).await;

        // Re-query instead of trusting the launch output
        let pid = ctx
            .host
            .read_file(ctx.machine, &pid_file)
            .await?
            .and_then(|contents| contents.trim().parse::<u32>().ok());
        let Some(pid) = pid else {
            return Err(CommandFailure::new(format!(
                "no process id captured in {}",
                pid_file
            )));
        };

        ctx.instances.update_pid(ctx.instance.id, Some(pid)).await?;
        debug!(instance_id = ctx.instance.id, pid, "recorded process id");
        Ok(())
    }
}

/// Confirms the recorded process stays alive
pub struct VerifyProcess;

#[async_trait]
impl RemoteCommand for VerifyProcess {
    fn name(&self) -> &'static str {
        "verify process"
    }

    async fn is_satisfied(&self, _ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        Ok(false)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        let cooldown = CooldownOptions {
            base_delay: ctx.settings.verify_interval,
            max_delay: ctx.settings.verify_interval * 4,
            multiplier: 1.5,
        };
        let attempts = ctx.settings.verify_attempts.max(1);

        let mut last_pid = None;
        for attempt in 0..attempts {
            if let Some(pid) = current_pid(ctx).await? {
                last_pid = Some(pid);
                if ctx.host.process_alive(ctx.machine, pid).await? {
                    ctx.instances.update_pid(ctx.instance.id, Some(pid)).await?;
                    debug!(instance_id = ctx.instance.id, pid, attempt, "process verified");
                    return Ok(());
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(calc_exp_backoff(&cooldown, attempt)).await;
            }
        }

        let tail = log_tail(ctx).await;
        let subject = match last_pid {
            Some(pid) => format!("process {}", pid),
            None => "process".to_string(),
        };
        let mut message = format!("{} not running after {} checks", subject, attempts);
        if !tail.trim().is_empty() {
            message.push_str("; last log lines:\n");
            message.push_str(tail.trim_end());
        }
        Err(CommandFailure::new(message))
    }
}

/// SIGTERM, then SIGKILL after the grace period, then confirm absence
pub struct StopProcess;

#[async_trait]
impl RemoteCommand for StopProcess {
    fn name(&self) -> &'static str {
        "stop process"
    }

    async fn is_satisfied(&self, ctx: &CommandContext<'_>) -> Result<bool, CommandFailure> {
        let stopped = match current_pid(ctx).await? {
            None => true,
            Some(pid) => !ctx.host.process_alive(ctx.machine, pid).await?,
        };
        // Drop a stale pid so the instance never points at a reused one
        if stopped && ctx.instance.process_pid.is_some() {
            ctx.instances.update_pid(ctx.instance.id, None).await?;
        }
        Ok(stopped)
    }

    async fn apply(&self, ctx: &CommandContext<'_>) -> Result<(), CommandFailure> {
        let Some(pid) = current_pid(ctx).await? else {
            return Ok(());
        };

        info!(machine = %ctx.machine.name, instance_id = ctx.instance.id, pid, "stopping process");
        ctx.host.signal_process(ctx.machine, pid, Signal::Term).await?;

        if !wait_for_exit(ctx, pid, ctx.settings.stop_grace).await? {
            warn!(
                instance_id = ctx.instance.id,
                pid,
                "process ignored SIGTERM for {:?}, sending SIGKILL",
                ctx.settings.stop_grace
            );
            ctx.host.signal_process(ctx.machine, pid, Signal::Kill).await?;
            if !wait_for_exit(ctx, pid, ctx.settings.stop_force_wait).await? {
                return Err(CommandFailure::new(format!(
                    "process {} still alive after SIGKILL",
                    pid
                )));
            }
        }

        ctx.host.remove_file(ctx.machine, &ctx.paths.pid_file()).await?;
        ctx.instances.update_pid(ctx.instance.id, None).await?;
        Ok(())
    }
}
