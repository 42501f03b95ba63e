//! SSH channel backed by the local `ssh`, `scp` and `sshpass` binaries

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::machine::{Machine, MachineAuth};
use crate::remote::channel::{RemoteChannel, SshError, SshOptions};
use crate::remote::tools::{LocalTool, ToolValidator};

/// sshpass exits with 5 when the password is rejected
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// ssh exits with 255 when the connection itself fails
const SSH_CONNECTION_ERROR: i32 = 255;

/// Private key material written out for the lifetime of one call
struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    async fn write(key: &str) -> Result<Self, SshError> {
        let scratch = Dir::scratch();
        scratch.create().await.map_err(to_io)?;
        let file = scratch.file(&format!("key-{}", uuid::Uuid::new_v4().simple()));

        let mut contents = key.to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }
        file.write_private(contents.as_bytes()).await.map_err(to_io)?;
        Ok(Self {
            path: file.path().to_path_buf(),
        })
    }
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "failed to remove key file: {}", e);
        }
    }
}

fn to_io(err: impl std::fmt::Display) -> SshError {
    SshError::Io(std::io::Error::other(err.to_string()))
}

/// A prepared ssh/scp invocation and the key file it depends on
struct Invocation {
    command: Command,
    _key: Option<KeyFile>,
    password_auth: bool,
}

pub struct NativeSshChannel {
    options: SshOptions,
    tools: Arc<ToolValidator>,
}

impl NativeSshChannel {
    pub fn new(options: SshOptions, tools: Arc<ToolValidator>) -> Self {
        Self { options, tools }
    }

    fn connection_args(&self, tool: LocalTool, machine: &Machine) -> Vec<String> {
        let port_flag = if tool == LocalTool::Scp { "-P" } else { "-p" };
        vec![
            port_flag.to_string(),
            machine.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
        ]
    }

    async fn prepare(&self, tool: LocalTool, machine: &Machine) -> Result<Invocation, SshError> {
        let binary = self.tools.require(tool)?;
        let mut args = self.connection_args(tool, machine);
        let mut key = None;
        let mut password_auth = false;

        let mut command = match &machine.auth {
            MachineAuth::Password(password) => {
                let sshpass = self.tools.require(LocalTool::Sshpass)?;
                let mut command = Command::new(sshpass);
                command.arg("-e").arg(&binary);
                command.env("SSHPASS", password.expose_secret());
                args.extend(["-o".to_string(), "PubkeyAuthentication=no".to_string()]);
                password_auth = true;
                command
            }
            MachineAuth::PrivateKey(private_key) => {
                let key_file = KeyFile::write(private_key.expose_secret()).await?;
                args.extend([
                    "-i".to_string(),
                    key_file.path.display().to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                ]);
                key = Some(key_file);
                Command::new(&binary)
            }
            MachineAuth::Agent => {
                args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
                Command::new(&binary)
            }
        };

        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        Ok(Invocation {
            command,
            _key: key,
            password_auth,
        })
    }

    async fn run(
        mut invocation: Invocation,
        operation: &str,
        after: Duration,
    ) -> Result<String, SshError> {
        let child = invocation.command.spawn()?;

        // Dropping the child on timeout kills it
        let output = match tokio::time::timeout(after, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(SshError::Timeout {
                    operation: operation.to_string(),
                    after,
                })
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(operation, code, stderr = %stderr, "remote call failed");

        if invocation.password_auth && code == SSHPASS_BAD_PASSWORD {
            return Err(SshError::Unreachable(
                "Permission denied: password rejected".to_string(),
            ));
        }
        if code == SSH_CONNECTION_ERROR {
            return Err(SshError::Unreachable(stderr));
        }
        Err(SshError::NonZeroExit { code, stderr })
    }
}

#[async_trait]
impl RemoteChannel for NativeSshChannel {
    async fn exec(&self, machine: &Machine, command: &str) -> Result<String, SshError> {
        let mut invocation = self.prepare(LocalTool::Ssh, machine).await?;
        invocation.command.arg(machine.destination()).arg(command);
        debug!(machine = %machine.name, command, "ssh exec");
        Self::run(invocation, "ssh exec", self.options.command_timeout).await
    }

    async fn upload(&self, machine: &Machine, local: &Path, remote: &str) -> Result<(), SshError> {
        if !File::new(local).exists().await {
            return Err(SshError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("local file {} does not exist", local.display()),
            )));
        }
        let mut invocation = self.prepare(LocalTool::Scp, machine).await?;
        invocation
            .command
            .arg(local)
            .arg(format!("{}:{}", machine.destination(), remote));
        debug!(machine = %machine.name, local = %local.display(), remote, "scp upload");
        Self::run(invocation, "scp upload", self.options.transfer_timeout).await?;
        Ok(())
    }

    async fn download(
        &self,
        machine: &Machine,
        remote: &str,
        local: &Path,
    ) -> Result<(), SshError> {
        let mut invocation = self.prepare(LocalTool::Scp, machine).await?;
        invocation
            .command
            .arg(format!("{}:{}", machine.destination(), remote))
            .arg(local);
        debug!(machine = %machine.name, remote, local = %local.display(), "scp download");
        Self::run(invocation, "scp download", self.options.transfer_timeout).await?;
        Ok(())
    }
}
