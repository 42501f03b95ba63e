//! Remote execution channel

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::machine::Machine;

/// Failure kinds surfaced by the execution channel
#[derive(Error, Debug)]
pub enum SshError {
    /// A local client tool is not installed on the orchestrator host
    #[error("required tool '{tool}' not found on PATH ({hint})")]
    ToolMissing { tool: String, hint: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("remote command exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    /// The command ran but its answer could not be read
    #[error("unrecognized output from `{command}`: {output:?}")]
    UnexpectedOutput { command: String, output: String },

    /// ssh itself failed to connect or authenticate (exit status 255)
    #[error("unable to reach host: {0}")]
    Unreachable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Not machine-specific: retrying on another machine will not help
    pub fn is_environment(&self) -> bool {
        matches!(self, SshError::ToolMissing { .. })
    }

    /// Short remediation hint for connection failures
    pub fn hint(&self) -> &'static str {
        match self {
            SshError::ToolMissing { .. } => "install the missing tool on the orchestrator host",
            SshError::Timeout { .. } => "connection timed out; check network reachability and firewall rules",
            SshError::Unreachable(msg) | SshError::NonZeroExit { stderr: msg, .. } => {
                classify_failure(msg)
            }
            SshError::UnexpectedOutput { .. } => {
                "the remote shell printed something unexpected; check login banners and shell rc files"
            }
            SshError::Io(_) => "local I/O failure while talking to ssh",
        }
    }
}

/// Map raw ssh diagnostics onto a human hint
pub fn classify_failure(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("permission denied") || lower.contains("authentication") {
        "authentication failed; check username, password or private key"
    } else if lower.contains("connection refused") {
        "connection refused; check that sshd listens on the configured port"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "connection timed out; check network reachability and firewall rules"
    } else if lower.contains("no route to host")
        || lower.contains("could not resolve")
        || lower.contains("name or service not known")
        || lower.contains("network is unreachable")
    {
        "host unreachable; check the address and DNS"
    } else {
        "check the machine's connection settings"
    }
}

/// Per-call timeouts; all finite
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
            transfer_timeout: Duration::from_secs(600),
        }
    }
}

/// Run a command on, or copy a file to/from, a machine
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Execute a shell command and return its captured stdout
    async fn exec(&self, machine: &Machine, command: &str) -> Result<String, SshError>;

    /// Copy a local file to the given remote path
    async fn upload(&self, machine: &Machine, local: &Path, remote: &str) -> Result<(), SshError>;

    /// Copy a remote file to the given local path
    async fn download(&self, machine: &Machine, remote: &str, local: &Path)
        -> Result<(), SshError>;
}
