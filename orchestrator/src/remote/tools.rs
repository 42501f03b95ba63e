//! Local client tool validation

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::debug;

use crate::remote::channel::SshError;

/// External binaries the native channel shells out to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTool {
    Ssh,
    Scp,
    Sshpass,
}

impl LocalTool {
    pub const ALL: [LocalTool; 3] = [LocalTool::Ssh, LocalTool::Scp, LocalTool::Sshpass];

    pub fn binary(&self) -> &'static str {
        match self {
            LocalTool::Ssh => "ssh",
            LocalTool::Scp => "scp",
            LocalTool::Sshpass => "sshpass",
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            LocalTool::Ssh | LocalTool::Scp => {
                "install openssh-client (apt-get install openssh-client / yum install openssh-clients)"
            }
            LocalTool::Sshpass => {
                "password authentication needs sshpass (apt-get install sshpass / yum install sshpass)"
            }
        }
    }

    fn index(&self) -> usize {
        match self {
            LocalTool::Ssh => 0,
            LocalTool::Scp => 1,
            LocalTool::Sshpass => 2,
        }
    }
}

/// Checks PATH once per tool and remembers the answer
#[derive(Debug, Default)]
pub struct ToolValidator {
    resolved: [OnceLock<Option<PathBuf>>; 3],
}

impl ToolValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the tool or fail with an environment error
    pub fn require(&self, tool: LocalTool) -> Result<PathBuf, SshError> {
        let resolved = self.resolved[tool.index()].get_or_init(|| {
            let found = find_in_path(tool.binary());
            debug!(tool = tool.binary(), found = ?found, "resolved local tool");
            found
        });
        resolved.clone().ok_or_else(|| SshError::ToolMissing {
            tool: tool.binary().to_string(),
            hint: tool.install_hint().to_string(),
        })
    }
}

/// Locate an executable on PATH
pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode() & 0o111 != 0
            }
            #[cfg(not(unix))]
            {
                true
            }
        }
        _ => false,
    }
}
