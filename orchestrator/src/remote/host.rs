//! Typed remote primitives the command set is written against

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;

use crate::models::machine::Machine;
use crate::remote::channel::{RemoteChannel, SshError};

const ABSENT: &str = "__LOGFLEET_ABSENT__";
const PRESENT: &str = "__LOGFLEET_PRESENT__";
const PING: &str = "__LOGFLEET_PING__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn flag(&self) -> &'static str {
        match self {
            Signal::Term => "-TERM",
            Signal::Kill => "-KILL",
        }
    }
}

/// A detached launch of the log shipper
#[derive(Debug, Clone)]
pub struct Launch {
    pub workdir: String,
    pub program: String,
    pub args: Vec<String>,
    pub log_file: String,
    pub pid_file: String,
}

#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// True if the machine answers a trivial command
    async fn ping(&self, machine: &Machine) -> Result<bool, SshError>;

    async fn dir_exists(&self, machine: &Machine, path: &str) -> Result<bool, SshError>;

    async fn file_exists(&self, machine: &Machine, path: &str) -> Result<bool, SshError>;

    /// `mkdir -p`
    async fn make_dir(&self, machine: &Machine, path: &str) -> Result<(), SshError>;

    /// `rm -rf`
    async fn remove_dir(&self, machine: &Machine, path: &str) -> Result<(), SshError>;

    async fn read_file(&self, machine: &Machine, path: &str) -> Result<Option<String>, SshError>;

    /// Replace the file contents, creating parent directories
    async fn write_file(&self, machine: &Machine, path: &str, contents: &str)
        -> Result<(), SshError>;

    async fn remove_file(&self, machine: &Machine, path: &str) -> Result<(), SshError>;

    /// SHA-256 of the file, `None` if it does not exist
    async fn file_digest(&self, machine: &Machine, path: &str) -> Result<Option<String>, SshError>;

    async fn upload_file(&self, machine: &Machine, local: &Path, remote: &str)
        -> Result<(), SshError>;

    /// Unpack a gzipped tarball into `dest`, dropping its top-level directory,
    /// then remove the archive
    async fn extract_archive(&self, machine: &Machine, archive: &str, dest: &str)
        -> Result<(), SshError>;

    async fn process_alive(&self, machine: &Machine, pid: u32) -> Result<bool, SshError>;

    async fn signal_process(&self, machine: &Machine, pid: u32, signal: Signal)
        -> Result<(), SshError>;

    /// Start a process that survives the session; its pid lands in `pid_file`
    async fn launch_detached(&self, machine: &Machine, launch: &Launch) -> Result<(), SshError>;

    async fn tail_file(&self, machine: &Machine, path: &str, lines: usize)
        -> Result<String, SshError>;
}

/// Single-quote a value for POSIX sh
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Last non-empty line of command output. Login banners and shell rc
/// files can print ahead of the command's own answer.
fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

/// `RemoteHost` implemented as shell snippets over a `RemoteChannel`
pub struct ShellHost<C: RemoteChannel> {
    channel: Arc<C>,
}

impl<C: RemoteChannel> ShellHost<C> {
    pub fn new(channel: Arc<C>) -> Self {
        Self { channel }
    }

    async fn test(&self, machine: &Machine, condition: &str) -> Result<bool, SshError> {
        let command = format!("if {}; then echo {}; else echo {}; fi", condition, PRESENT, ABSENT);
        let output = self.channel.exec(machine, &command).await?;
        let answer = match last_line(&output) {
            PRESENT => Some(true),
            ABSENT => Some(false),
            _ => None,
        };
        answer.ok_or(SshError::UnexpectedOutput { command, output })
    }

    pub(crate) fn write_command(path: &str, contents: &str) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(contents.as_bytes());
        let temp = format!("{}.tmp-{}", path, uuid::Uuid::new_v4().simple());
        format!(
            "mkdir -p {dir} && printf '%s' {data} | base64 -d > {temp} && mv -f {temp} {path}",
            dir = shell_quote(parent_dir(path)),
            data = shell_quote(&encoded),
            temp = shell_quote(&temp),
            path = shell_quote(path),
        )
    }

    pub(crate) fn launch_command(launch: &Launch) -> String {
        let args = launch
            .args
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        // `&` binds to nohup alone so $! is the shipper's pid
        format!(
            "mkdir -p {log_dir} {pid_dir}; cd {workdir} || exit 1; nohup {program} {args} > {log} 2>&1 < /dev/null & echo $! > {pid}",
            log_dir = shell_quote(parent_dir(&launch.log_file)),
            pid_dir = shell_quote(parent_dir(&launch.pid_file)),
            workdir = shell_quote(&launch.workdir),
            program = shell_quote(&launch.program),
            args = args,
            log = shell_quote(&launch.log_file),
            pid = shell_quote(&launch.pid_file),
        )
    }
}

#[async_trait]
impl<C: RemoteChannel + 'static> RemoteHost for ShellHost<C> {
    async fn ping(&self, machine: &Machine) -> Result<bool, SshError> {
        let output = self.channel.exec(machine, &format!("echo {}", PING)).await?;
        Ok(last_line(&output) == PING)
    }

    async fn dir_exists(&self, machine: &Machine, path: &str) -> Result<bool, SshError> {
        self.test(machine, &format!("[ -d {} ]", shell_quote(path))).await
    }

    async fn file_exists(&self, machine: &Machine, path: &str) -> Result<bool, SshError> {
        self.test(machine, &format!("[ -f {} ]", shell_quote(path))).await
    }

    async fn make_dir(&self, machine: &Machine, path: &str) -> Result<(), SshError> {
        self.channel
            .exec(machine, &format!("mkdir -p {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    async fn remove_dir(&self, machine: &Machine, path: &str) -> Result<(), SshError> {
        self.channel
            .exec(machine, &format!("rm -rf {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    async fn read_file(&self, machine: &Machine, path: &str) -> Result<Option<String>, SshError> {
        if !self.file_exists(machine, path).await? {
            return Ok(None);
        }
        let output = self
            .channel
            .exec(machine, &format!("cat {}", shell_quote(path)))
            .await?;
        Ok(Some(output))
    }

    async fn write_file(
        &self,
        machine: &Machine,
        path: &str,
        contents: &str,
    ) -> Result<(), SshError> {
        self.channel
            .exec(machine, &Self::write_command(path, contents))
            .await?;
        Ok(())
    }

    async fn remove_file(&self, machine: &Machine, path: &str) -> Result<(), SshError> {
        self.channel
            .exec(machine, &format!("rm -f {}", shell_quote(path)))
            .await?;
        Ok(())
    }

    async fn file_digest(&self, machine: &Machine, path: &str) -> Result<Option<String>, SshError> {
        let quoted = shell_quote(path);
        let command = format!(
            "if [ -f {q} ]; then sha256sum {q} | cut -d' ' -f1; else echo {absent}; fi",
            q = quoted,
            absent = ABSENT
        );
        let output = self.channel.exec(machine, &command).await?;
        let digest = match last_line(&output) {
            "" => None,
            ABSENT => Some(None),
            digest => Some(Some(digest.to_string())),
        };
        digest.ok_or(SshError::UnexpectedOutput { command, output })
    }

    async fn upload_file(
        &self,
        machine: &Machine,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError> {
        self.make_dir(machine, parent_dir(remote)).await?;
        self.channel.upload(machine, local, remote).await
    }

    async fn extract_archive(
        &self,
        machine: &Machine,
        archive: &str,
        dest: &str,
    ) -> Result<(), SshError> {
        let command = format!(
            "tar -xzf {archive} -C {dest} --strip-components=1 && rm -f {archive}",
            archive = shell_quote(archive),
            dest = shell_quote(dest)
        );
        self.channel.exec(machine, &command).await?;
        Ok(())
    }

    async fn process_alive(&self, machine: &Machine, pid: u32) -> Result<bool, SshError> {
        self.test(machine, &format!("ps -p {} > /dev/null 2>&1", pid))
            .await
    }

    async fn signal_process(
        &self,
        machine: &Machine,
        pid: u32,
        signal: Signal,
    ) -> Result<(), SshError> {
        // The process may already be gone; liveness is checked separately
        let command = format!("kill {} {} 2>/dev/null || true", signal.flag(), pid);
        self.channel.exec(machine, &command).await?;
        Ok(())
    }

    async fn launch_detached(&self, machine: &Machine, launch: &Launch) -> Result<(), SshError> {
        self.channel
            .exec(machine, &Self::launch_command(launch))
            .await?;
        Ok(())
    }

    async fn tail_file(
        &self,
        machine: &Machine,
        path: &str,
        lines: usize,
    ) -> Result<String, SshError> {
        let command = format!("tail -n {} {} 2>/dev/null || true", lines, shell_quote(path));
        self.channel.exec(machine, &command).await
    }
}
