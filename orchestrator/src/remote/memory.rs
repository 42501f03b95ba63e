//! In-memory simulated fleet

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::machine::{Machine, MachineId};
use crate::remote::channel::SshError;
use crate::remote::host::{Launch, RemoteHost, Signal};
use crate::utils::sha256_hash;

/// Primitive operations, used to target faults and inspect call history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    Ping,
    DirExists,
    FileExists,
    MakeDir,
    RemoveDir,
    ReadFile,
    WriteFile,
    RemoveFile,
    FileDigest,
    Upload,
    Extract,
    ProcessAlive,
    Signal,
    Launch,
    Tail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NonZeroExit,
    Timeout,
    Unreachable,
    ToolMissing,
}

impl FaultKind {
    fn to_error(self, op: HostOp) -> SshError {
        match self {
            FaultKind::NonZeroExit => SshError::NonZeroExit {
                code: 1,
                stderr: format!("injected failure in {:?}", op),
            },
            FaultKind::Timeout => SshError::Timeout {
                operation: format!("{:?}", op),
                after: Duration::from_secs(0),
            },
            FaultKind::Unreachable => {
                SshError::Unreachable("ssh: connect to host: Connection refused".to_string())
            }
            FaultKind::ToolMissing => SshError::ToolMissing {
                tool: "ssh".to_string(),
                hint: "install openssh-client".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Fault {
    machine_id: MachineId,
    op: HostOp,
    kind: FaultKind,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct SimHost {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, String>,
    processes: BTreeSet<u32>,
    unreachable: bool,
    ignores_term: bool,
    history: Vec<HostOp>,
}

impl SimHost {
    fn make_dirs(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    fn write(&mut self, path: &str, contents: String) {
        if let Some(idx) = path.rfind('/') {
            self.make_dirs(&path[..idx]);
        }
        self.files.insert(path.to_string(), contents);
    }
}

#[derive(Debug)]
struct Inner {
    hosts: HashMap<MachineId, SimHost>,
    faults: Vec<Fault>,
    next_pid: u32,
}

/// A `RemoteHost` that simulates machines in memory. Directory trees,
/// files and processes are tracked per machine id.
#[derive(Debug)]
pub struct MemoryHost {
    inner: Mutex<Inner>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                hosts: HashMap::new(),
                faults: Vec::new(),
                next_pid: 4000,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_host<T>(
        &self,
        machine: &Machine,
        op: HostOp,
        f: impl FnOnce(&mut SimHost, &mut u32) -> Result<T, SshError>,
    ) -> Result<T, SshError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let injected = inner
            .faults
            .iter_mut()
            .find(|fault| {
                fault.machine_id == machine.id
                    && fault.op == op
                    && fault.remaining.map_or(true, |n| n > 0)
            })
            .map(|fault| {
                if let Some(n) = fault.remaining.as_mut() {
                    *n -= 1;
                }
                fault.kind
            });

        let host = inner.hosts.entry(machine.id).or_default();
        host.history.push(op);
        if host.unreachable {
            return Err(FaultKind::Unreachable.to_error(op));
        }
        if let Some(kind) = injected {
            return Err(kind.to_error(op));
        }
        f(host, &mut inner.next_pid)
    }

    /// Fail every call of `op` on the machine
    pub fn fail(&self, machine_id: MachineId, op: HostOp, kind: FaultKind) {
        self.lock().faults.push(Fault {
            machine_id,
            op,
            kind,
            remaining: None,
        });
    }

    /// Fail the next `times` calls of `op` on the machine
    pub fn fail_times(&self, machine_id: MachineId, op: HostOp, kind: FaultKind, times: u32) {
        self.lock().faults.push(Fault {
            machine_id,
            op,
            kind,
            remaining: Some(times),
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn set_unreachable(&self, machine_id: MachineId, unreachable: bool) {
        self.lock().hosts.entry(machine_id).or_default().unreachable = unreachable;
    }

    /// Make processes on the machine survive SIGTERM
    pub fn ignore_term(&self, machine_id: MachineId, ignore: bool) {
        self.lock().hosts.entry(machine_id).or_default().ignores_term = ignore;
    }

    /// Kill a process behind the orchestrator's back
    pub fn kill(&self, machine_id: MachineId, pid: u32) {
        if let Some(host) = self.lock().hosts.get_mut(&machine_id) {
            host.processes.remove(&pid);
        }
    }

    pub fn running_pids(&self, machine_id: MachineId) -> Vec<u32> {
        self.lock()
            .hosts
            .get(&machine_id)
            .map(|h| h.processes.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn file(&self, machine_id: MachineId, path: &str) -> Option<String> {
        self.lock()
            .hosts
            .get(&machine_id)
            .and_then(|h| h.files.get(path).cloned())
    }

    pub fn put_file(&self, machine_id: MachineId, path: &str, contents: &str) {
        self.lock()
            .hosts
            .entry(machine_id)
            .or_default()
            .write(path, contents.to_string());
    }

    pub fn has_dir(&self, machine_id: MachineId, path: &str) -> bool {
        self.lock()
            .hosts
            .get(&machine_id)
            .is_some_and(|h| h.dirs.contains(path))
    }

    /// Every primitive invoked against the machine, in order
    pub fn history(&self, machine_id: MachineId) -> Vec<HostOp> {
        self.lock()
            .hosts
            .get(&machine_id)
            .map(|h| h.history.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, machine_id: MachineId, op: HostOp) -> usize {
        self.history(machine_id).iter().filter(|o| **o == op).count()
    }

    pub fn clear_history(&self, machine_id: MachineId) {
        if let Some(host) = self.lock().hosts.get_mut(&machine_id) {
            host.history.clear();
        }
    }
}

fn resolve(workdir: &str, program: &str) -> String {
    match program.strip_prefix("./") {
        Some(rest) => format!("{}/{}", workdir.trim_end_matches('/'), rest),
        None if program.starts_with('/') => program.to_string(),
        None => format!("{}/{}", workdir.trim_end_matches('/'), program),
    }
}

#[async_trait]
impl RemoteHost for MemoryHost {
    async fn ping(&self, machine: &Machine) -> Result<bool, SshError> {
        self.with_host(machine, HostOp::Ping, |_, _| Ok(true))
    }

    async fn dir_exists(&self, machine: &Machine, path: &str) -> Result<bool, SshError> {
        self.with_host(machine, HostOp::DirExists, |h, _| Ok(h.dirs.contains(path)))
    }

    async fn file_exists(&self, machine: &Machine, path: &str) -> Result<bool, SshError> {
        self.with_host(machine, HostOp::FileExists, |h, _| {
            Ok(h.files.contains_key(path))
        })
    }

    async fn make_dir(&self, machine: &Machine, path: &str) -> Result<(), SshError> {
        self.with_host(machine, HostOp::MakeDir, |h, _| {
            h.make_dirs(path);
            Ok(())
        })
    }

    async fn remove_dir(&self, machine: &Machine, path: &str) -> Result<(), SshError> {
        self.with_host(machine, HostOp::RemoveDir, |h, _| {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            h.dirs.retain(|d| d != path && !d.starts_with(&prefix));
            h.files.retain(|f, _| !f.starts_with(&prefix));
            Ok(())
        })
    }

    async fn read_file(&self, machine: &Machine, path: &str) -> Result<Option<String>, SshError> {
        self.with_host(machine, HostOp::ReadFile, |h, _| Ok(h.files.get(path).cloned()))
    }

    async fn write_file(
        &self,
        machine: &Machine,
        path: &str,
        contents: &str,
    ) -> Result<(), SshError> {
        self.with_host(machine, HostOp::WriteFile, |h, _| {
            h.write(path, contents.to_string());
            Ok(())
        })
    }

    async fn remove_file(&self, machine: &Machine, path: &str) -> Result<(), SshError> {
        self.with_host(machine, HostOp::RemoveFile, |h, _| {
            h.files.remove(path);
            Ok(())
        })
    }

    async fn file_digest(&self, machine: &Machine, path: &str) -> Result<Option<String>, SshError> {
        self.with_host(machine, HostOp::FileDigest, |h, _| {
            Ok(h.files.get(path).map(|c| sha256_hash(c.as_bytes())))
        })
    }

    async fn upload_file(
        &self,
        machine: &Machine,
        local: &Path,
        remote: &str,
    ) -> Result<(), SshError> {
        self.with_host(machine, HostOp::Upload, |h, _| {
            h.write(remote, format!("archive:{}", local.display()));
            Ok(())
        })
    }

    async fn extract_archive(
        &self,
        machine: &Machine,
        archive: &str,
        dest: &str,
    ) -> Result<(), SshError> {
        self.with_host(machine, HostOp::Extract, |h, _| {
            if h.files.remove(archive).is_none() {
                return Err(SshError::NonZeroExit {
                    code: 2,
                    stderr: format!("tar: {}: Cannot open: No such file or directory", archive),
                });
            }
            let dest = dest.trim_end_matches('/');
            h.write(&format!("{}/bin/logstash", dest), "#!/bin/sh\n".to_string());
            h.write(&format!("{}/config/jvm.options", dest), "-Xms1g\n-Xmx1g\n".to_string());
            h.write(&format!("{}/config/logstash.yml", dest), String::new());
            Ok(())
        })
    }

    async fn process_alive(&self, machine: &Machine, pid: u32) -> Result<bool, SshError> {
        self.with_host(machine, HostOp::ProcessAlive, |h, _| {
            Ok(h.processes.contains(&pid))
        })
    }

    async fn signal_process(
        &self,
        machine: &Machine,
        pid: u32,
        signal: Signal,
    ) -> Result<(), SshError> {
        self.with_host(machine, HostOp::Signal, |h, _| {
            if signal == Signal::Kill || !h.ignores_term {
                h.processes.remove(&pid);
            }
            Ok(())
        })
    }

    async fn launch_detached(&self, machine: &Machine, launch: &Launch) -> Result<(), SshError> {
        self.with_host(machine, HostOp::Launch, |h, next_pid| {
            if !h.dirs.contains(launch.workdir.trim_end_matches('/')) {
                return Err(SshError::NonZeroExit {
                    code: 1,
                    stderr: format!("cd: {}: No such file or directory", launch.workdir),
                });
            }
            let pid = *next_pid;
            *next_pid += 1;

            // A missing binary still yields a pid, of a process that exits at once
            let program = resolve(&launch.workdir, &launch.program);
            if h.files.contains_key(&program) {
                h.processes.insert(pid);
                h.write(
                    &launch.log_file,
                    format!("[INFO ] Starting Logstash {}\n", launch.args.join(" ")),
                );
            } else {
                h.write(
                    &launch.log_file,
                    format!("nohup: failed to run command '{}': No such file or directory\n", launch.program),
                );
            }
            h.write(&launch.pid_file, format!("{}\n", pid));
            Ok(())
        })
    }

    async fn tail_file(
        &self,
        machine: &Machine,
        path: &str,
        lines: usize,
    ) -> Result<String, SshError> {
        self.with_host(machine, HostOp::Tail, |h, _| {
            let contents = h.files.get(path).cloned().unwrap_or_default();
            let all: Vec<&str> = contents.lines().collect();
            let start = all.len().saturating_sub(lines);
            Ok(all[start..].join("\n"))
        })
    }
}
