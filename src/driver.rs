//! Hypervisor driver boundary.
//!
//! Every VM operation the control plane performs goes through the [`VmDriver`]
//! trait: one real implementation shells out to `limactl`, and [`MockDriver`]
//! backs the tests with in-memory instances and per-operation failure
//! injection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

pub const DEFAULT_CLONE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum DriverError {
    /// The hypervisor command exited nonzero; stderr is preserved verbatim.
    #[error("{op} {instance} failed: {stderr}")]
    CommandFailed {
        op: &'static str,
        instance: String,
        stderr: String,
    },

    #[error("{op} {instance} timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        instance: String,
        timeout: Duration,
    },

    #[error("instance {0:?} not found")]
    NotFound(String),

    #[error("spawning {op}: {source}")]
    Spawn {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("no IP address reported by {0}")]
    NoAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum VmStatus {
    Running,
    Stopped,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmInstance {
    pub name: String,
    pub status: VmStatus,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub name: String,
    pub template: Option<PathBuf>,
    pub cpus: Option<u32>,
    pub memory: Option<String>,
    pub disk: Option<String>,
    pub start: bool,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CloneOpts {
    pub source: String,
    pub target: String,
    pub start: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ToVm,
    FromVm,
}

#[derive(Debug, Clone)]
pub struct CopyOpts {
    pub instance: String,
    pub direction: CopyDirection,
    pub local_path: PathBuf,
    pub vm_path: String,
}

#[derive(Debug, Clone)]
pub struct ShellOpts {
    pub instance: String,
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[async_trait]
pub trait VmDriver: Send + Sync {
    async fn create(&self, opts: CreateOpts) -> Result<(), DriverError>;
    async fn clone_vm(&self, opts: CloneOpts) -> Result<(), DriverError>;
    async fn start(&self, name: &str) -> Result<(), DriverError>;
    async fn stop(&self, name: &str) -> Result<(), DriverError>;
    async fn delete(&self, name: &str, force: bool) -> Result<(), DriverError>;
    async fn list(&self) -> Result<Vec<VmInstance>, DriverError>;
    async fn get(&self, name: &str) -> Result<VmInstance, DriverError>;
    /// Run a command inside the guest and return its stdout.
    async fn shell(&self, opts: ShellOpts) -> Result<String, DriverError>;
    async fn copy(&self, opts: CopyOpts) -> Result<(), DriverError>;
    /// Command that follows the runner service's journal inside the guest.
    /// Spawned (not awaited) by the log stream manager.
    fn log_tail_command(&self, vm_name: &str) -> Command;
}

/// Best-effort guest IP lookup via `hostname -I`; returns the first address.
pub async fn lookup_ip(driver: &dyn VmDriver, name: &str) -> Result<String, DriverError> {
    let output = driver
        .shell(ShellOpts {
            instance: name.to_string(),
            command: "hostname".to_string(),
            args: vec!["-I".to_string()],
            timeout: Duration::from_secs(10),
        })
        .await?;

    output
        .split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| DriverError::NoAddress(name.to_string()))
}

// ---------------------------------------------------------------------------
// limactl implementation
// ---------------------------------------------------------------------------

pub struct LimaDriver {
    limactl: PathBuf,
    runner_service: String,
}

impl LimaDriver {
    pub fn new(limactl: impl Into<PathBuf>, runner_service: impl Into<String>) -> Self {
        Self {
            limactl: limactl.into(),
            runner_service: runner_service.into(),
        }
    }

    async fn run(
        &self,
        op: &'static str,
        instance: &str,
        args: &[String],
        deadline: Option<Duration>,
    ) -> Result<String, DriverError> {
        let mut cmd = Command::new(&self.limactl);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match deadline {
            Some(d) => timeout(d, cmd.output())
                .await
                .map_err(|_| DriverError::Timeout {
                    op,
                    instance: instance.to_string(),
                    timeout: d,
                })?,
            None => cmd.output().await,
        }
        .map_err(|source| DriverError::Spawn { op, source })?;

        if !output.status.success() {
            return Err(DriverError::CommandFailed {
                op,
                instance: instance.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl VmDriver for LimaDriver {
    async fn create(&self, opts: CreateOpts) -> Result<(), DriverError> {
        let mut args = vec!["create".to_string()];
        if let Some(template) = &opts.template {
            args.push(template.display().to_string());
        }
        args.push("--name".to_string());
        args.push(opts.name.clone());
        if let Some(cpus) = opts.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = &opts.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(disk) = &opts.disk {
            args.push("--disk".to_string());
            args.push(disk.clone());
        }
        args.push("--tty=false".to_string());

        self.run("create", &opts.name, &args, opts.timeout).await?;
        if opts.start {
            self.start(&opts.name).await?;
        }
        Ok(())
    }

    async fn clone_vm(&self, opts: CloneOpts) -> Result<(), DriverError> {
        let deadline = opts.timeout;
        timeout(deadline, async {
            self.run(
                "clone",
                &opts.target,
                &owned(&["clone", &opts.source, &opts.target]),
                None,
            )
            .await?;
            if opts.start {
                self.run("start", &opts.target, &owned(&["start", &opts.target]), None)
                    .await?;
            }
            Ok(())
        })
        .await
        .map_err(|_| DriverError::Timeout {
            op: "clone",
            instance: opts.target.clone(),
            timeout: deadline,
        })?
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        self.run("start", name, &owned(&["start", name]), None)
            .await
            .map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        self.run("stop", name, &owned(&["stop", name]), None)
            .await
            .map(|_| ())
    }

    async fn delete(&self, name: &str, force: bool) -> Result<(), DriverError> {
        let mut args = owned(&["delete", name]);
        if force {
            args.push("--force".to_string());
        }
        self.run("delete", name, &args, None).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<VmInstance>, DriverError> {
        let output = self.run("list", "*", &owned(&["list", "--json"]), None).await?;
        // limactl emits one JSON document per line; skip anything unparseable.
        Ok(output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<VmInstance>(line).ok())
            .collect())
    }

    async fn get(&self, name: &str) -> Result<VmInstance, DriverError> {
        self.list()
            .await?
            .into_iter()
            .find(|inst| inst.name == name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn shell(&self, opts: ShellOpts) -> Result<String, DriverError> {
        let mut args = owned(&["shell", &opts.instance, &opts.command]);
        args.extend(opts.args.iter().cloned());
        self.run("shell", &opts.instance, &args, Some(opts.timeout))
            .await
    }

    async fn copy(&self, opts: CopyOpts) -> Result<(), DriverError> {
        let local = opts.local_path.display().to_string();
        let remote = format!("{}:{}", opts.instance, opts.vm_path);
        let args = match opts.direction {
            CopyDirection::ToVm => owned(&["copy", &local, &remote]),
            CopyDirection::FromVm => owned(&["copy", &remote, &local]),
        };
        self.run("copy", &opts.instance, &args, None).await.map(|_| ())
    }

    fn log_tail_command(&self, vm_name: &str) -> Command {
        let mut cmd = Command::new(&self.limactl);
        cmd.args([
            "shell",
            vm_name,
            "sudo",
            "journalctl",
            "-u",
            &self.runner_service,
            "-f",
            "--no-pager",
            "-n",
            "100",
        ]);
        cmd
    }
}

// ---------------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------------

type ShellFn = dyn Fn(&ShellOpts) -> Result<String, DriverError> + Send + Sync;

/// Test double: instances live in a map, failures are injected per operation,
/// and copies/shell invocations are recorded for assertions.
#[derive(Default)]
pub struct MockDriver {
    instances: Mutex<HashMap<String, VmInstance>>,
    copies: Mutex<Vec<CopyOpts>>,
    shell_calls: Mutex<Vec<ShellOpts>>,
    shell_fn: Mutex<Option<Box<ShellFn>>>,
    clone_error: Mutex<Option<String>>,
    copy_error: Mutex<Option<String>>,
    delete_error: Mutex<Option<String>>,
    tail_lines: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instance(&self, name: &str, status: VmStatus) {
        self.instances.lock().insert(
            name.to_string(),
            VmInstance {
                name: name.to_string(),
                status,
            },
        );
    }

    pub fn remove_instance(&self, name: &str) {
        self.instances.lock().remove(name);
    }

    pub fn has_instance(&self, name: &str) -> bool {
        self.instances.lock().contains_key(name)
    }

    pub fn fail_clone(&self, stderr: &str) {
        *self.clone_error.lock() = Some(stderr.to_string());
    }

    pub fn fail_copy(&self, stderr: &str) {
        *self.copy_error.lock() = Some(stderr.to_string());
    }

    pub fn fail_delete(&self, stderr: &str) {
        *self.delete_error.lock() = Some(stderr.to_string());
    }

    pub fn on_shell(&self, f: impl Fn(&ShellOpts) -> Result<String, DriverError> + Send + Sync + 'static) {
        *self.shell_fn.lock() = Some(Box::new(f));
    }

    /// Lines the fake tail command prints before blocking.
    pub fn set_tail_lines(&self, lines: &[&str]) {
        *self.tail_lines.lock() = lines.iter().map(|s| s.to_string()).collect();
    }

    pub fn recorded_copies(&self) -> Vec<CopyOpts> {
        self.copies.lock().clone()
    }

    pub fn recorded_shells(&self) -> Vec<ShellOpts> {
        self.shell_calls.lock().clone()
    }
}

#[async_trait]
impl VmDriver for MockDriver {
    async fn create(&self, opts: CreateOpts) -> Result<(), DriverError> {
        let status = if opts.start {
            VmStatus::Running
        } else {
            VmStatus::Stopped
        };
        self.add_instance(&opts.name, status);
        Ok(())
    }

    async fn clone_vm(&self, opts: CloneOpts) -> Result<(), DriverError> {
        if let Some(stderr) = self.clone_error.lock().clone() {
            return Err(DriverError::CommandFailed {
                op: "clone",
                instance: opts.target.clone(),
                stderr,
            });
        }
        if !self.has_instance(&opts.source) {
            return Err(DriverError::NotFound(opts.source.clone()));
        }
        let status = if opts.start {
            VmStatus::Running
        } else {
            VmStatus::Stopped
        };
        self.add_instance(&opts.target, status);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), DriverError> {
        match self.instances.lock().get_mut(name) {
            Some(inst) => {
                inst.status = VmStatus::Running;
                Ok(())
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        match self.instances.lock().get_mut(name) {
            Some(inst) => {
                inst.status = VmStatus::Stopped;
                Ok(())
            }
            None => Err(DriverError::NotFound(name.to_string())),
        }
    }

    async fn delete(&self, name: &str, _force: bool) -> Result<(), DriverError> {
        if let Some(stderr) = self.delete_error.lock().clone() {
            return Err(DriverError::CommandFailed {
                op: "delete",
                instance: name.to_string(),
                stderr,
            });
        }
        self.instances.lock().remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmInstance>, DriverError> {
        Ok(self.instances.lock().values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<VmInstance, DriverError> {
        self.instances
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(name.to_string()))
    }

    async fn shell(&self, opts: ShellOpts) -> Result<String, DriverError> {
        self.shell_calls.lock().push(opts.clone());
        match &*self.shell_fn.lock() {
            Some(f) => f(&opts),
            None => Ok(String::new()),
        }
    }

    async fn copy(&self, opts: CopyOpts) -> Result<(), DriverError> {
        if let Some(stderr) = self.copy_error.lock().clone() {
            return Err(DriverError::CommandFailed {
                op: "copy",
                instance: opts.instance.clone(),
                stderr,
            });
        }
        self.copies.lock().push(opts);
        Ok(())
    }

    fn log_tail_command(&self, _vm_name: &str) -> Command {
        let lines = self.tail_lines.lock().clone();
        // Delay before emitting: subscribers attach asynchronously and log
        // history is never replayed.
        let mut script = String::from("sleep 1; ");
        for line in &lines {
            script.push_str("echo ");
            script.push_str(line);
            script.push_str("; ");
        }
        script.push_str("sleep 30");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_clone_copies_master_and_starts() {
        let mock = MockDriver::new();
        mock.add_instance("agent-master", VmStatus::Stopped);

        mock.clone_vm(CloneOpts {
            source: "agent-master".into(),
            target: "warm-1".into(),
            start: true,
            timeout: DEFAULT_CLONE_TIMEOUT,
        })
        .await
        .unwrap();

        let inst = mock.get("warm-1").await.unwrap();
        assert_eq!(inst.status, VmStatus::Running);
    }

    #[tokio::test]
    async fn mock_clone_fails_without_source() {
        let mock = MockDriver::new();
        let err = mock
            .clone_vm(CloneOpts {
                source: "missing".into(),
                target: "warm-1".into(),
                start: true,
                timeout: DEFAULT_CLONE_TIMEOUT,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::NotFound(_)));
    }

    #[tokio::test]
    async fn injected_clone_failure_preserves_stderr() {
        let mock = MockDriver::new();
        mock.add_instance("agent-master", VmStatus::Running);
        mock.fail_clone("qemu: out of disk");

        let err = mock
            .clone_vm(CloneOpts {
                source: "agent-master".into(),
                target: "warm-1".into(),
                start: true,
                timeout: DEFAULT_CLONE_TIMEOUT,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("qemu: out of disk"));
    }

    #[tokio::test]
    async fn lookup_ip_returns_first_address() {
        let mock = MockDriver::new();
        mock.on_shell(|_| Ok("192.168.64.5 fd12::5\n".to_string()));

        let ip = lookup_ip(&mock, "warm-1").await.unwrap();
        assert_eq!(ip, "192.168.64.5");
    }

    #[tokio::test]
    async fn lookup_ip_fails_on_empty_output() {
        let mock = MockDriver::new();
        mock.on_shell(|_| Ok("   \n".to_string()));

        let err = lookup_ip(&mock, "warm-1").await.unwrap_err();
        assert!(matches!(err, DriverError::NoAddress(_)));
    }

    #[tokio::test]
    async fn delete_is_recorded_in_instance_map() {
        let mock = MockDriver::new();
        mock.add_instance("warm-1", VmStatus::Running);
        mock.delete("warm-1", true).await.unwrap();
        assert!(!mock.has_instance("warm-1"));
    }

    #[test]
    fn instance_status_parses_lima_json() {
        let inst: VmInstance =
            serde_json::from_str(r#"{"name":"warm-3","status":"Running","arch":"aarch64"}"#)
                .unwrap();
        assert_eq!(inst.name, "warm-3");
        assert_eq!(inst.status, VmStatus::Running);

        let inst: VmInstance =
            serde_json::from_str(r#"{"name":"warm-4","status":"Broken"}"#).unwrap();
        assert_eq!(inst.status, VmStatus::Unknown);
    }
}
