//! Launching and terminating isolated workloads.
//!
//! The lifecycle manager only sees the [`Workload`] trait. The production
//! implementation, [`ProcessSupervisor`], runs the configured program (qemu by
//! default) as a detached child in its own process group and signals it by
//! PID, so an instance can still be terminated after the manager restarts.

use crate::config::WorkloadConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, warn};

/// How long a fresh workload must stay up before spawn reports success.
const STARTUP_CHECK: Duration = Duration::from_millis(250);

/// Early-exit messages meaning the host port was taken after the probe.
const PORT_CONFLICT_MARKERS: [&str; 2] = [
    "Address already in use",
    "Could not set up host forwarding rule",
];

/// OS-level handle to a running workload.
///
/// Not `Clone`: terminating a workload consumes its handle.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    /// Rebuild a handle from a persisted PID.
    pub fn from_pid(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Why a spawn attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum SpawnFailure {
    /// The host port is taken; retry with another one.
    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("{0}")]
    Launch(String),
}

impl From<SpawnFailure> for Error {
    fn from(e: SpawnFailure) -> Self {
        Error::spawn(e.to_string())
    }
}

/// Spawn/kill capability for isolated workloads.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Start a workload for `client_key` reachable on host `port`.
    async fn spawn(
        &self,
        client_key: &str,
        port: u16,
    ) -> std::result::Result<ProcessHandle, SpawnFailure>;

    /// Ask the workload to shut down. Does not wait for exit; a workload
    /// that is already gone counts as killed.
    async fn kill(&self, handle: ProcessHandle) -> Result<()>;

    /// Whether the workload behind `handle` still exists.
    fn is_alive(&self, handle: &ProcessHandle) -> bool;
}

/// Runs each workload as a child process of this service.
pub struct ProcessSupervisor {
    config: WorkloadConfig,
}

impl ProcessSupervisor {
    pub fn new(config: WorkloadConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Workload for ProcessSupervisor {
    async fn spawn(
        &self,
        client_key: &str,
        port: u16,
    ) -> std::result::Result<ProcessHandle, SpawnFailure> {
        probe_port(port)?;

        let args = self.config.command_args(client_key, port);
        debug!(program = %self.config.program, args = ?args, "Launching workload");

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            // Keep terminal signals aimed at us away from the workloads.
            .process_group(0)
            .spawn()
            .map_err(|e| SpawnFailure::Launch(format!("{}: {}", self.config.program, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| SpawnFailure::Launch("workload exited before reporting a pid".into()))?;

        let mut stderr = child.stderr.take();
        match tokio::time::timeout(STARTUP_CHECK, child.wait()).await {
            Ok(Ok(status)) => {
                let output = read_stderr(stderr.take()).await;
                if is_port_conflict(&output) {
                    debug!(port, output = %output.trim(), "Workload lost its port during startup");
                    return Err(SpawnFailure::PortInUse(port));
                }
                return Err(SpawnFailure::Launch(format!(
                    "workload exited during startup: {}",
                    status
                )));
            }
            Ok(Err(e)) => return Err(SpawnFailure::Launch(format!("wait: {}", e))),
            Err(_) => {}
        }

        // Reap the child whenever it exits so it never lingers as a zombie.
        let client = client_key.to_string();
        tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(client = %client, pid, line = %line, "Workload stderr");
                }
            }
            match child.wait().await {
                Ok(status) => info!(client = %client, pid, %status, "Workload exited"),
                Err(e) => warn!(client = %client, pid, error = %e, "Failed to reap workload"),
            }
        });

        info!(client = %client_key, pid, port, "Workload spawned");
        Ok(ProcessHandle { pid })
    }

    async fn kill(&self, handle: ProcessHandle) -> Result<()> {
        signal_interrupt(handle)
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        let Ok(raw) = i32::try_from(handle.pid) else {
            return false;
        };
        !matches!(signal::kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
    }
}

/// Send SIGINT to the workload; a missing process is success.
pub fn signal_interrupt(handle: ProcessHandle) -> Result<()> {
    let pid = handle.pid;
    let raw = i32::try_from(pid).map_err(|_| Error::Kill {
        pid,
        reason: "pid out of range".into(),
    })?;
    match signal::kill(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) => {
            info!(pid, "Sent SIGINT to workload");
            Ok(())
        }
        Err(Errno::ESRCH) => {
            debug!(pid, "Workload already gone");
            Ok(())
        }
        Err(e) => Err(Error::Kill {
            pid,
            reason: e.to_string(),
        }),
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut output = String::new();
    if let Some(mut stderr) = stderr {
        // Bounded: a leftover grandchild may still hold the pipe open.
        let _ = tokio::time::timeout(STARTUP_CHECK, stderr.read_to_string(&mut output)).await;
    }
    output
}

fn is_port_conflict(output: &str) -> bool {
    PORT_CONFLICT_MARKERS
        .iter()
        .any(|marker| output.contains(marker))
}

fn probe_port(port: u16) -> std::result::Result<(), SpawnFailure> {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_listener) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(SpawnFailure::PortInUse(port)),
        Err(e) => Err(SpawnFailure::Launch(format!("probe port {}: {}", port, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(secs: &str) -> ProcessSupervisor {
        ProcessSupervisor::new(WorkloadConfig {
            program: "sleep".to_string(),
            args_template: Some(vec![secs.to_string()]),
            ..WorkloadConfig::default()
        })
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_spawn_and_kill_process() {
        let supervisor = sleeper("30");
        let handle = supervisor.spawn("test", free_port()).await.unwrap();
        assert!(handle.pid() > 0);
        assert!(supervisor.is_alive(&handle));
        supervisor.kill(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_reports_busy_port() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let supervisor = sleeper("30");
        let err = supervisor.spawn("test", port).await.unwrap_err();
        assert!(matches!(err, SpawnFailure::PortInUse(p) if p == port));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let supervisor = ProcessSupervisor::new(WorkloadConfig {
            program: "/nonexistent/instancer-workload".to_string(),
            args_template: Some(vec![]),
            ..WorkloadConfig::default()
        });
        let err = supervisor.spawn("test", free_port()).await.unwrap_err();
        assert!(matches!(err, SpawnFailure::Launch(_)));
    }

    #[tokio::test]
    async fn test_spawn_detects_immediate_exit() {
        let supervisor = ProcessSupervisor::new(WorkloadConfig {
            program: "false".to_string(),
            args_template: Some(vec![]),
            ..WorkloadConfig::default()
        });
        let err = supervisor.spawn("test", free_port()).await.unwrap_err();
        assert!(matches!(err, SpawnFailure::Launch(msg) if msg.contains("startup")));
    }

    fn lost_port_script(extra: &str) -> ProcessSupervisor {
        ProcessSupervisor::new(WorkloadConfig {
            program: "sh".to_string(),
            args_template: Some(vec![
                "-c".to_string(),
                format!(
                    "{}echo 'qemu-system-x86_64: Could not set up host forwarding rule \
                     tcp::{{port}}-:{{internal_port}}' >&2; exit 1",
                    extra
                ),
            ]),
            ..WorkloadConfig::default()
        })
    }

    #[tokio::test]
    async fn test_startup_bind_failure_is_port_conflict() {
        let port = free_port();
        let err = lost_port_script("").spawn("test", port).await.unwrap_err();
        assert!(matches!(err, SpawnFailure::PortInUse(p) if p == port));
    }

    #[test]
    fn test_port_conflict_markers() {
        assert!(is_port_conflict("bind: Address already in use\n"));
        assert!(!is_port_conflict("could not load kernel 'bzImage'"));
        assert!(!is_port_conflict(""));
    }

    #[tokio::test]
    async fn test_lost_port_is_retried_by_manager() {
        use crate::config::Config;
        use crate::lifecycle::LifecycleManager;
        use crate::store::InstanceStore;
        use std::sync::Arc;

        let tmp = tempfile::TempDir::new().unwrap();
        let attempts = tmp.path().join("attempts");
        let supervisor = lost_port_script(&format!("echo {{port}} >> {}; ", attempts.display()));
        let manager = LifecycleManager::new(
            Config {
                port_range: 49000..=50000,
                max_spawn_attempts: 3,
                workload: supervisor.config.clone(),
                ..Config::default()
            },
            InstanceStore::open_in_memory().unwrap(),
            Arc::new(supervisor),
        )
        .unwrap();

        let err = manager.create("a").await.unwrap_err();
        assert!(matches!(&err, Error::Spawn { reason } if reason.contains("3 attempts")), "{err:?}");

        let tried = std::fs::read_to_string(&attempts).unwrap();
        let ports: std::collections::HashSet<&str> = tried.lines().collect();
        assert_eq!(tried.lines().count(), 3);
        assert_eq!(ports.len(), 3);
    }

    #[tokio::test]
    async fn test_kill_twice_is_harmless() {
        let supervisor = sleeper("30");
        let handle = supervisor.spawn("test", free_port()).await.unwrap();
        let pid = handle.pid();
        supervisor.kill(handle).await.unwrap();
        // Give the reaper time to collect the child.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let handle = ProcessHandle::from_pid(pid);
        assert!(!supervisor.is_alive(&handle));
        supervisor.kill(handle).await.unwrap();
    }
}
