//! Startup configuration for the lifecycle core.

use crate::error::{Error, Result};
use std::ops::RangeInclusive;
use std::time::Duration;

pub const DEFAULT_SPAWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_SESSION_SECS: u64 = 30 * 60;
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 49152..=65535;
pub const DEFAULT_MAX_SPAWN_ATTEMPTS: u32 = 5;

/// Lifecycle settings. Fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Estimated time between launch and network readiness.
    pub spawn_grace: Duration,
    /// Usable lifetime after the instance becomes ready.
    pub session_duration: Duration,
    pub port_range: RangeInclusive<u16>,
    /// How many fresh ports to try when the chosen one is taken.
    pub max_spawn_attempts: u32,
    pub workload: WorkloadConfig,
}

impl Config {
    /// Total lifetime of an instance, measured from creation.
    pub fn lifetime(&self) -> Duration {
        self.spawn_grace + self.session_duration
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_range.is_empty() {
            return Err(Error::Config(format!(
                "empty port range {}-{}",
                self.port_range.start(),
                self.port_range.end()
            )));
        }
        if self.session_duration.is_zero() {
            return Err(Error::Config("session duration must be positive".into()));
        }
        if self.max_spawn_attempts == 0 {
            return Err(Error::Config("max spawn attempts must be at least 1".into()));
        }
        if self.workload.program.is_empty() {
            return Err(Error::Config("workload program is empty".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spawn_grace: Duration::from_secs(DEFAULT_SPAWN_GRACE_SECS),
            session_duration: Duration::from_secs(DEFAULT_SESSION_SECS),
            port_range: DEFAULT_PORT_RANGE,
            max_spawn_attempts: DEFAULT_MAX_SPAWN_ATTEMPTS,
            workload: WorkloadConfig::default(),
        }
    }
}

/// How to launch one isolated workload.
///
/// Without an `args_template` the argument vector is a qemu invocation that
/// boots `kernel`/`initrd` and forwards `internal_port` inside the guest to
/// the allocated host port. A template replaces it entirely; `{port}`,
/// `{internal_port}` and `{client}` are substituted per instance.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub program: String,
    pub kernel: String,
    pub initrd: String,
    pub memory: String,
    pub internal_port: u16,
    pub kernel_cmdline: String,
    pub extra_args: Vec<String>,
    pub args_template: Option<Vec<String>>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            program: "qemu-system-x86_64".to_string(),
            kernel: "bzImage".to_string(),
            initrd: "initramfs.cpio.gz".to_string(),
            memory: "4096M".to_string(),
            internal_port: 22222,
            kernel_cmdline: "console=ttyS0 loglevel=3 oops=panic panic=-1 pti=on".to_string(),
            extra_args: vec!["-cpu".to_string(), "qemu64,+smap".to_string()],
            args_template: None,
        }
    }
}

impl WorkloadConfig {
    /// Argument vector for the workload bound to `port`.
    pub fn command_args(&self, client: &str, port: u16) -> Vec<String> {
        if let Some(template) = &self.args_template {
            return template
                .iter()
                .map(|arg| {
                    arg.replace("{port}", &port.to_string())
                        .replace("{internal_port}", &self.internal_port.to_string())
                        .replace("{client}", client)
                })
                .collect();
        }

        let mut args = self.extra_args.clone();
        args.extend([
            "-m".to_string(),
            self.memory.clone(),
            "-kernel".to_string(),
            self.kernel.clone(),
            "-initrd".to_string(),
            self.initrd.clone(),
            "-append".to_string(),
            self.kernel_cmdline.clone(),
            "-monitor".to_string(),
            "/dev/null".to_string(),
            "-nographic".to_string(),
            "-netdev".to_string(),
            format!("user,id=net0,hostfwd=tcp::{}-:{}", port, self.internal_port),
            "-device".to_string(),
            "e1000,netdev=net0".to_string(),
            "-no-reboot".to_string(),
        ]);
        args
    }
}

/// Parse a `LOW-HIGH` port range.
pub fn parse_port_range(s: &str) -> std::result::Result<RangeInclusive<u16>, String> {
    let (low, high) = s
        .split_once('-')
        .ok_or_else(|| format!("expected LOW-HIGH, got '{}'", s))?;
    let low: u16 = low.trim().parse().map_err(|e| format!("bad low port: {}", e))?;
    let high: u16 = high.trim().parse().map_err(|e| format!("bad high port: {}", e))?;
    if low > high {
        return Err(format!("inverted port range {}-{}", low, high));
    }
    Ok(low..=high)
}
