//! Scripted workload for exercising the lifecycle without launching
//! processes.

use crate::error::{Error, Result};
use crate::workload::{ProcessHandle, SpawnFailure, Workload};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct FakeWorkload {
    next_pid: AtomicU32,
    spawns: AtomicU32,
    kills: Mutex<Vec<u32>>,
    alive: Mutex<HashSet<u32>>,
    /// Outcomes consumed by upcoming spawns, front first.
    script: Mutex<VecDeque<Outcome>>,
    always_fail: bool,
    fail_kill: bool,
    kill_delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    PortInUse,
    Fail,
}

impl FakeWorkload {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::new()
        }
    }

    pub fn failing_kills() -> Self {
        Self {
            fail_kill: true,
            ..Self::new()
        }
    }

    /// Kills take `delay` to return.
    pub fn slow_kills(delay: Duration) -> Self {
        Self {
            kill_delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn push_outcome(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> Vec<u32> {
        self.kills.lock().unwrap().clone()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.lock().unwrap().len()
    }

    /// Simulate the workload dying on its own.
    pub fn crash(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn spawn(
        &self,
        _client_key: &str,
        port: u16,
    ) -> std::result::Result<ProcessHandle, SpawnFailure> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        // Let competing tasks interleave as a real launch would.
        tokio::task::yield_now().await;

        if self.always_fail {
            return Err(SpawnFailure::Launch("scripted failure".into()));
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Outcome::PortInUse) => return Err(SpawnFailure::PortInUse(port)),
            Some(Outcome::Fail) => return Err(SpawnFailure::Launch("scripted failure".into())),
            None => {}
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.alive.lock().unwrap().insert(pid);
        Ok(ProcessHandle::from_pid(pid))
    }

    async fn kill(&self, handle: ProcessHandle) -> Result<()> {
        let pid = handle.pid();
        self.kills.lock().unwrap().push(pid);
        if let Some(delay) = self.kill_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_kill {
            return Err(Error::Kill {
                pid,
                reason: "scripted kill failure".into(),
            });
        }
        self.alive.lock().unwrap().remove(&pid);
        Ok(())
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.alive.lock().unwrap().contains(&handle.pid())
    }
}
