//! Instance lifecycle manager.
//!
//! Orchestrates the store, port allocator, workload supervisor and expiry
//! scheduler behind one state machine:
//!
//! ```text
//! Absent -> Spawning -> Ready -> Expired -> Absent
//!              \__________________/
//! ```
//!
//! Every mutation for a client key runs under that key's lock, which makes
//! "check absent, then create" atomic and lets explicit deletes and timer
//! driven expiry race safely: whichever gets the lock first removes the
//! record, the other finds nothing to do.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::instance::{InstanceRecord, InstanceStatus, Phase};
use crate::keylock::KeyLocks;
use crate::ports::{PortAllocator, PortLease};
use crate::scheduler::{ExpiryHandler, ExpiryScheduler};
use crate::store::InstanceStore;
use crate::workload::{ProcessHandle, SpawnFailure, Workload};
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const STORE_WRITE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Entry point for creating, querying and deleting instances.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    store: InstanceStore,
    ports: PortAllocator,
    workload: Arc<dyn Workload>,
    scheduler: ExpiryScheduler,
    locks: KeyLocks,
}

impl LifecycleManager {
    pub fn new(config: Config, store: InstanceStore, workload: Arc<dyn Workload>) -> Result<Self> {
        config.validate()?;
        let ports = PortAllocator::new(config.port_range.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                ports,
                workload,
                scheduler: ExpiryScheduler::new(),
                locks: KeyLocks::new(),
            }),
        })
    }

    /// Launch a new instance for `client_key`.
    ///
    /// Fails with [`Error::AlreadyExists`] when the client already has one.
    /// A failed launch leaves no record behind.
    pub async fn create(&self, client_key: &str) -> Result<InstanceRecord> {
        self.inner.create(client_key).await
    }

    pub async fn query(&self, client_key: &str) -> Result<InstanceStatus> {
        self.inner.query(client_key).await
    }

    /// Tear down the client's instance. [`Error::NotFound`] means there was
    /// nothing to delete.
    pub async fn delete(&self, client_key: &str) -> Result<()> {
        self.inner.delete(client_key).await
    }

    /// Kill and purge every persisted record.
    ///
    /// Run once at startup, before serving: timers from a previous process
    /// are gone, so its records can never expire on their own.
    pub async fn reconcile(&self) -> Result<usize> {
        self.inner.reconcile().await
    }

    /// Stop all timers. Running workloads are left for the next
    /// [`reconcile`](Self::reconcile).
    pub fn shutdown(&self) {
        self.inner.scheduler.shutdown();
    }

    pub fn armed_timers(&self) -> usize {
        self.inner.scheduler.armed_count()
    }
}

impl Inner {
    async fn create(self: &Arc<Self>, client_key: &str) -> Result<InstanceRecord> {
        // Held until the record is persisted and armed: a concurrent create
        // for this key must see the record, never a workload still launching.
        let _guard = self.locks.lock(client_key).await;

        let key = client_key.to_string();
        if self.with_store(move |store| store.exists(&key)).await? {
            debug!(client = %client_key, "Instance already exists");
            return Err(Error::already_exists(client_key));
        }

        let (handle, lease) = self.spawn_with_retry(client_key).await?;

        let grace = self.config.spawn_grace;
        let lifetime = self.config.lifetime();
        // Stored with millisecond precision.
        let created_at = Utc::now().trunc_subsecs(3);
        let expires_at = created_at
            + chrono::Duration::from_std(lifetime)
                .map_err(|e| Error::Config(format!("lifetime out of range: {}", e)))?;
        let record = InstanceRecord {
            client_key: client_key.to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            port: lease.port(),
            pid: handle.pid(),
            created_at,
            expires_at,
            phase: if grace.is_zero() {
                Phase::Ready
            } else {
                Phase::Spawning
            },
            waited_seconds: 0,
        };

        if let Err(e) = self.persist(&record).await {
            error!(
                client = %client_key,
                pid = record.pid,
                port = record.port,
                error = %e,
                "Failed to record spawned workload, terminating it"
            );
            if let Err(kill_err) = self.workload.kill(handle).await {
                error!(
                    client = %client_key,
                    pid = record.pid,
                    error = %kill_err,
                    "Untracked workload could not be killed"
                );
            }
            return Err(match e {
                Error::DuplicateKey { client } => Error::AlreadyExists { client },
                other => other,
            });
        }
        drop(lease);

        self.scheduler.arm(
            Arc::downgrade(self),
            client_key,
            &record.instance_id,
            !grace.is_zero(),
            lifetime,
        );

        info!(
            client = %client_key,
            instance_id = %record.instance_id,
            port = record.port,
            pid = record.pid,
            expires_at = %record.expires_at,
            "Instance created"
        );
        Ok(record)
    }

    /// Launch the workload, moving to a fresh port whenever the chosen one
    /// turns out to be taken.
    async fn spawn_with_retry(&self, client_key: &str) -> Result<(ProcessHandle, PortLease<'_>)> {
        let attempts = self.config.max_spawn_attempts;
        let mut busy: HashSet<u16> = HashSet::new();
        for attempt in 1..=attempts {
            let lease = self.ports.reserve(|| {
                let mut exclude = self.store.live_ports()?;
                exclude.extend(busy.iter().copied());
                Ok(exclude)
            })?;
            let port = lease.port();
            match self.workload.spawn(client_key, port).await {
                Ok(handle) => return Ok((handle, lease)),
                Err(SpawnFailure::PortInUse(port)) => {
                    warn!(client = %client_key, port, attempt, "Port in use, retrying with another");
                    busy.insert(port);
                }
                Err(e) => {
                    warn!(client = %client_key, port, error = %e, "Workload spawn failed");
                    return Err(e.into());
                }
            }
        }
        Err(Error::spawn(format!(
            "no usable port after {} attempts",
            attempts
        )))
    }

    /// Run a store operation on the blocking pool.
    async fn with_store<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&InstanceStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| Error::Store(format!("store task failed: {}", e)))?
    }

    async fn persist(&self, record: &InstanceRecord) -> Result<()> {
        let mut attempt = 1;
        loop {
            let row = record.clone();
            match self.with_store(move |store| store.create(&row)).await {
                Ok(()) => return Ok(()),
                Err(e @ Error::DuplicateKey { .. }) => return Err(e),
                Err(e) if attempt < STORE_WRITE_ATTEMPTS => {
                    warn!(client = %record.client_key, attempt, error = %e, "Store write failed, retrying");
                    tokio::time::sleep(STORE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn query(&self, client_key: &str) -> Result<InstanceStatus> {
        let key = client_key.to_string();
        let record = self.with_store(move |store| store.get(&key)).await?;

        let handle = ProcessHandle::from_pid(record.pid);
        if !self.workload.is_alive(&handle) {
            warn!(client = %client_key, pid = record.pid, "Workload vanished, reclaiming record");
            self.reclaim(client_key, &record.instance_id).await;
            return Err(Error::not_found(client_key));
        }

        let remaining = self
            .scheduler
            .remaining(client_key, &record.instance_id)
            .unwrap_or_else(|| {
                (record.expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });

        Ok(InstanceStatus {
            client_key: record.client_key,
            phase: record.phase,
            port: (record.phase == Phase::Ready).then_some(record.port),
            remaining,
            waited_seconds: record.waited_seconds,
            spawn_grace_seconds: self.config.spawn_grace.as_secs(),
        })
    }

    async fn delete(&self, client_key: &str) -> Result<()> {
        let _guard = self.locks.lock(client_key).await;
        let key = client_key.to_string();
        let record = self.with_store(move |store| store.get(&key)).await?;
        self.teardown(record).await?;
        info!(client = %client_key, "Instance deleted");
        Ok(())
    }

    /// Remove `instance_id` if it is still the client's current instance.
    async fn reclaim(&self, client_key: &str, instance_id: &str) {
        let _guard = self.locks.lock(client_key).await;
        let key = client_key.to_string();
        let record = match self.with_store(move |store| store.get(&key)).await {
            Ok(record) if record.instance_id == instance_id => record,
            Ok(_) => {
                debug!(client = %client_key, instance_id = %instance_id, "Instance replaced, nothing to reclaim");
                return;
            }
            Err(Error::NotFound { .. }) => {
                debug!(client = %client_key, instance_id = %instance_id, "Instance already deleted");
                return;
            }
            Err(e) => {
                error!(client = %client_key, error = %e, "Failed to read instance for reclaim");
                return;
            }
        };
        if let Err(e) = self.teardown(record).await {
            error!(client = %client_key, error = %e, "Failed to reclaim instance");
        }
    }

    /// Cancel timers, mark expired, kill, then remove the record. Caller
    /// holds the key lock, so the kill runs under it; the signal does not
    /// wait for the workload to exit.
    async fn teardown(&self, record: InstanceRecord) -> Result<()> {
        let client_key = record.client_key.as_str();
        self.scheduler.disarm(client_key);
        // An expired record is never reported as ready, even if removal fails.
        let key = record.client_key.clone();
        if let Err(e) = self
            .with_store(move |store| store.update_phase(&key, Phase::Expired))
            .await
        {
            warn!(client = %client_key, error = %e, "Failed to mark instance expired");
        }

        if let Err(e) = self.workload.kill(ProcessHandle::from_pid(record.pid)).await {
            warn!(client = %client_key, pid = record.pid, error = %e, "Kill failed, removing record anyway");
        }

        let key = record.client_key.clone();
        self.with_store(move |store| store.delete(&key))
            .await
            .map_err(|e| {
                error!(client = %client_key, pid = record.pid, error = %e, "Failed to remove instance record");
                e
            })
    }

    async fn reconcile(&self) -> Result<usize> {
        let records = self.with_store(|store| store.list()).await?;
        let count = records.len();
        for record in records {
            let _guard = self.locks.lock(&record.client_key).await;
            if let Err(e) = self.workload.kill(ProcessHandle::from_pid(record.pid)).await {
                warn!(client = %record.client_key, pid = record.pid, error = %e, "Kill failed during reconcile");
            }
            let key = record.client_key.clone();
            self.with_store(move |store| store.delete(&key)).await?;
            info!(
                client = %record.client_key,
                pid = record.pid,
                port = record.port,
                phase = %record.phase,
                "Purged stale instance"
            );
        }
        Ok(count)
    }
}

#[async_trait]
impl ExpiryHandler for Inner {
    async fn on_spawn_tick(&self, client_key: &str, instance_id: &str) -> bool {
        let _guard = self.locks.lock(client_key).await;
        if !self.scheduler.is_armed(client_key, instance_id) {
            return false;
        }

        let grace_ticks = grace_ticks(self.config.spawn_grace);
        let key = client_key.to_string();
        let result = self
            .with_store(move |store| {
                let waited = store.increment_waited(&key)?;
                if waited >= grace_ticks {
                    store.update_phase(&key, Phase::Ready)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .await;
        match result {
            Ok(true) => {
                info!(client = %client_key, instance_id = %instance_id, "Instance ready");
                false
            }
            Ok(false) => true,
            Err(e) => {
                warn!(client = %client_key, error = %e, "Spawn-wait tick failed");
                !matches!(e, Error::NotFound { .. })
            }
        }
    }

    async fn on_expire(&self, client_key: &str, instance_id: &str) {
        info!(client = %client_key, instance_id = %instance_id, "Instance lifetime over");
        self.reclaim(client_key, instance_id).await;
    }
}

/// Whole spawn-wait seconds needed before an instance counts as ready.
fn grace_ticks(grace: Duration) -> u32 {
    let secs = grace.as_secs() + u64::from(grace.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}
