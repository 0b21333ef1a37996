//! Per-instance timers.
//!
//! Each armed instance gets two tasks: a one-second spawn-wait ticker that
//! runs until the handler reports readiness, and a one-shot expiry timer
//! that fires after the full instance lifetime. Both are bound to a
//! [`CancellationToken`] kept in the scheduler's table next to the instance
//! id and deadline, which is the in-memory mirror of the armed records.
//!
//! Timers hold only a [`Weak`] reference to their handler, so dropping the
//! manager stops them from firing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SPAWN_TICK: Duration = Duration::from_secs(1);

/// Receives timer callbacks. Implementations must tolerate callbacks for
/// instances that have since been deleted or replaced.
#[async_trait]
pub trait ExpiryHandler: Send + Sync + 'static {
    /// One spawn-wait second elapsed. Return `false` to stop ticking.
    async fn on_spawn_tick(&self, client_key: &str, instance_id: &str) -> bool;

    /// The instance reached the end of its lifetime.
    async fn on_expire(&self, client_key: &str, instance_id: &str);
}

struct Armed {
    instance_id: String,
    deadline: Instant,
    cancel: CancellationToken,
}

pub struct ExpiryScheduler {
    timers: Mutex<HashMap<String, Armed>>,
    shutdown: CancellationToken,
}

impl ExpiryScheduler {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Arm both timers for an instance. Any timers still armed for the same
    /// key are cancelled first.
    pub fn arm<H: ExpiryHandler>(
        &self,
        handler: Weak<H>,
        client_key: &str,
        instance_id: &str,
        spawn_wait: bool,
        lifetime: Duration,
    ) {
        let cancel = self.shutdown.child_token();
        let deadline = Instant::now() + lifetime;

        let previous = self.table().insert(
            client_key.to_string(),
            Armed {
                instance_id: instance_id.to_string(),
                deadline,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(client = %client_key, stale = %previous.instance_id, "Replacing armed timers");
            previous.cancel.cancel();
        }

        if spawn_wait {
            tokio::spawn(run_spawn_wait(
                handler.clone(),
                client_key.to_string(),
                instance_id.to_string(),
                cancel.clone(),
            ));
        }
        tokio::spawn(run_expiry(
            handler,
            client_key.to_string(),
            instance_id.to_string(),
            deadline,
            cancel,
        ));

        debug!(client = %client_key, instance_id = %instance_id, lifetime_secs = lifetime.as_secs(), "Timers armed");
    }

    /// Cancel and forget the timers for `client_key`. Returns whether any
    /// were armed.
    pub fn disarm(&self, client_key: &str) -> bool {
        match self.table().remove(client_key) {
            Some(armed) => {
                armed.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the timers armed for `client_key` belong to `instance_id`.
    pub fn is_armed(&self, client_key: &str, instance_id: &str) -> bool {
        self.table()
            .get(client_key)
            .map(|armed| armed.instance_id == instance_id && !armed.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Time left before the expiry timer for `client_key` fires.
    pub fn remaining(&self, client_key: &str, instance_id: &str) -> Option<Duration> {
        self.table()
            .get(client_key)
            .filter(|armed| armed.instance_id == instance_id)
            .map(|armed| armed.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn armed_count(&self) -> usize {
        self.table().len()
    }

    /// Cancel every timer. Used on process shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let drained = self.table().drain().count();
        info!(timers = drained, "Expiry scheduler stopped");
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Armed>> {
        // Critical sections never panic, so recover from poisoning.
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ExpiryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_spawn_wait<H: ExpiryHandler>(
    handler: Weak<H>,
    client_key: String,
    instance_id: String,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + SPAWN_TICK, SPAWN_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(handler) = handler.upgrade() else { break };
                if !handler.on_spawn_tick(&client_key, &instance_id).await {
                    break;
                }
            }
        }
    }
}

async fn run_expiry<H: ExpiryHandler>(
    handler: Weak<H>,
    client_key: String,
    instance_id: String,
    deadline: Instant,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(client = %client_key, instance_id = %instance_id, "Expiry timer cancelled");
        }
        _ = sleep_until(deadline) => {
            if let Some(handler) = handler.upgrade() {
                handler.on_expire(&client_key, &instance_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        ticks: AtomicU32,
        expired: Mutex<Vec<(String, String)>>,
        ready_after: u32,
    }

    #[async_trait]
    impl ExpiryHandler for Recorder {
        async fn on_spawn_tick(&self, _client_key: &str, _instance_id: &str) -> bool {
            let ticks = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            ticks < self.ready_after
        }

        async fn on_expire(&self, client_key: &str, instance_id: &str) {
            self.expired
                .lock()
                .unwrap()
                .push((client_key.to_string(), instance_id.to_string()));
        }
    }

    fn recorder(ready_after: u32) -> Arc<Recorder> {
        Arc::new(Recorder {
            ready_after,
            ..Recorder::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_wait_ticks_until_ready() {
        let handler = recorder(3);
        let scheduler = ExpiryScheduler::new();
        scheduler.arm(Arc::downgrade(&handler), "a", "id-1", true, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(handler.ticks.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fires_once_at_deadline() {
        let handler = recorder(1);
        let scheduler = ExpiryScheduler::new();
        scheduler.arm(Arc::downgrade(&handler), "a", "id-1", false, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(handler.expired.lock().unwrap().is_empty());
        assert!(scheduler.remaining("a", "id-1").unwrap() <= Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            *handler.expired.lock().unwrap(),
            vec![("a".to_string(), "id-1".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_timers() {
        let handler = recorder(100);
        let scheduler = ExpiryScheduler::new();
        scheduler.arm(Arc::downgrade(&handler), "a", "id-1", true, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(scheduler.disarm("a"));
        assert!(!scheduler.disarm("a"));
        assert!(!scheduler.is_armed("a", "id-1"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handler.ticks.load(Ordering::SeqCst), 1);
        assert!(handler.expired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_stale_timers() {
        let handler = recorder(100);
        let scheduler = ExpiryScheduler::new();
        scheduler.arm(Arc::downgrade(&handler), "a", "old", false, Duration::from_secs(5));
        scheduler.arm(Arc::downgrade(&handler), "a", "new", false, Duration::from_secs(8));

        assert!(scheduler.is_armed("a", "new"));
        assert!(!scheduler.is_armed("a", "old"));
        assert_eq!(scheduler.armed_count(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            *handler.expired.lock().unwrap(),
            vec![("a".to_string(), "new".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handler_stops_timers() {
        let handler = recorder(100);
        let scheduler = ExpiryScheduler::new();
        scheduler.arm(Arc::downgrade(&handler), "a", "id-1", true, Duration::from_secs(2));
        drop(handler);

        tokio::time::sleep(Duration::from_secs(5)).await;
        // Nothing to observe beyond not panicking; the table entry remains
        // until disarmed.
        assert_eq!(scheduler.armed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let handler = recorder(100);
        let scheduler = ExpiryScheduler::new();
        scheduler.arm(Arc::downgrade(&handler), "a", "1", false, Duration::from_secs(2));
        scheduler.arm(Arc::downgrade(&handler), "b", "2", false, Duration::from_secs(2));

        scheduler.shutdown();
        assert_eq!(scheduler.armed_count(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(handler.expired.lock().unwrap().is_empty());
    }
}
