//! Host port selection for new instances.

use crate::error::{Error, Result};
use rand::Rng;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Mutex;

/// Draws ports uniformly from a fixed range.
///
/// Nothing is persisted. Ports held by recorded instances come from the
/// caller; ports handed out by [`reserve`](Self::reserve) but not yet
/// recorded are tracked in memory until their lease is dropped.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    in_flight: Mutex<HashSet<u16>>,
}

/// A port reserved for an instance that is still being launched.
#[derive(Debug)]
pub struct PortLease<'a> {
    port: u16,
    allocator: &'a PortAllocator,
}

impl PortLease<'_> {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        self.allocator.in_flight().remove(&self.port);
    }
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve a port that is neither live nor in flight.
    ///
    /// `live_ports` is read while the in-flight set is locked, so a lease
    /// released after its instance was recorded is always seen by one of the
    /// two sets.
    pub fn reserve<F>(&self, live_ports: F) -> Result<PortLease<'_>>
    where
        F: FnOnce() -> Result<HashSet<u16>>,
    {
        let mut in_flight = self.in_flight();
        let mut exclude = live_ports()?;
        exclude.extend(in_flight.iter().copied());
        let port = self.allocate(&exclude)?;
        in_flight.insert(port);
        Ok(PortLease {
            port,
            allocator: self,
        })
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick a port that is not in `exclude`.
    pub fn allocate(&self, exclude: &HashSet<u16>) -> Result<u16> {
        let size = usize::from(*self.range.end() - *self.range.start()) + 1;
        let taken = exclude.iter().filter(|p| self.range.contains(p)).count();
        if taken >= size {
            return Err(Error::spawn(format!(
                "port range {}-{} exhausted",
                self.range.start(),
                self.range.end()
            )));
        }

        let mut rng = rand::thread_rng();
        // Dense ranges degrade to a scan from a random offset.
        if taken * 2 > size {
            let offset = rng.gen_range(0..size);
            return (0..size)
                .map(|i| self.range.start() + ((offset + i) % size) as u16)
                .find(|port| !exclude.contains(port))
                .ok_or_else(|| Error::spawn("port range exhausted"));
        }

        loop {
            let port = rng.gen_range(self.range.clone());
            if !exclude.contains(&port) {
                return Ok(port);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_within_range() {
        let allocator = PortAllocator::new(49000..=50000);
        let none = HashSet::new();
        for _ in 0..1000 {
            let port = allocator.allocate(&none).unwrap();
            assert!((49000..=50000).contains(&port));
        }
    }

    #[test]
    fn test_never_returns_live_port() {
        let allocator = PortAllocator::new(49000..=49999);
        let mut live = HashSet::new();
        for _ in 0..10_000 {
            let port = allocator.allocate(&live).unwrap();
            assert!(!live.contains(&port));
            live.insert(port);
            // Keep roughly 900 instances alive at once.
            if live.len() > 900 {
                let victim = *live.iter().next().unwrap();
                live.remove(&victim);
            }
        }
    }

    #[test]
    fn test_fills_entire_range() {
        let allocator = PortAllocator::new(60000..=60009);
        let mut live = HashSet::new();
        for _ in 0..10 {
            live.insert(allocator.allocate(&live).unwrap());
        }
        assert_eq!(live.len(), 10);
        assert!(matches!(allocator.allocate(&live), Err(Error::Spawn { .. })));
    }

    #[test]
    fn test_leases_exclude_each_other() {
        let allocator = PortAllocator::new(60000..=60001);
        let first = allocator.reserve(|| Ok(HashSet::new())).unwrap();
        let second = allocator.reserve(|| Ok(HashSet::new())).unwrap();
        assert_ne!(first.port(), second.port());
        assert!(allocator.reserve(|| Ok(HashSet::new())).is_err());

        let freed = first.port();
        drop(first);
        let third = allocator.reserve(|| Ok(HashSet::new())).unwrap();
        assert_eq!(third.port(), freed);
    }

    #[test]
    fn test_reserve_respects_live_ports() {
        let allocator = PortAllocator::new(60000..=60001);
        let lease = allocator
            .reserve(|| Ok([60000].into_iter().collect()))
            .unwrap();
        assert_eq!(lease.port(), 60001);
    }

    #[test]
    fn test_ignores_excluded_ports_outside_range() {
        let allocator = PortAllocator::new(60000..=60000);
        let exclude: HashSet<u16> = [1, 2, 3].into_iter().collect();
        assert_eq!(allocator.allocate(&exclude).unwrap(), 60000);
    }
}
