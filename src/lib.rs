//! Instancer - one ephemeral, isolated workload per client.
//!
//! The [`LifecycleManager`] allocates a port, launches the workload, records
//! it, and reclaims it when its lifetime runs out or the client deletes it.
//! The HTTP layer in [`http_server`] is a thin adapter over it.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux.");

pub mod config;
pub mod error;
pub mod http_server;
pub mod identity;
pub mod instance;
pub mod keylock;
pub mod lifecycle;
pub mod ports;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod verify;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, WorkloadConfig};
pub use error::{Error, Result};
pub use instance::{InstanceRecord, InstanceStatus, Phase};
pub use lifecycle::LifecycleManager;
pub use store::InstanceStore;
pub use workload::{ProcessHandle, ProcessSupervisor, Workload};
