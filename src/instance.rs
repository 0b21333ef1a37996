//! Instance data model.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle phase of a recorded instance.
///
/// Phases only move forward: `Spawning -> Ready -> Expired`, and any phase
/// may be followed by deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Spawning,
    Ready,
    Expired,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Spawning => "spawning",
            Phase::Ready => "ready",
            Phase::Expired => "expired",
        }
    }

    /// Whether moving from `self` to `next` respects phase ordering.
    pub fn can_advance_to(self, next: Phase) -> bool {
        next > self
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spawning" => Ok(Phase::Spawning),
            "ready" => Ok(Phase::Ready),
            "expired" => Ok(Phase::Expired),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// Persisted record of one live instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub client_key: String,
    /// Minted per create; distinguishes successive instances of one client.
    pub instance_id: String,
    pub port: u16,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub phase: Phase,
    pub waited_seconds: u32,
}

/// What callers see when asking about their instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub client_key: String,
    pub phase: Phase,
    /// Only reported once the workload is ready.
    pub port: Option<u16>,
    #[serde(rename = "remaining_secs", serialize_with = "as_secs")]
    pub remaining: Duration,
    pub waited_seconds: u32,
    pub spawn_grace_seconds: u64,
}

impl InstanceStatus {
    /// Remaining lifetime as `HH:MM:SS`.
    pub fn countdown(&self) -> String {
        format_countdown(self.remaining)
    }
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

/// Format a duration as `HH:MM:SS`; hours wrap at one day.
pub fn format_countdown(d: Duration) -> String {
    let total = d.as_secs();
    let hours = (total / 3600) % 24;
    let minutes = (total / 60) % 60;
    let seconds = total % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
