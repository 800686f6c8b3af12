use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of wall-clock timestamps for events.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock pinned at construction and advanced by the tokio monotonic
/// clock, so timestamps never jump backwards and follow paused test time.
#[derive(Debug, Clone)]
pub struct AnchoredClock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl AnchoredClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self { wall, mono: Instant::now() }
    }
}

impl Default for AnchoredClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let since = self.mono.elapsed();
        chrono::Duration::from_std(since)
            .map(|d| self.wall + d)
            .unwrap_or(self.wall)
    }
}
