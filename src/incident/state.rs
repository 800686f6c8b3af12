//! The incident record shared by every producer.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Idle,
    Alert,
    Emergency,
}

impl Status {
    pub fn is_open(&self) -> bool {
        !matches!(self, Status::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Alert => "alert",
            Status::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEntry {
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// Offsets (from `fall_detected_at`) at which the next periodic effects are due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cadence {
    pub next_capture: Duration,
    pub next_sound: Duration,
}

/// Singleton incident state. Only the reducer mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    /// Incident number, bumped whenever an incident opens.
    pub incident: u64,
    pub status: Status,
    pub fall_detected_at: Option<DateTime<Utc>>,

    pub person_present: bool,
    pub person_fallen_by_pose: bool,
    /// Kept for dashboard compatibility, never set.
    pub person_moving: bool,

    pub sound_muted: bool,
    pub latest_snapshot: Option<String>,

    pub last_sensor_data: Option<Value>,
    pub sensor_history: VecDeque<SensorEntry>,

    /// Alert budget left as of the last tick.
    pub countdown_remaining_secs: Option<u64>,
    /// Set when the timer of the open incident died.
    pub monitoring_degraded: bool,

    /// Applied mutation count
    pub seq: u64,

    #[serde(skip)]
    pub cadence: Cadence,
}

impl IncidentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time since the incident opened, zero when idle or when the clock went backwards.
    pub fn elapsed_at(&self, now: DateTime<Utc>) -> Duration {
        self.fall_detected_at
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    pub fn push_reading(&mut self, timestamp: DateTime<Utc>, data: Value, capacity: usize) {
        self.last_sensor_data = Some(data.clone());
        self.sensor_history.push_back(SensorEntry { timestamp, data });
        while self.sensor_history.len() > capacity {
            self.sensor_history.pop_front();
        }
    }

    /// Back to the idle baseline. Keeps the incident counter, sensor history
    /// and the last snapshot reference.
    pub fn reset_to_idle(&mut self) {
        self.status = Status::Idle;
        self.fall_detected_at = None;
        self.person_present = false;
        self.person_fallen_by_pose = false;
        self.person_moving = false;
        self.sound_muted = false;
        self.countdown_remaining_secs = None;
        self.monitoring_degraded = false;
        self.cadence = Cadence::default();
    }
}
