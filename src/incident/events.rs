//! Inbound events and outbound effects of the escalation state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One perception observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(default)]
    pub person_detected: bool,
    #[serde(default)]
    pub person_fallen_by_pose: bool,
}

/// Commands issued from the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserCommand {
    Mute,
    Unmute,
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SensorReading(Value),
    AlertSignal,
    EmergencySignal,
    CancelSignal,
    DetectionUpdate(Detection),
    /// Synthetic tick from the escalation timer of `incident`.
    TimerTick { incident: u64, elapsed: Duration },
    Mute,
    Unmute,
    /// A capture effect produced an artifact.
    SnapshotCaptured { incident: u64, reference: String },
    /// The timer of `incident` died without being cancelled.
    TimerFaulted { incident: u64, reason: String },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SensorReading(_) => "sensor_reading",
            Event::AlertSignal => "alert_signal",
            Event::EmergencySignal => "emergency_signal",
            Event::CancelSignal => "cancel_signal",
            Event::DetectionUpdate(_) => "detection_update",
            Event::TimerTick { .. } => "timer_tick",
            Event::Mute => "mute",
            Event::Unmute => "unmute",
            Event::SnapshotCaptured { .. } => "snapshot_captured",
            Event::TimerFaulted { .. } => "timer_faulted",
        }
    }
}

impl From<UserCommand> for Event {
    fn from(cmd: UserCommand) -> Self {
        match cmd {
            UserCommand::Mute => Event::Mute,
            UserCommand::Unmute => Event::Unmute,
            UserCommand::Cancel => Event::CancelSignal,
        }
    }
}

/// Why an incident reached `Emergency`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationCause {
    /// Fall pose latched inside the terminal window of the countdown.
    EarlyTrigger,
    /// Countdown expired without cancellation.
    Forced,
    /// Emergency signalled directly by the ingest collaborator.
    Signalled,
}

/// Side effects requested by a transition. Executed elsewhere, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartTimer { incident: u64 },
    CancelTimer { incident: u64 },
    CaptureSnapshot { incident: u64 },
    PlaySound,
    StopSound,
    SendEmergencyEmail { incident: u64, snapshot: Option<String> },
    BroadcastAlert,
    BroadcastProgress { remaining: Duration },
    BroadcastEmergency { cause: EscalationCause },
    BroadcastCancelled,
    BroadcastDegraded { reason: String },
}
