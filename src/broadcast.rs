//! Fan-out of state changes and incident notices to dashboard subscribers.

use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;

use crate::incident::{EscalationCause, IncidentRecord};
use crate::logging::{self, obj, v_str, Domain};

/// Everything observers can see. Snapshot images are referenced by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Broadcast {
    StateChanged {
        snapshot: IncidentRecord,
    },
    FallAlert {
        incident: u64,
        message: String,
        timestamp: Option<String>,
        snapshot: Option<String>,
    },
    Progress {
        incident: u64,
        person_present: bool,
        person_fallen_by_pose: bool,
        time_remaining_secs: u64,
    },
    Emergency {
        incident: u64,
        message: String,
        cause: EscalationCause,
        person_present: bool,
        person_fallen_by_pose: bool,
        snapshot: Option<String>,
        sensor_data: Option<serde_json::Value>,
    },
    Cancelled {
        incident: u64,
        message: String,
    },
    MonitoringDegraded {
        incident: u64,
        reason: String,
    },
}

impl Broadcast {
    pub fn kind(&self) -> &'static str {
        match self {
            Broadcast::StateChanged { .. } => "state_changed",
            Broadcast::FallAlert { .. } => "fall_alert",
            Broadcast::Progress { .. } => "progress",
            Broadcast::Emergency { .. } => "emergency",
            Broadcast::Cancelled { .. } => "cancelled",
            Broadcast::MonitoringDegraded { .. } => "monitoring_degraded",
        }
    }
}

/// Publisher side. Sending never blocks and never fails the caller: with no
/// subscribers the message is dropped, and slow subscribers see a lag error
/// on their own receiver.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Broadcast>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    pub fn publish(&self, msg: Broadcast) {
        let kind = msg.kind();
        let receivers = self.tx.send(msg).unwrap_or(0);
        if kind != "state_changed" {
            logging::debug(
                Domain::Broadcast,
                "published",
                obj(&[("kind", v_str(kind)), ("receivers", json!(receivers))]),
            );
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
