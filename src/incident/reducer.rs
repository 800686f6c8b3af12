//! Pure reducer: (Record, Event, now) -> (Record', Vec<Effect>)
//!
//! All status transitions happen here. The function never blocks and never
//! performs I/O; everything observable leaves as an [`Effect`] for the engine
//! to route to the timer controller, the dispatcher or the broadcaster.
//!
//! ```text
//!            AlertSignal               tick: remaining == 0
//!   Idle ───────────────► Alert ──────────────────────────► Emergency
//!    ▲  EmergencySignal     │  tick/detection: fall pose          ▲
//!    │  ─────────────────── │  latched && remaining <= window ────┘
//!    │                      │
//!    └──── CancelSignal ────┴──────────── CancelSignal ───────────┘
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::events::{Effect, EscalationCause, Event};
use super::latch;
use super::state::{IncidentRecord, Status};
use crate::config::EngineConfig;

/// Result of processing an event
#[derive(Debug, Default)]
pub struct ReducerOutput {
    pub effects: Vec<Effect>,
    /// False when the event was ignored and the record is unchanged.
    pub applied: bool,
}

/// Pure reducer function
pub fn reduce(
    record: &mut IncidentRecord,
    event: Event,
    now: DateTime<Utc>,
    cfg: &EngineConfig,
) -> ReducerOutput {
    let mut effects = Vec::new();

    let applied = match event {
        Event::SensorReading(payload) => {
            record.push_reading(now, payload, cfg.history_capacity);
            true
        }
        Event::AlertSignal => on_alert(record, now, cfg, &mut effects),
        Event::EmergencySignal => on_emergency_signal(record, now, cfg, &mut effects),
        Event::CancelSignal => on_cancel(record, &mut effects),
        Event::DetectionUpdate(observed) => {
            let changed = latch::apply(record, observed);
            let elapsed = record.elapsed_at(now);
            check_early_trigger(record, elapsed, cfg, &mut effects) || changed
        }
        Event::TimerTick { incident, elapsed } => on_tick(record, incident, elapsed, cfg, &mut effects),
        Event::Mute => {
            if record.status.is_open() && !record.sound_muted {
                record.sound_muted = true;
                effects.push(Effect::StopSound);
                true
            } else {
                false
            }
        }
        Event::Unmute => {
            // No catch-up: the next cadence slot decides whether sound plays.
            if record.status.is_open() && record.sound_muted {
                record.sound_muted = false;
                true
            } else {
                false
            }
        }
        Event::SnapshotCaptured { incident, reference } => {
            // captures finishing after their incident closed belong to nobody
            if incident == record.incident && record.status.is_open() {
                record.latest_snapshot = Some(reference);
                true
            } else {
                false
            }
        }
        Event::TimerFaulted { incident, reason } => {
            if incident == record.incident && record.status.is_open() && !record.monitoring_degraded {
                record.monitoring_degraded = true;
                effects.push(Effect::BroadcastDegraded { reason });
                true
            } else {
                false
            }
        }
    };

    if applied {
        record.seq += 1;
    }

    ReducerOutput { effects, applied }
}

fn on_alert(
    record: &mut IncidentRecord,
    now: DateTime<Utc>,
    cfg: &EngineConfig,
    effects: &mut Vec<Effect>,
) -> bool {
    match record.status {
        Status::Idle => {
            open_incident(record, now, cfg, effects);
            record.countdown_remaining_secs = Some(ceil_secs(cfg.alert_timeout));
            effects.insert(0, Effect::BroadcastAlert);
            true
        }
        Status::Alert if record.monitoring_degraded => restart_timer(record, effects),
        _ => false,
    }
}

fn on_emergency_signal(
    record: &mut IncidentRecord,
    now: DateTime<Utc>,
    cfg: &EngineConfig,
    effects: &mut Vec<Effect>,
) -> bool {
    match record.status {
        Status::Idle => {
            open_incident(record, now, cfg, effects);
            enter_emergency(record, Duration::ZERO, EscalationCause::Signalled, cfg, effects)
        }
        Status::Alert => {
            let at = record.elapsed_at(now);
            enter_emergency(record, at, EscalationCause::Signalled, cfg, effects)
        }
        Status::Emergency if record.monitoring_degraded => restart_timer(record, effects),
        Status::Emergency => false,
    }
}

fn on_cancel(record: &mut IncidentRecord, effects: &mut Vec<Effect>) -> bool {
    if !record.status.is_open() {
        return false;
    }
    let incident = record.incident;
    record.reset_to_idle();
    effects.push(Effect::CancelTimer { incident });
    effects.push(Effect::StopSound);
    effects.push(Effect::BroadcastCancelled);
    true
}

fn on_tick(
    record: &mut IncidentRecord,
    incident: u64,
    elapsed: Duration,
    cfg: &EngineConfig,
    effects: &mut Vec<Effect>,
) -> bool {
    // Stale tick from a timer that lost the race against a cancel.
    if incident != record.incident || !record.status.is_open() {
        return false;
    }
    let before = effects.len();

    match record.status {
        Status::Alert => {
            let remaining = cfg.alert_timeout.saturating_sub(elapsed);
            record.countdown_remaining_secs = Some(ceil_secs(remaining));
            effects.push(Effect::BroadcastProgress { remaining });
            if remaining.is_zero() {
                enter_emergency(record, elapsed, EscalationCause::Forced, cfg, effects);
            } else {
                check_early_trigger(record, elapsed, cfg, effects);
            }
        }
        Status::Emergency => {
            if elapsed >= record.cadence.next_sound {
                if !record.sound_muted {
                    effects.push(Effect::PlaySound);
                }
                // A muted slot is consumed, never replayed after unmute.
                record.cadence.next_sound = elapsed + cfg.sound_every;
            }
        }
        Status::Idle => {}
    }

    if elapsed >= record.cadence.next_capture {
        effects.push(Effect::CaptureSnapshot { incident: record.incident });
        record.cadence.next_capture = elapsed + cfg.capture_every;
    }

    effects.len() > before
}

/// Escalate an open alert when the fall pose is latched inside the terminal window.
fn check_early_trigger(
    record: &mut IncidentRecord,
    elapsed: Duration,
    cfg: &EngineConfig,
    effects: &mut Vec<Effect>,
) -> bool {
    if record.status != Status::Alert || !record.person_fallen_by_pose {
        return false;
    }
    let remaining = cfg.alert_timeout.saturating_sub(elapsed);
    if remaining > cfg.early_window {
        return false;
    }
    enter_emergency(record, elapsed, EscalationCause::EarlyTrigger, cfg, effects)
}

fn open_incident(
    record: &mut IncidentRecord,
    now: DateTime<Utc>,
    cfg: &EngineConfig,
    effects: &mut Vec<Effect>,
) {
    record.incident += 1;
    record.status = Status::Alert;
    record.fall_detected_at = Some(now);
    record.monitoring_degraded = false;
    record.latest_snapshot = None;
    record.cadence.next_capture = cfg.capture_every;
    record.cadence.next_sound = Duration::ZERO;
    effects.push(Effect::CaptureSnapshot { incident: record.incident });
    effects.push(Effect::StartTimer { incident: record.incident });
}

/// Emergency entry. First arrival wins; a second attempt is a no-op.
fn enter_emergency(
    record: &mut IncidentRecord,
    at: Duration,
    cause: EscalationCause,
    cfg: &EngineConfig,
    effects: &mut Vec<Effect>,
) -> bool {
    if record.status != Status::Alert {
        return false;
    }
    record.status = Status::Emergency;
    effects.push(Effect::SendEmergencyEmail {
        incident: record.incident,
        snapshot: record.latest_snapshot.clone(),
    });
    if !record.sound_muted {
        effects.push(Effect::PlaySound);
    }
    record.cadence.next_sound = at + cfg.sound_every;
    effects.push(Effect::BroadcastEmergency { cause });
    true
}

fn restart_timer(record: &mut IncidentRecord, effects: &mut Vec<Effect>) -> bool {
    record.monitoring_degraded = false;
    effects.push(Effect::StartTimer { incident: record.incident });
    true
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
