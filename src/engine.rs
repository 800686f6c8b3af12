//! Escalation engine: the single entry point producers talk to.
//!
//! Every event is stamped with the clock, reduced against the store and its
//! effects routed in order: timer control to the [`TimerSlot`], notices to
//! the [`Broadcaster`], everything else to the [`Dispatcher`]. Routing
//! happens under the ordering lock so observers see notices in transition
//! order.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::broadcast::{Broadcast, Broadcaster};
use crate::clock::{AnchoredClock, Clock};
use crate::config::EngineConfig;
use crate::dispatch::mail::MailSettings;
use crate::dispatch::{Backends, Dispatcher, EffectHost, Notification};
use crate::incident::{reduce, Effect, Event, IncidentRecord, IncidentStore, Status};
use crate::ingest::{self, Channel};
use crate::logging::{self, obj, payload_digest, v_bool, v_str, Domain};
use crate::timer::{TickOutcome, TickSink, TimerSlot};

const ALERT_MESSAGE: &str = "Fall detected! Emergency countdown started.";
const EMERGENCY_MESSAGE: &str = "EMERGENCY! Fall confirmed. Notifying emergency contact.";
const CANCELLED_MESSAGE: &str = "Alert cancelled by user.";

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: EngineConfig,
    store: IncidentStore,
    clock: Arc<dyn Clock>,
    timers: TimerSlot,
    dispatcher: Dispatcher,
    broadcaster: Broadcaster,
    order: Mutex<()>,
    // timers and notifier tasks hold the engine weakly
    this: Weak<Inner>,
}

impl Engine {
    /// Must be called inside a tokio runtime; `submit` may then be called
    /// from any thread.
    pub fn new(cfg: EngineConfig, backends: Backends) -> Result<Self> {
        Self::with_clock(cfg, backends, Arc::new(AnchoredClock::new()))
    }

    pub fn with_clock(cfg: EngineConfig, backends: Backends, clock: Arc<dyn Clock>) -> Result<Self> {
        let runtime = Handle::try_current().context("engine needs a tokio runtime")?;
        Ok(Self::on_runtime(runtime, cfg, backends, clock))
    }

    /// Timers and notifications are spawned on `runtime`.
    pub fn on_runtime(runtime: Handle, cfg: EngineConfig, backends: Backends, clock: Arc<dyn Clock>) -> Self {
        let dispatcher = Dispatcher::new(runtime.clone(), backends, MailSettings::from_config(&cfg));
        let inner = Arc::new_cyclic(|this| Inner {
            cfg,
            store: IncidentStore::new(),
            clock,
            timers: TimerSlot::new(runtime),
            dispatcher,
            broadcaster: Broadcaster::default(),
            order: Mutex::new(()),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Point-in-time copy of the incident record.
    pub fn snapshot(&self) -> IncidentRecord {
        self.inner.store.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcaster.subscribe()
    }

    /// Incident whose escalation timer is ticking right now.
    pub fn timer_active(&self) -> Option<u64> {
        self.inner.timers.active_incident()
    }

    /// Stop the escalation timer. Once the engine and in-flight
    /// notifications are dropped, subscribers see the channel close.
    pub fn shutdown(&self) {
        if let Some(incident) = self.inner.timers.shutdown() {
            logging::info(Domain::Timer, "timer_shutdown", obj(&[("incident", json!(incident))]));
        }
    }

    /// Apply one event and route its effects. Returns the committed record.
    pub fn submit(&self, event: Event) -> IncidentRecord {
        self.inner.submit(event)
    }

    /// Decode a raw collaborator message and apply the resulting events.
    /// Undecodable input is logged and leaves the record untouched.
    pub fn ingest(&self, channel: Channel, payload: &[u8]) -> Result<()> {
        let decoded = ingest::decode(channel, payload);
        self.deliver(channel.as_str(), &payload_digest(payload), decoded)
    }

    /// Same as [`Engine::ingest`] for an `{"channel", "data"}` envelope line.
    pub fn ingest_envelope(&self, line: &str) -> Result<()> {
        let decoded = ingest::decode_envelope(line);
        self.deliver("envelope", &payload_digest(line.as_bytes()), decoded)
    }

    fn deliver(&self, source: &str, digest: &str, decoded: Result<Vec<Event>>) -> Result<()> {
        match decoded {
            Ok(events) => {
                for event in events {
                    self.submit(event);
                }
                Ok(())
            }
            Err(err) => {
                logging::warn(
                    Domain::Ingest,
                    "decode_failed",
                    obj(&[
                        ("source", v_str(source)),
                        ("digest", v_str(digest)),
                        ("error", v_str(&format!("{:#}", err))),
                    ]),
                );
                Err(err)
            }
        }
    }
}

impl Inner {
    fn submit(&self, event: Event) -> IncidentRecord {
        let kind = event.kind();
        let _order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let (snapshot, out) = self.store.mutate(|record| reduce(record, event, now, &self.cfg));

        if !out.applied {
            logging::debug(Domain::Incident, "event_ignored", obj(&[("kind", v_str(kind))]));
            return snapshot;
        }

        if kind != "sensor_reading" && kind != "timer_tick" {
            logging::info(
                Domain::Incident,
                "transition",
                obj(&[
                    ("kind", v_str(kind)),
                    ("incident", json!(snapshot.incident)),
                    ("status", v_str(snapshot.status.as_str())),
                    ("effects", json!(out.effects.len())),
                ]),
            );
        }

        self.broadcaster.publish(Broadcast::StateChanged { snapshot: snapshot.clone() });
        for effect in out.effects {
            self.route(effect, &snapshot);
        }
        snapshot
    }

    fn route(&self, effect: Effect, snapshot: &IncidentRecord) {
        match effect {
            Effect::StartTimer { incident } => match self.this.upgrade() {
                Some(this) => {
                    let sink: Arc<dyn TickSink> = this;
                    self.timers.start(incident, self.cfg.tick, sink);
                }
                None => logging::warn(Domain::Timer, "engine_gone", obj(&[("incident", json!(incident))])),
            },
            Effect::CancelTimer { incident } => {
                self.timers.cancel(incident);
            }
            Effect::CaptureSnapshot { incident } => self.notify(Notification::CaptureSnapshot { incident }),
            Effect::PlaySound => self.notify(Notification::PlaySound),
            Effect::StopSound => self.notify(Notification::StopSound),
            Effect::SendEmergencyEmail { incident, snapshot } => {
                self.notify(Notification::SendEmergencyEmail { incident, snapshot })
            }
            Effect::BroadcastAlert => self.broadcaster.publish(Broadcast::FallAlert {
                incident: snapshot.incident,
                message: ALERT_MESSAGE.to_string(),
                timestamp: snapshot.fall_detected_at.map(|t| t.to_rfc3339()),
                snapshot: snapshot.latest_snapshot.clone(),
            }),
            Effect::BroadcastProgress { remaining } => self.broadcaster.publish(Broadcast::Progress {
                incident: snapshot.incident,
                person_present: snapshot.person_present,
                person_fallen_by_pose: snapshot.person_fallen_by_pose,
                time_remaining_secs: whole_secs(remaining),
            }),
            Effect::BroadcastEmergency { cause } => {
                logging::info(
                    Domain::Incident,
                    "emergency",
                    obj(&[
                        ("incident", json!(snapshot.incident)),
                        ("cause", json!(cause)),
                        ("muted", v_bool(snapshot.sound_muted)),
                    ]),
                );
                self.broadcaster.publish(Broadcast::Emergency {
                    incident: snapshot.incident,
                    message: EMERGENCY_MESSAGE.to_string(),
                    cause,
                    person_present: snapshot.person_present,
                    person_fallen_by_pose: snapshot.person_fallen_by_pose,
                    snapshot: snapshot.latest_snapshot.clone(),
                    sensor_data: snapshot.last_sensor_data.clone(),
                })
            }
            Effect::BroadcastCancelled => self.broadcaster.publish(Broadcast::Cancelled {
                // the record is already back in Idle; its counter still names the incident
                incident: snapshot.incident,
                message: CANCELLED_MESSAGE.to_string(),
            }),
            Effect::BroadcastDegraded { reason } => self.broadcaster.publish(Broadcast::MonitoringDegraded {
                incident: snapshot.incident,
                reason,
            }),
        }
    }

    fn notify(&self, notification: Notification) {
        match self.this.upgrade() {
            Some(this) => {
                let host: Arc<dyn EffectHost> = this;
                self.dispatcher.dispatch(notification, host);
            }
            None => logging::warn(
                Domain::Notify,
                "engine_gone",
                obj(&[("kind", v_str(notification.kind()))]),
            ),
        }
    }
}

impl TickSink for Inner {
    fn on_tick(&self, incident: u64) -> Result<TickOutcome> {
        let live = self.store.read();
        if live.incident != incident || !live.status.is_open() {
            return Ok(TickOutcome::Stop);
        }
        let started = live
            .fall_detected_at
            .ok_or_else(|| anyhow!("open incident {} has no start time", incident))?;
        let elapsed = (self.clock.now() - started).to_std().unwrap_or(Duration::ZERO);

        let after = self.submit(Event::TimerTick { incident, elapsed });
        if after.incident == incident && after.status != Status::Idle {
            Ok(TickOutcome::Continue)
        } else {
            Ok(TickOutcome::Stop)
        }
    }

    fn on_fault(&self, incident: u64, reason: String) {
        self.submit(Event::TimerFaulted { incident, reason });
    }
}

impl EffectHost for Inner {
    fn live(&self) -> IncidentRecord {
        self.store.read()
    }

    fn snapshot_captured(&self, incident: u64, reference: String) {
        self.submit(Event::SnapshotCaptured { incident, reference });
    }
}

fn whole_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
