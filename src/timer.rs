//! Per-incident escalation countdown.
//!
//! One tokio task per open incident ticks at a fixed cadence and hands each
//! tick to a [`TickSink`], which re-reads the live record before acting. The
//! task ends when the sink reports the incident closed, when it is cancelled
//! through its handle, or when it faults; a fault is reported back to the
//! sink so the incident can be flagged as unmonitored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::logging::{self, obj, v_str, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The incident is no longer open; the timer should end.
    Stop,
}

/// Receiver of timer ticks.
pub trait TickSink: Send + Sync + 'static {
    fn on_tick(&self, incident: u64) -> Result<TickOutcome>;
    fn on_fault(&self, incident: u64, reason: String);
}

/// Handle to a running countdown. Dropping it cancels the task.
#[derive(Debug)]
pub struct EscalationTimer {
    incident: u64,
    cancel_tx: watch::Sender<bool>,
    alive: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl EscalationTimer {
    /// Start ticking on `runtime`. Callable from any thread.
    pub fn spawn(runtime: &Handle, incident: u64, cadence: Duration, sink: Arc<dyn TickSink>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let alive = Arc::new(AtomicBool::new(true));

        let worker = runtime.spawn(run(
            incident,
            cadence,
            Arc::clone(&sink),
            cancel_rx,
            AliveGuard(Arc::clone(&alive)),
        ));
        let supervisor = runtime.spawn(async move {
            if let Err(err) = worker.await {
                if err.is_panic() {
                    logging::warn(
                        Domain::Timer,
                        "timer_fault",
                        obj(&[("incident", json!(incident)), ("reason", v_str("panic"))]),
                    );
                    sink.on_fault(incident, "timer task panicked".to_string());
                }
            }
        });

        logging::debug(
            Domain::Timer,
            "timer_started",
            obj(&[("incident", json!(incident)), ("cadence_ms", json!(cadence.as_millis() as u64))]),
        );

        Self { incident, cancel_tx, alive, supervisor: Some(supervisor) }
    }

    pub fn incident(&self) -> u64 {
        self.incident
    }

    /// True while the tick loop is running.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Ask the tick loop to stop. It will not deliver another tick.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait until the task (including fault reporting) has finished.
    pub async fn join(mut self) {
        self.cancel();
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.await;
        }
    }
}

impl Drop for EscalationTimer {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}

struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn run(
    incident: u64,
    cadence: Duration,
    sink: Arc<dyn TickSink>,
    mut cancel_rx: watch::Receiver<bool>,
    _alive: AliveGuard,
) {
    let mut ticker = interval_at(Instant::now() + cadence, cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => {
                logging::debug(Domain::Timer, "timer_cancelled", obj(&[("incident", json!(incident))]));
                return;
            }
            _ = ticker.tick() => {}
        }
        if *cancel_rx.borrow() {
            return;
        }

        match sink.on_tick(incident) {
            Ok(TickOutcome::Continue) => {}
            Ok(TickOutcome::Stop) => {
                logging::debug(Domain::Timer, "timer_stopped", obj(&[("incident", json!(incident))]));
                return;
            }
            Err(err) => {
                logging::warn(
                    Domain::Timer,
                    "timer_fault",
                    obj(&[("incident", json!(incident)), ("reason", v_str(&format!("{:#}", err)))]),
                );
                sink.on_fault(incident, format!("{:#}", err));
                return;
            }
        }
    }
}

/// Holds at most one live timer and keeps it bound to its incident.
#[derive(Debug)]
pub struct TimerSlot {
    runtime: Handle,
    current: Mutex<Option<EscalationTimer>>,
}

impl TimerSlot {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime, current: Mutex::new(None) }
    }

    /// Start the countdown for `incident`, stopping any timer left over from
    /// another incident first. Returns false if it is already running.
    pub fn start(&self, incident: u64, cadence: Duration, sink: Arc<dyn TickSink>) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = current.as_ref() {
            if timer.incident() == incident && timer.is_running() {
                return false;
            }
            timer.cancel();
        }
        *current = Some(EscalationTimer::spawn(&self.runtime, incident, cadence, sink));
        true
    }

    /// Cancel the timer of `incident`. A cancel for any other incident is
    /// ignored so a late cancel cannot kill a newer countdown.
    pub fn cancel(&self, incident: u64) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(timer) if timer.incident() == incident => {
                timer.cancel();
                *current = None;
                true
            }
            _ => false,
        }
    }

    /// Stop whatever timer is held, whatever its incident.
    pub fn shutdown(&self) -> Option<u64> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.take().map(|timer| {
            timer.cancel();
            timer.incident()
        })
    }

    /// Incident whose timer is currently ticking.
    pub fn active_incident(&self) -> Option<u64> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().filter(|t| t.is_running()).map(|t| t.incident())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicU64;

    #[derive(Clone, Copy)]
    enum Mode {
        Continue,
        StopAfter(u64),
        FailAfter(u64),
        PanicAfter(u64),
    }

    struct Recorder {
        ticks: AtomicU64,
        faults: Mutex<Vec<(u64, String)>>,
        mode: Mode,
    }

    impl Recorder {
        fn new(mode: Mode) -> Arc<Self> {
            Arc::new(Self { ticks: AtomicU64::new(0), faults: Mutex::new(Vec::new()), mode })
        }

        fn ticks(&self) -> u64 {
            self.ticks.load(Ordering::SeqCst)
        }

        fn faults(&self) -> Vec<(u64, String)> {
            self.faults.lock().unwrap().clone()
        }
    }

    impl TickSink for Recorder {
        fn on_tick(&self, _incident: u64) -> Result<TickOutcome> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            match self.mode {
                Mode::Continue => Ok(TickOutcome::Continue),
                Mode::StopAfter(k) if n >= k => Ok(TickOutcome::Stop),
                Mode::FailAfter(k) if n >= k => Err(anyhow!("store unavailable")),
                Mode::PanicAfter(k) if n >= k => panic!("tick handler bug"),
                _ => Ok(TickOutcome::Continue),
            }
        }

        fn on_fault(&self, incident: u64, reason: String) {
            self.faults.lock().unwrap().push((incident, reason));
        }
    }

    const SEC: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_cadence() {
        let rec = Recorder::new(Mode::Continue);
        let timer = EscalationTimer::spawn(&Handle::current(), 1, SEC, rec.clone());
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(rec.ticks(), 5);
        assert!(timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let rec = Recorder::new(Mode::Continue);
        let timer = EscalationTimer::spawn(&Handle::current(), 1, SEC, rec.clone());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rec.ticks(), 3);
        assert!(!timer.is_running());
        assert!(rec.faults().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let rec = Recorder::new(Mode::Continue);
        let timer = EscalationTimer::spawn(&Handle::current(), 1, SEC, rec.clone());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(timer);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rec.ticks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_outcome_ends_task() {
        let rec = Recorder::new(Mode::StopAfter(4));
        let timer = EscalationTimer::spawn(&Handle::current(), 1, SEC, rec.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rec.ticks(), 4);
        assert!(!timer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_error_reported_as_fault() {
        let rec = Recorder::new(Mode::FailAfter(2));
        let timer = EscalationTimer::spawn(&Handle::current(), 7, SEC, rec.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rec.ticks(), 2);
        assert!(!timer.is_running());
        let faults = rec.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, 7);
        assert!(faults[0].1.contains("store unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_reported_as_fault() {
        let rec = Recorder::new(Mode::PanicAfter(3));
        let timer = EscalationTimer::spawn(&Handle::current(), 2, SEC, rec.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!timer.is_running());
        timer.join().await;
        assert_eq!(rec.faults(), vec![(2, "timer task panicked".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_keeps_one_timer_per_incident() {
        let rec = Recorder::new(Mode::Continue);
        let slot = TimerSlot::new(Handle::current());
        assert!(slot.start(1, SEC, rec.clone()));
        assert!(!slot.start(1, SEC, rec.clone()));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(rec.ticks(), 2);
        assert_eq!(slot.active_incident(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_ignores_cancel_for_other_incident() {
        let old = Recorder::new(Mode::Continue);
        let new = Recorder::new(Mode::Continue);
        let slot = TimerSlot::new(Handle::current());
        slot.start(1, SEC, old.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        // new incident replaces the stale timer
        slot.start(2, SEC, new.clone());
        assert!(!slot.cancel(1));
        tokio::time::sleep(Duration::from_millis(3200)).await;
        assert_eq!(old.ticks(), 1);
        assert_eq!(new.ticks(), 3);
        assert_eq!(slot.active_incident(), Some(2));

        assert!(slot.cancel(2));
        assert_eq!(slot.active_incident(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_shutdown_stops_any_incident() {
        let rec = Recorder::new(Mode::Continue);
        let slot = TimerSlot::new(Handle::current());
        slot.start(5, SEC, rec.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(slot.shutdown(), Some(5));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rec.ticks(), 1);
        assert_eq!(slot.shutdown(), None);
    }

    #[test]
    fn test_spawn_from_plain_thread() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let rec = Recorder::new(Mode::StopAfter(1));
        let slot = Arc::new(TimerSlot::new(rt.handle().clone()));

        let (s, r) = (slot.clone(), rec.clone());
        std::thread::spawn(move || s.start(9, Duration::from_millis(20), r))
            .join()
            .unwrap();

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(rec.ticks(), 1);
        assert_eq!(slot.active_incident(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_restarts_after_fault() {
        let failing = Recorder::new(Mode::FailAfter(1));
        let slot = TimerSlot::new(Handle::current());
        slot.start(3, SEC, failing.clone());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(slot.active_incident(), None);

        let healthy = Recorder::new(Mode::Continue);
        assert!(slot.start(3, SEC, healthy.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(healthy.ticks(), 1);
    }
}
