//! Notification dispatcher.
//!
//! Runs notification effects on their own tasks so a slow or failing
//! backend never holds up a transition. Failures are logged and dropped;
//! periodic effects get another chance on the next cadence slot.

pub mod backends;
pub mod mail;
pub mod snapshot;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::incident::{IncidentRecord, Status};
use crate::logging::{self, obj, payload_digest, v_str, Domain, ProfileScope};
use backends::{FrameSource, Mailer, SnapshotStore, SoundPlayer};
use mail::{EmergencyMail, MailSettings};

pub use backends::Frame;
pub use snapshot::{snapshot_name, DirSnapshotStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    CaptureSnapshot { incident: u64 },
    PlaySound,
    StopSound,
    SendEmergencyEmail { incident: u64, snapshot: Option<String> },
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::CaptureSnapshot { .. } => "capture_snapshot",
            Notification::PlaySound => "play_sound",
            Notification::StopSound => "stop_sound",
            Notification::SendEmergencyEmail { .. } => "send_emergency_email",
        }
    }
}

/// What the dispatcher may see of and report to the engine.
pub trait EffectHost: Send + Sync + 'static {
    /// Live snapshot of the incident record.
    fn live(&self) -> IncidentRecord;
    /// A capture produced `reference` for `incident`.
    fn snapshot_captured(&self, incident: u64, reference: String);
}

pub struct Backends {
    pub frames: Arc<dyn FrameSource>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub mailer: Arc<dyn Mailer>,
    pub sound: Arc<dyn SoundPlayer>,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Handle,
    backends: Backends,
    mail: MailSettings,
    capture_seq: AtomicU64,
    emailed: Mutex<HashSet<u64>>,
    // bumped by every stop; a play that sees it move while starting undoes itself
    sound_epoch: AtomicU64,
}

impl Dispatcher {
    pub fn new(runtime: Handle, backends: Backends, mail: MailSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                backends,
                mail,
                capture_seq: AtomicU64::new(0),
                emailed: Mutex::new(HashSet::new()),
                sound_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Run `notification` on its own task. Callable from any thread.
    pub fn dispatch(&self, notification: Notification, host: Arc<dyn EffectHost>) -> JoinHandle<()> {
        let this = self.clone();
        self.inner
            .runtime
            .spawn(async move { this.execute(notification, host).await })
    }

    pub async fn execute(&self, notification: Notification, host: Arc<dyn EffectHost>) {
        let kind = notification.kind();
        let _scope = ProfileScope::with_context("notify", &[("kind", v_str(kind))]);

        let result = match notification {
            Notification::CaptureSnapshot { incident } => self.capture(incident, host.as_ref()).await,
            Notification::PlaySound => self.play(host.as_ref()).await,
            Notification::StopSound => self.stop().await,
            Notification::SendEmergencyEmail { incident, snapshot } => {
                self.email(incident, snapshot.as_deref()).await
            }
        };

        if let Err(err) = result {
            logging::warn(
                Domain::Notify,
                "notification_failed",
                obj(&[("kind", v_str(kind)), ("error", v_str(&format!("{:#}", err)))]),
            );
        }
    }

    async fn capture(&self, incident: u64, host: &dyn EffectHost) -> Result<()> {
        let inner = &self.inner;
        let Some(frame) = inner.backends.frames.latest_frame().await.context("reading frame")? else {
            logging::debug(Domain::Notify, "capture_skipped", obj(&[("incident", json!(incident))]));
            return Ok(());
        };

        let seq = inner.capture_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = snapshot_name(incident, seq, Utc::now());
        let reference = inner
            .backends
            .snapshots
            .persist(&name, &frame)
            .await
            .with_context(|| format!("persisting {}", name))?;

        logging::info(
            Domain::Notify,
            "snapshot_saved",
            obj(&[
                ("incident", json!(incident)),
                ("reference", v_str(&reference)),
                ("bytes", json!(frame.bytes.len())),
                ("digest", v_str(&payload_digest(&frame.bytes))),
            ]),
        );
        host.snapshot_captured(incident, reference);
        Ok(())
    }

    async fn play(&self, host: &dyn EffectHost) -> Result<()> {
        let epoch = self.inner.sound_epoch.load(Ordering::SeqCst);
        let live = host.live();
        if live.sound_muted || live.status != Status::Emergency {
            logging::debug(
                Domain::Notify,
                "sound_suppressed",
                obj(&[("muted", json!(live.sound_muted)), ("status", v_str(live.status.as_str()))]),
            );
            return Ok(());
        }
        let sound = &self.inner.backends.sound;
        sound.play().await.context("starting playback")?;
        if self.inner.sound_epoch.load(Ordering::SeqCst) != epoch {
            // a stop landed while this play was in flight
            sound.stop().await.context("stopping overtaken playback")?;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.inner.sound_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.backends.sound.stop().await.context("stopping playback")
    }

    async fn email(&self, incident: u64, snapshot: Option<&str>) -> Result<()> {
        let first = self
            .inner
            .emailed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(incident);
        if !first {
            logging::warn(Domain::Notify, "email_duplicate_dropped", obj(&[("incident", json!(incident))]));
            return Ok(());
        }
        let Some(mail) = EmergencyMail::compose(&self.inner.mail, incident, snapshot, Utc::now()) else {
            logging::warn(
                Domain::Notify,
                "email_skipped",
                obj(&[("incident", json!(incident)), ("msg", v_str("no recipient configured"))]),
            );
            return Ok(());
        };
        self.inner.backends.mailer.send(&mail).await.context("sending emergency email")?;
        logging::info(
            Domain::Notify,
            "email_sent",
            obj(&[("incident", json!(incident)), ("to", v_str(&mail.to))]),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Host {
        record: Mutex<IncidentRecord>,
        captured: Mutex<Vec<(u64, String)>>,
    }

    impl Host {
        fn with_status(status: Status, muted: bool) -> Arc<Self> {
            let host = Self::default();
            {
                let mut r = host.record.lock().unwrap();
                r.status = status;
                r.sound_muted = muted;
            }
            Arc::new(host)
        }

        fn set_muted(&self, muted: bool) {
            self.record.lock().unwrap().sound_muted = muted;
        }
    }

    impl EffectHost for Host {
        fn live(&self) -> IncidentRecord {
            self.record.lock().unwrap().clone()
        }

        fn snapshot_captured(&self, incident: u64, reference: String) {
            self.captured.lock().unwrap().push((incident, reference));
        }
    }

    struct Frames(Option<Result<Frame, String>>);

    #[async_trait]
    impl FrameSource for Frames {
        async fn latest_frame(&self) -> Result<Option<Frame>> {
            match &self.0 {
                None => Ok(None),
                Some(Ok(f)) => Ok(Some(f.clone())),
                Some(Err(e)) => Err(anyhow!(e.clone())),
            }
        }
    }

    #[derive(Default)]
    struct MemStore {
        saved: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SnapshotStore for MemStore {
        async fn persist(&self, name: &str, _frame: &Frame) -> Result<String> {
            self.saved.lock().unwrap().push(name.to_string());
            Ok(format!("mem:{}", name))
        }
    }

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<EmergencyMail>>,
        fail: bool,
    }

    #[async_trait]
    impl Mailer for Outbox {
        async fn send(&self, mail: &EmergencyMail) -> Result<()> {
            if self.fail {
                return Err(anyhow!("smtp down"));
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Speaker {
        log: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl SoundPlayer for Speaker {
        async fn play(&self) -> Result<()> {
            self.log.lock().unwrap().push("play");
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.log.lock().unwrap().push("stop");
            Ok(())
        }
    }

    struct Rig {
        dispatcher: Dispatcher,
        store: Arc<MemStore>,
        outbox: Arc<Outbox>,
        speaker: Arc<Speaker>,
    }

    fn rig(frames: Frames, outbox: Outbox) -> Rig {
        let store = Arc::new(MemStore::default());
        let outbox = Arc::new(outbox);
        let speaker = Arc::new(Speaker::default());
        let dispatcher = Dispatcher::new(
            Handle::current(),
            Backends {
                frames: Arc::new(frames),
                snapshots: store.clone(),
                mailer: outbox.clone(),
                sound: speaker.clone(),
            },
            mail_settings(),
        );
        Rig { dispatcher, store, outbox, speaker }
    }

    fn mail_settings() -> MailSettings {
        MailSettings {
            sender: "watch@example.org".into(),
            recipient: Some("carer@example.org".into()),
            snapshot_dir: "snapshots".into(),
        }
    }

    /// Holds `play` open until released, like a backend that plays the whole clip.
    #[derive(Default)]
    struct BlockingSpeaker {
        log: Mutex<Vec<&'static str>>,
        clip_done: Notify,
    }

    #[async_trait]
    impl SoundPlayer for BlockingSpeaker {
        async fn play(&self) -> Result<()> {
            self.log.lock().unwrap().push("play_start");
            self.clip_done.notified().await;
            self.log.lock().unwrap().push("play_end");
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.log.lock().unwrap().push("stop");
            Ok(())
        }
    }

    fn frame() -> Frames {
        Frames(Some(Ok(Frame { bytes: vec![1, 2, 3] })))
    }

    #[tokio::test]
    async fn test_capture_reports_reference() {
        let rig = rig(frame(), Outbox::default());
        let host = Host::with_status(Status::Alert, false);
        rig.dispatcher
            .dispatch(Notification::CaptureSnapshot { incident: 4 }, host.clone())
            .await
            .unwrap();
        let captured = host.captured.lock().unwrap().clone();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, 4);
        assert!(captured[0].1.starts_with("mem:fall_snapshot_4_001_"));
        assert_eq!(rig.store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capture_failure_is_skipped() {
        let rig = rig(Frames(Some(Err("camera gone".into()))), Outbox::default());
        let host = Host::with_status(Status::Alert, false);
        rig.dispatcher.execute(Notification::CaptureSnapshot { incident: 1 }, host.clone()).await;
        assert!(host.captured.lock().unwrap().is_empty());
        assert!(rig.store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_frame_no_snapshot() {
        let rig = rig(Frames(None), Outbox::default());
        let host = Host::with_status(Status::Alert, false);
        rig.dispatcher.execute(Notification::CaptureSnapshot { incident: 1 }, host.clone()).await;
        assert!(host.captured.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_play_rechecks_mute() {
        let rig = rig(frame(), Outbox::default());
        let host = Host::with_status(Status::Emergency, false);
        rig.dispatcher.execute(Notification::PlaySound, host.clone()).await;
        host.set_muted(true);
        rig.dispatcher.execute(Notification::PlaySound, host.clone()).await;
        rig.dispatcher.execute(Notification::StopSound, host.clone()).await;
        assert_eq!(*rig.speaker.log.lock().unwrap(), vec!["play", "stop"]);
    }

    #[tokio::test]
    async fn test_play_suppressed_after_cancel() {
        let rig = rig(frame(), Outbox::default());
        let host = Host::with_status(Status::Idle, false);
        rig.dispatcher.execute(Notification::PlaySound, host).await;
        assert!(rig.speaker.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_email_sent_once_per_incident() {
        let rig = rig(frame(), Outbox::default());
        let host = Host::with_status(Status::Emergency, false);
        let email = |incident| Notification::SendEmergencyEmail { incident, snapshot: Some("s.jpg".into()) };
        rig.dispatcher.execute(email(1), host.clone()).await;
        rig.dispatcher.execute(email(1), host.clone()).await;
        rig.dispatcher.execute(email(2), host.clone()).await;
        let sent = rig.outbox.sent.lock().unwrap().clone();
        assert_eq!(sent.iter().map(|m| m.incident).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(sent[0].attachment.as_deref(), Some("snapshots/s.jpg"));
    }

    #[tokio::test]
    async fn test_stop_not_blocked_by_playing_clip() {
        let speaker = Arc::new(BlockingSpeaker::default());
        let dispatcher = Dispatcher::new(
            Handle::current(),
            Backends {
                frames: Arc::new(Frames(None)),
                snapshots: Arc::new(MemStore::default()),
                mailer: Arc::new(Outbox::default()),
                sound: speaker.clone(),
            },
            mail_settings(),
        );
        let host = Host::with_status(Status::Emergency, false);

        let playing = dispatcher.dispatch(Notification::PlaySound, host.clone());
        while speaker.log.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        host.set_muted(true);
        dispatcher.execute(Notification::StopSound, host.clone()).await;
        assert_eq!(*speaker.log.lock().unwrap(), vec!["play_start", "stop"]);

        speaker.clip_done.notify_one();
        playing.await.unwrap();
        assert_eq!(*speaker.log.lock().unwrap(), vec!["play_start", "stop", "play_end", "stop"]);
    }

    #[tokio::test]
    async fn test_late_email_for_older_incident_still_sent() {
        let rig = rig(frame(), Outbox::default());
        let host = Host::with_status(Status::Emergency, false);
        let email = |incident| Notification::SendEmergencyEmail { incident, snapshot: None };
        rig.dispatcher.execute(email(2), host.clone()).await;
        rig.dispatcher.execute(email(1), host.clone()).await;
        rig.dispatcher.execute(email(1), host.clone()).await;
        let sent: Vec<u64> = rig.outbox.sent.lock().unwrap().iter().map(|m| m.incident).collect();
        assert_eq!(sent, vec![2, 1]);
    }

    #[test]
    fn test_dispatch_from_plain_thread() {
        let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(1).build().unwrap();
        let dispatcher = Dispatcher::new(
            rt.handle().clone(),
            Backends {
                frames: Arc::new(frame()),
                snapshots: Arc::new(MemStore::default()),
                mailer: Arc::new(Outbox::default()),
                sound: Arc::new(Speaker::default()),
            },
            mail_settings(),
        );
        let host = Host::with_status(Status::Alert, false);

        let (d, h) = (dispatcher.clone(), host.clone());
        let task = std::thread::spawn(move || d.dispatch(Notification::CaptureSnapshot { incident: 3 }, h))
            .join()
            .unwrap();
        rt.block_on(task).unwrap();
        assert_eq!(host.captured.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_email_failure_not_retried() {
        let rig = rig(frame(), Outbox { fail: true, ..Default::default() });
        let host = Host::with_status(Status::Emergency, false);
        let email = Notification::SendEmergencyEmail { incident: 1, snapshot: None };
        rig.dispatcher.execute(email.clone(), host.clone()).await;
        rig.dispatcher.execute(email, host).await;
        assert!(rig.outbox.sent.lock().unwrap().is_empty());
    }
}
