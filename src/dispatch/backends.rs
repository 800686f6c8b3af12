//! Collaborator interfaces consumed by the dispatcher, plus the logging
//! stand-ins used when no real device is wired in.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::mail::EmergencyMail;
use crate::logging::{self, obj, v_str, Domain};

/// An encoded still image handed over by the video pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Most recent frame, `None` when the pipeline has nothing yet.
    async fn latest_frame(&self) -> Result<Option<Frame>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist `frame` under `name` and return the reference observers use.
    async fn persist(&self, name: &str, frame: &Frame) -> Result<String>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &EmergencyMail) -> Result<()>;
}

#[async_trait]
pub trait SoundPlayer: Send + Sync {
    async fn play(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub struct NoFrames;

#[async_trait]
impl FrameSource for NoFrames {
    async fn latest_frame(&self) -> Result<Option<Frame>> {
        Ok(None)
    }
}

/// Writes the mail to the log instead of a mail transport.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &EmergencyMail) -> Result<()> {
        logging::info(
            Domain::Notify,
            "mail_logged",
            obj(&[
                ("to", v_str(&mail.to)),
                ("subject", v_str(&mail.subject)),
                ("attachment", mail.attachment.as_deref().map(v_str).unwrap_or(json!(null))),
            ]),
        );
        Ok(())
    }
}

/// Tracks playback state and logs instead of driving an audio device.
#[derive(Debug, Default)]
pub struct LogSoundPlayer {
    playing: AtomicBool,
}

#[async_trait]
impl SoundPlayer for LogSoundPlayer {
    async fn play(&self) -> Result<()> {
        self.playing.store(true, Ordering::SeqCst);
        logging::info(Domain::Notify, "sound_logged", obj(&[("action", v_str("play"))]));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.playing.swap(false, Ordering::SeqCst) {
            logging::info(Domain::Notify, "sound_logged", obj(&[("action", v_str("stop"))]));
        }
        Ok(())
    }
}
