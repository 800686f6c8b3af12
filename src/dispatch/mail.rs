use chrono::{DateTime, Utc};

use crate::config::EngineConfig;

pub const EMERGENCY_SUBJECT: &str = "!! EMERGENCY ALERT: Fall Detected !!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSettings {
    pub sender: String,
    pub recipient: Option<String>,
    /// Folder the snapshot store writes into, used to resolve attachments.
    pub snapshot_dir: String,
}

impl MailSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            sender: cfg.email_sender.clone(),
            recipient: cfg.email_recipient.clone(),
            snapshot_dir: cfg.snapshot_dir.clone(),
        }
    }
}

/// Mail handed to the transport. The snapshot travels by reference; the
/// transport decides whether to attach the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyMail {
    pub incident: u64,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachment: Option<String>,
}

impl EmergencyMail {
    /// None when no recipient is configured.
    pub fn compose(
        settings: &MailSettings,
        incident: u64,
        snapshot: Option<&str>,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        let to = settings.recipient.clone()?;
        let body = format!(
            "A fall has been detected and the emergency state has been triggered.\n\n\
             Timestamp: {}\n\n\
             Please check on the person immediately.\n\n{}",
            at.format("%Y-%m-%d %H:%M:%S"),
            if snapshot.is_some() {
                "A snapshot from the camera is attached."
            } else {
                "No camera snapshot was available."
            }
        );
        Some(Self {
            incident,
            from: settings.sender.clone(),
            to,
            subject: EMERGENCY_SUBJECT.to_string(),
            body,
            attachment: snapshot.map(|name| format!("{}/{}", settings.snapshot_dir, name)),
        })
    }
}
