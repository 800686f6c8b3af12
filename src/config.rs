use std::time::Duration;

use anyhow::{bail, Result};

/// Escalation timing and notification settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Total alert budget before forced escalation.
    pub alert_timeout: Duration,
    /// Terminal part of the budget in which a latched fall pose escalates early.
    pub early_window: Duration,
    /// Escalation timer cadence.
    pub tick: Duration,
    pub capture_every: Duration,
    pub sound_every: Duration,
    pub history_capacity: usize,
    pub snapshot_dir: String,
    pub email_sender: String,
    pub email_recipient: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alert_timeout: Duration::from_secs(30),
            early_window: Duration::from_secs(10),
            tick: Duration::from_secs(1),
            capture_every: Duration::from_secs(5),
            sound_every: Duration::from_secs(5),
            history_capacity: 100,
            snapshot_dir: "snapshots".to_string(),
            email_sender: "fallwatch@localhost".to_string(),
            email_recipient: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            alert_timeout: std::env::var("ALERT_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(d.alert_timeout),
            early_window: std::env::var("EARLY_WINDOW_SECS").ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(d.early_window),
            tick: std::env::var("TICK_MILLIS").ok().and_then(|v| v.parse().ok()).map(Duration::from_millis).unwrap_or(d.tick),
            capture_every: std::env::var("CAPTURE_EVERY_SECS").ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(d.capture_every),
            sound_every: std::env::var("SOUND_EVERY_SECS").ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(d.sound_every),
            history_capacity: std::env::var("HISTORY_CAPACITY").ok().and_then(|v| v.parse().ok()).unwrap_or(d.history_capacity),
            snapshot_dir: std::env::var("SNAPSHOT_DIR").unwrap_or(d.snapshot_dir),
            email_sender: std::env::var("EMAIL_SENDER").unwrap_or(d.email_sender),
            email_recipient: std::env::var("EMAIL_RECIPIENT").ok(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.alert_timeout.is_zero() {
            bail!("alert timeout must be positive");
        }
        if self.early_window > self.alert_timeout {
            bail!(
                "early window {:?} exceeds alert timeout {:?}",
                self.early_window,
                self.alert_timeout
            );
        }
        if self.tick.is_zero() || self.capture_every.is_zero() || self.sound_every.is_zero() {
            bail!("timer cadences must be positive");
        }
        if self.history_capacity == 0 {
            bail!("sensor history capacity must be at least 1");
        }
        Ok(())
    }
}
