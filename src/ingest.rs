//! Decoding of raw collaborator messages into engine events.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::incident::{Detection, Event, UserCommand};

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Sensor topic: JSON object, optionally carrying a `status` signal.
    Sensor,
    /// Perception pipeline.
    Detection,
    /// Dashboard user commands.
    Command,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sensor => "sensor",
            Channel::Detection => "detection",
            Channel::Command => "command",
        }
    }
}

/// `{"channel": "...", "data": ...}` line as read by the binary.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub channel: Channel,
    pub data: Value,
}

pub fn decode(channel: Channel, payload: &[u8]) -> Result<Vec<Event>> {
    let value: Value = serde_json::from_slice(payload)
        .with_context(|| format!("{} payload is not valid JSON", channel.as_str()))?;
    decode_value(channel, value)
}

pub fn decode_envelope(line: &str) -> Result<Vec<Event>> {
    let envelope: Envelope = serde_json::from_str(line).context("malformed envelope")?;
    decode_value(envelope.channel, envelope.data)
}

pub fn decode_value(channel: Channel, value: Value) -> Result<Vec<Event>> {
    match channel {
        Channel::Sensor => sensor_events(value),
        Channel::Detection => detection_event(value).map(|e| vec![e]),
        Channel::Command => command_event(value).map(|e| vec![e]),
    }
}

/// The reading itself always comes first; a recognised `status` adds the
/// matching signal after it.
fn sensor_events(value: Value) -> Result<Vec<Event>> {
    if !value.is_object() {
        bail!("sensor payload must be a JSON object");
    }
    let signal = match value.get("status").and_then(Value::as_str) {
        Some("alert") => Some(Event::AlertSignal),
        Some("emergency") => Some(Event::EmergencySignal),
        Some("cancelled") => Some(Event::CancelSignal),
        _ => None,
    };
    let mut events = vec![Event::SensorReading(value)];
    events.extend(signal);
    Ok(events)
}

fn detection_event(value: Value) -> Result<Event> {
    let detection: Detection = serde_json::from_value(value).context("malformed detection update")?;
    Ok(Event::DetectionUpdate(detection))
}

fn command_event(value: Value) -> Result<Event> {
    let name = match &value {
        Value::String(s) => s.as_str(),
        Value::Object(map) => map
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("command object without a \"command\" string"))?,
        _ => bail!("command must be a string or an object"),
    };
    let cmd: UserCommand = serde_json::from_value(Value::String(name.to_ascii_lowercase()))
        .with_context(|| format!("unknown command {:?}", name))?;
    Ok(cmd.into())
}
