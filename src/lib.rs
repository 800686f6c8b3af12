//! Incident escalation engine for a fall-detection system.
//!
//! Producers (sensor ingest, perception, dashboard commands) feed events
//! into the [`engine::Engine`]. The engine keeps one incident record,
//! drives the Idle -> Alert -> Emergency escalation with a cancellable
//! countdown, fires notifications and broadcasts every change to
//! subscribers.

pub mod broadcast;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod incident;
pub mod ingest;
pub mod logging;
pub mod timer;

pub use config::EngineConfig;
pub use engine::Engine;
