//! Incident state, transitions and the store that serializes them.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Producers   │────►│    Store     │────►│   Reducer    │
//! │ (ingest/UI/  │     │ (one writer) │     │  (pure fn)   │
//! │   timer)     │     └──────────────┘     └──────────────┘
//! └──────────────┘                                 │
//!                                                  ▼
//!                                           ┌──────────────┐
//!                                           │   Effects    │
//!                                           │ (timer/notify│
//!                                           │  /broadcast) │
//!                                           └──────────────┘
//! ```

pub mod events;
pub mod latch;
pub mod reducer;
pub mod state;
pub mod store;

pub use events::{Detection, Effect, EscalationCause, Event, UserCommand};
pub use reducer::{reduce, ReducerOutput};
pub use state::{IncidentRecord, SensorEntry, Status};
pub use store::IncidentStore;
