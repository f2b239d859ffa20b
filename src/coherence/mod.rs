//! Coherence engine for a shared, non-inclusive cache slice: an inclusive directory, a smaller data
//! array, a miss tracker and the per-command state machine that ties them together.

pub mod array;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod flush;
mod handlers;
pub mod line;
pub mod mshr;
pub mod responses;
pub mod state;
pub mod stats;


pub use config::{CoherenceConfig, Protocol};
pub use controller::{Controller, Outbound, Outcome, Route};
pub use error::ProtocolViolation;
pub use event::{Addr, Command, CommandClass, EventId, MemEvent, PeerId};
pub use flush::FlushState;
pub use state::State;
pub use stats::{CoherenceStats, NullTelemetry, SharedStats, TelemetrySink};
