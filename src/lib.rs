//! metron is a MIDI sequencing engine built around two clock domains.
//! Tracks hold timed events in either real time (milliseconds) or
//! metered time (ticks, 480 per quarter note); a tempo map converts
//! between the two, including across exponential tempo ramps. Playback
//! groups drive independent transports over a shared track store, and a
//! single engine thread schedules everything against a millisecond
//! clock.
//!
//! Entry points: [`song::Song`] to load a document, [`engine::spawn_engine`]
//! to bring up the scheduler, [`engine::EngineHandle`] to drive it.

pub mod engine;
pub mod error;
pub mod events;
pub mod group;
pub mod output;
pub mod song;
pub mod stack;
pub mod task;
pub mod timing;
pub mod track;

pub use engine::{AUDITION_GROUP, EngineCommand, EngineHandle, EngineUpdate, spawn_engine};
pub use error::EngineError;
pub use events::{Event, EventKind, VirtualChannel};
pub use group::{Group, GroupId, GroupState, StartOptions, SyncMode};
pub use output::{CaptureSink, MidirSink, OutputCommand, OutputSink};
pub use song::Song;
pub use stack::EventStack;
pub use timing::{ClockDomain, SchedTime, TICKS_PER_QUARTER, TempoChange, TempoMap};
pub use track::{Destination, DestinationTable, Track, TrackId, TrackStore};
