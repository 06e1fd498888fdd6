//! The narrow view of the document layer the engine consumes: ordered
//! track event sequences behind reader/writer locks, and the destination
//! table resolving virtual channels to physical ports. Tracks are owned
//! by the document; the engine only reads them through cursors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::timing::ClockDomain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An ordered event sequence in one clock domain. `events` are sorted by
/// track-relative due time; `length` is the logical span, which may
/// extend past the last event.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    pub domain: ClockDomain,
    pub length: u32,
    pub events: Vec<Event>,
}

impl Track {
    pub fn new(id: TrackId, domain: ClockDomain, length: u32) -> Self {
        Track {
            id,
            name: String::new(),
            domain,
            length,
            events: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_events(mut self, mut events: Vec<Event>) -> Self {
        events.sort_by_key(|e| e.due.0);
        self.events = events;
        self
    }
}

/// Index cursor over a track's event sequence: seek to an index, peek at
/// an offset, advance. The cursor holds no reference so a task can keep
/// it across lock acquisitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackCursor {
    index: usize,
}

impl TrackCursor {
    pub fn seek(&mut self, index: usize) {
        self.index = index;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Event at a signed offset from the cursor, without moving it.
    pub fn peek<'a>(&self, track: &'a Track, offset: isize) -> Option<&'a Event> {
        let idx = self.index.checked_add_signed(offset)?;
        track.events.get(idx)
    }

    pub fn current<'a>(&self, track: &'a Track) -> Option<&'a Event> {
        track.events.get(self.index)
    }

    pub fn advance(&mut self) {
        self.index += 1;
    }

    pub fn at_end(&self, track: &Track) -> bool {
        self.index >= track.events.len()
    }
}

pub type SharedTrack = Arc<RwLock<Track>>;

/// The document-owned track collection, as seen by the engine.
#[derive(Default)]
pub struct TrackStore {
    tracks: RwLock<HashMap<TrackId, SharedTrack>>,
}

impl TrackStore {
    pub fn new() -> Self {
        TrackStore::default()
    }

    pub fn insert(&self, track: Track) -> SharedTrack {
        let id = track.id;
        let shared = Arc::new(RwLock::new(track));
        self.tracks.write().insert(id, shared.clone());
        shared
    }

    pub fn get(&self, id: TrackId) -> Option<SharedTrack> {
        self.tracks.read().get(&id).cloned()
    }
}

/// Where a virtual channel's output goes, and how it is shaped on the
/// way out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Destination {
    pub port: u8,
    pub channel: u8,
    pub muted: bool,
    pub solo: bool,
    /// Semitone shift applied to note events; results outside 0..=127
    /// suppress the note entirely.
    pub transpose: i8,
}

impl Default for Destination {
    fn default() -> Self {
        Destination {
            port: 0,
            channel: 0,
            muted: false,
            solo: false,
            transpose: 0,
        }
    }
}

/// Virtual-channel resolution table. Snapshots hot-swap through
/// `ArcSwap` so mute/solo/transpose edits from the host never block the
/// scheduling thread.
pub struct DestinationTable {
    table: ArcSwap<Vec<Destination>>,
}

impl Default for DestinationTable {
    fn default() -> Self {
        // Identity mapping: virtual channel n goes to channel n on port 0.
        let table = (0..16)
            .map(|ch| Destination { channel: ch, ..Destination::default() })
            .collect();
        DestinationTable {
            table: ArcSwap::from_pointee(table),
        }
    }
}

impl DestinationTable {
    pub fn new(destinations: Vec<Destination>) -> Self {
        DestinationTable {
            table: ArcSwap::from_pointee(destinations),
        }
    }

    pub fn store(&self, destinations: Vec<Destination>) {
        self.table.store(Arc::new(destinations));
    }

    pub fn snapshot(&self) -> Arc<Vec<Destination>> {
        self.table.load_full()
    }

    pub fn resolve(&self, channel: u8) -> Destination {
        self.table
            .load()
            .get(channel as usize)
            .copied()
            .unwrap_or_default()
    }

    /// True if any destination is soloed, which silences the rest.
    pub fn any_solo(&self) -> bool {
        self.table.load().iter().any(|d| d.solo)
    }

    /// Whether notes on `channel` are audible given mute/solo state.
    pub fn audible(&self, channel: u8) -> bool {
        let dest = self.resolve(channel);
        !dest.muted && (dest.solo || !self.any_solo())
    }
}
