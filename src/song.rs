//! Song documents. A song is the serialized form of everything the
//! engine needs: tracks with their events, the tempo map, and the
//! virtual-channel destination table.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::EngineError;
use crate::events::Event;
use crate::timing::{ClockDomain, TempoChange, TempoMap};
use crate::track::{Destination, DestinationTable, Track, TrackId, TrackStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackData {
    pub id: u32,
    pub name: String,
    pub domain: ClockDomain,
    /// Track length in the track's own domain. Sequence playback of the
    /// track loops over this span when no explicit duration is given.
    pub length: u32,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub name: String,
    pub bpm: f64,
    #[serde(default)]
    pub tempo_changes: Vec<TempoChange>,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Tracks playback starts on; empty means all of them. Tracks only
    /// reached through Sequence events belong here, not in this list.
    #[serde(default)]
    pub main_tracks: Vec<u32>,
    pub tracks: Vec<TrackData>,
}

impl Song {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let text = fs::read_to_string(path)?;
        let song: Song = ron::from_str(&text)?;
        info!(name = %song.name, tracks = song.tracks.len(), "loaded song");
        Ok(song)
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Build the runtime structures the engine plays from.
    pub fn compile(&self) -> (Arc<TrackStore>, Arc<DestinationTable>, TempoMap) {
        let store = Arc::new(TrackStore::new());
        for data in &self.tracks {
            let track = Track::new(TrackId(data.id), data.domain, data.length)
                .with_name(data.name.clone())
                .with_events(data.events.clone());
            store.insert(track);
        }
        let dests = if self.destinations.is_empty() {
            Arc::new(DestinationTable::default())
        } else {
            Arc::new(DestinationTable::new(self.destinations.clone()))
        };
        let tempo = TempoMap::from_changes(self.bpm, &self.tempo_changes);
        (store, dests, tempo)
    }

    /// Root tracks for playback: the explicit list when given, otherwise
    /// every track.
    pub fn root_tracks(&self) -> Vec<TrackId> {
        if self.main_tracks.is_empty() {
            self.tracks.iter().map(|t| TrackId(t.id)).collect()
        } else {
            self.main_tracks.iter().map(|id| TrackId(*id)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::timing::TICKS_PER_QUARTER;

    fn demo_song() -> Song {
        Song {
            name: "demo".into(),
            bpm: 120.0,
            tempo_changes: vec![],
            destinations: vec![],
            main_tracks: vec![],
            tracks: vec![TrackData {
                id: 1,
                name: "lead".into(),
                domain: ClockDomain::Metered,
                length: 4 * TICKS_PER_QUARTER,
                events: vec![Event::new(
                    0u32,
                    0,
                    EventKind::Note { key: 60, velocity: 100, duration: TICKS_PER_QUARTER },
                )],
            }],
        }
    }

    #[test]
    fn round_trips_through_ron() {
        let song = demo_song();
        let text = ron::ser::to_string_pretty(&song, ron::ser::PrettyConfig::default()).unwrap();
        let back: Song = ron::from_str(&text).unwrap();
        assert_eq!(back.tracks.len(), 1);
        assert_eq!(back.tracks[0].events, song.tracks[0].events);
    }

    #[test]
    fn compile_populates_store() {
        let (store, _dests, tempo) = demo_song().compile();
        let track = store.get(TrackId(1)).unwrap();
        assert_eq!(track.read().name, "lead");
        assert_eq!(track.read().events.len(), 1);
        assert!((tempo.bpm_at_real(0.0) - 120.0).abs() < 1e-9);
    }
}
