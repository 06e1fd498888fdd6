//! The dispatch boundary: scheduled events leave the engine here, either
//! to a real MIDI device through midir or to a capture sink in tests.
//! Also holds the channel-state cache that locate updates silently in
//! place of audible output.

use std::collections::HashMap;

use midir::{MidiOutput, MidiOutputConnection};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::events::EventKind;
use crate::timing::SchedTime;

/// A fully resolved output command: destination port/channel plus the
/// payload, stamped with the Real time it became due.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputCommand {
    pub due: SchedTime,
    pub port: u8,
    pub channel: u8,
    pub kind: EventKind,
}

pub trait OutputSink: Send {
    fn send(&mut self, command: OutputCommand);
}

/// Encode an output payload as raw MIDI bytes. Scheduling markers have
/// no wire form and return `None`.
pub fn encode(channel: u8, kind: &EventKind) -> Option<[u8; 3]> {
    let ch = channel & 0x0f;
    match *kind {
        EventKind::NoteOn { key, velocity } => Some([0x90 | ch, key & 0x7f, velocity & 0x7f]),
        EventKind::NoteOff { key } => Some([0x80 | ch, key & 0x7f, 0]),
        EventKind::Controller { controller, value } => {
            Some([0xb0 | ch, controller & 0x7f, value & 0x7f])
        }
        EventKind::Program { program } => Some([0xc0 | ch, program & 0x7f, 0]),
        EventKind::Aftertouch { value } => Some([0xd0 | ch, value & 0x7f, 0]),
        EventKind::PitchBend { value, .. } => {
            Some([0xe0 | ch, (value & 0x7f) as u8, ((value >> 7) & 0x7f) as u8])
        }
        _ => None,
    }
}

/// Byte length of an encoded message (program change and channel
/// pressure are two-byte messages).
fn message_len(status: u8) -> usize {
    match status & 0xf0 {
        0xc0 | 0xd0 => 2,
        _ => 3,
    }
}

/// Sink writing to one MIDI output port.
pub struct MidirSink {
    connection: MidiOutputConnection,
}

impl MidirSink {
    /// Open the port whose name contains `name`, or the first available
    /// port when `name` is `None`.
    pub fn open(name: Option<&str>) -> Result<Self, EngineError> {
        let output = MidiOutput::new("metron").map_err(|e| EngineError::Midi(e.to_string()))?;
        let ports = output.ports();
        let port = ports
            .iter()
            .find(|p| match name {
                Some(name) => output
                    .port_name(p)
                    .map(|n| n.contains(name))
                    .unwrap_or(false),
                None => true,
            })
            .ok_or_else(|| EngineError::NoOutputPort(name.map(str::to_owned)))?;

        let port_name = output.port_name(port).unwrap_or_default();
        let connection = output
            .connect(port, "metron-out")
            .map_err(|e| EngineError::Midi(e.to_string()))?;
        debug!(port = %port_name, "opened MIDI output");
        Ok(MidirSink { connection })
    }
}

impl OutputSink for MidirSink {
    fn send(&mut self, command: OutputCommand) {
        if let Some(bytes) = encode(command.channel, &command.kind) {
            let len = message_len(bytes[0]);
            if let Err(e) = self.connection.send(&bytes[..len]) {
                warn!(error = %e, "MIDI send failed");
            }
        }
    }
}

/// Test sink: records every dispatched command in order.
#[derive(Default)]
pub struct CaptureSink {
    pub commands: Vec<OutputCommand>,
}

impl CaptureSink {
    pub fn new() -> Self {
        CaptureSink::default()
    }

    pub fn note_ons(&self) -> Vec<&OutputCommand> {
        self.commands
            .iter()
            .filter(|c| matches!(c.kind, EventKind::NoteOn { .. }))
            .collect()
    }

    pub fn note_offs(&self) -> Vec<&OutputCommand> {
        self.commands
            .iter()
            .filter(|c| matches!(c.kind, EventKind::NoteOff { .. }))
            .collect()
    }
}

impl OutputSink for CaptureSink {
    fn send(&mut self, command: OutputCommand) {
        self.commands.push(command);
    }
}

/// Last known controller/program/bend state per (port, channel). While
/// locating, control events update this cache silently instead of being
/// emitted; the host can read it afterwards to chase device state.
#[derive(Debug, Default, Clone)]
pub struct ChannelCache {
    channels: HashMap<(u8, u8), ChannelImage>,
}

#[derive(Debug, Default, Clone)]
pub struct ChannelImage {
    pub controllers: HashMap<u8, u8>,
    pub program: Option<u8>,
    pub bend: Option<u16>,
    pub aftertouch: Option<u8>,
}

impl ChannelCache {
    pub fn apply(&mut self, port: u8, channel: u8, kind: &EventKind) {
        let image = self.channels.entry((port, channel)).or_default();
        match *kind {
            EventKind::Controller { controller, value } => {
                image.controllers.insert(controller, value);
            }
            EventKind::Program { program } => image.program = Some(program),
            EventKind::PitchBend { value, .. } => image.bend = Some(value),
            EventKind::Aftertouch { value } => image.aftertouch = Some(value),
            _ => {}
        }
    }

    pub fn image(&self, port: u8, channel: u8) -> Option<&ChannelImage> {
        self.channels.get(&(port, channel))
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_channel_voice_messages() {
        assert_eq!(
            encode(2, &EventKind::NoteOn { key: 60, velocity: 100 }),
            Some([0x92, 60, 100])
        );
        assert_eq!(encode(0, &EventKind::NoteOff { key: 60 }), Some([0x80, 60, 0]));
        assert_eq!(
            encode(15, &EventKind::PitchBend { value: 8192, ramp: 0 }),
            Some([0xef, 0x00, 0x40])
        );
        assert_eq!(encode(0, &EventKind::Wake), None);
    }

    #[test]
    fn cache_tracks_latest_state() {
        let mut cache = ChannelCache::default();
        cache.apply(0, 3, &EventKind::Controller { controller: 7, value: 40 });
        cache.apply(0, 3, &EventKind::Controller { controller: 7, value: 90 });
        cache.apply(0, 3, &EventKind::Program { program: 12 });

        let image = cache.image(0, 3).unwrap();
        assert_eq!(image.controllers.get(&7), Some(&90));
        assert_eq!(image.program, Some(12));
        assert!(cache.image(0, 4).is_none());
    }
}
