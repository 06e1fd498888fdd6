use serde::{Deserialize, Serialize};

use crate::task::TaskId;
use crate::timing::SchedTime;
use crate::track::TrackId;

/// A logical output channel, resolved into a physical port/channel pair
/// through the destination table at dispatch time.
pub type VirtualChannel = u8;

/// One event: a scheduling envelope plus a command-specific payload.
///
/// The same type is used in two places with different time meanings: in a
/// [`Track`](crate::track::Track) the due time is track-relative, on an
/// [`EventStack`](crate::stack::EventStack) it is absolute in the stack's
/// clock domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub due: SchedTime,
    /// The task that queued this event; wake markers and interpolation
    /// steps are routed back to it, output events go to the sink.
    #[serde(skip)]
    pub task: Option<TaskId>,
    pub channel: VirtualChannel,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// Musical form held in tracks; expanded by a task into a paired
    /// NoteOn/NoteOff push.
    Note { key: u8, velocity: u8, duration: u32 },
    NoteOn { key: u8, velocity: u8 },
    NoteOff { key: u8 },
    Controller { controller: u8, value: u8 },
    Program { program: u8 },
    Aftertouch { value: u8 },
    /// `ramp` is the interpolation span in track domain units; zero
    /// bends immediately. Values are 14-bit, centered at 8192.
    PitchBend { value: u16, ramp: u32 },
    /// Recurring interpolation step toward a pitch-bend target.
    BendStep { from: u16, to: u16, elapsed: u32, duration: u32 },
    /// Re-execute the region `[start, start + duration)` `count` times
    /// in total; zero means forever.
    Repeat { duration: u32, count: u32 },
    /// Spawn a child task over the referenced track.
    Sequence { track: TrackId, duration: Option<u32>, interruptible: bool },
    /// Wake marker for the owning task.
    Wake,
}

impl Event {
    pub fn new(due: impl Into<SchedTime>, channel: VirtualChannel, kind: EventKind) -> Self {
        Event {
            due: due.into(),
            task: None,
            channel,
            kind,
        }
    }

    pub fn wake(due: SchedTime, task: TaskId) -> Self {
        Event {
            due,
            task: Some(task),
            channel: 0,
            kind: EventKind::Wake,
        }
    }

    pub fn owned_by(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn is_note_off(&self) -> bool {
        matches!(self.kind, EventKind::NoteOff { .. })
    }

    /// True for payloads that leave the engine through the output sink
    /// (as opposed to scheduling markers consumed internally).
    pub fn is_output(&self) -> bool {
        matches!(
            self.kind,
            EventKind::NoteOn { .. }
                | EventKind::NoteOff { .. }
                | EventKind::Controller { .. }
                | EventKind::Program { .. }
                | EventKind::Aftertouch { .. }
                | EventKind::PitchBend { .. }
        )
    }
}
