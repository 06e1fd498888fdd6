//! Playback cursor over one track. A task walks its track's event
//! sequence, expands each musical event into low-level commands on its
//! group's event stack, handles repeat frames and nested sequence
//! spawns, and re-queues itself at the next point it needs attention.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, trace, warn};

use crate::events::{Event, EventKind};
use crate::output::ChannelCache;
use crate::stack::EventStack;
use crate::timing::{
    ClockDomain, LOCK_RETRY, LOCK_TIMEOUT, PLAY_AHEAD, REPEAT_EPSILON, SchedTime, TempoMap,
    WAKE_MARGIN,
};
use crate::track::{DestinationTable, SharedTrack, TrackCursor, TrackId, TrackStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Active,
    /// Terminal. The task is deleted only when its final wake-up is
    /// dispatched, so commands it already queued drain first.
    Finished,
}

/// Saved rewind position plus countdown for re-executing a bounded track
/// region. Frames are stacked most-recent-first; suppression of
/// overlapping repeats keeps the stack properly nested.
#[derive(Debug, Clone, Copy)]
struct RepeatFrame {
    /// Cursor index to rewind to (just past the Repeat marker).
    cursor: usize,
    /// Absolute end of the current pass.
    end: SchedTime,
    /// Region length in track domain units.
    span: u32,
    /// Passes left including the one in progress; zero means forever.
    remaining: u32,
}

/// Everything a task borrows from its group while playing.
pub struct PlayContext<'a> {
    pub seek: SchedTime,
    pub locating: bool,
    pub stack: &'a mut EventStack,
    pub tempo: &'a TempoMap,
    pub dests: &'a DestinationTable,
    pub cache: &'a mut ChannelCache,
    pub store: &'a TrackStore,
    /// The group's other tasks, for the ancestor cycle walk. The playing
    /// task itself is temporarily removed from this map.
    pub tasks: &'a HashMap<TaskId, Task>,
    /// Children created during this play call; the group registers them
    /// once the call returns.
    pub spawned: &'a mut Vec<Task>,
    pub next_task_id: &'a mut u64,
}

impl PlayContext<'_> {
    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId(*self.next_task_id);
        *self.next_task_id += 1;
        id
    }
}

pub struct Task {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub track_id: TrackId,
    pub domain: ClockDomain,
    pub state: TaskState,
    /// Whether this task may be cut short when its parent goes away.
    pub interruptible: bool,
    track: SharedTrack,
    cursor: TrackCursor,
    /// Absolute time of track-relative zero for the current pass;
    /// advanced by each repeat or implicit-loop jump.
    origin: SchedTime,
    /// Absolute bound from an explicit duration; playback past it
    /// finishes the task.
    end: Option<SchedTime>,
    frames: Vec<RepeatFrame>,
    /// While set, consumed events up to this time are a post-rewind
    /// catch-up: played once, Repeat markers excluded.
    catchup_until: Option<SchedTime>,
    /// Latest due time this task has pushed; the final wake-up lands
    /// here so queued commands drain before deletion.
    horizon: SchedTime,
    root: bool,
}

impl Task {
    pub fn spawn_root(
        id: TaskId,
        track_id: TrackId,
        track: SharedTrack,
        domain: ClockDomain,
        origin: SchedTime,
        end: Option<SchedTime>,
    ) -> Self {
        Task {
            id,
            parent: None,
            track_id,
            domain,
            state: TaskState::Active,
            interruptible: true,
            track,
            cursor: TrackCursor::default(),
            origin,
            end,
            frames: Vec::new(),
            catchup_until: None,
            horizon: origin,
            root: true,
        }
    }

    pub fn origin(&self) -> SchedTime {
        self.origin
    }

    /// Track-relative position for UI cursor rendering.
    pub fn position(&self, seek: SchedTime) -> u32 {
        seek.delta(self.origin).max(0) as u32
    }

    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    fn bump_horizon(&mut self, due: SchedTime) {
        if due.is_after(self.horizon) {
            self.horizon = due;
        }
    }

    fn next_repeat_end(&self) -> Option<SchedTime> {
        // Frames are nested, so the innermost (most recent) ends first.
        self.frames.last().map(|f| f.end)
    }

    /// Advance the cursor through everything due at the current seek
    /// time, then re-queue a wake-up for the next point of interest.
    pub fn play(&mut self, ctx: &mut PlayContext<'_>) {
        if self.is_finished() {
            return;
        }

        // Steady state must not stall the control loop on a contended
        // track; locate must make deterministic progress. The handle is
        // cloned so the guard does not pin `self`.
        let shared = self.track.clone();
        let guard = if ctx.locating {
            Some(shared.read())
        } else {
            shared.try_read_for(LOCK_TIMEOUT)
        };
        let Some(track) = guard else {
            trace!(task = %self.id, track = %self.track_id, "track busy, rescheduling");
            self.queue_wake(ctx.stack, ctx.seek.offset(LOCK_RETRY));
            return;
        };

        let horizon_limit = if ctx.locating {
            ctx.seek
        } else {
            ctx.seek.offset(PLAY_AHEAD)
        };

        loop {
            if let Some(frame_end) = self.next_repeat_end() {
                if frame_end.is_due(ctx.seek.offset(REPEAT_EPSILON)) {
                    self.arrive_at_repeat(ctx.seek);
                    continue;
                }
            }

            if self.cursor.at_end(&track) {
                if let Some(frame_end) = self.next_repeat_end() {
                    // The repeated region runs to track end; wait there.
                    self.queue_wake(ctx.stack, frame_end);
                    return;
                }
                if !self.root && track.length > 0 {
                    // Child tasks loop the whole track implicitly until
                    // their duration runs out. An empty track has no pass
                    // to replay, so it runs off the end instead.
                    let next_origin = self.origin.offset(track.length);
                    let exhausted = self
                        .end
                        .map(|end| !end.is_after(next_origin))
                        .unwrap_or(false);
                    if !exhausted {
                        self.origin = next_origin;
                        self.cursor.seek(0);
                        continue;
                    }
                }
                break;
            }

            let event = self.cursor.current(&track).expect("cursor in bounds").clone();
            let due = self.origin.offset(event.due.0);

            if let Some(end) = self.end {
                if due.is_after(end) {
                    break;
                }
            }

            if let Some(limit) = self.catchup_until {
                if due.is_due(limit) {
                    self.cursor.advance();
                    self.replay_event(&event, due, ctx);
                    continue;
                }
                self.catchup_until = None;
            }

            if due.is_due(horizon_limit) {
                if let Some(frame_end) = self.next_repeat_end() {
                    // Events at or past the frame boundary belong to the
                    // pass after the rewind; hold them until the frame
                    // resolves so the cursor does not cross the seam.
                    if !frame_end.is_after(due) {
                        self.queue_wake(ctx.stack, frame_end);
                        return;
                    }
                }
                self.cursor.advance();
                self.play_event(&event, due, ctx);
            } else {
                // Wake at the next repeat boundary or just ahead of the
                // next unconsumed event, whichever comes first. A locate
                // consumes exactly at event times, so no margin there.
                let mut wake = if ctx.locating { due } else { due.back(WAKE_MARGIN) };
                if let Some(frame_end) = self.next_repeat_end() {
                    if wake.is_after(frame_end) {
                        wake = frame_end;
                    }
                }
                self.queue_wake(ctx.stack, wake);
                return;
            }
        }

        self.finish(ctx.stack, ctx.seek);
    }

    fn finish(&mut self, stack: &mut EventStack, seek: SchedTime) {
        self.state = TaskState::Finished;
        let last = if self.horizon.is_after(seek) {
            self.horizon
        } else {
            seek
        };
        debug!(task = %self.id, track = %self.track_id, "finished, final wake at {}", last.0);
        self.queue_wake(stack, last);
    }

    fn queue_wake(&mut self, stack: &mut EventStack, due: SchedTime) {
        self.bump_horizon(due);
        if stack.push(Event::wake(due, self.id)).is_err() {
            // The stack will drain; retrying on the next group update is
            // the degraded path.
            warn!(task = %self.id, "wake push failed, stack full");
        }
    }

    /// Expand one track event. `due` is the event's absolute time in
    /// this task's clock domain.
    fn play_event(&mut self, event: &Event, due: SchedTime, ctx: &mut PlayContext<'_>) {
        match event.kind {
            EventKind::Note { key, velocity, duration } => {
                self.play_note(event.channel, key, velocity, duration, due, ctx)
            }
            EventKind::Controller { .. }
            | EventKind::Program { .. }
            | EventKind::Aftertouch { .. } => self.play_control(event, due, ctx),
            EventKind::PitchBend { value, ramp } => {
                self.play_bend(event.channel, value, ramp, due, ctx)
            }
            EventKind::Repeat { duration, count } => self.begin_repeat(due, duration, count),
            EventKind::Sequence { track, duration, interruptible } => {
                self.spawn_sequence(track, duration, interruptible, due, ctx)
            }
            // Low-level payloads do not appear in tracks.
            _ => {}
        }
    }

    /// Post-rewind catch-up: events skipped by a repeat jump are played
    /// once, but Repeat markers must not push fresh frames.
    fn replay_event(&mut self, event: &Event, due: SchedTime, ctx: &mut PlayContext<'_>) {
        if !matches!(event.kind, EventKind::Repeat { .. }) {
            self.play_event(event, due, ctx);
        }
    }

    fn play_note(
        &mut self,
        channel: u8,
        key: u8,
        velocity: u8,
        duration: u32,
        due: SchedTime,
        ctx: &mut PlayContext<'_>,
    ) {
        // No audible output while locating; mute/solo silences too.
        if ctx.locating || !ctx.dests.audible(channel) {
            return;
        }
        let dest = ctx.dests.resolve(channel);
        let key = key as i16 + dest.transpose as i16;
        if !(0..=127).contains(&key) {
            return;
        }
        let key = key as u8;

        let off_due = due.offset(duration);
        let pair = [
            Event::new(due, channel, EventKind::NoteOn { key, velocity }).owned_by(self.id),
            Event::new(off_due, channel, EventKind::NoteOff { key }).owned_by(self.id),
        ];
        // Paired push is atomic: on a full stack the note is dropped
        // whole rather than left hanging without its note-off.
        match ctx.stack.push_list(pair, 2, 0) {
            Ok(()) => self.bump_horizon(off_due),
            Err(_) => debug!(task = %self.id, key, "stack full, note pair dropped"),
        }
    }

    fn play_control(&mut self, event: &Event, due: SchedTime, ctx: &mut PlayContext<'_>) {
        if ctx.locating {
            // Silent state capture; the host chases the device later.
            let dest = ctx.dests.resolve(event.channel);
            ctx.cache.apply(dest.port, dest.channel, &event.kind);
            return;
        }
        let queued = Event::new(due, event.channel, event.kind.clone()).owned_by(self.id);
        if ctx.stack.push(queued).is_ok() {
            self.bump_horizon(due);
        }
    }

    fn play_bend(
        &mut self,
        channel: u8,
        value: u16,
        ramp: u32,
        due: SchedTime,
        ctx: &mut PlayContext<'_>,
    ) {
        let dest = ctx.dests.resolve(channel);
        if ctx.locating {
            ctx.cache
                .apply(dest.port, dest.channel, &EventKind::PitchBend { value, ramp: 0 });
            return;
        }
        if ramp == 0 {
            let queued =
                Event::new(due, channel, EventKind::PitchBend { value, ramp: 0 }).owned_by(self.id);
            if ctx.stack.push(queued).is_ok() {
                self.bump_horizon(due);
            }
            return;
        }
        // A ramped bend becomes a recurring interpolation step; the
        // dispatcher emits intermediate values and re-queues the step
        // until the ramp time has elapsed.
        let from = ctx
            .cache
            .image(dest.port, dest.channel)
            .and_then(|image| image.bend)
            .unwrap_or(8192);
        let step = Event::new(
            due,
            channel,
            EventKind::BendStep { from, to: value, elapsed: 0, duration: ramp },
        )
        .owned_by(self.id);
        if ctx.stack.push(step).is_ok() {
            self.bump_horizon(due.offset(ramp));
        }
    }

    /// Push a repeat frame recording the rewind position, unless a
    /// stricter frame is already pending (overlaps are ignored).
    fn begin_repeat(&mut self, start: SchedTime, duration: u32, count: u32) {
        if duration == 0 {
            // A spanless region has nothing to rewind over; a frame for
            // it would pin the end and never advance.
            trace!(task = %self.id, "zero-span repeat ignored");
            return;
        }
        let end = start.offset(duration);
        if self.frames.iter().any(|f| !f.end.is_after(end)) {
            trace!(task = %self.id, "overlapping repeat ignored");
            return;
        }
        self.frames.push(RepeatFrame {
            cursor: self.cursor.index(),
            end,
            span: duration,
            remaining: count,
        });
    }

    /// The seek time has reached the innermost frame's end: rewind the
    /// cursor, shift the origin by the repeated span, and mark the
    /// already-elapsed slice of the new pass for catch-up replay.
    fn arrive_at_repeat(&mut self, seek: SchedTime) {
        let Some(frame) = self.frames.last_mut() else { return };
        if frame.remaining != 0 {
            frame.remaining -= 1;
            if frame.remaining == 0 {
                self.frames.pop();
                return;
            }
        }
        let span = frame.span;
        frame.end = frame.end.offset(span);
        let cursor = frame.cursor;
        self.cursor.seek(cursor);
        self.origin = self.origin.offset(span);
        self.catchup_until = Some(seek);
    }

    fn spawn_sequence(
        &mut self,
        target: TrackId,
        duration: Option<u32>,
        interruptible: bool,
        due: SchedTime,
        ctx: &mut PlayContext<'_>,
    ) {
        if self.references_ancestor(target, ctx.tasks) {
            // Refused, not surfaced: a cyclic spawn would recurse
            // forever. Visible to operators through the log only.
            warn!(task = %self.id, track = %target, "cyclic sequence reference refused");
            return;
        }
        let Some(track) = ctx.store.get(target) else {
            warn!(task = %self.id, track = %target, "sequence references unknown track");
            return;
        };
        let child_domain = track.read().domain;

        // The child runs in its track's domain; start and duration cross
        // over through the tempo map when the domains differ.
        let origin = if child_domain == self.domain {
            due
        } else {
            SchedTime(ctx.tempo.convert(due.0 as f64, self.domain).round() as u32)
        };
        let end = duration.map(|d| {
            if child_domain == self.domain {
                origin.offset(d)
            } else {
                let parent_end = due.offset(d);
                SchedTime(ctx.tempo.convert(parent_end.0 as f64, self.domain).round() as u32)
            }
        });

        let id = ctx.allocate_id();
        let child = Task {
            id,
            parent: Some(self.id),
            track_id: target,
            domain: child_domain,
            state: TaskState::Active,
            interruptible,
            track,
            cursor: TrackCursor::default(),
            origin,
            end,
            frames: Vec::new(),
            catchup_until: None,
            horizon: origin,
            root: false,
        };
        debug!(task = %self.id, child = %id, track = %target, "spawned sequence task");
        ctx.spawned.push(child);
    }

    /// True if `target` is this task's own track or the track of any
    /// ancestor, at any depth.
    fn references_ancestor(&self, target: TrackId, tasks: &HashMap<TaskId, Task>) -> bool {
        if self.track_id == target {
            return true;
        }
        let mut parent = self.parent;
        while let Some(id) = parent {
            let Some(task) = tasks.get(&id) else { break };
            if task.track_id == target {
                return true;
            }
            parent = task.parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::Track;

    fn note(due: u32, key: u8, duration: u32) -> Event {
        Event::new(due, 0, EventKind::Note { key, velocity: 100, duration })
    }

    struct Harness {
        store: TrackStore,
        dests: DestinationTable,
        cache: ChannelCache,
        tempo: TempoMap,
        stack: EventStack,
        tasks: HashMap<TaskId, Task>,
        spawned: Vec<Task>,
        next_task_id: u64,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                store: TrackStore::new(),
                dests: DestinationTable::default(),
                cache: ChannelCache::default(),
                tempo: TempoMap::default(),
                stack: EventStack::new(256),
                tasks: HashMap::new(),
                spawned: Vec::new(),
                next_task_id: 100,
            }
        }

        fn root_task(&self, track: Track) -> Task {
            let id = track.id;
            let shared = self.store.insert(track);
            Task::spawn_root(TaskId(1), id, shared, ClockDomain::Metered, SchedTime(0), None)
        }

        fn play(&mut self, task: &mut Task, seek: u32) {
            let mut ctx = PlayContext {
                seek: SchedTime(seek),
                locating: false,
                stack: &mut self.stack,
                tempo: &self.tempo,
                dests: &self.dests,
                cache: &mut self.cache,
                store: &self.store,
                tasks: &self.tasks,
                spawned: &mut self.spawned,
                next_task_id: &mut self.next_task_id,
            };
            task.play(&mut ctx);
        }

        /// Drive the task the way the group dispatcher would: pop due
        /// events, route wakes back to the task, collect output.
        fn run_until(&mut self, task: &mut Task, until: u32) -> Vec<Event> {
            let mut output = Vec::new();
            self.play(task, 0);
            let mut seek = 0;
            while seek <= until {
                let Some(next) = self.stack.next_time() else { break };
                if next.is_after(SchedTime(until)) {
                    break;
                }
                seek = next.0;
                let event = self.stack.pop().unwrap();
                match event.kind {
                    EventKind::Wake => {
                        if task.is_finished() {
                            break;
                        }
                        self.play(task, seek);
                    }
                    _ => output.push(event),
                }
            }
            output
        }
    }

    #[test]
    fn single_note_expands_to_a_pair() {
        let mut h = Harness::new();
        let track =
            Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![note(0, 60, 480)]);
        let mut task = h.root_task(track);

        let output = h.run_until(&mut task, 4000);
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].due, SchedTime(0));
        assert_eq!(output[0].kind, EventKind::NoteOn { key: 60, velocity: 100 });
        assert_eq!(output[1].due, SchedTime(480));
        assert_eq!(output[1].kind, EventKind::NoteOff { key: 60 });
        assert!(task.is_finished());
    }

    #[test]
    fn muted_channel_emits_nothing() {
        let mut h = Harness::new();
        let mut dests = vec![crate::track::Destination::default(); 16];
        dests[0].muted = true;
        h.dests.store(dests);

        let track =
            Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![note(0, 60, 480)]);
        let mut task = h.root_task(track);
        let output = h.run_until(&mut task, 4000);
        assert!(output.is_empty());
    }

    #[test]
    fn transposition_out_of_range_suppresses_the_note() {
        let mut h = Harness::new();
        let mut dests = vec![crate::track::Destination::default(); 16];
        dests[0].transpose = 12;
        h.dests.store(dests);

        let track = Track::new(TrackId(1), ClockDomain::Metered, 1920)
            .with_events(vec![note(0, 60, 480), note(480, 120, 480)]);
        let mut task = h.root_task(track);
        let output = h.run_until(&mut task, 4000);

        // 60 transposes to 72, 120 would transpose to 132 and is dropped.
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].kind, EventKind::NoteOn { key: 72, velocity: 100 });
    }

    #[test]
    fn finite_repeat_replays_the_region_exactly_n_times() {
        let mut h = Harness::new();
        // Repeat the first beat three times in total, note at its start.
        let track = Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![
            Event::new(0u32, 0, EventKind::Repeat { duration: 480, count: 3 }),
            note(0, 60, 240),
            note(1440, 64, 240),
        ]);
        let mut task = h.root_task(track);
        let output = h.run_until(&mut task, 10_000);

        let ons: Vec<_> = output
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::NoteOn { key, .. } => Some((key, e.due.0)),
                _ => None,
            })
            .collect();
        // One pass per count, each at its origin-adjusted time, no seam
        // duplication; the trailing note shifts by the inserted spans.
        assert_eq!(ons, vec![(60, 0), (60, 480), (60, 960), (64, 2400)]);
        assert!(task.is_finished());
    }

    #[test]
    fn event_just_past_the_repeat_region_plays_once_after_the_final_pass() {
        let mut h = Harness::new();
        // The second note sits inside the look-ahead window of the frame
        // boundary; it must wait out every rewind rather than being
        // consumed once per pass.
        let track = Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![
            Event::new(0u32, 0, EventKind::Repeat { duration: 480, count: 3 }),
            note(470, 60, 10),
            note(500, 64, 10),
        ]);
        let mut task = h.root_task(track);
        let output = h.run_until(&mut task, 10_000);

        let ons: Vec<_> = output
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::NoteOn { key, .. } => Some((key, e.due.0)),
                _ => None,
            })
            .collect();
        assert_eq!(ons, vec![(60, 470), (60, 950), (60, 1430), (64, 1460)]);
        assert!(task.is_finished());
    }

    #[test]
    fn zero_span_repeat_is_ignored() {
        let mut h = Harness::new();
        // Without the span guard this frame can never end and the play
        // loop spins forever.
        let track = Track::new(TrackId(1), ClockDomain::Metered, 960).with_events(vec![
            Event::new(0u32, 0, EventKind::Repeat { duration: 0, count: 0 }),
            note(0, 60, 240),
        ]);
        let mut task = h.root_task(track);
        let output = h.run_until(&mut task, 4000);

        let ons = output
            .iter()
            .filter(|e| matches!(e.kind, EventKind::NoteOn { .. }))
            .count();
        assert_eq!(ons, 1);
        assert!(task.is_finished());
    }

    #[test]
    fn empty_child_track_finishes_instead_of_looping() {
        let mut h = Harness::new();
        let shared = h.store.insert(Track::new(TrackId(5), ClockDomain::Metered, 0));
        let mut child = Task::spawn_root(
            TaskId(9),
            TrackId(5),
            shared,
            ClockDomain::Metered,
            SchedTime(0),
            Some(SchedTime(1440)),
        );
        child.root = false;

        let output = h.run_until(&mut child, 4000);
        assert!(output.is_empty());
        assert!(child.is_finished());
    }

    #[test]
    fn infinite_repeat_keeps_replaying() {
        let mut h = Harness::new();
        let track = Track::new(TrackId(1), ClockDomain::Metered, 960).with_events(vec![
            Event::new(0u32, 0, EventKind::Repeat { duration: 480, count: 0 }),
            note(0, 60, 240),
        ]);
        let mut task = h.root_task(track);
        let output = h.run_until(&mut task, 4800);

        let ons = output
            .iter()
            .filter(|e| matches!(e.kind, EventKind::NoteOn { .. }))
            .count();
        assert!(ons >= 8, "expected continuing passes, got {ons}");
        assert!(!task.is_finished());
    }

    #[test]
    fn repeat_boundary_tolerance_is_pinned() {
        // The arrival test allows REPEAT_EPSILON of slack; a tuning
        // change here should be a conscious decision.
        assert_eq!(REPEAT_EPSILON, 3);
    }

    #[test]
    fn sequence_spawn_registers_a_child() {
        let mut h = Harness::new();
        let inner = Track::new(TrackId(2), ClockDomain::Metered, 480)
            .with_events(vec![note(0, 72, 240)]);
        h.store.insert(inner);

        let outer = Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![Event::new(
            480u32,
            0,
            EventKind::Sequence { track: TrackId(2), duration: Some(960), interruptible: true },
        )]);
        let mut task = h.root_task(outer);
        h.run_until(&mut task, 4000);

        assert_eq!(h.spawned.len(), 1);
        let child = &h.spawned[0];
        assert_eq!(child.track_id, TrackId(2));
        assert_eq!(child.parent, Some(task.id));
        assert_eq!(child.origin(), SchedTime(480));
        assert_eq!(child.end, Some(SchedTime(1440)));
    }

    #[test]
    fn cyclic_sequence_reference_is_refused_at_any_depth() {
        let mut h = Harness::new();

        // Track 3 references track 1, which is two ancestors up.
        let t3 = Track::new(TrackId(3), ClockDomain::Metered, 480).with_events(vec![Event::new(
            0u32,
            0,
            EventKind::Sequence { track: TrackId(1), duration: None, interruptible: true },
        )]);
        let t3_shared = h.store.insert(t3);
        let t1 = Track::new(TrackId(1), ClockDomain::Metered, 480);
        let t1_shared = h.store.insert(t1);

        let root = Task::spawn_root(
            TaskId(1),
            TrackId(1),
            t1_shared,
            ClockDomain::Metered,
            SchedTime(0),
            None,
        );
        let mut mid = Task::spawn_root(
            TaskId(2),
            TrackId(2),
            h.store.insert(Track::new(TrackId(2), ClockDomain::Metered, 480)),
            ClockDomain::Metered,
            SchedTime(0),
            None,
        );
        mid.parent = Some(TaskId(1));
        h.tasks.insert(TaskId(1), root);
        h.tasks.insert(TaskId(2), mid);

        let mut leaf = Task::spawn_root(
            TaskId(3),
            TrackId(3),
            t3_shared,
            ClockDomain::Metered,
            SchedTime(0),
            None,
        );
        leaf.parent = Some(TaskId(2));
        leaf.root = false;

        // Bound the implicit loop so the run terminates.
        leaf.end = Some(SchedTime(480));
        h.run_until(&mut leaf, 2000);
        assert!(h.spawned.is_empty(), "cyclic spawn must be refused");

        // Direct self-reference is refused too.
        let t4 = Track::new(TrackId(4), ClockDomain::Metered, 480).with_events(vec![Event::new(
            0u32,
            0,
            EventKind::Sequence { track: TrackId(4), duration: None, interruptible: true },
        )]);
        let mut selfref = h.root_task(t4);
        h.run_until(&mut selfref, 2000);
        assert!(h.spawned.is_empty());
    }

    #[test]
    fn child_task_loops_implicitly_until_duration_runs_out() {
        let mut h = Harness::new();
        let track =
            Track::new(TrackId(5), ClockDomain::Metered, 480).with_events(vec![note(0, 60, 240)]);
        let shared = h.store.insert(track);
        let mut child = Task::spawn_root(
            TaskId(9),
            TrackId(5),
            shared,
            ClockDomain::Metered,
            SchedTime(0),
            Some(SchedTime(1440)),
        );
        child.root = false;

        let output = h.run_until(&mut child, 4000);
        let ons: Vec<u32> = output
            .iter()
            .filter(|e| matches!(e.kind, EventKind::NoteOn { .. }))
            .map(|e| e.due.0)
            .collect();
        // Three whole-track passes fit in the 1440-tick duration.
        assert_eq!(ons, vec![0, 480, 960]);
        assert!(child.is_finished());
    }

    #[test]
    fn locating_caches_control_state_instead_of_emitting() {
        let mut h = Harness::new();
        let track = Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![
            Event::new(0u32, 2, EventKind::Controller { controller: 7, value: 99 }),
            Event::new(0u32, 2, EventKind::Program { program: 8 }),
            note(0, 60, 480),
        ]);
        let mut task = h.root_task(track);

        let mut ctx = PlayContext {
            seek: SchedTime(960),
            locating: true,
            stack: &mut h.stack,
            tempo: &h.tempo,
            dests: &h.dests,
            cache: &mut h.cache,
            store: &h.store,
            tasks: &h.tasks,
            spawned: &mut h.spawned,
            next_task_id: &mut h.next_task_id,
        };
        task.play(&mut ctx);

        // Only the task's own wake may be queued; no audible output.
        assert!(h.stack.iter().all(|e| matches!(e.kind, EventKind::Wake)));
        let image = h.cache.image(0, 2).unwrap();
        assert_eq!(image.controllers.get(&7), Some(&99));
        assert_eq!(image.program, Some(8));
    }
}
