//! One playback context: both clock domains with their event stacks, the
//! active task set, the tempo map, and the Start/Stop/Pause/Locate state
//! machine. The control loop drives `update`; locate runs on a separate
//! short-lived worker that calls `locate_step` in bounded batches.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::events::{Event, EventKind};
use crate::output::{ChannelCache, OutputCommand, OutputSink};
use crate::stack::EventStack;
use crate::task::{PlayContext, Task, TaskId};
use crate::timing::{ClockDomain, LOCATE_BATCH, SchedTime, TempoMap};
use crate::track::{DestinationTable, TrackId, TrackStore};

/// Targets earlier than this (Real ms) are cheaper to replay from zero
/// than to jump to.
const RESET_EARLY: f64 = 500.0;

/// Forward jumps longer than this (Real ms) force a reset; the
/// accumulated task state is unlikely to be worth carrying that far.
const RESET_FORWARD_GAP: f64 = 30_000.0;

/// Interval between emitted pitch-bend interpolation steps, in the
/// owning stack's domain units.
const BEND_STEP: u32 = 10;

/// Stack capacity per clock domain.
const STACK_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group{}", self.0)
    }
}

/// Transport state. Exactly one variant at a time; the clock runs only
/// in `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Stopped,
    /// Started but holding at the origin until a sync pulse arrives.
    AwaitingSync,
    Running,
    Paused,
    /// An asynchronous locate is seeking to the target.
    Locating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Immediate,
    /// Hold at the start position until `sync_pulse` releases playback.
    Await,
}

/// Orthogonal capability flags passed to `start`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Restart from the start position when playback runs dry.
    pub loop_playback: bool,
    /// Come out of the locate paused instead of running.
    pub start_paused: bool,
    /// UI hint carried through state queries; the engine does not act on
    /// it.
    pub folded_display: bool,
}

/// What `update` asks of the control loop.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    /// Global tick of the next wanted wake-up, if any.
    pub next_wake: Option<u32>,
    /// Playback ran dry and the group stopped; the UI should hear of it.
    pub stopped: bool,
    /// Playback ran dry with the loop option set; the control loop
    /// should begin a locate back to the start.
    pub restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateProgress {
    /// Batch done, more to do.
    Working,
    /// Target reached; the group is out of `Locating`.
    Done,
    /// A newer locate request superseded this one.
    Superseded,
}

/// Clock, seek frontier and pending-event stack for one domain.
pub struct TimeState {
    pub stack: EventStack,
    /// Where the clock is now, timeline-absolute in this domain.
    pub current: SchedTime,
    /// Dispatch frontier; trails or equals `current` while running.
    pub seek: SchedTime,
    /// Playback start position (the last locate target).
    pub start: SchedTime,
    pub end: Option<SchedTime>,
}

impl TimeState {
    fn new() -> Self {
        TimeState {
            stack: EventStack::new(STACK_CAPACITY),
            current: SchedTime(0),
            seek: SchedTime(0),
            start: SchedTime(0),
            end: None,
        }
    }
}

struct PendingLocate {
    epoch: u64,
    real_target: SchedTime,
    metered_target: SchedTime,
    reset: bool,
    prepared: bool,
}

pub struct Group {
    pub id: GroupId,
    state: GroupState,
    options: StartOptions,
    sync: SyncMode,
    real: TimeState,
    metered: TimeState,
    tasks: HashMap<TaskId, Task>,
    next_task_id: u64,
    tempo: TempoMap,
    cache: ChannelCache,
    /// (port, channel, key) of every note-on dispatched without its
    /// note-off yet; drives all-notes-off at teardown.
    sounding: HashSet<(u8, u8, u8)>,
    store: Arc<TrackStore>,
    dests: Arc<DestinationTable>,
    main_tracks: Vec<TrackId>,
    /// `real.current = tick - clock_offset`; refreshed while halted so
    /// the clock holds steady.
    clock_offset: u32,
    /// Set when a worker finished a locate; the next update re-anchors
    /// the clock to the new position.
    needs_resync: bool,
    /// Groups flagged continuous never auto-stop on empty stacks (the
    /// ad hoc audition context).
    pub continuous: bool,
    locate_epoch: u64,
    pending: Option<PendingLocate>,
}

impl Group {
    pub fn new(id: GroupId, store: Arc<TrackStore>, dests: Arc<DestinationTable>) -> Self {
        Group {
            id,
            state: GroupState::Stopped,
            options: StartOptions::default(),
            sync: SyncMode::default(),
            real: TimeState::new(),
            metered: TimeState::new(),
            tasks: HashMap::new(),
            next_task_id: 1,
            tempo: TempoMap::default(),
            cache: ChannelCache::default(),
            sounding: HashSet::new(),
            store,
            dests,
            main_tracks: Vec::new(),
            clock_offset: 0,
            needs_resync: false,
            continuous: false,
            locate_epoch: 0,
            pending: None,
        }
    }

    pub fn set_tempo_map(&mut self, tempo: TempoMap) {
        self.tempo = tempo;
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == GroupState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state == GroupState::Paused
    }

    pub fn current_time(&self, domain: ClockDomain) -> SchedTime {
        match domain {
            ClockDomain::Real => self.real.current,
            ClockDomain::Metered => self.metered.current,
        }
    }

    pub fn current_bpm(&self) -> f64 {
        self.tempo.bpm_at_real(self.real.current.0 as f64)
    }

    pub fn options(&self) -> StartOptions {
        self.options
    }

    /// Channel state accumulated by the last locate, for host-side
    /// chasing.
    pub fn channel_cache(&self) -> &ChannelCache {
        &self.cache
    }

    /// Track-relative position of every active task over `track`, for
    /// UI playback-cursor rendering.
    pub fn task_positions(&self, track: TrackId) -> Vec<u32> {
        self.tasks
            .values()
            .filter(|t| t.track_id == track && !t.is_finished())
            .map(|t| t.position(self.seek_of(t.domain)))
            .collect()
    }

    fn seek_of(&self, domain: ClockDomain) -> SchedTime {
        match domain {
            ClockDomain::Real => self.real.seek,
            ClockDomain::Metered => self.metered.seek,
        }
    }

    /// Bind the group to its main tracks and request playback from
    /// `target` (in `domain` units). Computes both domains' start and
    /// end from the target via the tempo map and decides between a full
    /// reset and a direct jump; the actual seeking happens on the locate
    /// worker the control loop spawns next.
    pub fn start(
        &mut self,
        tracks: Vec<TrackId>,
        target: f64,
        domain: ClockDomain,
        duration: Option<f64>,
        sync: SyncMode,
        options: StartOptions,
    ) {
        let (real_target, metered_target) = match domain {
            ClockDomain::Real => (target, self.tempo.real_to_metered(target)),
            ClockDomain::Metered => (self.tempo.metered_to_real(target), target),
        };
        let real_target = SchedTime(real_target.max(0.0).round() as u32);
        let metered_target = SchedTime(metered_target.max(0.0).round() as u32);

        self.real.start = real_target;
        self.metered.start = metered_target;
        (self.real.end, self.metered.end) = match (duration, domain) {
            (None, _) => (None, None),
            (Some(d), ClockDomain::Real) => {
                let real_end = real_target.0 as f64 + d;
                let metered_end = self.tempo.real_to_metered(real_end);
                (
                    Some(SchedTime(real_end.round() as u32)),
                    Some(SchedTime(metered_end.round() as u32)),
                )
            }
            (Some(d), ClockDomain::Metered) => {
                let metered_end = metered_target.0 as f64 + d;
                let real_end = self.tempo.metered_to_real(metered_end);
                (
                    Some(SchedTime(real_end.round() as u32)),
                    Some(SchedTime(metered_end.round() as u32)),
                )
            }
        };

        // A very early target, a direction reversal, or a large forward
        // gap all make replaying from zero cheaper than a direct jump.
        let reset = self.tasks.is_empty()
            || (real_target.0 as f64) < RESET_EARLY
            || self.real.seek.is_after(real_target)
            || real_target.delta(self.real.seek) as f64 > RESET_FORWARD_GAP;

        self.main_tracks = tracks;
        self.options = options;
        self.sync = sync;
        self.state = GroupState::Locating;
        self.locate_epoch += 1;
        self.pending = Some(PendingLocate {
            epoch: self.locate_epoch,
            real_target,
            metered_target,
            reset,
            prepared: false,
        });
        info!(
            group = %self.id,
            target = real_target.0,
            reset,
            "start requested"
        );
    }

    /// Re-arm the last start at the start position (loop option).
    pub fn restart(&mut self) {
        let tracks = self.main_tracks.clone();
        let target = self.real.start.0 as f64;
        let duration = self
            .real
            .end
            .map(|end| end.delta(self.real.start).max(0) as f64);
        let (sync, options) = (self.sync, self.options);
        self.start(tracks, target, ClockDomain::Real, duration, sync, options);
    }

    pub fn locate_epoch(&self) -> u64 {
        self.locate_epoch
    }

    /// One bounded locate batch. Called repeatedly by the locate worker
    /// while it holds the group lock; returning between batches keeps
    /// the lock fair and makes supersession prompt.
    pub fn locate_step(&mut self, epoch: u64, sink: &mut dyn OutputSink) -> LocateProgress {
        if self.locate_epoch != epoch {
            return LocateProgress::Superseded;
        }
        let Some(pending) = &mut self.pending else {
            return LocateProgress::Superseded;
        };
        let (real_target, metered_target, reset) =
            (pending.real_target, pending.metered_target, pending.reset);

        if !pending.prepared {
            pending.prepared = true;
            if reset {
                self.reset_for_locate(sink);
            }
        }

        for _ in 0..LOCATE_BATCH {
            // The more imminent of the two domains, compared in Real
            // time, is executed first; its seek time jumps to the event.
            let next_real = self.real.stack.next_time();
            let next_metered = self.metered.stack.next_time();
            let next = match (next_real, next_metered) {
                (None, None) => None,
                (Some(r), None) => Some((ClockDomain::Real, r, r)),
                (None, Some(m)) => {
                    let as_real = SchedTime(self.tempo.metered_to_real(m.0 as f64).round() as u32);
                    Some((ClockDomain::Metered, m, as_real))
                }
                (Some(r), Some(m)) => {
                    let as_real = SchedTime(self.tempo.metered_to_real(m.0 as f64).round() as u32);
                    if as_real.is_after(r) {
                        Some((ClockDomain::Real, r, r))
                    } else {
                        Some((ClockDomain::Metered, m, as_real))
                    }
                }
            };

            // Events due exactly at the target stay queued: they belong
            // to normal playback, not the silent catch-up.
            let Some((domain, due, as_real)) = next else {
                self.finish_locate(real_target, metered_target);
                return LocateProgress::Done;
            };
            if !real_target.is_after(as_real) {
                self.finish_locate(real_target, metered_target);
                return LocateProgress::Done;
            }

            // Cross-update both seek frontiers before executing.
            self.real.seek = as_real;
            self.metered.seek = match domain {
                ClockDomain::Metered => due,
                ClockDomain::Real => SchedTime(
                    self.tempo
                        .real_to_metered(as_real.0 as f64)
                        .round()
                        .max(0.0) as u32,
                ),
            };

            let event = match domain {
                ClockDomain::Real => self.real.stack.pop(),
                ClockDomain::Metered => self.metered.stack.pop(),
            };
            let Some(event) = event else { break };
            self.dispatch_locating(event, domain, sink);
        }
        LocateProgress::Working
    }

    /// Reset half of a locate: silence pending note-offs, drop the rest,
    /// destroy all tasks and respawn one root task per main track.
    fn reset_for_locate(&mut self, sink: &mut dyn OutputSink) {
        self.flush_note_offs(sink);
        self.real.stack.clear();
        self.metered.stack.clear();
        self.tasks.clear();
        self.cache.clear();
        self.real.seek = SchedTime(0);
        self.metered.seek = SchedTime(0);

        let tracks = std::mem::take(&mut self.main_tracks);
        for track_id in &tracks {
            let Some(shared) = self.store.get(*track_id) else {
                warn!(group = %self.id, track = %track_id, "main track missing, skipped");
                continue;
            };
            let domain = shared.read().domain;
            let id = TaskId(self.next_task_id);
            self.next_task_id += 1;
            let end = match domain {
                ClockDomain::Real => self.real.end,
                ClockDomain::Metered => self.metered.end,
            };
            let task = Task::spawn_root(id, *track_id, shared, domain, SchedTime(0), end);
            self.register_task(task);
        }
        self.main_tracks = tracks;
    }

    /// Insert a task and queue its first wake-up on its domain's stack.
    fn register_task(&mut self, task: Task) {
        let stack = match task.domain {
            ClockDomain::Real => &mut self.real.stack,
            ClockDomain::Metered => &mut self.metered.stack,
        };
        if stack.push(Event::wake(task.origin(), task.id)).is_err() {
            warn!(group = %self.id, task = %task.id, "stack full, task never scheduled");
        }
        self.tasks.insert(task.id, task);
    }

    fn finish_locate(&mut self, real_target: SchedTime, metered_target: SchedTime) {
        self.real.seek = real_target;
        self.metered.seek = metered_target;
        self.real.current = real_target;
        self.metered.current = metered_target;
        self.pending = None;
        self.needs_resync = true;
        self.state = match (self.sync, self.options.start_paused) {
            (_, true) => GroupState::Paused,
            (SyncMode::Await, false) => GroupState::AwaitingSync,
            (SyncMode::Immediate, false) => GroupState::Running,
        };
        info!(group = %self.id, at = real_target.0, state = ?self.state, "locate finished");
    }

    /// Release a group holding in `AwaitingSync`.
    pub fn sync_pulse(&mut self) {
        if self.state == GroupState::AwaitingSync {
            self.state = GroupState::Running;
            self.needs_resync = true;
        }
    }

    /// Advance the clocks to the global tick and dispatch everything
    /// due. Clocks hold steady while halted.
    pub fn update(&mut self, tick: u32, sink: &mut dyn OutputSink) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();

        if self.needs_resync {
            self.clock_offset = tick.wrapping_sub(self.real.current.0);
            self.needs_resync = false;
        }
        if self.state != GroupState::Running {
            // Hold the clock at its current position.
            self.clock_offset = tick.wrapping_sub(self.real.current.0);
            return outcome;
        }

        self.real.current = SchedTime(tick.wrapping_sub(self.clock_offset));
        self.metered.current = SchedTime(
            self.tempo
                .real_to_metered(self.real.current.0 as f64)
                .round()
                .max(0.0) as u32,
        );
        self.real.seek = self.real.current;
        self.metered.seek = self.metered.current;

        // Domain-then-time order within the tick.
        for domain in [ClockDomain::Real, ClockDomain::Metered] {
            loop {
                let event = {
                    let state = self.domain_state_mut(domain);
                    state.stack.pop_due(state.seek)
                };
                let Some(event) = event else { break };
                self.dispatch(event, domain, sink);
            }
        }

        if self.real.stack.is_empty() && self.metered.stack.is_empty() {
            if self.continuous {
                // The audition context idles instead of stopping.
            } else if self.options.loop_playback {
                debug!(group = %self.id, "playback drained, looping");
                outcome.restart = true;
            } else {
                debug!(group = %self.id, "playback drained, stopping");
                self.state = GroupState::Stopped;
                outcome.stopped = true;
            }
            return outcome;
        }

        // Next wake: the earlier of the two stacks, compared in Real
        // time, translated back to the global tick.
        let next_real = self.real.stack.next_time();
        let next_metered = self.metered.stack.next_time().map(|m| {
            SchedTime(self.tempo.metered_to_real(m.0 as f64).round().max(0.0) as u32)
        });
        let wake = match (next_real, next_metered) {
            (None, None) => None,
            (Some(r), None) => Some(r),
            (None, Some(m)) => Some(m),
            (Some(r), Some(m)) => Some(if r.is_after(m) { m } else { r }),
        };
        outcome.next_wake = wake.map(|w| w.0.wrapping_add(self.clock_offset));
        outcome
    }

    fn domain_state_mut(&mut self, domain: ClockDomain) -> &mut TimeState {
        match domain {
            ClockDomain::Real => &mut self.real,
            ClockDomain::Metered => &mut self.metered,
        }
    }

    /// Steady-state dispatch of one due event.
    fn dispatch(&mut self, event: Event, domain: ClockDomain, sink: &mut dyn OutputSink) {
        match event.kind {
            EventKind::Wake => {
                let Some(id) = event.task else { return };
                self.dispatch_wake(id, domain, false);
            }
            EventKind::BendStep { from, to, elapsed, duration } => {
                self.dispatch_bend_step(event.due, event.channel, from, to, elapsed, duration, domain, sink);
            }
            _ if event.is_output() => self.emit(event, sink),
            _ => {}
        }
    }

    fn dispatch_locating(&mut self, event: Event, domain: ClockDomain, sink: &mut dyn OutputSink) {
        match event.kind {
            EventKind::Wake => {
                let Some(id) = event.task else { return };
                self.dispatch_wake(id, domain, true);
            }
            // A ramp crossed by the locate settles at its target value.
            EventKind::BendStep { to, .. } => {
                let dest = self.dests.resolve(event.channel);
                self.cache
                    .apply(dest.port, dest.channel, &EventKind::PitchBend { value: to, ramp: 0 });
            }
            // Leftover note-ons from before the jump are stale; their
            // note-offs still go out so nothing sticks.
            EventKind::NoteOn { .. } => {}
            EventKind::NoteOff { .. } => self.emit(event, sink),
            _ if event.is_output() => {
                let dest = self.dests.resolve(event.channel);
                self.cache.apply(dest.port, dest.channel, &event.kind);
            }
            _ => {}
        }
    }

    /// A wake for a Finished task deletes it; anything else re-enters
    /// the task's scheduling.
    fn dispatch_wake(&mut self, id: TaskId, domain: ClockDomain, locating: bool) {
        let Some(mut task) = self.tasks.remove(&id) else { return };
        if task.is_finished() {
            trace!(group = %self.id, task = %id, "finished task deleted");
            return;
        }
        // An interruptible child whose parent is gone is cut short.
        if task.interruptible
            && task
                .parent
                .map(|p| !self.tasks.contains_key(&p))
                .unwrap_or(false)
        {
            debug!(group = %self.id, task = %id, "orphaned interruptible task dropped");
            return;
        }

        let mut spawned = Vec::new();
        {
            let state = match domain {
                ClockDomain::Real => &mut self.real,
                ClockDomain::Metered => &mut self.metered,
            };
            let mut ctx = PlayContext {
                seek: state.seek,
                locating,
                stack: &mut state.stack,
                tempo: &self.tempo,
                dests: &self.dests,
                cache: &mut self.cache,
                store: &self.store,
                tasks: &self.tasks,
                spawned: &mut spawned,
                next_task_id: &mut self.next_task_id,
            };
            task.play(&mut ctx);
        }
        self.tasks.insert(id, task);
        for child in spawned {
            self.register_task(child);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_bend_step(
        &mut self,
        due: SchedTime,
        channel: u8,
        from: u16,
        to: u16,
        elapsed: u32,
        duration: u32,
        domain: ClockDomain,
        sink: &mut dyn OutputSink,
    ) {
        let value = if duration == 0 {
            to
        } else {
            let delta = (to as i32 - from as i32) * elapsed.min(duration) as i32 / duration as i32;
            (from as i32 + delta) as u16
        };
        self.emit(
            Event::new(due, channel, EventKind::PitchBend { value, ramp: 0 }),
            sink,
        );
        if elapsed < duration {
            let next_elapsed = (elapsed + BEND_STEP).min(duration);
            let next = Event::new(
                due.offset(next_elapsed - elapsed),
                channel,
                EventKind::BendStep { from, to, elapsed: next_elapsed, duration },
            );
            let stack = &mut self.domain_state_mut(domain).stack;
            if stack.push(next).is_err() {
                debug!(group = %self.id, "stack full, bend ramp truncated");
            }
        }
    }

    /// Resolve the destination and hand the command to the sink,
    /// keeping the channel cache and sounding-note ledger current.
    fn emit(&mut self, event: Event, sink: &mut dyn OutputSink) {
        let dest = self.dests.resolve(event.channel);
        self.cache.apply(dest.port, dest.channel, &event.kind);
        match event.kind {
            EventKind::NoteOn { key, .. } => {
                self.sounding.insert((dest.port, dest.channel, key));
            }
            EventKind::NoteOff { key } => {
                self.sounding.remove(&(dest.port, dest.channel, key));
            }
            _ => {}
        }
        sink.send(OutputCommand {
            due: event.due,
            port: dest.port,
            channel: dest.channel,
            kind: event.kind,
        });
    }

    /// Dispatch only the queued note-offs, leaving everything else in
    /// place. Used by stop and by the reset half of a locate so no note
    /// is left sounding.
    fn flush_note_offs(&mut self, sink: &mut dyn OutputSink) {
        for domain in [ClockDomain::Real, ClockDomain::Metered] {
            let offs = self
                .domain_state_mut(domain)
                .stack
                .drain_matching(Event::is_note_off);
            for event in offs {
                self.emit(event, sink);
            }
        }
    }

    /// Halt the clock and flush pending note-offs. Task state survives,
    /// so a later start can jump onward.
    pub fn stop(&mut self, sink: &mut dyn OutputSink) {
        self.locate_epoch += 1; // abandon any in-flight locate
        self.pending = None;
        self.flush_note_offs(sink);
        self.state = GroupState::Stopped;
        info!(group = %self.id, "stopped");
    }

    /// Toggle the pause flag. No flushing: held notes hold.
    pub fn pause(&mut self, paused: bool) {
        match (self.state, paused) {
            (GroupState::Running, true) => self.state = GroupState::Paused,
            (GroupState::Paused, false) => {
                self.state = GroupState::Running;
                self.needs_resync = true;
            }
            _ => {}
        }
    }

    /// Tear the context down: every sounding note gets its note-off,
    /// tasks cascade away.
    pub fn teardown(&mut self, sink: &mut dyn OutputSink) {
        self.locate_epoch += 1;
        self.pending = None;
        self.flush_note_offs(sink);
        for (port, channel, key) in std::mem::take(&mut self.sounding) {
            sink.send(OutputCommand {
                due: self.real.seek,
                port,
                channel,
                kind: EventKind::NoteOff { key },
            });
        }
        self.tasks.clear();
        self.real.stack.clear();
        self.metered.stack.clear();
        self.state = GroupState::Stopped;
    }
}
