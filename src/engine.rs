//! The single scheduling authority. One dedicated thread owns the clock,
//! drives every playback group, and serves a small fire-and-forget
//! command queue; locate requests get their own short-lived worker, at
//! most one per group.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::group::{Group, GroupId, LocateProgress, StartOptions, SyncMode};
use crate::output::{ChannelCache, OutputSink};
use crate::timing::{ClockDomain, MAX_SLEEP, SchedTime, TempoMap};
use crate::track::{DestinationTable, TrackId, TrackStore};

/// The always-present context for ad hoc auditioning; it never
/// auto-stops when its stacks run dry.
pub const AUDITION_GROUP: GroupId = GroupId(0);

/// Bound on draining the command channel during shutdown.
const QUIT_DRAIN: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub enum EngineCommand {
    Start {
        group: GroupId,
        tracks: Vec<TrackId>,
        target: f64,
        domain: ClockDomain,
        duration: Option<f64>,
        sync: SyncMode,
        options: StartOptions,
    },
    Stop { group: GroupId },
    Pause { group: GroupId },
    Continue { group: GroupId },
    SyncPulse { group: GroupId },
    SetTempoMap { group: GroupId, tempo: TempoMap },
    /// Internal: a locate worker finished and the loop should re-check
    /// wake times immediately.
    Nudge,
    Quit,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    PlaybackState { group: GroupId, playing: bool },
    LocateFinished { group: GroupId },
}

struct EngineShared {
    groups: Mutex<HashMap<GroupId, Group>>,
    // Lock order: groups before sink, everywhere.
    sink: Mutex<Box<dyn OutputSink>>,
    store: Arc<TrackStore>,
    dests: Arc<DestinationTable>,
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    shared: Arc<EngineShared>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn send(&self, command: EngineCommand) {
        if self.command_tx.send(command).is_err() {
            warn!("engine command channel closed");
        }
    }

    fn with_group<T>(&self, id: GroupId, f: impl FnOnce(&Group) -> T) -> Option<T> {
        self.shared.groups.lock().get(&id).map(f)
    }

    pub fn is_running(&self, group: GroupId) -> bool {
        self.with_group(group, Group::is_running).unwrap_or(false)
    }

    pub fn is_paused(&self, group: GroupId) -> bool {
        self.with_group(group, Group::is_paused).unwrap_or(false)
    }

    pub fn current_time(&self, group: GroupId, domain: ClockDomain) -> Option<SchedTime> {
        self.with_group(group, |g| g.current_time(domain))
    }

    pub fn current_bpm(&self, group: GroupId) -> Option<f64> {
        self.with_group(group, Group::current_bpm)
    }

    /// Flags the group was last started with, including UI hints like
    /// `folded_display`.
    pub fn options(&self, group: GroupId) -> StartOptions {
        self.with_group(group, Group::options).unwrap_or_default()
    }

    /// Track-relative positions of every active task over `track`, for
    /// the UI's playback cursors.
    pub fn task_positions(&self, group: GroupId, track: TrackId) -> Vec<u32> {
        self.with_group(group, |g| g.task_positions(track))
            .unwrap_or_default()
    }

    /// Channel state captured by the group's last locate.
    pub fn channel_cache(&self, group: GroupId) -> Option<ChannelCache> {
        self.with_group(group, |g| g.channel_cache().clone())
    }

    /// Stop the scheduling thread and join it. Pending commands are
    /// drained with a bounded wait.
    pub fn quit(mut self) {
        let _ = self.command_tx.send(EngineCommand::Quit);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawn the scheduling thread. The host owns the returned handle; the
/// engine owns everything else.
pub fn spawn_engine(
    store: Arc<TrackStore>,
    dests: Arc<DestinationTable>,
    sink: Box<dyn OutputSink>,
) -> EngineHandle {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let mut groups = HashMap::new();
    let mut audition = Group::new(AUDITION_GROUP, store.clone(), dests.clone());
    audition.continuous = true;
    groups.insert(AUDITION_GROUP, audition);

    let shared = Arc::new(EngineShared {
        groups: Mutex::new(groups),
        sink: Mutex::new(sink),
        store,
        dests,
    });

    let thread_shared = shared.clone();
    let thread_tx = command_tx.clone();
    let thread = std::thread::spawn(move || {
        engine_thread(thread_shared, command_rx, thread_tx, update_tx);
    });

    EngineHandle {
        command_tx,
        update_rx,
        shared,
        thread: Some(thread),
    }
}

fn tick_of(start: Instant) -> u32 {
    start.elapsed().as_millis() as u32
}

fn engine_thread(
    shared: Arc<EngineShared>,
    command_rx: Receiver<EngineCommand>,
    command_tx: Sender<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    let start = Instant::now();
    let mut locate_workers: HashMap<GroupId, JoinHandle<()>> = HashMap::new();
    let mut next_wake: Option<u32> = None;
    info!("engine thread up");

    loop {
        // Sleep until the nearer of the next wanted wake-up and a new
        // command, never longer than the latency ceiling.
        let timeout = match next_wake {
            Some(wake) => {
                let dt = SchedTime(wake).delta(SchedTime(tick_of(start)));
                if dt <= 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(dt as u64).min(MAX_SLEEP)
                }
            }
            None => MAX_SLEEP,
        };

        // At most one command per wake keeps dispatch latency bounded
        // even under command floods.
        match command_rx.recv_timeout(timeout) {
            Ok(EngineCommand::Quit) => {
                while command_rx.recv_timeout(QUIT_DRAIN).is_ok() {}
                break;
            }
            Ok(command) => {
                handle_command(command, &shared, &command_tx, &update_tx, &mut locate_workers)
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = tick_of(start);
        let mut restarts = Vec::new();
        {
            let mut groups = shared.groups.lock();
            let mut sink = shared.sink.lock();
            next_wake = None;
            for group in groups.values_mut() {
                let outcome = group.update(now, sink.as_mut());
                if let Some(wake) = outcome.next_wake {
                    next_wake = Some(match next_wake {
                        Some(current) if !SchedTime(current).is_after(SchedTime(wake)) => current,
                        _ => wake,
                    });
                }
                if outcome.stopped {
                    let _ = update_tx.send(EngineUpdate::PlaybackState {
                        group: group.id,
                        playing: false,
                    });
                }
                if outcome.restart {
                    group.restart();
                    restarts.push(group.id);
                }
            }
        }
        for id in restarts {
            spawn_locate(&shared, id, &command_tx, &update_tx, &mut locate_workers);
        }
    }

    // Teardown: silence everything, then collect the workers.
    {
        let mut groups = shared.groups.lock();
        let mut sink = shared.sink.lock();
        for group in groups.values_mut() {
            group.teardown(sink.as_mut());
        }
    }
    for (_, worker) in locate_workers.drain() {
        let _ = worker.join();
    }
    info!("engine thread down");
}

fn handle_command(
    command: EngineCommand,
    shared: &Arc<EngineShared>,
    command_tx: &Sender<EngineCommand>,
    update_tx: &Sender<EngineUpdate>,
    locate_workers: &mut HashMap<GroupId, JoinHandle<()>>,
) {
    match command {
        EngineCommand::Start { group, tracks, target, domain, duration, sync, options } => {
            {
                let mut groups = shared.groups.lock();
                let entry = groups.entry(group).or_insert_with(|| {
                    Group::new(group, shared.store.clone(), shared.dests.clone())
                });
                entry.start(tracks, target, domain, duration, sync, options);
            }
            spawn_locate(shared, group, command_tx, update_tx, locate_workers);
            let _ = update_tx.send(EngineUpdate::PlaybackState { group, playing: true });
        }
        EngineCommand::Stop { group } => {
            let mut groups = shared.groups.lock();
            let mut sink = shared.sink.lock();
            if let Some(g) = groups.get_mut(&group) {
                g.stop(sink.as_mut());
                let _ = update_tx.send(EngineUpdate::PlaybackState { group, playing: false });
            }
        }
        EngineCommand::Pause { group } => {
            if let Some(g) = shared.groups.lock().get_mut(&group) {
                g.pause(true);
            }
        }
        EngineCommand::Continue { group } => {
            if let Some(g) = shared.groups.lock().get_mut(&group) {
                g.pause(false);
            }
        }
        EngineCommand::SyncPulse { group } => {
            if let Some(g) = shared.groups.lock().get_mut(&group) {
                g.sync_pulse();
            }
        }
        EngineCommand::SetTempoMap { group, tempo } => {
            let mut groups = shared.groups.lock();
            let entry = groups.entry(group).or_insert_with(|| {
                Group::new(group, shared.store.clone(), shared.dests.clone())
            });
            entry.set_tempo_map(tempo);
        }
        EngineCommand::Nudge | EngineCommand::Quit => {}
    }
}

/// Spawn a locate worker for `group`, serializing with any prior one.
/// The previous worker sees the bumped epoch at its next batch boundary
/// and exits promptly, so the join here is short.
fn spawn_locate(
    shared: &Arc<EngineShared>,
    id: GroupId,
    command_tx: &Sender<EngineCommand>,
    update_tx: &Sender<EngineUpdate>,
    locate_workers: &mut HashMap<GroupId, JoinHandle<()>>,
) {
    if let Some(previous) = locate_workers.remove(&id) {
        let _ = previous.join();
    }

    let epoch = match shared.groups.lock().get(&id) {
        Some(group) => group.locate_epoch(),
        None => return,
    };

    let shared = shared.clone();
    let command_tx = command_tx.clone();
    let update_tx = update_tx.clone();
    let worker = std::thread::spawn(move || {
        debug!(group = %id, epoch, "locate worker up");
        loop {
            let progress = {
                let mut groups = shared.groups.lock();
                let Some(group) = groups.get_mut(&id) else { break };
                let mut sink = shared.sink.lock();
                group.locate_step(epoch, sink.as_mut())
            };
            match progress {
                // Dropping the locks between batches keeps cancellation
                // and state queries prompt.
                LocateProgress::Working => {}
                LocateProgress::Done => {
                    let _ = update_tx.send(EngineUpdate::LocateFinished { group: id });
                    let _ = command_tx.send(EngineCommand::Nudge);
                    break;
                }
                LocateProgress::Superseded => break,
            }
        }
        debug!(group = %id, epoch, "locate worker down");
    });
    locate_workers.insert(id, worker);
}
