//! End-to-end playback scenarios driven through the public API.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use metron::group::{LocateProgress, UpdateOutcome};
use metron::{
    CaptureSink, ClockDomain, DestinationTable, EngineCommand, EngineUpdate, Event, EventKind,
    Group, GroupId, OutputCommand, OutputSink, StartOptions, SyncMode, Track, TrackId, TrackStore,
    spawn_engine,
};

fn note(due: u32, key: u8, duration: u32) -> Event {
    Event::new(due, 0, EventKind::Note { key, velocity: 100, duration })
}

fn group_over(tracks: Vec<Track>) -> Group {
    let store = Arc::new(TrackStore::new());
    for track in tracks {
        store.insert(track);
    }
    Group::new(GroupId(1), store, Arc::new(DestinationTable::default()))
}

fn start_and_locate(group: &mut Group, tracks: Vec<TrackId>, sink: &mut CaptureSink) {
    group.start(
        tracks,
        0.0,
        ClockDomain::Metered,
        None,
        SyncMode::Immediate,
        StartOptions::default(),
    );
    let epoch = group.locate_epoch();
    loop {
        match group.locate_step(epoch, sink) {
            LocateProgress::Working => {}
            LocateProgress::Done | LocateProgress::Superseded => break,
        }
    }
}

fn run(group: &mut Group, sink: &mut CaptureSink, until: u32) -> UpdateOutcome {
    let mut outcome = UpdateOutcome::default();
    for tick in 0..=until {
        outcome = group.update(tick, sink);
        if outcome.stopped || outcome.restart {
            break;
        }
    }
    outcome
}

fn ons(sink: &CaptureSink) -> Vec<(u8, u32)> {
    sink.note_ons().iter().map(|c| (note_key(c), c.due.0)).collect()
}

fn note_key(command: &OutputCommand) -> u8 {
    match command.kind {
        EventKind::NoteOn { key, .. } | EventKind::NoteOff { key, .. } => key,
        _ => panic!("not a note command"),
    }
}

#[test]
fn repeated_region_plays_back_expanded() {
    // The first beat repeats three times in total before playback moves
    // on to the note at tick 1440.
    let track = Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![
        Event::new(0u32, 0, EventKind::Repeat { duration: 480, count: 3 }),
        note(0, 60, 240),
        note(1440, 64, 240),
    ]);
    let mut group = group_over(vec![track]);
    let mut sink = CaptureSink::new();
    start_and_locate(&mut group, vec![TrackId(1)], &mut sink);

    let outcome = run(&mut group, &mut sink, 10_000);
    assert!(outcome.stopped);
    assert_eq!(ons(&sink), vec![(60, 0), (60, 480), (60, 960), (64, 2400)]);
    assert_eq!(sink.note_offs().len(), 4);
}

#[test]
fn sequence_event_loops_the_child_track() {
    let child = Track::new(TrackId(2), ClockDomain::Metered, 480)
        .with_events(vec![note(0, 72, 240)]);
    let parent = Track::new(TrackId(1), ClockDomain::Metered, 1920).with_events(vec![Event::new(
        0u32,
        0,
        EventKind::Sequence { track: TrackId(2), duration: Some(1440), interruptible: false },
    )]);
    let mut group = group_over(vec![parent, child]);
    let mut sink = CaptureSink::new();
    start_and_locate(&mut group, vec![TrackId(1)], &mut sink);

    let outcome = run(&mut group, &mut sink, 10_000);
    assert!(outcome.stopped);
    // The child track is shorter than the requested duration, so it
    // loops over its own length until the window closes.
    assert_eq!(ons(&sink), vec![(72, 0), (72, 480), (72, 960)]);
}

#[test]
fn real_domain_track_dispatches_in_milliseconds() {
    let track = Track::new(TrackId(1), ClockDomain::Real, 1000)
        .with_events(vec![note(250, 60, 500)]);
    let mut group = group_over(vec![track]);
    let mut sink = CaptureSink::new();
    start_and_locate(&mut group, vec![TrackId(1)], &mut sink);

    let outcome = run(&mut group, &mut sink, 5000);
    assert!(outcome.stopped);
    assert_eq!(ons(&sink), vec![(60, 250)]);
    assert_eq!(sink.note_offs()[0].due.0, 750);
}

#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<OutputCommand>>>);

impl OutputSink for SharedSink {
    fn send(&mut self, command: OutputCommand) {
        self.0.lock().push(command);
    }
}

#[test]
fn engine_plays_a_short_song_and_reports_stop() {
    // One note of 96 ticks at 120 BPM, about 100 ms of wall time.
    let store = Arc::new(TrackStore::new());
    store.insert(
        Track::new(TrackId(1), ClockDomain::Metered, 96).with_events(vec![note(0, 60, 96)]),
    );
    let sink = SharedSink::default();
    let commands = sink.0.clone();
    let engine = spawn_engine(store, Arc::new(DestinationTable::default()), Box::new(sink));

    let group = GroupId(1);
    engine.send(EngineCommand::Start {
        group,
        tracks: vec![TrackId(1)],
        target: 0.0,
        domain: ClockDomain::Metered,
        duration: None,
        sync: SyncMode::Immediate,
        options: StartOptions::default(),
    });

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut stopped = false;
    while std::time::Instant::now() < deadline {
        match engine.update_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(EngineUpdate::PlaybackState { playing: false, .. }) => {
                stopped = true;
                break;
            }
            Ok(_) => {}
            Err(_) => {}
        }
    }
    assert!(stopped, "engine never reported the group stopping");
    assert!(!engine.is_running(group));
    engine.quit();

    let sent = commands.lock();
    let note_ons = sent
        .iter()
        .filter(|c| matches!(c.kind, EventKind::NoteOn { .. }))
        .count();
    assert_eq!(note_ons, 1);
    assert!(sent.iter().any(|c| matches!(c.kind, EventKind::NoteOff { .. })));
}
