use std::path::Path;
use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use metron::{
    ClockDomain, EngineCommand, EngineUpdate, GroupId, MidirSink, Song, StartOptions, SyncMode,
    spawn_engine,
};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let song_path = args.next().unwrap_or_else(|| "song.ron".into());
    let port_name = args.next();

    let song = match Song::load(Path::new(&song_path)) {
        Ok(song) => song,
        Err(err) => {
            error!(path = %song_path, %err, "could not load song");
            return ExitCode::FAILURE;
        }
    };
    let (store, dests, tempo) = song.compile();

    let sink = match MidirSink::open(port_name.as_deref()) {
        Ok(sink) => sink,
        Err(err) => {
            error!(%err, "could not open MIDI output");
            return ExitCode::FAILURE;
        }
    };

    let engine = spawn_engine(store, dests, Box::new(sink));

    let group = GroupId(1);
    let tracks = song.root_tracks();
    engine.send(EngineCommand::SetTempoMap { group, tempo });
    engine.send(EngineCommand::Start {
        group,
        tracks,
        target: 0.0,
        domain: ClockDomain::Metered,
        duration: None,
        sync: SyncMode::Immediate,
        options: StartOptions::default(),
    });
    info!(song = %song.name, "playing");

    // Block until the group plays out.
    while let Ok(update) = engine.update_rx.recv() {
        if let EngineUpdate::PlaybackState { playing: false, .. } = update {
            break;
        }
    }
    engine.quit();
    ExitCode::SUCCESS
}
