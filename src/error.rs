#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The event stack is at capacity. Non-fatal: callers degrade (a
    /// paired note-off push is skipped as a unit, a wake is retried).
    #[error("event stack is full")]
    StackFull,

    #[error("no MIDI output port matching {0:?}")]
    NoOutputPort(Option<String>),

    #[error("failed to read song file: {0}")]
    SongIo(#[from] std::io::Error),

    #[error("failed to parse song file: {0}")]
    SongParse(#[from] ron::error::SpannedError),

    #[error("failed to serialize song: {0}")]
    SongWrite(#[from] ron::error::Error),

    #[error("MIDI output error: {0}")]
    Midi(String),
}
