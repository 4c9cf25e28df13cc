use thiserror::Error;

/// Failures turning a user query into a playable track.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no results found")]
    NoResults,
    #[error("lookup failed: {0}")]
    LookupFailure(String),
    #[error("lookup timed out")]
    TimedOut,
}

/// Failures from the playback engine and the audio backend. Precondition
/// variants are reported straight back to the invoking user; `Sink` is
/// absorbed into normal queue advancement.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("not connected to a voice channel")]
    NotConnected,
    #[error("nothing is currently playing")]
    NothingPlaying,
    #[error("playback is already paused")]
    AlreadyPaused,
    #[error("playback is not paused")]
    NotPaused,
    #[error("audio sink error: {0}")]
    Sink(String),
    #[error("playback engine is no longer running")]
    EngineClosed,
}
