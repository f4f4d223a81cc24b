use thiserror::Error;

/// Request-fatal conditions surfaced to the caller.
#[derive(Debug, Error)]
pub enum SpeakError {
    #[error("text is required")]
    EmptyInput,

    #[error("queue full")]
    Overloaded,

    #[error("request cancelled before it reached the pipeline")]
    Cancelled,

    #[error("pipeline lease unavailable: {0}")]
    Lease(#[from] std::io::Error),
}

/// Failure of one reply-generation attempt. Always recovered by the fallback line.
#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("failed to start reply generator: {0}")]
    Spawn(std::io::Error),

    #[error("reply generator timed out after {0}s")]
    Timeout(u64),

    #[error("reply generator exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("reply generator returned an empty response")]
    Empty,

    #[error("reply rejected by shaping rules: {0}")]
    Malformed(String),
}

/// Failure of one synthesis call against the speech engine.
#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("speech engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("speech engine returned {status} for {endpoint}")]
    Status { endpoint: &'static str, status: u16 },

    #[error("speech engine returned invalid audio: {0}")]
    InvalidAudio(String),

    #[error("Speaker not found: {0}")]
    SpeakerNotFound(String),
}

/// Failure of an audio output mechanism.
#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("No audio player found. Set player_command or install pw-play/paplay/aplay.")]
    NoPlayer,

    #[error("failed to run {player}: {source}")]
    Spawn {
        player: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{player} exited with {status}")]
    ExitStatus { player: String, status: String },

    #[error("{player} did not finish within {secs}s")]
    Timeout { player: String, secs: u64 },

    #[error("audio device error: {0}")]
    Device(String),

    #[error("all audio players failed: {0}")]
    Exhausted(String),
}
