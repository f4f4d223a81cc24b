//! VOICEVOX speaker box: turns text (or a generated reply to it) into
//! ordered, streamed speech on the local audio device.

pub mod backends;
pub mod config_loader;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod http;
pub mod lease;
pub mod pipeline;
pub mod reply;
pub mod segmenter;
pub mod speaker_box;
pub mod telemetry;
pub mod text;

pub use error::SpeakError;
pub use speaker_box::{SpeakRequest, SpeakResult, SpeakerBox};
