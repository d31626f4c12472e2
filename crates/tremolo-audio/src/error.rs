//! Audio error types.

use thiserror::Error;

/// Audio error type.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] symphonia::core::errors::Error),

    #[error("No audio track in file")]
    NoAudioTrack,

    #[error("Unsupported stream parameters: {0}")]
    UnsupportedFormat(&'static str),

    #[error("No default output device")]
    NoOutputDevice,

    #[error("Failed to build output stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("Failed to start output stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("Failed to pause output stream: {0}")]
    PauseStream(#[from] cpal::PauseStreamError),

    #[error("Voice thread is gone")]
    VoiceGone,

    #[error("No voice is active")]
    NoVoice,
}

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
