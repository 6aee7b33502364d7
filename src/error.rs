//! Error taxonomy for the public API surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// Required credentials are absent. Fatal for the attempted call; the
    /// caller surfaces it and does not retry.
    #[error("no API key configured")]
    MissingCredentials,

    /// Transport or remote failure on the live duplex channel.
    #[error("live channel failure: {0}")]
    Channel(String),

    /// An audio input or output device could not be acquired.
    #[error("audio device unavailable: {0}")]
    AudioDevice(String),

    /// The narration pipeline failed as a whole (not a single skipped unit).
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),
}
