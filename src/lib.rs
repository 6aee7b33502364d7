//! Live voice conversation orchestrator for the Gemini speech APIs.
//!
//! The crate wires four pieces together: a duplex websocket session that
//! streams microphone audio up and reply audio down, a reconciler that folds
//! partial transcriptions into a stable transcript, a gapless playback
//! scheduler, and an on-demand narration pipeline that reads transcript
//! messages aloud. [`orchestrator::VoiceOrchestrator`] is the entry point.

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod live;
pub mod narration;
pub mod orchestrator;
pub mod playback;
pub mod transcript;

pub use config::{load_config, save_config, Config};
pub use error::VoiceError;
pub use live::ConnectionState;
pub use orchestrator::VoiceOrchestrator;
pub use transcript::{Message, MessageAuthor, Transcript};
