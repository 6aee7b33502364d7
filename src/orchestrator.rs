//! Top-level facade tying the live session and narration together over one
//! shared transcript.

use std::sync::Arc;

use crate::config::Config;
use crate::error::VoiceError;
use crate::live::{ConnectionState, LiveSessionManager};
use crate::narration::NarrationManager;
use crate::transcript::{Message, Transcript};

pub struct VoiceOrchestrator {
    config: Config,
    transcript: Transcript,
    live: LiveSessionManager,
    narrator: Arc<NarrationManager>,
}

impl VoiceOrchestrator {
    pub fn new(config: Config) -> Self {
        let transcript = Transcript::new();
        let live = LiveSessionManager::new(transcript.clone());
        let narrator = Arc::new(NarrationManager::new(&config, transcript.clone()));
        Self {
            config,
            transcript,
            live,
            narrator,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Ordered snapshot of the reconciled conversation.
    pub fn messages(&self) -> Vec<Message> {
        self.transcript.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.live.state()
    }

    pub fn narrating_id(&self) -> Option<u64> {
        self.narrator.playing_id()
    }

    /// Message whose narration audio is still being synthesized.
    pub fn narration_loading_id(&self) -> Option<u64> {
        self.narrator.loading_id()
    }

    pub fn detected_language(&self) -> Option<String> {
        self.live.detected_language()
    }

    /// Open a live session. Any running narration is silenced first so the
    /// conversation does not talk over it.
    pub fn connect(&self) -> Result<(), VoiceError> {
        self.narrator.stop();
        self.live.connect(&self.config)
    }

    pub fn disconnect(&self) {
        self.live.disconnect();
    }

    /// Narrate a transcript message by id. Reply audio still streaming from
    /// the live session is flushed so the two never overlap. Unknown ids
    /// are ignored.
    pub fn read_aloud(&self, message_id: u64) {
        let message: Message = match self.transcript.get(message_id) {
            Some(message) => message,
            None => return,
        };
        self.live.stop_playback();
        self.narrator.read_aloud(&message);
    }

    pub fn stop_narration(&self) {
        self.narrator.stop();
    }

    /// Change the synthesized voice for future sessions and narrations.
    /// A session already connected keeps the voice it was opened with.
    pub fn set_voice(&mut self, voice: &str) {
        self.config.voice_name = voice.to_string();
        self.narrator.set_voice(voice);
    }
}

impl Drop for VoiceOrchestrator {
    fn drop(&mut self) {
        self.narrator.stop();
        self.live.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::MessageAuthor;

    #[test]
    fn read_aloud_with_unknown_id_is_a_noop() {
        let orchestrator = VoiceOrchestrator::new(Config::default());
        orchestrator.read_aloud(42);
        assert!(orchestrator.narrating_id().is_none());
    }

    #[test]
    fn connect_without_credentials_surfaces_the_error() {
        let orchestrator = VoiceOrchestrator::new(Config::default());
        assert!(matches!(
            orchestrator.connect(),
            Err(VoiceError::MissingCredentials)
        ));
        assert_eq!(orchestrator.connection_state(), ConnectionState::Error);
    }

    #[test]
    fn transcript_is_shared_with_callers() {
        let orchestrator = VoiceOrchestrator::new(Config::default());
        let id = orchestrator
            .transcript()
            .append(MessageAuthor::User, "hello");
        assert_eq!(orchestrator.transcript().get(id).unwrap().text, "hello");
    }
}
