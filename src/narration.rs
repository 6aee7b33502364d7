//! On-demand narration: split a message into speakable units, synthesize
//! them one at a time and stream them out gaplessly.

use anyhow::Result;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use crate::audio::{decode_wire_audio, PcmBuffer};
use crate::client::UREQ_AGENT;
use crate::config::{Config, OUTPUT_SAMPLE_RATE, TTS_MODEL};
use crate::error::VoiceError;
use crate::playback::{AudioOut, PlaybackDevice};
use crate::transcript::{Message, Transcript};

const NARRATION_FAILED_MESSAGE: &str = "Sorry, I couldn't read that aloud.";

/// Turns one unit of text into a playable buffer. `Ok(None)` means the
/// service produced no audio for this unit; the unit is skipped, not fatal.
pub trait SpeechSynthesizer: Send + Sync {
    fn synthesize(&self, text: &str, voice: &str) -> Result<Option<PcmBuffer>>;
}

/// Request/response synthesis over the HTTP generateContent API.
pub struct GeminiSynthesizer {
    api_key: String,
}

impl GeminiSynthesizer {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

impl SpeechSynthesizer for GeminiSynthesizer {
    fn synthesize(&self, text: &str, voice: &str) -> Result<Option<PcmBuffer>> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            TTS_MODEL
        );

        let payload = serde_json::json!({
            "contents": [{
                "parts": [{ "text": text }]
            }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": {
                            "voiceName": voice
                        }
                    }
                }
            }
        });

        let resp = UREQ_AGENT
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .send_json(payload)?;

        let reader = std::io::BufReader::new(resp.into_body().into_reader());
        let json: serde_json::Value = serde_json::from_reader(reader)?;

        let b64 = json
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .and_then(|parts| {
                parts.iter().find_map(|part| {
                    part.get("inlineData")
                        .and_then(|d| d.get("data"))
                        .and_then(|d| d.as_str())
                })
            });

        match b64 {
            // A payload that fails to decode counts as "no audio" for this
            // unit, not a fatal failure.
            Some(data) => match decode_wire_audio(data, OUTPUT_SAMPLE_RATE) {
                Ok(buffer) if !buffer.is_empty() => Ok(Some(buffer)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }
}

/// Split text into narration units at sentence punctuation and newlines.
/// Text with no terminator at all becomes a single unit.
pub fn split_units(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | '\n') {
            if !current.trim().is_empty() {
                units.push(current.clone());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        units.push(current);
    }

    units
}

struct ActiveNarration {
    message_id: u64,
    generation: u64,
}

type DeviceFactory = Box<dyn Fn() -> Result<Arc<dyn AudioOut>, VoiceError> + Send + Sync>;

/// Drives read-aloud requests. At most one narration runs at a time; a new
/// request replaces the running one, and a request for the message already
/// playing toggles it off.
pub struct NarrationManager {
    transcript: Transcript,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voice: Mutex<String>,
    generation: AtomicU64,
    active: Mutex<Option<ActiveNarration>>,
    loading_id: Mutex<Option<u64>>,
    playing_id: Mutex<Option<u64>>,
    device: Mutex<Option<Arc<dyn AudioOut>>>,
    device_factory: DeviceFactory,
}

impl NarrationManager {
    pub fn new(config: &Config, transcript: Transcript) -> Self {
        Self::with_backend(
            transcript,
            Arc::new(GeminiSynthesizer::new(config.gemini_api_key.clone())),
            config.voice_name.clone(),
            Box::new(|| {
                let device = PlaybackDevice::open(OUTPUT_SAMPLE_RATE)?;
                Ok(Arc::new(device) as Arc<dyn AudioOut>)
            }),
        )
    }

    pub fn with_backend(
        transcript: Transcript,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voice: String,
        device_factory: DeviceFactory,
    ) -> Self {
        Self {
            transcript,
            synthesizer,
            voice: Mutex::new(voice),
            generation: AtomicU64::new(0),
            active: Mutex::new(None),
            loading_id: Mutex::new(None),
            playing_id: Mutex::new(None),
            device: Mutex::new(None),
            device_factory,
        }
    }

    /// Message currently being synthesized, if any.
    pub fn loading_id(&self) -> Option<u64> {
        *self.loading_id.lock().unwrap()
    }

    /// Message currently playing or queued, if any.
    pub fn playing_id(&self) -> Option<u64> {
        *self.playing_id.lock().unwrap()
    }

    /// Start narrating a message. Requesting the message that is already
    /// narrating stops it instead.
    pub fn read_aloud(self: &Arc<Self>, message: &Message) {
        {
            let active = self.active.lock().unwrap();
            if let Some(narration) = active.as_ref() {
                if narration.message_id == message.id {
                    drop(active);
                    self.stop();
                    return;
                }
            }
        }

        self.stop();

        let units = split_units(&message.text);
        if units.is_empty() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.active.lock().unwrap() = Some(ActiveNarration {
            message_id: message.id,
            generation,
        });
        *self.loading_id.lock().unwrap() = Some(message.id);
        *self.playing_id.lock().unwrap() = Some(message.id);

        let manager = self.clone();
        let spawned = std::thread::Builder::new()
            .name("narration-pump".to_string())
            .spawn(move || {
                manager.pump(generation, units);
            });
        if spawned.is_err() {
            log::error!("[Narration] failed to spawn pump thread");
            self.stop();
        }
    }

    /// Stop the current narration and flush any queued audio. Idempotent.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.active.lock().unwrap() = None;
        *self.loading_id.lock().unwrap() = None;
        *self.playing_id.lock().unwrap() = None;
        if let Some(device) = self.device.lock().unwrap().as_ref() {
            device.clear();
        }
    }

    pub fn set_voice(&self, voice: &str) {
        *self.voice.lock().unwrap() = voice.to_string();
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Reuse the open output device or acquire a fresh one.
    fn ensure_device(&self) -> Result<Arc<dyn AudioOut>, VoiceError> {
        let mut slot = self.device.lock().unwrap();
        if let Some(device) = slot.as_ref() {
            if device.is_open() {
                return Ok(device.clone());
            }
        }
        let device = (self.device_factory)()?;
        *slot = Some(device.clone());
        Ok(device)
    }

    fn pump(&self, generation: u64, units: Vec<String>) {
        let device = match self.ensure_device() {
            Ok(device) => device,
            Err(e) => {
                self.abort(generation, e);
                return;
            }
        };

        let voice = self.voice.lock().unwrap().clone();

        for unit in units {
            if !self.is_current(generation) {
                return;
            }

            let audio = match self.synthesizer.synthesize(&unit, &voice) {
                Ok(audio) => audio,
                Err(e) => {
                    self.abort(generation, VoiceError::Synthesis(e.to_string()));
                    return;
                }
            };

            if !self.is_current(generation) {
                return;
            }

            let buffer = match audio {
                Some(buffer) if !buffer.is_empty() => buffer,
                // No audio for this unit, move on to the next.
                _ => continue,
            };

            {
                // First audible unit: synthesis latency is behind us. The
                // generation is re-checked under the lock so a stale pump
                // cannot clear a replacement's loading marker.
                let mut loading = self.loading_id.lock().unwrap();
                if !self.is_current(generation) {
                    return;
                }
                loading.take();
            }

            device.write(&buffer.samples);

            // Wait for this unit to drain before synthesizing the next, so
            // a stop request takes effect between units.
            while device.pending() > 0 {
                if !self.is_current(generation) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        self.finish(generation);
    }

    fn abort(&self, generation: u64, error: VoiceError) {
        if !self.is_current(generation) {
            return;
        }
        log::error!("[Narration] {}", error);
        self.transcript.push_system(NARRATION_FAILED_MESSAGE);
        self.stop();
    }

    fn finish(&self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        *self.active.lock().unwrap() = None;
        *self.loading_id.lock().unwrap() = None;
        *self.playing_id.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::MessageAuthor;

    struct FakeSynth {
        responses: Mutex<Vec<Result<Option<PcmBuffer>, String>>>,
        calls: Mutex<Vec<String>>,
        voices: Mutex<Vec<String>>,
    }

    impl FakeSynth {
        fn new(responses: Vec<Result<Option<PcmBuffer>, String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
                voices: Mutex::new(Vec::new()),
            })
        }
    }

    impl SpeechSynthesizer for FakeSynth {
        fn synthesize(&self, text: &str, voice: &str) -> Result<Option<PcmBuffer>> {
            self.calls.lock().unwrap().push(text.to_string());
            self.voices.lock().unwrap().push(voice.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(Some(PcmBuffer::new(vec![0], 24_000)));
            }
            responses.remove(0).map_err(|e| anyhow::anyhow!(e))
        }
    }

    struct FakeOut {
        written: Mutex<Vec<i16>>,
        clears: Mutex<u32>,
    }

    impl FakeOut {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(Vec::new()),
                clears: Mutex::new(0),
            })
        }
    }

    impl AudioOut for FakeOut {
        fn write(&self, samples: &[i16]) {
            self.written.lock().unwrap().extend_from_slice(samples);
        }

        fn clear(&self) {
            *self.clears.lock().unwrap() += 1;
        }

        // Drains instantly so pump tests never block.
        fn pending(&self) -> usize {
            0
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn manager_with(
        transcript: Transcript,
        synth: Arc<FakeSynth>,
        out: Arc<FakeOut>,
    ) -> Arc<NarrationManager> {
        Arc::new(NarrationManager::with_backend(
            transcript,
            synth,
            "Aoede".to_string(),
            Box::new(move || Ok(out.clone() as Arc<dyn AudioOut>)),
        ))
    }

    fn message(id: u64, text: &str) -> Message {
        Message {
            id,
            author: MessageAuthor::Assistant,
            text: text.to_string(),
            is_loading: false,
            language: None,
        }
    }

    #[test]
    fn splits_on_sentence_punctuation_and_newlines() {
        let units = split_units("One. Two!\nThree? tail");
        assert_eq!(units, vec!["One.", " Two!", "Three?", " tail"]);
    }

    #[test]
    fn three_sentences_make_three_units() {
        let units = split_units("Hello there. How are you? Great!");
        let trimmed: Vec<&str> = units.iter().map(|u| u.trim()).collect();
        assert_eq!(trimmed, vec!["Hello there.", "How are you?", "Great!"]);
    }

    #[test]
    fn text_without_terminators_is_one_unit() {
        assert_eq!(split_units("no punctuation here"), vec!["no punctuation here"]);
    }

    #[test]
    fn whitespace_text_has_no_units() {
        assert!(split_units("   ").is_empty());
        assert!(split_units("").is_empty());
    }

    #[test]
    fn pump_synthesizes_every_unit_in_order() {
        let synth = FakeSynth::new(vec![]);
        let out = FakeOut::new();
        let manager = manager_with(Transcript::new(), synth.clone(), out.clone());

        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *manager.active.lock().unwrap() = Some(ActiveNarration {
            message_id: 1,
            generation,
        });
        manager.pump(generation, vec!["One.".to_string(), " Two.".to_string()]);

        assert_eq!(*synth.calls.lock().unwrap(), vec!["One.", " Two."]);
        assert_eq!(out.written.lock().unwrap().len(), 2);
        assert!(manager.active.lock().unwrap().is_none());
    }

    #[test]
    fn empty_synthesis_skips_the_unit_and_continues() {
        let synth = FakeSynth::new(vec![
            Ok(None),
            Ok(Some(PcmBuffer::new(vec![1], 24_000))),
        ]);
        let out = FakeOut::new();
        let manager = manager_with(Transcript::new(), synth.clone(), out.clone());

        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        manager.pump(generation, vec!["a.".to_string(), "b.".to_string()]);

        assert_eq!(synth.calls.lock().unwrap().len(), 2);
        assert_eq!(*out.written.lock().unwrap(), vec![1]);
    }

    #[test]
    fn synthesis_error_posts_system_message_and_stops() {
        let transcript = Transcript::new();
        let synth = FakeSynth::new(vec![Err("boom".to_string())]);
        let out = FakeOut::new();
        let manager = manager_with(transcript.clone(), synth, out.clone());

        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        manager.pump(generation, vec!["a.".to_string(), "b.".to_string()]);

        let messages = transcript.snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].author, MessageAuthor::System);
        assert_eq!(messages[0].text, NARRATION_FAILED_MESSAGE);
        assert!(out.written.lock().unwrap().is_empty());
        assert!(manager.playing_id().is_none());
    }

    #[test]
    fn stale_generation_does_nothing() {
        let transcript = Transcript::new();
        let synth = FakeSynth::new(vec![]);
        let out = FakeOut::new();
        let manager = manager_with(transcript.clone(), synth.clone(), out.clone());

        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        manager.stop();
        manager.pump(generation, vec!["a.".to_string()]);

        assert!(synth.calls.lock().unwrap().is_empty());
        assert!(transcript.is_empty());
    }

    #[test]
    fn read_aloud_same_message_toggles_off() {
        let synth = FakeSynth::new(vec![]);
        let out = FakeOut::new();
        let manager = manager_with(Transcript::new(), synth, out);

        // Install an active narration directly so the pump thread cannot
        // finish it before the toggle is exercised.
        *manager.active.lock().unwrap() = Some(ActiveNarration {
            message_id: 7,
            generation: manager.generation.load(Ordering::SeqCst),
        });
        *manager.playing_id.lock().unwrap() = Some(7);

        manager.read_aloud(&message(7, "Hello."));

        assert!(manager.active.lock().unwrap().is_none());
        assert!(manager.playing_id().is_none());
    }

    #[test]
    fn read_aloud_different_message_replaces_the_active_one() {
        let synth = FakeSynth::new(vec![]);
        let out = FakeOut::new();
        let manager = manager_with(Transcript::new(), synth.clone(), out.clone());

        let old_generation = manager.generation.load(Ordering::SeqCst);
        *manager.active.lock().unwrap() = Some(ActiveNarration {
            message_id: 7,
            generation: old_generation,
        });
        *manager.playing_id.lock().unwrap() = Some(7);
        *manager.device.lock().unwrap() = Some(out.clone() as Arc<dyn AudioOut>);

        manager.read_aloud(&message(8, "New text."));

        // The replaced narration's queued audio was flushed once, up front.
        assert_eq!(*out.clears.lock().unwrap(), 1);

        // Any continuation of the old narration is now a no-op.
        manager.pump(old_generation, vec!["Old text.".to_string()]);
        assert!(!synth.calls.lock().unwrap().iter().any(|c| c == "Old text."));

        for _ in 0..200 {
            if manager.active.lock().unwrap().is_none() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*synth.calls.lock().unwrap(), vec!["New text."]);
        assert!(manager.playing_id().is_none());
    }

    #[test]
    fn set_voice_applies_to_subsequent_synthesis() {
        let synth = FakeSynth::new(vec![]);
        let out = FakeOut::new();
        let manager = manager_with(Transcript::new(), synth.clone(), out);

        manager.set_voice("Puck");
        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        manager.pump(generation, vec!["a.".to_string()]);

        assert_eq!(*synth.voices.lock().unwrap(), vec!["Puck"]);
    }

    struct InterruptingSynth {
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl SpeechSynthesizer for InterruptingSynth {
        fn synthesize(&self, _text: &str, _voice: &str) -> Result<Option<PcmBuffer>> {
            if let Some(hook) = self.hook.lock().unwrap().take() {
                hook();
            }
            Ok(Some(PcmBuffer::new(vec![0], 24_000)))
        }
    }

    #[test]
    fn stale_pump_never_clears_the_replacements_loading_id() {
        let out = FakeOut::new();
        let synth = Arc::new(InterruptingSynth {
            hook: Mutex::new(None),
        });
        let factory_out = out.clone();
        let manager = Arc::new(NarrationManager::with_backend(
            Transcript::new(),
            synth.clone(),
            "Aoede".to_string(),
            Box::new(move || Ok(factory_out.clone() as Arc<dyn AudioOut>)),
        ));

        let generation = manager.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *manager.loading_id.lock().unwrap() = Some(1);

        // Mid-synthesis, a replacement request stops this narration and
        // claims the loading marker for itself.
        let hijack = manager.clone();
        *synth.hook.lock().unwrap() = Some(Box::new(move || {
            hijack.stop();
            *hijack.loading_id.lock().unwrap() = Some(2);
        }));

        manager.pump(generation, vec!["a.".to_string()]);

        assert_eq!(*manager.loading_id.lock().unwrap(), Some(2));
        assert!(out.written.lock().unwrap().is_empty());
    }

    #[test]
    fn read_aloud_empty_message_is_a_noop() {
        let synth = FakeSynth::new(vec![]);
        let out = FakeOut::new();
        let manager = manager_with(Transcript::new(), synth.clone(), out);

        manager.read_aloud(&message(1, "   "));

        assert!(manager.active.lock().unwrap().is_none());
        assert!(manager.playing_id().is_none());
    }

    #[test]
    fn stop_is_idempotent_and_clears_device() {
        let synth = FakeSynth::new(vec![]);
        let out = FakeOut::new();
        let manager = manager_with(Transcript::new(), synth, out.clone());

        *manager.device.lock().unwrap() = Some(out.clone() as Arc<dyn AudioOut>);
        manager.stop();
        manager.stop();

        assert_eq!(*out.clears.lock().unwrap(), 2);
        assert!(manager.loading_id().is_none());
    }
}
