//! Runtime configuration: credentials, voice choice and the system prompt.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Live conversation model (duplex websocket, native audio).
pub const LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Non-streaming speech synthesis model (request/response).
pub const TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";

/// Capture rate the live channel expects for microphone audio.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Rate of synthesized audio coming back from the service.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per capture frame pushed to the channel.
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gemini_api_key: String,
    pub voice_name: String,
    pub system_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            voice_name: "Aoede".to_string(),
            system_prompt: String::new(),
        }
    }
}

/// Config file location under the platform config directory.
pub fn config_path() -> PathBuf {
    let config_dir = dirs::config_dir().unwrap_or_default().join("talkbridge");
    let _ = std::fs::create_dir_all(&config_dir);
    config_dir.join("config.json")
}

/// Load config from disk. The `GEMINI_API_KEY` environment variable wins
/// over the file; a missing or malformed file falls back to defaults.
/// Credentials are validated fail-fast at connect/synthesis time, not here.
pub fn load_config() -> Config {
    let mut config: Config = std::fs::read_to_string(config_path())
        .ok()
        .and_then(|data| serde_json::from_str(&data).ok())
        .unwrap_or_default();
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        if !key.trim().is_empty() {
            config.gemini_api_key = key;
        }
    }
    config
}

pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(config_path(), data)?;
    Ok(())
}
