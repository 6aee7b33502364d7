//! WebSocket connection and message codec for the live voice channel.

use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use native_tls::TlsStream;
use std::net::TcpStream;
use std::time::Duration;
use tungstenite::WebSocket;

use crate::config::{Config, LIVE_MODEL};

pub type LiveSocket = WebSocket<TlsStream<TcpStream>>;

/// One semantic event folded out of a server message. A single wire message
/// can yield several of these; order within the message is preserved.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEvent {
    /// Partial transcription of the user's microphone audio.
    UserTranscript(String),
    /// Partial transcription of the model's spoken reply.
    AssistantTranscript(String),
    /// Raw 16-bit PCM bytes of synthesized reply audio.
    AudioChunk(Vec<u8>),
    /// The current conversational turn is finished.
    TurnComplete,
}

/// Create the TLS WebSocket connection to the live API.
pub fn connect_live_socket(api_key: &str) -> Result<LiveSocket> {
    let ws_url = format!(
        "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent?key={}",
        api_key
    );

    let url = url::Url::parse(&ws_url)?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("No host in URL"))?;
    let port = 443;

    use std::net::ToSocketAddrs;
    let addr = format!("{}:{}", host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve hostname: {}", host))?;

    let tcp_stream = TcpStream::connect_timeout(&addr, Duration::from_secs(10))?;
    tcp_stream.set_read_timeout(Some(Duration::from_secs(30)))?;
    tcp_stream.set_write_timeout(Some(Duration::from_secs(30)))?;
    tcp_stream.set_nodelay(true)?;

    let connector = native_tls::TlsConnector::new()?;
    let tls_stream = connector.connect(host, tcp_stream)?;

    let (socket, _response) = tungstenite::client::client(&ws_url, tls_stream)?;

    Ok(socket)
}

/// Adjust the read timeout on the underlying TCP stream. Setup waits use a
/// long timeout; the steady-state loop polls with a short one.
pub fn set_read_timeout(socket: &mut LiveSocket, timeout: Duration) -> Result<()> {
    socket
        .get_mut()
        .get_mut()
        .set_read_timeout(Some(timeout))?;
    Ok(())
}

/// Send the session setup message. The native audio model requires the
/// AUDIO response modality; both transcription directions are enabled so
/// the conversation can be reconciled into text.
pub fn send_session_setup(socket: &mut LiveSocket, config: &Config) -> Result<()> {
    let mut setup = serde_json::json!({
        "setup": {
            "model": format!("models/{}", LIVE_MODEL),
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": {
                            "voiceName": config.voice_name
                        }
                    }
                }
            },
            "inputAudioTranscription": {},
            "outputAudioTranscription": {}
        }
    });

    if !config.system_prompt.trim().is_empty() {
        setup["setup"]["systemInstruction"] = serde_json::json!({
            "parts": [{
                "text": config.system_prompt
            }]
        });
    }

    socket.write(tungstenite::Message::Text(setup.to_string().into()))?;
    socket.flush()?;

    Ok(())
}

/// Push one microphone frame to the channel as base64 PCM.
pub fn send_audio_frame(socket: &mut LiveSocket, pcm_bytes: &[u8]) -> Result<()> {
    let b64_audio = general_purpose::STANDARD.encode(pcm_bytes);
    let msg = serde_json::json!({
        "realtime_input": {
            "media_chunks": [{
                "data": b64_audio,
                "mime_type": "audio/pcm;rate=16000"
            }]
        }
    });

    socket.write(tungstenite::Message::Text(msg.to_string().into()))?;
    socket.flush()?;

    Ok(())
}

/// Fold a server message into its semantic events. Transcription fields are
/// not trimmed because leading spaces are intentional word separators;
/// purely-whitespace fragments still pass through so the reconciler can
/// accumulate them. `TurnComplete` is ordered last, matching its meaning.
pub fn parse_server_message(msg: &str) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    let json: serde_json::Value = match serde_json::from_str(msg) {
        Ok(json) => json,
        Err(_) => return events,
    };

    let server_content = match json.get("serverContent") {
        Some(content) => content,
        None => return events,
    };

    if let Some(transcription) = server_content.get("inputTranscription") {
        if let Some(text) = transcription.get("text").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                events.push(InboundEvent::UserTranscript(text.to_string()));
            }
        }
    }

    if let Some(transcription) = server_content.get("outputTranscription") {
        if let Some(text) = transcription.get("text").and_then(|t| t.as_str()) {
            if !text.is_empty() {
                events.push(InboundEvent::AssistantTranscript(text.to_string()));
            }
        }
    }

    if let Some(model_turn) = server_content.get("modelTurn") {
        if let Some(parts) = model_turn.get("parts").and_then(|p| p.as_array()) {
            for part in parts {
                let data = part
                    .get("inlineData")
                    .and_then(|d| d.get("data"))
                    .and_then(|d| d.as_str());
                if let Some(b64) = data {
                    if let Ok(bytes) = general_purpose::STANDARD.decode(b64) {
                        if !bytes.is_empty() {
                            events.push(InboundEvent::AudioChunk(bytes));
                        }
                    }
                }
            }
        }
    }

    if let Some(tc) = server_content.get("turnComplete") {
        if tc.as_bool().unwrap_or(false) {
            events.push(InboundEvent::TurnComplete);
        }
    }

    events
}

/// Check if the message is the server's setup acknowledgement.
pub fn is_setup_complete(msg: &str) -> bool {
    msg.contains("setupComplete")
}

/// Check if the message carries a server-side error.
pub fn parse_server_error(msg: &str) -> Option<String> {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(msg) {
        if let Some(error) = json.get("error") {
            if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
                return Some(message.to_string());
            }
            return Some(error.to_string());
        }
    }
    None
}
