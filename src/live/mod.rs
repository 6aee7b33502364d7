//! Live duplex voice session: one worker thread owning the socket, the
//! microphone stream and the playback scheduler.

pub mod capture;
pub mod wire;

pub use wire::InboundEvent;

use anyhow::Result;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, Mutex,
};
use std::time::{Duration, Instant};

use crate::audio::{samples_to_bytes, PcmBuffer};
use crate::config::{Config, OUTPUT_SAMPLE_RATE};
use crate::error::VoiceError;
use crate::playback::{PlaybackDevice, StreamScheduler, WallClock};
use crate::transcript::{Reconciler, Transcript};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

struct ActiveSession {
    stop_signal: Arc<AtomicBool>,
    flush_playback: Arc<AtomicBool>,
    thread: std::thread::JoinHandle<()>,
}

/// Owns the lifecycle of the live session worker. All methods are safe to
/// call from any thread; the socket and audio streams live on the worker.
pub struct LiveSessionManager {
    transcript: Transcript,
    state: Arc<Mutex<ConnectionState>>,
    // The channel does not report a source language today; the slot stays
    // empty until a collaborator supplies one.
    detected_language: Arc<Mutex<Option<String>>>,
    active: Mutex<Option<ActiveSession>>,
}

impl LiveSessionManager {
    pub fn new(transcript: Transcript) -> Self {
        Self {
            transcript,
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            detected_language: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    pub fn detected_language(&self) -> Option<String> {
        self.detected_language.lock().unwrap().clone()
    }

    /// Start a session. Credentials are checked before anything is spawned
    /// so a missing key never leaves a half-open session behind.
    pub fn connect(&self, config: &Config) -> Result<(), VoiceError> {
        if config.gemini_api_key.trim().is_empty() {
            *self.state.lock().unwrap() = ConnectionState::Error;
            self.transcript
                .push_system("No API key configured. Add your Gemini API key to connect.");
            return Err(VoiceError::MissingCredentials);
        }

        self.disconnect();
        *self.state.lock().unwrap() = ConnectionState::Connecting;

        let stop_signal = Arc::new(AtomicBool::new(false));
        let flush_playback = Arc::new(AtomicBool::new(false));

        let config = config.clone();
        let transcript = self.transcript.clone();
        let state = self.state.clone();
        let stop = stop_signal.clone();
        let flush = flush_playback.clone();

        let thread = std::thread::Builder::new()
            .name("live-session".to_string())
            .spawn(move || {
                match run_session(&config, &transcript, &state, &stop, &flush) {
                    Ok(()) => {
                        *state.lock().unwrap() = ConnectionState::Disconnected;
                    }
                    Err(e) => {
                        log::error!("[LiveSession] session failed: {}", e);
                        transcript.push_system(&format!("Connection error: {}", e));
                        *state.lock().unwrap() = ConnectionState::Error;
                    }
                }
            })
            .map_err(|e| VoiceError::Channel(e.to_string()))?;

        *self.active.lock().unwrap() = Some(ActiveSession {
            stop_signal,
            flush_playback,
            thread,
        });

        Ok(())
    }

    /// Stop the session and wait for the worker to release its devices.
    /// Calling with no session running is a no-op.
    pub fn disconnect(&self) {
        let session = self.active.lock().unwrap().take();
        if let Some(session) = session {
            session.stop_signal.store(true, Ordering::SeqCst);
            if session.thread.join().is_err() {
                log::warn!("[LiveSession] worker thread panicked");
                *self.state.lock().unwrap() = ConnectionState::Error;
            }
        }
    }

    /// Drop all reply audio that has not played yet. The session keeps
    /// running; the next reply chunk starts a fresh timeline.
    pub fn stop_playback(&self) {
        if let Some(session) = self.active.lock().unwrap().as_ref() {
            session.flush_playback.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for LiveSessionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// One normalized read attempt on the live channel.
enum ChannelRead {
    Message(String),
    /// Nothing arrived within the read timeout.
    Quiet,
    Closed,
}

trait TextChannel {
    fn read_message(&mut self) -> Result<ChannelRead>;
}

impl TextChannel for wire::LiveSocket {
    fn read_message(&mut self) -> Result<ChannelRead> {
        match self.read() {
            Ok(tungstenite::Message::Text(msg)) => Ok(ChannelRead::Message(msg.to_string())),
            Ok(tungstenite::Message::Binary(data)) => Ok(match String::from_utf8(data.to_vec()) {
                Ok(text) => ChannelRead::Message(text),
                Err(_) => ChannelRead::Quiet,
            }),
            Ok(tungstenite::Message::Close(_)) => Ok(ChannelRead::Closed),
            Ok(_) => Ok(ChannelRead::Quiet),
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(ChannelRead::Quiet)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn run_session(
    config: &Config,
    transcript: &Transcript,
    state: &Arc<Mutex<ConnectionState>>,
    stop_signal: &Arc<AtomicBool>,
    flush_playback: &Arc<AtomicBool>,
) -> Result<()> {
    let mut socket = wire::connect_live_socket(&config.gemini_api_key)?;
    wire::send_session_setup(&mut socket, config)?;

    match complete_setup(&mut socket, stop_signal, state) {
        Ok(true) => {}
        Ok(false) => {
            // Cancelled before the server acked setup.
            let _ = socket.close(None);
            return Ok(());
        }
        Err(e) => {
            let _ = socket.close(None);
            return Err(e);
        }
    }

    let result = run_connected(&mut socket, config, transcript, stop_signal, flush_playback);
    let _ = socket.close(None);
    result
}

/// Block until the server acknowledges setup, then publish the Connected
/// state. Returns Ok(false) if the session was cancelled while waiting.
fn complete_setup(
    channel: &mut impl TextChannel,
    stop_signal: &Arc<AtomicBool>,
    state: &Arc<Mutex<ConnectionState>>,
) -> Result<bool> {
    let setup_start = Instant::now();
    loop {
        if stop_signal.load(Ordering::SeqCst) {
            return Ok(false);
        }

        match channel.read_message()? {
            ChannelRead::Message(msg) => {
                if wire::is_setup_complete(&msg) {
                    *state.lock().unwrap() = ConnectionState::Connected;
                    return Ok(true);
                }
                if let Some(error) = wire::parse_server_error(&msg) {
                    return Err(anyhow::anyhow!("Setup rejected: {}", error));
                }
            }
            ChannelRead::Quiet => {
                if setup_start.elapsed() > Duration::from_secs(30) {
                    return Err(anyhow::anyhow!("Setup timeout - no response from server"));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            ChannelRead::Closed => {
                return Err(anyhow::anyhow!("Connection closed during setup"));
            }
        }
    }
}

fn run_connected(
    socket: &mut wire::LiveSocket,
    config: &Config,
    transcript: &Transcript,
    stop_signal: &Arc<AtomicBool>,
    flush_playback: &Arc<AtomicBool>,
) -> Result<()> {
    // Short read timeout so the loop can interleave socket reads with
    // microphone frames and control flags.
    wire::set_read_timeout(socket, Duration::from_millis(50))?;

    let device = Arc::new(PlaybackDevice::open(OUTPUT_SAMPLE_RATE)?);
    let mut scheduler = StreamScheduler::new(device, Arc::new(WallClock::new()));

    let (frame_tx, frame_rx) = mpsc::channel::<Vec<i16>>();
    let _capture_stream = capture::start_capture(frame_tx, stop_signal.clone())?;

    let mut reconciler = Reconciler::new();
    log::info!("[LiveSession] connected, voice={}", config.voice_name);

    loop {
        if stop_signal.load(Ordering::SeqCst) {
            break;
        }

        if flush_playback.swap(false, Ordering::SeqCst) {
            scheduler.stop_all();
        }

        // Push every captured frame before reading, keeping mic latency low.
        while let Ok(frame) = frame_rx.try_recv() {
            wire::send_audio_frame(socket, &samples_to_bytes(&frame))?;
        }

        match TextChannel::read_message(socket)? {
            ChannelRead::Message(msg) => {
                handle_server_message(&msg, transcript, &mut reconciler, &mut scheduler)?;
            }
            ChannelRead::Quiet => {
                std::thread::sleep(Duration::from_millis(10));
            }
            ChannelRead::Closed => {
                log::info!("[LiveSession] connection closed by server");
                break;
            }
        }
    }

    scheduler.stop_all();
    reconciler.close_turn();
    Ok(())
}

fn handle_server_message(
    msg: &str,
    transcript: &Transcript,
    reconciler: &mut Reconciler,
    scheduler: &mut StreamScheduler,
) -> Result<()> {
    if let Some(error) = wire::parse_server_error(msg) {
        return Err(anyhow::anyhow!("Server error: {}", error));
    }

    let events = wire::parse_server_message(msg);
    for event in &events {
        if let InboundEvent::AudioChunk(bytes) = event {
            let chunk = PcmBuffer::new(crate::audio::bytes_to_samples(bytes), OUTPUT_SAMPLE_RATE);
            if !chunk.is_empty() {
                scheduler.enqueue(&chunk);
            }
        }
    }
    reconciler.ingest(&events, transcript);

    Ok(())
}
