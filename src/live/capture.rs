//! Microphone capture for the live channel.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};

use crate::audio::{downmix_i16_to_mono, downmix_to_mono, resample_linear};
use crate::config::{CAPTURE_FRAME_SAMPLES, INPUT_SAMPLE_RATE};

/// Groups resampled samples into fixed-size channel frames. Device callbacks
/// deliver arbitrary buffer sizes, the channel wants uniform ones.
pub(crate) struct FrameChunker {
    pending: Vec<i16>,
}

impl FrameChunker {
    pub(crate) fn new() -> Self {
        Self {
            pending: Vec::with_capacity(CAPTURE_FRAME_SAMPLES * 2),
        }
    }

    /// Absorb samples and return every complete frame now available.
    pub(crate) fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.pending.len() >= CAPTURE_FRAME_SAMPLES {
            let frame: Vec<i16> = self.pending.drain(..CAPTURE_FRAME_SAMPLES).collect();
            frames.push(frame);
        }
        frames
    }
}

/// Start microphone capture. Complete 16kHz mono frames are sent on
/// `frame_tx`; the returned cpal Stream must be kept alive for the duration
/// of the session and dropped on the thread that created it.
pub fn start_capture(
    frame_tx: mpsc::Sender<Vec<i16>>,
    stop_signal: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow::anyhow!("No microphone available. Please connect a microphone."))?;
    let config = device.default_input_config()?;

    let sample_rate = config.sample_rate();
    let channels = config.channels() as usize;
    let err_fn = |err| log::error!("[Capture] audio stream error: {}", err);

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            let mut chunker = FrameChunker::new();
            device.build_input_stream(
                &config.into(),
                move |data: &[f32], _: &_| {
                    if stop_signal.load(Ordering::Relaxed) {
                        return;
                    }
                    let mono = downmix_to_mono(data, channels);
                    let resampled = resample_linear(&mono, sample_rate, INPUT_SAMPLE_RATE);
                    for frame in chunker.push(&resampled) {
                        if frame_tx.send(frame).is_err() {
                            return;
                        }
                    }
                },
                err_fn,
                None,
            )?
        }
        cpal::SampleFormat::I16 => {
            let mut chunker = FrameChunker::new();
            device.build_input_stream(
                &config.into(),
                move |data: &[i16], _: &_| {
                    if stop_signal.load(Ordering::Relaxed) {
                        return;
                    }
                    let mono = downmix_i16_to_mono(data, channels);
                    let resampled = resample_linear(&mono, sample_rate, INPUT_SAMPLE_RATE);
                    for frame in chunker.push(&resampled) {
                        if frame_tx.send(frame).is_err() {
                            return;
                        }
                    }
                },
                err_fn,
                None,
            )?
        }
        _ => return Err(anyhow::anyhow!("Unsupported audio format")),
    };

    stream.play()?;
    Ok(stream)
}
