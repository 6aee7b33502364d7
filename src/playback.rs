//! Gapless streaming playback: a monotonic scheduler over a FIFO sample sink.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc, Mutex,
};
use std::time::{Duration, Instant};

use crate::audio::PcmBuffer;
use crate::error::VoiceError;

/// Hardware playback rate. Devices that reject 24kHz mono almost always
/// accept 48kHz stereo.
const DEVICE_SAMPLE_RATE: u32 = 48_000;

/// Monotonic clock in the playback timebase.
pub trait DeviceClock: Send + Sync {
    fn now(&self) -> f64;
}

pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceClock for WallClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// A FIFO sample sink backed by an output device. Samples play in the order
/// written; `clear` drops everything not yet played.
pub trait AudioOut: Send + Sync {
    fn write(&self, samples: &[i16]);
    fn clear(&self);
    /// Samples queued but not yet consumed by the device.
    fn pending(&self) -> usize;
    fn is_open(&self) -> bool;
}

struct ScheduledSource {
    start: f64,
    end: f64,
}

/// Books chunk timings so consecutive chunks are seamless. The sink's FIFO
/// ordering makes no-gap/no-overlap structural; the scheduler only tracks
/// when each chunk will be audible.
pub struct StreamScheduler {
    sink: Arc<dyn AudioOut>,
    clock: Arc<dyn DeviceClock>,
    next_start: f64,
    active: Vec<ScheduledSource>,
}

impl StreamScheduler {
    pub fn new(sink: Arc<dyn AudioOut>, clock: Arc<dyn DeviceClock>) -> Self {
        Self {
            sink,
            clock,
            next_start: 0.0,
            active: Vec::new(),
        }
    }

    /// Queue a chunk. Returns the time it is scheduled to become audible:
    /// back-to-back with the previous chunk, or now if the stream drained.
    pub fn enqueue(&mut self, chunk: &PcmBuffer) -> f64 {
        let now = self.clock.now();
        self.active.retain(|s| s.end > now);

        let start = self.next_start.max(now);
        let end = start + chunk.duration_secs();

        self.sink.write(&chunk.samples);
        self.active.push(ScheduledSource { start, end });
        self.next_start = end;

        start
    }

    /// Flush everything and reset the timeline to "start immediately".
    pub fn stop_all(&mut self) {
        self.sink.clear();
        self.active.clear();
        self.next_start = 0.0;
    }

    /// Chunks currently scheduled or playing.
    pub fn active_sources(&mut self) -> usize {
        let now = self.clock.now();
        self.active.retain(|s| s.end > now);
        self.active.len()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

/// An output device wrapped as an [`AudioOut`]. The cpal stream is owned by
/// a dedicated thread because streams cannot move between threads; this
/// struct holds only the shared queue and flags, so it is freely shareable.
pub struct PlaybackDevice {
    queue: Arc<Mutex<VecDeque<i16>>>,
    open: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    source_rate: u32,
}

impl PlaybackDevice {
    /// Open the default output device for mono source audio at `source_rate`.
    /// Fails if no device is available or the stream cannot be built.
    pub fn open(source_rate: u32) -> Result<Self, VoiceError> {
        let queue: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let open = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let queue_thread = queue.clone();
        let open_thread = open.clone();
        let shutdown_thread = shutdown.clone();

        std::thread::Builder::new()
            .name("playback-device".to_string())
            .spawn(move || {
                run_device_thread(queue_thread, open_thread, shutdown_thread, ready_tx);
            })
            .map_err(|e| VoiceError::AudioDevice(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::AudioDevice("playback thread exited".to_string()))?
            .map_err(VoiceError::AudioDevice)?;

        Ok(Self {
            queue,
            open,
            shutdown,
            source_rate,
        })
    }

    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        self.queue.lock().unwrap().clear();
    }
}

impl AudioOut for PlaybackDevice {
    fn write(&self, samples: &[i16]) {
        let mut queue = self.queue.lock().unwrap();
        if self.source_rate * 2 == DEVICE_SAMPLE_RATE {
            // 24kHz source on a 48kHz device: duplicate each sample.
            for &sample in samples {
                queue.push_back(sample);
                queue.push_back(sample);
            }
        } else {
            queue.extend(samples.iter().copied());
        }
    }

    fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }

    fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for PlaybackDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_device_thread(
    queue: Arc<Mutex<VecDeque<i16>>>,
    open: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    ready_tx: mpsc::Sender<Result<(), String>>,
) {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = match host.default_output_device() {
        Some(device) => device,
        None => {
            let _ = ready_tx.send(Err("No audio output device found".to_string()));
            return;
        }
    };

    // Stereo because many devices reject mono; the callback duplicates the
    // mono queue into both channels.
    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: DEVICE_SAMPLE_RATE,
        buffer_size: cpal::BufferSize::Default,
    };

    let queue_cb = queue.clone();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut queue = queue_cb.lock().unwrap();
            for frame in data.chunks_mut(2) {
                let sample = queue.pop_front().unwrap_or(0) as f32 / 32768.0;
                frame[0] = sample;
                frame[1] = sample;
            }
        },
        |err| log::error!("[Playback] audio stream error: {}", err),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("Failed to create output stream: {}", e)));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(format!("Failed to start output stream: {}", e)));
        return;
    }

    open.store(true, Ordering::SeqCst);
    let _ = ready_tx.send(Ok(()));

    // Keep the stream alive until the handle shuts us down.
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct MockClock(pub Mutex<f64>);

    impl MockClock {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(0.0)))
        }

        pub(crate) fn advance(&self, secs: f64) {
            *self.0.lock().unwrap() += secs;
        }
    }

    impl DeviceClock for MockClock {
        fn now(&self) -> f64 {
            *self.0.lock().unwrap()
        }
    }

    pub(crate) struct MockSink {
        pub(crate) written: Mutex<Vec<i16>>,
        pub(crate) cleared: Mutex<u32>,
    }

    impl MockSink {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                written: Mutex::new(Vec::new()),
                cleared: Mutex::new(0),
            })
        }
    }

    impl AudioOut for MockSink {
        fn write(&self, samples: &[i16]) {
            self.written.lock().unwrap().extend_from_slice(samples);
        }

        fn clear(&self) {
            *self.cleared.lock().unwrap() += 1;
            self.written.lock().unwrap().clear();
        }

        fn pending(&self) -> usize {
            0
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    fn chunk(secs: f64) -> PcmBuffer {
        PcmBuffer::new(vec![0; (secs * 24_000.0) as usize], 24_000)
    }

    #[test]
    fn chunks_are_scheduled_back_to_back() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut scheduler = StreamScheduler::new(sink, clock);

        let first = scheduler.enqueue(&chunk(0.5));
        let second = scheduler.enqueue(&chunk(0.25));

        assert_eq!(first, 0.0);
        assert!((second - 0.5).abs() < 1e-9);
        assert!((scheduler.next_start() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn drained_stream_restarts_at_now() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut scheduler = StreamScheduler::new(sink, clock.clone());

        scheduler.enqueue(&chunk(0.5));
        clock.advance(2.0);

        let start = scheduler.enqueue(&chunk(0.5));
        assert!((start - 2.0).abs() < 1e-9);
    }

    #[test]
    fn stop_all_flushes_sink_and_resets_timeline() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut scheduler = StreamScheduler::new(sink.clone(), clock.clone());

        scheduler.enqueue(&chunk(1.0));
        scheduler.enqueue(&chunk(1.0));
        scheduler.stop_all();

        assert_eq!(*sink.cleared.lock().unwrap(), 1);
        assert_eq!(scheduler.next_start(), 0.0);
        assert_eq!(scheduler.active_sources(), 0);

        clock.advance(0.5);
        let start = scheduler.enqueue(&chunk(0.5));
        assert!((start - 0.5).abs() < 1e-9);
    }

    #[test]
    fn finished_sources_are_reaped() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut scheduler = StreamScheduler::new(sink, clock.clone());

        scheduler.enqueue(&chunk(0.5));
        scheduler.enqueue(&chunk(0.5));
        assert_eq!(scheduler.active_sources(), 2);

        clock.advance(0.6);
        assert_eq!(scheduler.active_sources(), 1);

        clock.advance(1.0);
        assert_eq!(scheduler.active_sources(), 0);
    }

    #[test]
    fn samples_reach_the_sink_in_order() {
        let clock = MockClock::new();
        let sink = MockSink::new();
        let mut scheduler = StreamScheduler::new(sink.clone(), clock);

        scheduler.enqueue(&PcmBuffer::new(vec![1, 2], 24_000));
        scheduler.enqueue(&PcmBuffer::new(vec![3], 24_000));

        assert_eq!(*sink.written.lock().unwrap(), vec![1, 2, 3]);
    }
}
