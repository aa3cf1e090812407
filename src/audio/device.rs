//! Microphone lifecycle: start/stop with guaranteed hardware release.
//!
//! The hardware delivers chunks on its own realtime thread. That thread only
//! touches [`CaptureShared`]: it checks the running flag, appends under a
//! short-held lock, and forwards a copy to the optional VAD tap with
//! `try_send`. It never blocks and never performs I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};

/// Capture rate expected by every VAD backend and ASR engine.
pub const SAMPLE_RATE: u32 = 16_000;

/// Nominal frame size (32ms at 16kHz).
pub const FRAME_SAMPLES: usize = 512;

/// ~10 minutes of audio at the nominal frame size.
pub const DEFAULT_MAX_BUFFERED_FRAMES: usize = 18_750;

/// Mono f32 samples at [`SAMPLE_RATE`], as delivered by one hardware callback.
pub type AudioFrame = Vec<f32>;

/// Errors that can occur while opening or releasing the input device.
#[derive(Debug, Clone)]
pub enum AudioError {
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    StreamCloseFailed(String),
    FileCreationFailed(String),
    WriteFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::StreamCloseFailed(e) => write!(f, "Failed to release audio stream: {}", e),
            AudioError::FileCreationFailed(e) => write!(f, "Failed to create WAV file: {}", e),
            AudioError::WriteFailed(e) => write!(f, "Failed to write audio data: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// Ordered frames captured since the last clear.
#[derive(Debug, Default, Clone)]
pub struct AudioSession {
    frames: VecDeque<AudioFrame>,
    samples: usize,
}

impl AudioSession {
    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples as f32 / SAMPLE_RATE as f32
    }

    /// Concatenate all frames into one contiguous buffer.
    pub fn into_samples(self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.samples);
        for frame in self.frames {
            out.extend_from_slice(&frame);
        }
        out
    }

    fn push(&mut self, frame: AudioFrame, max_frames: usize) {
        self.samples += frame.len();
        self.frames.push_back(frame);
        while self.frames.len() > max_frames {
            if let Some(dropped) = self.frames.pop_front() {
                self.samples -= dropped.len();
            }
        }
    }
}

/// State shared between the control side and the realtime callback.
pub struct CaptureShared {
    running: AtomicBool,
    buffer: Mutex<AudioSession>,
    tap: Mutex<Option<SyncSender<AudioFrame>>>,
    max_frames: usize,
}

impl CaptureShared {
    pub fn new(max_frames: usize) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(false),
            buffer: Mutex::new(AudioSession::default()),
            tap: Mutex::new(None),
            max_frames: max_frames.max(1),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Called from the audio thread with one converted chunk.
    pub fn push(&self, frame: AudioFrame) {
        if !self.is_running() || frame.is_empty() {
            return;
        }

        if let Some(tap) = lock(&self.tap).as_ref() {
            match tap.try_send(frame.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => log::trace!("VAD tap full, dropping chunk"),
            }
        }

        lock(&self.buffer).push(frame, self.max_frames);
    }

    fn take(&self) -> AudioSession {
        std::mem::take(&mut *lock(&self.buffer))
    }

    fn clear(&self) {
        *lock(&self.buffer) = AudioSession::default();
    }
}

/// Recover from poisoning: the audio thread must never panic on a lock.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// An open hardware stream. Closing releases the device to the OS.
pub trait InputStream: Send + Sync {
    fn close(self: Box<Self>) -> Result<(), AudioError>;
}

/// Opens input streams that feed a [`CaptureShared`].
pub trait InputBackend: Send + Sync + 'static {
    fn open(&self, shared: Arc<CaptureShared>) -> Result<Box<dyn InputStream>, AudioError>;

    /// Name of the device that `open` will use, for per-device settings.
    fn device_name(&self) -> Option<String> {
        None
    }
}

/// Owns the microphone stream for one process.
pub struct AudioDevice {
    backend: Arc<dyn InputBackend>,
    shared: Arc<CaptureShared>,
    handle: Option<Box<dyn InputStream>>,
}

impl AudioDevice {
    pub fn new(backend: Arc<dyn InputBackend>, max_frames: usize) -> Self {
        Self {
            backend,
            shared: CaptureShared::new(max_frames),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the hardware stream. A second call while running is a no-op.
    pub fn start(&mut self) -> Result<(), AudioError> {
        if self.is_running() && self.handle.is_some() {
            log::debug!("Audio device already running, skipping start");
            return Ok(());
        }

        // Clear leftovers from a previous inconsistent stop.
        if let Some(stale) = self.handle.take() {
            log::warn!("Releasing stale audio handle before start");
            if let Err(e) = stale.close() {
                log::warn!("Stale audio handle release failed: {}", e);
            }
        }

        self.shared.running.store(true, Ordering::SeqCst);
        match self.backend.open(self.shared.clone()) {
            Ok(handle) => {
                self.handle = Some(handle);
                log::info!("Audio capture started, microphone open");
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start audio capture: {}", e);
                self.shared.running.store(false, Ordering::SeqCst);
                self.handle = None;
                Err(e)
            }
        }
    }

    /// Release the hardware. Always runs the release path, even if the device
    /// already looks stopped. Returns whether a live capture was stopped.
    pub fn stop(&mut self) -> Result<bool, AudioError> {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        self.release(was_running)
    }

    fn release(&mut self, was_running: bool) -> Result<bool, AudioError> {
        let result = match self.handle.take() {
            Some(handle) => handle.close(),
            None => Ok(()),
        };

        match &result {
            Ok(()) if was_running => log::info!("Audio capture stopped, microphone released"),
            Ok(()) => log::debug!("Audio device stop on an idle device"),
            Err(e) => log::error!("Audio release reported an error: {}", e),
        }
        result.map(|()| was_running)
    }

    /// Atomically take every frame captured since the last clear.
    pub fn get_and_clear_buffer(&self) -> AudioSession {
        self.shared.take()
    }

    pub fn clear_buffer(&self) {
        self.shared.clear();
    }

    /// Stop sequence: flip the running flag, snapshot the buffer, release the
    /// hardware. Audio arriving during release is discarded.
    pub fn finish(&mut self) -> (AudioSession, Result<bool, AudioError>) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        let session = self.get_and_clear_buffer();
        (session, self.release(was_running))
    }

    /// Route a copy of every captured chunk to a VAD worker.
    pub fn set_tap(&self, tap: Option<SyncSender<AudioFrame>>) {
        *lock(&self.shared.tap) = tap;
    }

    pub fn device_name(&self) -> Option<String> {
        self.backend.device_name()
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.stop();
        }
    }
}
