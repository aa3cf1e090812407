//! CPAL input backend.
//!
//! `cpal::Stream` is not `Send` on every platform, so each open stream lives on
//! its own thread. Closing the handle wakes that thread, which pauses and drops
//! the stream, and only then returns. The device is released to the OS before
//! `close()` returns.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample as _;
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};

use super::device::{AudioError, CaptureShared, InputBackend, InputStream, SAMPLE_RATE};

/// Captures from the default input device (or a named one).
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    preferred_device: Option<String>,
}

impl CpalInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(name: impl Into<String>) -> Self {
        Self {
            preferred_device: Some(name.into()),
        }
    }

    fn select_device(&self) -> Result<Device, AudioError> {
        let host = cpal::default_host();

        if let Some(wanted) = &self.preferred_device {
            let found = host
                .input_devices()
                .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false));
            match found {
                Some(device) => return Ok(device),
                None => log::warn!("Input device {:?} not found, using default", wanted),
            }
        }

        host.default_input_device().ok_or(AudioError::NoInputDevice)
    }
}

impl InputBackend for CpalInput {
    fn open(&self, shared: Arc<CaptureShared>) -> Result<Box<dyn InputStream>, AudioError> {
        let device = self.select_device()?;
        log::info!("Using audio input device: {:?}", device.name());

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("talkback-audio".to_string())
            .spawn(move || -> Result<(), AudioError> {
                let stream = match build_stream(&device, shared) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };

                if let Err(e) = stream.play() {
                    drop(stream);
                    let _ = ready_tx.send(Err(AudioError::StreamCreationFailed(format!(
                        "Failed to start stream: {}",
                        e
                    ))));
                    return Ok(());
                }

                let _ = ready_tx.send(Ok(()));

                // Parked until close() sends or the handle is dropped.
                let _ = stop_rx.recv();

                let paused = stream
                    .pause()
                    .map_err(|e| AudioError::StreamCloseFailed(e.to_string()));
                drop(stream);
                paused
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AudioError::StreamCreationFailed(
                    "audio thread exited before the stream opened".to_string(),
                ))
            }
        }
    }

    fn device_name(&self) -> Option<String> {
        self.select_device().ok().and_then(|d| d.name().ok())
    }
}

struct CpalStream {
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<Result<(), AudioError>>>,
}

impl CpalStream {
    fn release(&mut self) -> Result<(), AudioError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| AudioError::StreamCloseFailed("audio thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl InputStream for CpalStream {
    fn close(mut self: Box<Self>) -> Result<(), AudioError> {
        self.release()
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Pick 16kHz if the device supports it (mono preferred), else its default.
fn choose_config(device: &Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
    if let Ok(ranges) = device.supported_input_configs() {
        let mut candidates: Vec<_> = ranges
            .filter(|r| {
                r.min_sample_rate().0 <= SAMPLE_RATE && r.max_sample_rate().0 >= SAMPLE_RATE
            })
            .filter(|r| {
                matches!(
                    r.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
                )
            })
            .collect();
        candidates.sort_by_key(|r| r.channels());
        if let Some(range) = candidates.into_iter().next() {
            let supported = range.with_sample_rate(SampleRate(SAMPLE_RATE));
            let format = supported.sample_format();
            return Ok((supported.into(), format));
        }
    }

    let supported = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;
    let format = supported.sample_format();
    Ok((supported.into(), format))
}

fn build_stream(device: &Device, shared: Arc<CaptureShared>) -> Result<Stream, AudioError> {
    let (config, sample_format) = choose_config(device)?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?} (capturing at {} Hz mono)",
        config.sample_rate.0,
        config.channels,
        sample_format,
        SAMPLE_RATE
    );

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(device, &config, shared),
        SampleFormat::U16 => build_stream_typed::<u16>(device, &config, shared),
        SampleFormat::F32 => build_stream_typed::<f32>(device, &config, shared),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    shared: Arc<CaptureShared>,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
{
    let channels = config.channels as usize;
    let in_rate = config.sample_rate.0;
    let err_fn = |err| log::error!("Audio stream error: {}", err);
    let mut resampler = LinearResampler::new(in_rate, SAMPLE_RATE);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !shared.is_running() {
                    return;
                }
                let mono = downmix(data, channels);
                shared.push(resampler.process(&mono));
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Average interleaved channels into one f32 channel.
fn downmix<T: cpal::Sample>(data: &[T], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|s| s.to_float_sample().to_sample()).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame
                .iter()
                .map(|s| -> f32 { s.to_float_sample().to_sample() })
                .sum();
            sum / frame.len() as f32
        })
        .collect()
}

/// Linear resampler for a continuous stream. The read position and the last
/// input sample carry over between callbacks, so chunk boundaries neither
/// drop nor repeat output samples.
struct LinearResampler {
    /// Input samples per output sample.
    step: f64,
    /// Next read position relative to the start of the next chunk. In
    /// (-1, 0) it falls between `prev` and that chunk's first sample.
    pos: f64,
    prev: Option<f32>,
}

impl LinearResampler {
    fn new(from: u32, to: u32) -> Self {
        Self {
            step: from as f64 / to as f64,
            pos: 0.0,
            prev: None,
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.step == 1.0 || input.is_empty() {
            return input.to_vec();
        }
        let prev = self.prev.unwrap_or(input[0]);
        let at = |i: isize| if i < 0 { prev } else { input[i as usize] };
        let last = (input.len() - 1) as f64;

        let mut out = Vec::with_capacity((input.len() as f64 / self.step).ceil() as usize + 1);
        while self.pos <= last {
            let floor = self.pos.floor();
            let frac = (self.pos - floor) as f32;
            let i = floor as isize;
            let a = at(i);
            let b = if frac > 0.0 { at(i + 1) } else { a };
            out.push(a + (b - a) * frac);
            self.pos += self.step;
        }
        self.pos -= input.len() as f64;
        self.prev = input.last().copied();
        out
    }
}

/// Names of every input device on the default host.
pub fn list_input_devices() -> Vec<String> {
    match cpal::default_host().input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            log::warn!("Failed to enumerate input devices: {}", e);
            Vec::new()
        }
    }
}
