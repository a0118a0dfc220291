//! Microphone capture producing fixed 80 ms frames.
//!
//! A dedicated thread owns the cpal input stream. The stream callback
//! accumulates samples into 1280-sample frames, stamps each with a gapless
//! sequence number, and hands them to a bounded channel without blocking.
//! When the channel is full the frame is dropped and counted; the consumer
//! notices the sequence gap and resets its temporal context.

use crate::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bounded frame queue between the capture callback and the wake-word task.
const FRAME_QUEUE: usize = 64;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Unsupported capture configuration: {0}")]
    Config(String),
}

/// Shared mute switch for the capture path.
///
/// Muted frames are still produced on schedule, zero-filled and flagged,
/// so downstream pacing and rolling buffers keep their timing.
#[derive(Clone)]
pub struct MuteHandle(Arc<AtomicBool>);

impl MuteHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for MuteHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// What the capture side can hand the audio pipeline.
#[derive(Debug)]
pub enum CaptureEvent {
    Frame(AudioFrame),
    /// The device faulted; capture will not produce further frames.
    Fault(String),
    /// The capture thread is gone.
    Closed,
}

pub struct AudioCapture {
    frames: mpsc::Receiver<AudioFrame>,
    faults: mpsc::Receiver<String>,
    mute: MuteHandle,
    dropped: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
}

impl AudioCapture {
    /// Open the capture device and start streaming.
    ///
    /// The mute switch is passed in (not created here) so the same handle
    /// keeps working across device reopens. The gateway requires 16 kHz
    /// mono; devices that cannot provide it fail fast here rather than
    /// resampling.
    pub fn open(device_name: Option<&str>, mute: MuteHandle) -> Result<Self, CaptureError> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (fault_tx, fault_rx) = mpsc::channel(4);
        let dropped = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        // The stream must be built and kept alive on its own thread.
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), CaptureError>>();
        let thread_mute = mute.clone();
        let thread_dropped = dropped.clone();
        let thread_shutdown = shutdown.clone();
        let requested_device = device_name.map(|s| s.to_string());

        std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let stream = match build_capture_stream(
                    requested_device.as_deref(),
                    frame_tx,
                    fault_tx.clone(),
                    thread_mute,
                    thread_dropped,
                ) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = fault_tx.try_send(format!("failed to start stream: {e}"));
                    return;
                }

                while !thread_shutdown.load(Ordering::Acquire) {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                drop(stream);
            })
            .map_err(|e| CaptureError::Stream(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| CaptureError::Stream("capture thread exited during setup".into()))??;

        log::info!(
            "🎙️ Capture open: {} @ {}Hz mono, {}-sample frames",
            device_name.unwrap_or("default device"),
            SAMPLE_RATE,
            FRAME_SAMPLES
        );

        Ok(Self {
            frames: frame_rx,
            faults: fault_rx,
            mute,
            dropped,
            shutdown,
        })
    }

    pub fn mute_handle(&self) -> MuteHandle {
        self.mute.clone()
    }

    /// Frames dropped because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait for the next frame or fault, whichever comes first.
    pub async fn recv(&mut self) -> CaptureEvent {
        tokio::select! {
            frame = self.frames.recv() => match frame {
                Some(frame) => CaptureEvent::Frame(frame),
                None => CaptureEvent::Closed,
            },
            fault = self.faults.recv() => match fault {
                Some(detail) => CaptureEvent::Fault(detail),
                None => CaptureEvent::Closed,
            },
        }
    }

    /// Enumerate capture devices for `--list-devices`.
    pub fn list_devices() -> Result<Vec<String>, CaptureError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| CaptureError::Device(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<Device, CaptureError> {
    match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| CaptureError::Device(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| CaptureError::Device(format!("capture device not found: {wanted}"))),
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::Device("no default input device".into())),
    }
}

fn build_capture_stream(
    device_name: Option<&str>,
    frames: mpsc::Sender<AudioFrame>,
    faults: mpsc::Sender<String>,
    mute: MuteHandle,
    dropped: Arc<AtomicU64>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = find_device(&host, device_name)?;

    let supported: Vec<_> = device
        .supported_input_configs()
        .map_err(|e| CaptureError::Config(e.to_string()))?
        .collect();

    // Require native 16 kHz support; no resampling path.
    let native = supported
        .iter()
        .find(|c| c.min_sample_rate().0 <= SAMPLE_RATE && c.max_sample_rate().0 >= SAMPLE_RATE)
        .cloned()
        .ok_or_else(|| {
            CaptureError::Config(format!(
                "device does not support {} Hz capture",
                SAMPLE_RATE
            ))
        })?
        .with_sample_rate(cpal::SampleRate(SAMPLE_RATE));

    let channels = native.channels() as usize;
    let stream_config = cpal::StreamConfig {
        channels: native.channels(),
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_faults = faults.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Capture stream fault: {}", err);
        let _ = err_faults.try_send(err.to_string());
    };

    let stream = match native.sample_format() {
        SampleFormat::I16 => {
            build_typed_stream::<i16>(&device, &stream_config, channels, frames, mute, dropped, err_fn)?
        }
        SampleFormat::U16 => {
            build_typed_stream::<u16>(&device, &stream_config, channels, frames, mute, dropped, err_fn)?
        }
        SampleFormat::F32 => {
            build_typed_stream::<f32>(&device, &stream_config, channels, frames, mute, dropped, err_fn)?
        }
        other => {
            return Err(CaptureError::Config(format!(
                "unsupported sample format: {other:?}"
            )))
        }
    };

    Ok(stream)
}

fn build_typed_stream<T>(
    device: &Device,
    config: &cpal::StreamConfig,
    channels: usize,
    frames: mpsc::Sender<AudioFrame>,
    mute: MuteHandle,
    dropped: Arc<AtomicU64>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, CaptureError>
where
    T: Sample + SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let mut pending: Vec<i16> = Vec::with_capacity(FRAME_SAMPLES);
    let mut sequence_no: u64 = 0;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // First channel only; the gateway is mono end to end.
                for frame in data.chunks(channels) {
                    if let Some(sample) = frame.first() {
                        pending.push(i16::from_sample(*sample));
                        if pending.len() == FRAME_SAMPLES {
                            let muted = mute.is_muted();
                            let samples = if muted {
                                pending.clear();
                                vec![0i16; FRAME_SAMPLES]
                            } else {
                                std::mem::replace(
                                    &mut pending,
                                    Vec::with_capacity(FRAME_SAMPLES),
                                )
                            };
                            let out = AudioFrame {
                                samples,
                                t0: Instant::now(),
                                sequence_no,
                                muted,
                            };
                            sequence_no += 1;
                            if frames.try_send(out).is_err() {
                                dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::Stream(e.to_string()))
}
