//! Speaker playback machine.
//!
//! One clip plays at a time: `Idle → Speaking → (Completed | Interrupted |
//! Error) → Idle`. Commands queue while a clip is playing; `Stop` preempts
//! within one frame. Every `Play` resolves its completion channel exactly
//! once, including on error, so the orchestrator can always make progress.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::Display;
use tokio::sync::oneshot;

/// PCM audio ready for the speaker.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.samples.len() as u64 * 1_000 / self.sample_rate as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum PlaybackOutcome {
    Completed,
    Interrupted,
    Error(String),
}

pub enum PlaybackCommand {
    Play {
        clip: AudioClip,
        done: oneshot::Sender<PlaybackOutcome>,
    },
    Stop,
}

/// Cloneable handle submitting commands to the playback thread.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: std_mpsc::Sender<PlaybackCommand>,
}

impl PlaybackHandle {
    /// Wrap an existing command channel. Used by tests to stand in a fake
    /// playback sink.
    pub fn new(tx: std_mpsc::Sender<PlaybackCommand>) -> Self {
        Self { tx }
    }

    /// Queue a clip; the returned receiver resolves when playback ends.
    pub fn play(&self, clip: AudioClip) -> oneshot::Receiver<PlaybackOutcome> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send(PlaybackCommand::Play {
                clip,
                done: done_tx,
            })
            .is_err()
        {
            // Thread gone; the receiver will see the drop as a completion
            // error, which the caller maps to PlaybackOutcome::Error.
            log::error!("Playback thread is not running");
        }
        done_rx
    }

    /// Preempt the current clip, if any.
    pub fn stop(&self) {
        let _ = self.tx.send(PlaybackCommand::Stop);
    }
}

pub struct Playback;

impl Playback {
    /// Start the playback thread and return its command handle.
    pub fn spawn(device_name: Option<String>) -> PlaybackHandle {
        let (tx, rx) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || run_playback_thread(device_name, rx))
            .expect("failed to spawn playback thread");
        PlaybackHandle::new(tx)
    }
}

fn run_playback_thread(device_name: Option<String>, rx: std_mpsc::Receiver<PlaybackCommand>) {
    let mut queued: std::collections::VecDeque<(AudioClip, oneshot::Sender<PlaybackOutcome>)> =
        std::collections::VecDeque::new();
    loop {
        let (clip, done) = match queued.pop_front() {
            Some(next) => next,
            None => match rx.recv() {
                Ok(PlaybackCommand::Play { clip, done }) => (clip, done),
                Ok(PlaybackCommand::Stop) => continue, // nothing playing
                Err(_) => break,
            },
        };
        let outcome = play_clip(device_name.as_deref(), clip, &rx, &mut queued);
        let _ = done.send(outcome);
    }
    log::debug!("Playback thread shutting down");
}

/// Play one clip to completion, watching the command queue for `Stop`.
/// `Play` commands arriving mid-clip are queued behind the current one.
fn play_clip(
    device_name: Option<&str>,
    clip: AudioClip,
    rx: &std_mpsc::Receiver<PlaybackCommand>,
    queued: &mut std::collections::VecDeque<(AudioClip, oneshot::Sender<PlaybackOutcome>)>,
) -> PlaybackOutcome {
    let host = cpal::default_host();
    let device = match device_name {
        Some(wanted) => match host
            .output_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| d.name().map(|n| n == wanted).unwrap_or(false)))
        {
            Some(d) => d,
            None => return PlaybackOutcome::Error(format!("output device not found: {wanted}")),
        },
        None => match host.default_output_device() {
            Some(d) => d,
            None => return PlaybackOutcome::Error("no default output device".into()),
        },
    };

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(clip.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let total = clip.samples.len();
    let cursor = Arc::new(Mutex::new(0usize));
    let samples = Arc::new(clip.samples);

    let cb_cursor = cursor.clone();
    let cb_samples = samples.clone();
    let stream = device.build_output_stream(
        &config,
        move |out: &mut [f32], _| {
            let mut pos = cb_cursor.lock().unwrap();
            for slot in out.iter_mut() {
                *slot = if *pos < cb_samples.len() {
                    let s = cb_samples[*pos] as f32 / 32_768.0;
                    *pos += 1;
                    s
                } else {
                    0.0
                };
            }
        },
        |err| log::error!("Playback stream fault: {}", err),
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => return PlaybackOutcome::Error(format!("failed to open output stream: {e}")),
    };
    if let Err(e) = stream.play() {
        return PlaybackOutcome::Error(format!("failed to start playback: {e}"));
    }

    // Poll for completion or preemption; one frame (~80 ms) of latency on
    // Stop is the contract.
    loop {
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(PlaybackCommand::Stop) => {
                drop(stream);
                // Preemption flushes anything waiting behind the clip too.
                for (_, done) in queued.drain(..) {
                    let _ = done.send(PlaybackOutcome::Interrupted);
                }
                return PlaybackOutcome::Interrupted;
            }
            Ok(PlaybackCommand::Play { clip, done }) => {
                // Busy: enqueue behind the current clip.
                queued.push_back((clip, done));
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                let pos = *cursor.lock().unwrap();
                if pos >= total {
                    // Let the device drain its last buffer before teardown.
                    std::thread::sleep(Duration::from_millis(50));
                    drop(stream);
                    return PlaybackOutcome::Completed;
                }
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                drop(stream);
                return PlaybackOutcome::Interrupted;
            }
        }
    }
}
