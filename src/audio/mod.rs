//! Audio I/O: microphone capture and speaker playback.
//!
//! Both sides run on dedicated threads owning their cpal streams (cpal
//! streams are not `Send`); the rest of the gateway talks to them through
//! channels.

pub mod capture;
pub mod playback;

pub use capture::{AudioCapture, CaptureError, CaptureEvent, MuteHandle};
pub use playback::{AudioClip, Playback, PlaybackCommand, PlaybackHandle, PlaybackOutcome};
