//! Microphone capture and speaker playback.
//!
//! The orchestrator only sees the [`AudioInput`] and [`AudioOutput`] traits;
//! the cpal-backed [`capture::AudioCapture`] and [`playback::AudioPlayback`]
//! are the production devices.

pub mod capture;
pub mod playback;
pub mod resample;
pub mod spectrum;

use crate::error::AgentResult;
use crate::events::Subscription;
use cpal::traits::{DeviceTrait, HostTrait};

/// Native microphone rate for backends that do not fix their own.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Default inbound rate for synthesized agent audio.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Level signals are throttled to at most this many updates per second.
pub const LEVEL_UPDATES_PER_SEC: u32 = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// One fixed-size chunk of base64 encoded PCM16.
    Data(String),
    /// Short-window RMS of the microphone in [0, 1].
    Volume(f32),
    /// Visualizer bars, published alongside `Volume`.
    Spectrum(Vec<f32>),
    /// The device failed while capturing. Capture does not retry.
    Error(String),
}

pub trait AudioInput: Send {
    /// Acquire the device and begin emitting events. Starting an already
    /// started input is a no-op.
    fn start(&mut self) -> AgentResult<()>;
    /// Tear down and release the device. Safe when not started.
    fn stop(&mut self);
    fn is_active(&self) -> bool;
    fn subscribe(&self) -> Subscription<CaptureEvent>;
}

pub trait AudioOutput: Send + Sync {
    /// Queue PCM16 bytes for gapless playback after anything already scheduled.
    fn add_pcm16(&self, bytes: &[u8]);
    /// Halt immediately, discard queued audio and reset the scheduling clock.
    fn stop(&self);
    /// Latest smoothed output level in [0, 1].
    fn volume(&self) -> f32;
    /// Level tap: receives throttled output levels while audio plays.
    fn subscribe_volume(&self) -> Subscription<f32>;
}

pub fn pcm16_from_f32(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let clamped = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            clamped.to_le_bytes()
        })
        .collect()
}

/// A trailing odd byte is ignored.
pub fn f32_from_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}

/// List available output devices (name strings).
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}
