use super::resample::LinearResampler;
use super::{f32_from_pcm16, rms, AudioOutput, LEVEL_UPDATES_PER_SEC};
use crate::error::{AgentError, AgentResult};
use crate::events::{Emitter, Subscription};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Head start given to a fresh sequence so the first chunk is not starved.
pub const INITIAL_BUFFER: Duration = Duration::from_millis(100);
/// Per-block decay of the output level (peak-hold meter).
const LEVEL_DECAY: f32 = 0.7;

struct Segment {
    start: u64,
    samples: Vec<f32>,
}

/// Where a chunk landed on the output timeline, in output frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub start: u64,
    pub frames: u64,
}

impl Scheduled {
    pub fn end(&self) -> u64 {
        self.start + self.frames
    }
}

/// Sample-accurate playback timeline.
///
/// `clock` counts frames already rendered; `watermark` is the first free
/// frame after everything scheduled. A new chunk starts exactly at the
/// watermark, so consecutive chunks are gapless. If rendering has run past the
/// watermark (underrun), the watermark is first pulled up to `clock + lead`,
/// which bounds latency instead of letting it accumulate.
pub struct PlaybackScheduler {
    output_rate: u32,
    resampler: LinearResampler,
    clock: u64,
    watermark: u64,
    lead_frames: u64,
    queue: VecDeque<Segment>,
    level: f32,
    level_every: u64,
    since_level: u64,
}

impl PlaybackScheduler {
    pub fn new(source_rate: u32, output_rate: u32, lead: Duration) -> Self {
        let output_rate = output_rate.max(1);
        Self {
            output_rate,
            resampler: LinearResampler::new(source_rate, output_rate),
            clock: 0,
            watermark: 0,
            lead_frames: (lead.as_secs_f64() * output_rate as f64).round() as u64,
            queue: VecDeque::new(),
            level: 0.0,
            level_every: (output_rate / LEVEL_UPDATES_PER_SEC).max(1) as u64,
            since_level: 0,
        }
    }

    pub fn schedule_pcm16(&mut self, bytes: &[u8]) -> Option<Scheduled> {
        let samples = self.resampler.process(&f32_from_pcm16(bytes));
        if samples.is_empty() {
            return None;
        }
        if self.watermark < self.clock {
            self.watermark = self.clock + self.lead_frames;
        } else if self.queue.is_empty() && self.watermark == self.clock {
            self.watermark += self.lead_frames;
        }
        let scheduled = Scheduled {
            start: self.watermark,
            frames: samples.len() as u64,
        };
        self.watermark = scheduled.end();
        self.queue.push_back(Segment {
            start: scheduled.start,
            samples,
        });
        Some(scheduled)
    }

    /// Fill `out` with the next mono frames and advance the clock. Returns a
    /// level sample when one is due (throttled to the level update rate).
    pub fn render(&mut self, out: &mut [f32]) -> Option<f32> {
        for (i, slot) in out.iter_mut().enumerate() {
            let frame = self.clock + i as u64;
            *slot = 0.0;
            while let Some(segment) = self.queue.front() {
                if frame < segment.start {
                    break;
                }
                let idx = (frame - segment.start) as usize;
                if idx < segment.samples.len() {
                    *slot = segment.samples[idx];
                    break;
                }
                self.queue.pop_front();
            }
        }
        self.clock += out.len() as u64;
        while let Some(segment) = self.queue.front() {
            if segment.start + segment.samples.len() as u64 > self.clock {
                break;
            }
            self.queue.pop_front();
        }

        self.level = rms(out).max(self.level * LEVEL_DECAY).min(1.0);
        self.since_level += out.len() as u64;
        if self.since_level >= self.level_every {
            self.since_level = 0;
            Some(self.level)
        } else {
            None
        }
    }

    /// Discard everything unplayed and restart the timeline at the clock.
    pub fn stop(&mut self) {
        self.queue.clear();
        self.watermark = self.clock;
        self.resampler.reset();
        self.level = 0.0;
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    pub fn queued_frames(&self) -> u64 {
        self.watermark.saturating_sub(self.clock)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

struct PlaybackWorker {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// cpal speaker. The output callback pulls from the shared scheduler.
pub struct AudioPlayback {
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    level: Arc<AtomicU32>,
    levels: Emitter<f32>,
    worker: Option<PlaybackWorker>,
}

impl AudioPlayback {
    /// Open the output device and start an (initially silent) stream.
    pub fn open(device_name: Option<String>, source_rate: u32) -> AgentResult<Self> {
        let level = Arc::new(AtomicU32::new(0));
        let levels = Emitter::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<AgentResult<Arc<Mutex<PlaybackScheduler>>>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let level_cb = level.clone();
        let levels_cb = levels.clone();
        let thread = std::thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || {
                let opened = open_output(device_name.as_deref(), source_rate, level_cb, levels_cb);
                let (stream, scheduler) = match opened {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(scheduler));
                // Park until the handle is stopped or dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AgentError::DeviceUnavailable(format!("playback thread: {}", e)))?;

        let scheduler = match ready_rx.recv() {
            Ok(Ok(scheduler)) => scheduler,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AgentError::DeviceUnavailable("playback thread exited".into()));
            }
        };

        Ok(Self {
            scheduler,
            level,
            levels,
            worker: Some(PlaybackWorker { stop_tx, thread }),
        })
    }
}

impl AudioOutput for AudioPlayback {
    fn add_pcm16(&self, bytes: &[u8]) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            if let Some(at) = scheduler.schedule_pcm16(bytes) {
                log::trace!(
                    "[playback] scheduled {} frames at {} (queued {})",
                    at.frames,
                    at.start,
                    scheduler.queued_frames()
                );
            }
        }
    }

    fn stop(&self) {
        if let Ok(mut scheduler) = self.scheduler.lock() {
            if !scheduler.is_idle() {
                log::debug!(
                    "[playback] stop: discarding {} queued frames",
                    scheduler.queued_frames()
                );
            }
            scheduler.stop();
        }
        self.level.store(0f32.to_bits(), Ordering::Relaxed);
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    fn subscribe_volume(&self) -> Subscription<f32> {
        self.levels.subscribe()
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
        }
    }
}

fn open_output(
    device_name: Option<&str>,
    source_rate: u32,
    level: Arc<AtomicU32>,
    levels: Emitter<f32>,
) -> AgentResult<(cpal::Stream, Arc<Mutex<PlaybackScheduler>>)> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| AgentError::DeviceUnavailable(format!("Failed to list devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AgentError::DeviceUnavailable(format!("Device '{}' not found", name)))?,
        None => host
            .default_output_device()
            .ok_or_else(|| AgentError::DeviceUnavailable("No default output device".into()))?,
    };
    let name = device.name().unwrap_or_else(|_| "unknown".into());
    let default = device
        .default_output_config()
        .map_err(|e| AgentError::DeviceUnavailable(format!("No output config: {}", e)))?;
    let format = default.sample_format();
    let config: StreamConfig = default.config();
    log::info!(
        "[playback] using device: {} ({}Hz, {}ch, {:?}), source {}Hz",
        name,
        config.sample_rate.0,
        config.channels,
        format,
        source_rate
    );

    let scheduler = Arc::new(Mutex::new(PlaybackScheduler::new(
        source_rate,
        config.sample_rate.0,
        INITIAL_BUFFER,
    )));
    let tap = LevelTap { level, levels };
    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, scheduler.clone(), tap)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, scheduler.clone(), tap)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, scheduler.clone(), tap)?,
        other => {
            return Err(AgentError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };
    stream
        .play()
        .map_err(|e| AgentError::DeviceUnavailable(format!("Failed to start stream: {}", e)))?;
    Ok((stream, scheduler))
}

struct LevelTap {
    level: Arc<AtomicU32>,
    levels: Emitter<f32>,
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    scheduler: Arc<Mutex<PlaybackScheduler>>,
    tap: LevelTap,
) -> AgentResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                let due = match scheduler.lock() {
                    Ok(mut s) => s.render(&mut mono),
                    Err(_) => {
                        mono.iter_mut().for_each(|s| *s = 0.0);
                        None
                    }
                };
                for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    let value = <T as Sample>::from_sample(sample);
                    frame.iter_mut().for_each(|slot| *slot = value);
                }
                if let Some(level) = due {
                    tap.level.store(level.to_bits(), Ordering::Relaxed);
                    tap.levels.emit(level);
                }
            },
            |err| {
                log::error!("[playback] stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AgentError::DeviceUnavailable(format!("Failed to build stream: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm16_from_f32;

    const RATE: u32 = 1_000;

    fn chunk(frames: usize, value: f32) -> Vec<u8> {
        pcm16_from_f32(&vec![value; frames])
    }

    fn scheduler() -> PlaybackScheduler {
        PlaybackScheduler::new(RATE, RATE, Duration::from_millis(10))
    }

    #[test]
    fn consecutive_chunks_are_gapless() {
        let mut s = scheduler();
        let a = s.schedule_pcm16(&chunk(100, 0.1)).unwrap();
        let b = s.schedule_pcm16(&chunk(50, 0.2)).unwrap();
        let c = s.schedule_pcm16(&chunk(25, 0.3)).unwrap();

        assert_eq!(a.start, 10);
        assert_eq!(b.start, a.end());
        assert_eq!(c.start, b.end());
        assert_eq!(c.end() - a.start, 175);
    }

    #[test]
    fn jitter_within_the_queue_does_not_open_gaps() {
        let mut s = scheduler();
        let mut out = vec![0.0; 40];
        let a = s.schedule_pcm16(&chunk(100, 0.1)).unwrap();
        s.render(&mut out);
        let b = s.schedule_pcm16(&chunk(100, 0.2)).unwrap();
        s.render(&mut out);
        s.render(&mut out);
        let c = s.schedule_pcm16(&chunk(100, 0.3)).unwrap();
        assert_eq!(b.start, a.end());
        assert_eq!(c.start, b.end());
    }

    #[test]
    fn rendered_audio_is_continuous_across_chunks() {
        let mut s = PlaybackScheduler::new(RATE, RATE, Duration::ZERO);
        s.schedule_pcm16(&chunk(3, 0.5)).unwrap();
        s.schedule_pcm16(&chunk(2, -0.5)).unwrap();
        let mut out = vec![9.0; 6];
        s.render(&mut out);
        let q = 16383.0 / 32768.0;
        assert_eq!(out, vec![q, q, q, -q, -q, 0.0]);
        assert!(s.is_idle());
    }

    #[test]
    fn underrun_clamps_watermark_to_now() {
        let mut s = scheduler();
        s.schedule_pcm16(&chunk(20, 0.1)).unwrap();
        let mut out = vec![0.0; 200];
        s.render(&mut out);
        assert_eq!(s.clock(), 200);
        let next = s.schedule_pcm16(&chunk(20, 0.1)).unwrap();
        assert_eq!(next.start, 210);
        assert_eq!(s.queued_frames(), 30);
    }

    #[test]
    fn stop_discards_queue_and_restarts_at_now() {
        let mut s = scheduler();
        s.schedule_pcm16(&chunk(100, 0.1)).unwrap();
        s.schedule_pcm16(&chunk(100, 0.1)).unwrap();
        let mut out = vec![0.0; 30];
        s.render(&mut out);

        s.stop();
        assert!(s.is_idle());
        assert_eq!(s.watermark(), s.clock());

        let fresh = s.schedule_pcm16(&chunk(10, 0.1)).unwrap();
        assert_eq!(fresh.start, 30 + 10);
        let mut rest = vec![1.0; 100];
        s.render(&mut rest);
        assert_eq!(rest.iter().filter(|v| **v != 0.0).count(), 10);
    }

    #[test]
    fn source_rate_is_resampled_to_device_rate() {
        let mut s = PlaybackScheduler::new(24_000, 48_000, Duration::ZERO);
        let at = s.schedule_pcm16(&chunk(240, 0.1)).unwrap();
        assert_eq!(at.frames, 478);
    }

    #[test]
    fn level_tap_is_throttled_and_decays() {
        let mut s = PlaybackScheduler::new(RATE, RATE, Duration::ZERO);
        s.schedule_pcm16(&chunk(50, 0.5)).unwrap();
        let mut block = vec![0.0; 25];
        assert_eq!(s.render(&mut block), None);
        let level = s.render(&mut block).unwrap();
        assert!((level - 0.5).abs() < 1e-3);
        s.render(&mut block);
        let decayed = s.render(&mut block).unwrap();
        assert!(decayed < level && decayed > 0.0);
    }

    #[test]
    fn empty_chunk_is_not_scheduled() {
        let mut s = scheduler();
        assert_eq!(s.schedule_pcm16(&[]), None);
        assert_eq!(s.watermark(), 0);
    }
}
