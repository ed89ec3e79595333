use super::resample::LinearResampler;
use super::spectrum::SpectrumAnalyzer;
use super::{pcm16_from_f32, rms, AudioInput, CaptureEvent, LEVEL_UPDATES_PER_SEC};
use crate::error::{AgentError, AgentResult};
use crate::events::{Emitter, Subscription};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Samples per outbound chunk: about 85 ms at 24 kHz, 128 ms at 16 kHz.
pub const CHUNK_SAMPLES: usize = 2048;

/// Turns raw device buffers into outbound chunks and throttled level events.
///
/// Chunk cadence follows the device: a `Data` event is produced whenever
/// enough resampled audio has accumulated, never on a timer.
pub struct CaptureProcessor {
    resampler: LinearResampler,
    chunk_samples: usize,
    pending: Vec<f32>,
    spectrum: SpectrumAnalyzer,
    level_interval: Duration,
    last_level_at: Option<Instant>,
    level_window: Vec<f32>,
}

impl CaptureProcessor {
    pub fn new(input_rate: u32, output_rate: u32, chunk_samples: usize) -> Self {
        Self {
            resampler: LinearResampler::new(input_rate, output_rate),
            chunk_samples: chunk_samples.max(1),
            pending: Vec::with_capacity(chunk_samples * 2),
            spectrum: SpectrumAnalyzer::new(),
            level_interval: Duration::from_millis(1000 / LEVEL_UPDATES_PER_SEC as u64),
            last_level_at: None,
            level_window: Vec::new(),
        }
    }

    /// `mono` is one device buffer, already downmixed.
    pub fn process(&mut self, mono: &[f32], now: Instant) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        let samples = self.resampler.process(mono);

        self.level_window.extend_from_slice(&samples);
        self.spectrum.push(&samples);
        let due = match self.last_level_at {
            Some(at) => now.duration_since(at) >= self.level_interval,
            None => true,
        };
        if due && !self.level_window.is_empty() {
            events.push(CaptureEvent::Volume(rms(&self.level_window).min(1.0)));
            if let Some(bars) = self.spectrum.bars() {
                events.push(CaptureEvent::Spectrum(bars.to_vec()));
            }
            self.level_window.clear();
            self.last_level_at = Some(now);
        }

        self.pending.extend_from_slice(&samples);
        while self.pending.len() >= self.chunk_samples {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_samples).collect();
            events.push(CaptureEvent::Data(BASE64.encode(pcm16_from_f32(&chunk))));
        }
        events
    }

    /// Samples buffered toward the next chunk.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

struct CaptureWorker {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// cpal microphone. The stream lives on a dedicated thread that also runs the
/// [`CaptureProcessor`], so the handle itself is `Send`.
pub struct AudioCapture {
    device_name: Option<String>,
    sample_rate: u32,
    events: Emitter<CaptureEvent>,
    worker: Option<CaptureWorker>,
}

impl AudioCapture {
    /// Construction does not touch the device. `sample_rate` is the rate of
    /// the emitted PCM16 chunks.
    pub fn new(device_name: Option<String>, sample_rate: u32) -> Self {
        Self {
            device_name,
            sample_rate,
            events: Emitter::new(),
            worker: None,
        }
    }
}

impl AudioInput for AudioCapture {
    fn start(&mut self) -> AgentResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let (ready_tx, ready_rx) = mpsc::sync_channel::<AgentResult<()>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = self.device_name.clone();
        let sample_rate = self.sample_rate;
        let events = self.events.clone();

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || run_capture(device_name, sample_rate, events, ready_tx, stop_rx))
            .map_err(|e| AgentError::DeviceUnavailable(format!("capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop_tx, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(AgentError::DeviceUnavailable("capture thread exited".into()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
            log::info!("[capture] stopped");
        }
    }

    fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    fn subscribe(&self) -> Subscription<CaptureEvent> {
        self.events.subscribe()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    device_name: Option<String>,
    sample_rate: u32,
    events: Emitter<CaptureEvent>,
    ready_tx: mpsc::SyncSender<AgentResult<()>>,
    stop_rx: mpsc::Receiver<()>,
) {
    // Channel from cpal callback to this thread.
    let (raw_tx, raw_rx) = mpsc::sync_channel::<Vec<f32>>(128);

    let opened = open_input(device_name.as_deref(), sample_rate, raw_tx, events.clone());
    let (stream, input_rate) = match opened {
        Ok(v) => v,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut processor = CaptureProcessor::new(input_rate, sample_rate, CHUNK_SAMPLES);
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }
        match raw_rx.recv_timeout(Duration::from_millis(20)) {
            Ok(samples) => {
                for event in processor.process(&samples, Instant::now()) {
                    events.emit(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(stream);
    if processor.pending_samples() > 0 {
        log::debug!(
            "[capture] discarding {} samples of partial chunk",
            processor.pending_samples()
        );
    }
}

fn open_input(
    device_name: Option<&str>,
    sample_rate: u32,
    raw_tx: mpsc::SyncSender<Vec<f32>>,
    events: Emitter<CaptureEvent>,
) -> AgentResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AgentError::DeviceUnavailable(format!("Failed to list devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| AgentError::DeviceUnavailable(format!("Device '{}' not found", name)))?,
        None => host
            .default_input_device()
            .ok_or_else(|| AgentError::DeviceUnavailable("No default input device".into()))?,
    };
    let name = device.name().unwrap_or_else(|_| "unknown".into());

    let (config, format) = pick_config(&device, sample_rate)?;
    log::info!(
        "[capture] using device: {} ({}Hz, {}ch, {:?})",
        name,
        config.sample_rate.0,
        config.channels,
        format
    );

    let stream = match format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, raw_tx, events)?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, raw_tx, events)?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, raw_tx, events)?,
        other => {
            return Err(AgentError::DeviceUnavailable(format!(
                "unsupported sample format {:?}",
                other
            )))
        }
    };
    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => {
            AgentError::DeviceUnavailable("device not available".into())
        }
        cpal::PlayStreamError::BackendSpecific { err } => backend_error(&err.description),
        #[allow(unreachable_patterns)]
        other => AgentError::DeviceUnavailable(other.to_string()),
    })?;
    Ok((stream, config.sample_rate.0))
}

/// Prefer a supported range that covers the target rate directly, otherwise
/// the device default (resampled by the processor).
fn pick_config(device: &cpal::Device, rate: u32) -> AgentResult<(StreamConfig, SampleFormat)> {
    if let Ok(ranges) = device.supported_input_configs() {
        for range in ranges {
            let usable = matches!(
                range.sample_format(),
                SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U16
            );
            if usable
                && range.min_sample_rate().0 <= rate
                && range.max_sample_rate().0 >= rate
            {
                let format = range.sample_format();
                let config = range.with_sample_rate(cpal::SampleRate(rate));
                return Ok((config.config(), format));
            }
        }
    }
    let default = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            AgentError::DeviceUnavailable("device not available".into())
        }
        cpal::DefaultStreamConfigError::BackendSpecific { err } => backend_error(&err.description),
        other => AgentError::DeviceUnavailable(other.to_string()),
    })?;
    Ok((default.config(), default.sample_format()))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    raw_tx: mpsc::SyncSender<Vec<f32>>,
    events: Emitter<CaptureEvent>,
) -> AgentResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Downmix to mono.
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / channels as f32
                    })
                    .collect();
                let _ = raw_tx.try_send(mono);
            },
            move |err| {
                log::error!("[capture] stream error: {}", err);
                let message = match err {
                    cpal::StreamError::DeviceNotAvailable => "input device lost".to_string(),
                    other => other.to_string(),
                };
                events.emit(CaptureEvent::Error(message));
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AgentError::DeviceUnavailable("device not available".into())
            }
            cpal::BuildStreamError::BackendSpecific { err } => backend_error(&err.description),
            other => AgentError::DeviceUnavailable(other.to_string()),
        })
}

/// Hosts report permission problems as backend-specific errors.
fn backend_error(description: &str) -> AgentError {
    let lower = description.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("access") {
        AgentError::PermissionDenied
    } else {
        AgentError::DeviceUnavailable(description.to_string())
    }
}
