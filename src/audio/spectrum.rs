use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

pub const FFT_SIZE: usize = 256;
pub const BAR_COUNT: usize = 32;

/// Hann-windowed FFT over the most recent `FFT_SIZE` samples, folded into
/// `BAR_COUNT` smoothed magnitude bars for the visualizer.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    ring: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    smoothed: [f32; BAR_COUNT],
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
            ring: Vec::with_capacity(FFT_SIZE * 2),
            buffer: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            smoothed: [0.0; BAR_COUNT],
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.ring.extend_from_slice(samples);
        // Keep only the latest window.
        if self.ring.len() > FFT_SIZE * 2 {
            let drain = self.ring.len() - FFT_SIZE * 2;
            self.ring.drain(..drain);
        }
    }

    /// Recompute the bars from the latest window. Returns `None` until a full
    /// window has been pushed.
    pub fn bars(&mut self) -> Option<[f32; BAR_COUNT]> {
        if self.ring.len() < FFT_SIZE {
            return None;
        }
        let start = self.ring.len() - FFT_SIZE;
        for i in 0..FFT_SIZE {
            let window = 0.5
                * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE as f32 - 1.0)).cos());
            self.buffer[i] = Complex::new(self.ring[start + i] * window, 0.0);
        }
        self.fft.process(&mut self.buffer);

        // Skip the DC bin.
        let max_bin = FFT_SIZE / 2;
        for i in 0..BAR_COUNT {
            let idx = 1 + ((i as f32 / BAR_COUNT as f32) * (max_bin as f32 - 1.0)) as usize;
            let idx = idx.min(max_bin - 1);
            let normalized = (self.buffer[idx].norm() * 0.4).min(1.0);
            self.smoothed[i] = self.smoothed[i] * 0.6 + normalized * 0.4;
        }
        Some(self.smoothed)
    }
}
