/// Streaming linear-interpolation resampler. Keeps the last input sample and
/// the fractional read position between calls so chunk boundaries are seamless.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    pos: f64,
    last_sample: Option<f32>,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate: input_rate.max(1),
            output_rate: output_rate.max(1),
            pos: 0.0,
            last_sample: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.input_rate == self.output_rate
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.last_sample = None;
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if samples.is_empty() || self.is_passthrough() {
            return samples.to_vec();
        }
        let step = self.input_rate as f64 / self.output_rate as f64;

        let mut buf = Vec::with_capacity(samples.len() + 1);
        if let Some(last) = self.last_sample {
            buf.push(last);
        }
        buf.extend_from_slice(samples);

        let mut out = Vec::with_capacity((samples.len() as f64 / step) as usize + 2);
        let mut pos = self.pos;
        loop {
            let i = pos as usize;
            if i + 1 >= buf.len() {
                break;
            }
            let frac = (pos - i as f64) as f32;
            let s0 = buf[i];
            let s1 = buf[i + 1];
            out.push(s0 + (s1 - s0) * frac);
            pos += step;
        }

        // The last sample becomes index 0 of the next call's buffer.
        self.pos = pos - (buf.len() - 1) as f64;
        self.last_sample = buf.last().copied();
        out
    }
}
