//! Channel remixing and sample-rate conversion to the slot format

/// Remix interleaved `input` from `from` to `to` channels
pub fn remix(input: &[f32], from: u16, to: u16) -> Vec<f32> {
    let from = from.max(1) as usize;
    let to = to.max(1) as usize;
    if from == to {
        return input.to_vec();
    }

    let frames = input.len() / from;
    let mut out = Vec::with_capacity(frames * to);
    for frame in input.chunks_exact(from) {
        match (from, to) {
            (1, _) => out.extend(std::iter::repeat(frame[0]).take(to)),
            (_, 1) => out.push(frame.iter().sum::<f32>() / from as f32),
            // Keep the leading channels, repeat the last one if widening
            _ => out.extend((0..to).map(|c| frame[c.min(from - 1)])),
        }
    }
    out
}

/// Streaming linear-interpolation resampler
///
/// Keeps the last input frame between calls so buffer boundaries do not
/// click.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    channels: usize,
    /// Input frames advanced per output frame
    step: f64,
    /// Read position; 0.0 is the previous call's last frame
    position: f64,
    previous: Vec<f32>,
    primed: bool,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Self {
        Self {
            channels: channels.max(1) as usize,
            step: from_rate.max(1) as f64 / to_rate.max(1) as f64,
            position: 0.0,
            previous: vec![0.0; channels.max(1) as usize],
            primed: false,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        let ch = self.channels;
        let frames = input.len() / ch;
        if frames == 0 {
            return Vec::new();
        }
        if !self.primed {
            self.previous.copy_from_slice(&input[..ch]);
            self.primed = true;
        }

        let previous = &self.previous;
        let sample = |index: usize, c: usize| {
            if index == 0 {
                previous[c]
            } else {
                input[(index - 1) * ch + c]
            }
        };

        let mut out = Vec::with_capacity(((frames as f64 / self.step) as usize + 1) * ch);
        let mut position = self.position;
        while position < frames as f64 {
            let index = position as usize;
            let t = (position - index as f64) as f32;
            for c in 0..ch {
                let a = sample(index, c);
                let b = sample(index + 1, c);
                out.push(a + (b - a) * t);
            }
            position += self.step;
        }

        self.position = position - frames as f64;
        self.previous.copy_from_slice(&input[(frames - 1) * ch..frames * ch]);
        out
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.primed = false;
    }
}

/// Remix then resample a source format into the slot format
#[derive(Debug, Clone)]
pub struct FormatConverter {
    from_channels: u16,
    to_channels: u16,
    resampler: LinearResampler,
}

impl FormatConverter {
    pub fn new(from_rate: u32, from_channels: u16, to_rate: u32, to_channels: u16) -> Self {
        Self {
            from_channels,
            to_channels,
            resampler: LinearResampler::new(from_rate, to_rate, to_channels),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_channels == self.to_channels && self.resampler.is_passthrough()
    }

    /// Converted samples; frames = `len / to_channels`
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        let remixed = remix(input, self.from_channels, self.to_channels);
        self.resampler.process(&remixed)
    }

    pub fn output_channels(&self) -> u16 {
        self.to_channels
    }
}
