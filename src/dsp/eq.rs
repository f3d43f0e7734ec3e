//! Ten-band broadcast equalizer
//!
//! Each band owns one RBJ-cookbook biquad, run in direct form I with
//! independent filter history per channel.

use std::f64::consts::PI;

/// Number of fixed EQ bands
pub const EQ_BANDS: usize = 10;

/// Broadcast band layout (Hz)
pub const BAND_FREQUENCIES: [f64; EQ_BANDS] = [
    80.0, 150.0, 400.0, 800.0, 1500.0, 3000.0, 5000.0, 8000.0, 12000.0, 16000.0,
];

/// Named presets, gain in dB per band
const PRESETS: [(&str, [f64; EQ_BANDS]); 6] = [
    ("flat", [0.0; EQ_BANDS]),
    ("classic_rock", [4.0, 3.0, -1.0, -2.0, -1.0, 1.0, 3.0, 4.0, 4.0, 3.0]),
    ("country", [2.0, 1.0, 0.0, 1.0, 2.0, 3.0, 3.0, 2.0, 2.0, 1.0]),
    ("modern_rock", [5.0, 4.0, 0.0, -2.0, -1.0, 2.0, 4.0, 5.0, 5.0, 4.0]),
    ("broadcast", [3.0, 2.0, 0.0, -1.0, 0.0, 2.0, 3.0, 2.0, 1.0, 0.0]),
    ("spoken_word", [-4.0, -2.0, 0.0, 2.0, 4.0, 4.0, 3.0, 1.0, -1.0, -3.0]),
];

/// Names of the built-in presets
pub fn preset_names() -> impl Iterator<Item = &'static str> {
    PRESETS.iter().map(|(name, _)| *name)
}

/// Filter shape of a band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandType {
    LowShelf,
    Peaking,
    HighShelf,
}

/// Configuration of one EQ band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqBand {
    pub band_type: BandType,
    pub frequency_hz: f64,
    pub gain_db: f64,
    pub q: f64,
    pub enabled: bool,
}

impl EqBand {
    /// Default band at a position of the broadcast layout
    pub fn broadcast(index: usize) -> Self {
        let band_type = match index {
            0 => BandType::LowShelf,
            i if i == EQ_BANDS - 1 => BandType::HighShelf,
            _ => BandType::Peaking,
        };
        let q = match band_type {
            BandType::Peaking => 1.0,
            _ => std::f64::consts::FRAC_1_SQRT_2,
        };
        Self {
            band_type,
            frequency_hz: BAND_FREQUENCIES[index.min(EQ_BANDS - 1)],
            gain_db: 0.0,
            q,
            enabled: true,
        }
    }

    fn is_active(&self) -> bool {
        self.enabled && self.gain_db.abs() > 1e-6
    }
}

/// Normalized biquad coefficients (a0 == 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoefficients {
    pub const IDENTITY: Self = Self { b0: 1.0, b1: 0.0, b2: 0.0, a1: 0.0, a2: 0.0 };

    /// Design coefficients for a band at the given sample rate
    pub fn design(band: &EqBand, sample_rate: u32) -> Self {
        if !band.is_active() || sample_rate == 0 {
            return Self::IDENTITY;
        }

        let fs = sample_rate as f64;
        // Keep the corner safely below Nyquist for low sample rates
        let freq = band.frequency_hz.clamp(10.0, fs * 0.49);
        let q = band.q.max(0.05);
        let w0 = 2.0 * PI * freq / fs;
        let (sin_w, cos_w) = w0.sin_cos();
        let a = 10f64.powf(band.gain_db / 40.0);
        let alpha = sin_w / (2.0 * q);

        let (b0, b1, b2, a0, a1, a2) = match band.band_type {
            BandType::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos_w,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_w,
                1.0 - alpha / a,
            ),
            BandType::LowShelf => {
                let sqrt_a2 = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) - (a - 1.0) * cos_w + sqrt_a2),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w),
                    a * ((a + 1.0) - (a - 1.0) * cos_w - sqrt_a2),
                    (a + 1.0) + (a - 1.0) * cos_w + sqrt_a2,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos_w),
                    (a + 1.0) + (a - 1.0) * cos_w - sqrt_a2,
                )
            }
            BandType::HighShelf => {
                let sqrt_a2 = 2.0 * a.sqrt() * alpha;
                (
                    a * ((a + 1.0) + (a - 1.0) * cos_w + sqrt_a2),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w),
                    a * ((a + 1.0) + (a - 1.0) * cos_w - sqrt_a2),
                    (a + 1.0) - (a - 1.0) * cos_w + sqrt_a2,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos_w),
                    (a + 1.0) - (a - 1.0) * cos_w - sqrt_a2,
                )
            }
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }
}

/// Direct-form-I history for one channel
#[derive(Debug, Clone, Copy, Default)]
struct History {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

#[derive(Debug, Clone)]
struct Band {
    config: EqBand,
    coeffs: BiquadCoefficients,
    history: Vec<History>,
}

impl Band {
    fn process(&mut self, buffer: &mut [f32], frames: usize, channels: usize) {
        let c = self.coeffs;
        for frame in buffer.chunks_exact_mut(channels).take(frames) {
            for (sample, h) in frame.iter_mut().zip(self.history.iter_mut()) {
                let x = *sample as f64;
                let y = c.b0 * x + c.b1 * h.x1 + c.b2 * h.x2 - c.a1 * h.y1 - c.a2 * h.y2;
                h.x2 = h.x1;
                h.x1 = x;
                h.y2 = h.y1;
                h.y1 = y;
                *sample = y as f32;
            }
        }
    }
}

/// Ten-band equalizer
#[derive(Debug, Clone)]
pub struct DspEq {
    bands: Vec<Band>,
    sample_rate: u32,
    channels: usize,
    preset: String,
}

impl DspEq {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let bands = (0..EQ_BANDS)
            .map(|i| {
                let config = EqBand::broadcast(i);
                Band {
                    coeffs: BiquadCoefficients::design(&config, sample_rate),
                    config,
                    history: vec![History::default(); channels],
                }
            })
            .collect();
        Self {
            bands,
            sample_rate,
            channels,
            preset: "flat".to_string(),
        }
    }

    /// Change sample rate / channel count, recomputing every band
    pub fn set_format(&mut self, sample_rate: u32, channels: u16) {
        self.sample_rate = sample_rate;
        self.channels = channels.max(1) as usize;
        for band in &mut self.bands {
            band.coeffs = BiquadCoefficients::design(&band.config, sample_rate);
            band.history = vec![History::default(); self.channels];
        }
    }

    /// Replace one band's configuration
    pub fn set_band(&mut self, index: usize, config: EqBand) -> bool {
        let Some(band) = self.bands.get_mut(index) else {
            return false;
        };
        band.config = config;
        band.coeffs = BiquadCoefficients::design(&config, self.sample_rate);
        true
    }

    pub fn band(&self, index: usize) -> Option<&EqBand> {
        self.bands.get(index).map(|b| &b.config)
    }

    pub fn coefficients(&self, index: usize) -> Option<BiquadCoefficients> {
        self.bands.get(index).map(|b| b.coeffs)
    }

    /// Apply a named preset. Unknown names leave the bands untouched.
    pub fn apply_preset(&mut self, name: &str) -> bool {
        let Some((preset_name, gains)) = PRESETS.iter().find(|(n, _)| *n == name) else {
            return false;
        };
        for (index, gain) in gains.iter().enumerate() {
            let mut config = self.bands[index].config;
            config.gain_db = *gain;
            self.set_band(index, config);
        }
        self.preset = preset_name.to_string();
        true
    }

    pub fn preset(&self) -> &str {
        &self.preset
    }

    /// Clear all filter history
    pub fn reset(&mut self) {
        for band in &mut self.bands {
            band.history.iter_mut().for_each(|h| *h = History::default());
        }
    }

    /// Filter an interleaved buffer in place
    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        let channels = self.channels;
        for band in self.bands.iter_mut().filter(|b| b.config.is_active()) {
            band.process(buffer, frames, channels);
        }
    }
}
