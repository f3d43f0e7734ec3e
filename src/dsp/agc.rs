//! Feed-forward AGC with brick-wall limiter

use serde::{Deserialize, Serialize};

/// AGC / limiter settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcConfig {
    pub enabled: bool,
    /// Compression threshold in dBFS
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_gain_db: f32,
    /// Output ceiling in dBFS
    pub limiter_ceiling_db: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_db: -18.0,
            ratio: 3.0,
            attack_ms: 5.0,
            release_ms: 150.0,
            makeup_gain_db: 3.0,
            limiter_ceiling_db: -1.0,
        }
    }
}

fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn linear_to_db(lin: f32) -> f32 {
    20.0 * lin.max(1e-9).log10()
}

/// Exponential smoothing coefficient for a time constant
fn smoothing_coefficient(time_ms: f32, sample_rate: u32) -> f32 {
    let samples = time_ms.max(0.01) * sample_rate as f32 / 1000.0;
    1.0 - (-2.2 / samples).exp()
}

/// Automatic gain control stage
#[derive(Debug, Clone)]
pub struct DspAgc {
    config: AgcConfig,
    sample_rate: u32,
    channels: usize,
    attack_coef: f32,
    release_coef: f32,
    ceiling_lin: f32,
    makeup_lin: f32,
    /// Smoothed linear gain
    gain: f32,
    gain_db: f32,
}

impl DspAgc {
    pub fn new(config: AgcConfig, sample_rate: u32, channels: u16) -> Self {
        let mut agc = Self {
            config,
            sample_rate,
            channels: channels.max(1) as usize,
            attack_coef: 0.0,
            release_coef: 0.0,
            ceiling_lin: 1.0,
            makeup_lin: 1.0,
            gain: 1.0,
            gain_db: 0.0,
        };
        agc.configure(config, sample_rate, channels);
        agc.reset();
        agc
    }

    /// Apply new settings. The smoothed gain is kept unless the makeup gain moved.
    pub fn configure(&mut self, config: AgcConfig, sample_rate: u32, channels: u16) {
        let makeup_changed = self.config.makeup_gain_db != config.makeup_gain_db;
        self.config = config;
        self.sample_rate = sample_rate;
        self.channels = channels.max(1) as usize;
        self.attack_coef = smoothing_coefficient(config.attack_ms, sample_rate);
        self.release_coef = smoothing_coefficient(config.release_ms, sample_rate);
        self.ceiling_lin = db_to_linear(config.limiter_ceiling_db);
        self.makeup_lin = db_to_linear(config.makeup_gain_db);
        if makeup_changed {
            self.reset();
        }
    }

    pub fn config(&self) -> &AgcConfig {
        &self.config
    }

    /// Reset the smoothed gain to the resting (makeup) gain
    pub fn reset(&mut self) {
        self.gain = self.makeup_lin;
        self.gain_db = self.config.makeup_gain_db;
    }

    /// Instantaneous target gain in dB for a frame peak
    fn target_gain_db(&self, peak: f32) -> f32 {
        let peak_db = linear_to_db(peak);
        let makeup = self.config.makeup_gain_db;
        let mut gain_db = if peak_db <= self.config.threshold_db {
            makeup
        } else {
            let over_db = peak_db - self.config.threshold_db;
            makeup - over_db * (1.0 - 1.0 / self.config.ratio.max(1.0))
        };
        if peak_db + gain_db > self.config.limiter_ceiling_db {
            gain_db = self.config.limiter_ceiling_db - peak_db;
        }
        gain_db
    }

    /// Process an interleaved buffer in place
    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        let channels = self.channels;
        let ceiling = self.ceiling_lin;
        for frame in buffer.chunks_exact_mut(channels).take(frames) {
            let peak = frame.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            let target = db_to_linear(self.target_gain_db(peak));
            let coef = if target < self.gain {
                self.attack_coef
            } else {
                self.release_coef
            };
            self.gain += coef * (target - self.gain);
            for sample in frame.iter_mut() {
                *sample = (*sample * self.gain).clamp(-ceiling, ceiling);
            }
        }
        self.gain_db = linear_to_db(self.gain);
    }

    /// Current smoothed gain in dB
    pub fn current_gain_db(&self) -> f32 {
        self.gain_db
    }

    /// Gain reduction relative to the makeup gain, for metering (>= 0)
    pub fn gain_reduction_db(&self) -> f32 {
        (self.config.makeup_gain_db - self.gain_db).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgcConfig {
        AgcConfig {
            enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_threshold_never_exceeded_applies_makeup_only() {
        let cfg = AgcConfig {
            threshold_db: 100.0,
            makeup_gain_db: 3.0,
            ..config()
        };
        let mut agc = DspAgc::new(cfg, 44100, 2);
        let makeup = db_to_linear(3.0);
        let input: Vec<f32> = (0..2048).map(|i| ((i as f32) * 0.01).sin() * 0.25).collect();
        let mut output = input.clone();
        agc.process(&mut output, 1024);
        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a * makeup - b).abs() < 1e-6);
        }
        assert!(agc.gain_reduction_db() < 1e-4);
    }

    #[test]
    fn test_loud_signal_is_compressed() {
        let mut agc = DspAgc::new(config(), 48000, 1);
        let mut buffer = vec![0.9f32; 48000];
        agc.process(&mut buffer, 48000);
        assert!(agc.gain_reduction_db() > 3.0);
        assert!(buffer[47999] < 0.9);
    }

    #[test]
    fn test_output_never_exceeds_ceiling() {
        let cfg = AgcConfig {
            attack_ms: 500.0,
            makeup_gain_db: 12.0,
            ..config()
        };
        let mut agc = DspAgc::new(cfg, 44100, 2);
        let ceiling = db_to_linear(cfg.limiter_ceiling_db);
        let mut buffer: Vec<f32> = (0..8192).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        agc.process(&mut buffer, 4096);
        assert!(buffer.iter().all(|s| s.abs() <= ceiling + 1e-6));
    }

    #[test]
    fn test_release_recovers_after_peak() {
        let mut agc = DspAgc::new(config(), 48000, 1);
        let mut loud = vec![0.9f32; 9600];
        agc.process(&mut loud, 9600);
        let compressed = agc.gain_reduction_db();
        let mut quiet = vec![0.01f32; 96000];
        agc.process(&mut quiet, 96000);
        assert!(agc.gain_reduction_db() < compressed);
        assert!(agc.gain_reduction_db() < 0.5);
    }

    #[test]
    fn test_steady_state_follows_gain_law() {
        let cfg = AgcConfig {
            threshold_db: -18.0,
            ratio: 3.0,
            makeup_gain_db: 0.0,
            ..config()
        };
        let mut agc = DspAgc::new(cfg, 48000, 1);
        let mut buffer = vec![0.5f32; 48000];
        agc.process(&mut buffer, 48000);

        // 0.5 peaks at -6.02 dBFS: 11.98 dB over, two thirds of it removed
        let expected = (linear_to_db(0.5) + 18.0) * (1.0 - 1.0 / 3.0);
        assert!((expected - 7.99).abs() < 0.01);
        assert!(
            (agc.gain_reduction_db() - expected).abs() < 0.1,
            "reduction {}",
            agc.gain_reduction_db()
        );
        let out = 0.5 * db_to_linear(-expected);
        assert!((buffer[47999] - out).abs() < 1e-3);
    }

    #[test]
    fn test_makeup_clamped_to_ceiling() {
        let cfg = AgcConfig {
            makeup_gain_db: 24.0,
            limiter_ceiling_db: -1.0,
            ..config()
        };
        let mut agc = DspAgc::new(cfg, 48000, 1);
        // -20 dBFS sits under the threshold, so only makeup applies, but
        // 24 dB of it would land at +4 dBFS
        let mut buffer = vec![0.1f32; 48000];
        agc.process(&mut buffer, 48000);
        assert!((agc.current_gain_db() - 19.0).abs() < 0.1, "gain {}", agc.current_gain_db());
        assert!((buffer[47999] - db_to_linear(-1.0)).abs() < 1e-3);
    }

    #[test]
    fn test_attack_pulls_down_release_lets_go() {
        let cfg = AgcConfig {
            attack_ms: 5.0,
            release_ms: 150.0,
            makeup_gain_db: 0.0,
            ..config()
        };
        let mut agc = DspAgc::new(cfg, 48000, 1);
        let loud_target = db_to_linear(agc.target_gain_db(0.5));

        // One attack time (240 samples) covers 1 - e^-2.2 of the distance
        let mut loud = vec![0.5f32; 240];
        agc.process(&mut loud, 240);
        let moved = (1.0 - agc.gain) / (1.0 - loud_target);
        assert!((moved - (1.0 - (-2.2f32).exp())).abs() < 0.01, "moved {}", moved);

        // Settle, then drop below threshold: the release time applies
        let mut loud = vec![0.5f32; 48000];
        agc.process(&mut loud, 48000);
        let settled = agc.gain;
        let mut quiet = vec![0.01f32; 240];
        agc.process(&mut quiet, 240);
        let recovered = (agc.gain - settled) / (1.0 - settled);
        let release_step = 1.0 - (-2.2f32 * 240.0 / 7200.0).exp();
        assert!((recovered - release_step).abs() < 0.01, "recovered {}", recovered);
    }

    #[test]
    fn test_smoothing_coefficient_range() {
        let fast = smoothing_coefficient(1.0, 48000);
        let slow = smoothing_coefficient(1000.0, 48000);
        assert!(fast > slow);
        assert!(fast > 0.0 && fast < 1.0);
        assert!(slow > 0.0);
    }
}
