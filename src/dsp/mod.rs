//! Real-time signal processing chain
//!
//! EQ then AGC are applied by [`DspChain::process`]. The crossfader is owned
//! by the chain but driven separately at track boundaries.

pub mod agc;
pub mod crossfader;
pub mod eq;

pub use agc::{AgcConfig, DspAgc};
pub use crossfader::{CrossfaderConfig, DspCrossfader, FadeCallback};
pub use eq::{BandType, BiquadCoefficients, DspEq, EqBand};

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

/// Settings for the whole chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DspChainConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub eq_enabled: bool,
    pub eq_preset: String,
    pub agc: AgcConfig,
    pub crossfade: CrossfaderConfig,
}

impl Default for DspChainConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            eq_enabled: false,
            eq_preset: "flat".to_string(),
            agc: AgcConfig::default(),
            crossfade: CrossfaderConfig::default(),
        }
    }
}

impl DspChainConfig {
    /// True when `process` would touch the samples at all
    pub fn is_active(&self) -> bool {
        self.eq_enabled || self.agc.enabled
    }
}

/// EQ -> AGC processing chain with an attached crossfader
#[derive(Debug)]
pub struct DspChain {
    config: DspChainConfig,
    eq: DspEq,
    agc: DspAgc,
    crossfader: DspCrossfader,
}

impl DspChain {
    pub fn new(config: DspChainConfig) -> Self {
        let mut chain = Self {
            eq: DspEq::new(config.sample_rate, config.channels),
            agc: DspAgc::new(config.agc, config.sample_rate, config.channels),
            crossfader: DspCrossfader::new(config.crossfade, config.sample_rate, config.channels),
            config: DspChainConfig::default(),
        };
        chain.configure(config);
        chain
    }

    /// Apply a configuration. Takes effect on the next processed buffer.
    pub fn configure(&mut self, config: DspChainConfig) {
        let format_changed = config.sample_rate != self.config.sample_rate
            || config.channels != self.config.channels;
        if format_changed {
            self.eq.set_format(config.sample_rate, config.channels);
        }
        if !self.eq.apply_preset(&config.eq_preset) {
            tracing::warn!("Unknown EQ preset '{}', keeping '{}'", config.eq_preset, self.eq.preset());
        }
        self.agc.configure(config.agc, config.sample_rate, config.channels);
        self.crossfader
            .configure(config.crossfade, config.sample_rate, config.channels);
        tracing::debug!(
            eq = config.eq_enabled,
            preset = %self.eq.preset(),
            agc = config.agc.enabled,
            crossfade = config.crossfade.enabled,
            "DSP chain configured"
        );
        self.config = config;
    }

    pub fn config(&self) -> &DspChainConfig {
        &self.config
    }

    /// Process an interleaved buffer in place
    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        if self.config.eq_enabled {
            self.eq.process(buffer, frames);
        }
        if self.config.agc.enabled {
            self.agc.process(buffer, frames);
        }
    }

    /// Clear filter history, AGC gain and any running fade
    pub fn reset(&mut self) {
        self.eq.reset();
        self.agc.reset();
        self.crossfader.reset();
    }

    pub fn eq_apply_preset(&mut self, name: &str) -> bool {
        if self.eq.apply_preset(name) {
            self.config.eq_preset = name.to_string();
            true
        } else {
            false
        }
    }

    pub fn eq(&self) -> &DspEq {
        &self.eq
    }

    pub fn eq_mut(&mut self) -> &mut DspEq {
        &mut self.eq
    }

    /// Current AGC gain reduction in dB
    pub fn gain_reduction_db(&self) -> f32 {
        if self.config.agc.enabled {
            self.agc.gain_reduction_db()
        } else {
            0.0
        }
    }

    pub fn crossfader(&self) -> &DspCrossfader {
        &self.crossfader
    }

    pub fn crossfader_mut(&mut self) -> &mut DspCrossfader {
        &mut self.crossfader
    }
}

impl Default for DspChain {
    fn default() -> Self {
        Self::new(DspChainConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn eq_config(preset: &str) -> DspChainConfig {
        DspChainConfig {
            eq_enabled: true,
            eq_preset: preset.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_chain_is_passthrough() {
        let mut chain = DspChain::default();
        let input: Vec<f32> = (0..256).map(|i| (i as f32 * 0.05).sin()).collect();
        let mut output = input.clone();
        chain.process(&mut output, 128);
        assert_eq!(input, output);
        assert!(!chain.config().is_active());
    }

    #[test]
    fn test_reconfigure_applies_on_next_buffer() {
        let mut chain = DspChain::new(eq_config("flat"));
        let input = vec![0.2f32; 2048];

        let mut first = input.clone();
        chain.process(&mut first, 1024);
        assert_eq!(first, input);

        chain.configure(eq_config("spoken_word"));
        let mut second = input.clone();
        chain.process(&mut second, 1024);
        assert_ne!(second, input);
        assert_eq!(chain.eq().preset(), "spoken_word");
    }

    #[test]
    fn test_unknown_preset_keeps_previous() {
        let mut chain = DspChain::new(eq_config("country"));
        assert!(!chain.eq_apply_preset("polka"));
        assert_eq!(chain.eq().preset(), "country");
        assert_eq!(chain.config().eq_preset, "country");
    }

    #[test]
    fn test_sample_rate_change_redesigns_filters() {
        let mut chain = DspChain::new(eq_config("broadcast"));
        let before = chain.eq().coefficients(5);
        chain.configure(DspChainConfig {
            sample_rate: 22050,
            ..eq_config("broadcast")
        });
        assert_ne!(before, chain.eq().coefficients(5));
    }

    proptest! {
        #[test]
        fn prop_flat_eq_is_identity(samples in proptest::collection::vec(-1.0f32..1.0, 2..512)) {
            let mut chain = DspChain::new(eq_config("flat"));
            let frames = samples.len() / 2;
            let mut output = samples.clone();
            chain.process(&mut output, frames);
            for (a, b) in samples.iter().zip(output.iter()) {
                prop_assert!((a - b).abs() < 1e-6);
            }
        }

        #[test]
        fn prop_agc_output_within_ceiling(samples in proptest::collection::vec(-4.0f32..4.0, 2..512)) {
            let config = DspChainConfig {
                agc: AgcConfig { enabled: true, ..Default::default() },
                ..Default::default()
            };
            let ceiling = 10f32.powf(config.agc.limiter_ceiling_db / 20.0);
            let mut chain = DspChain::new(config);
            let frames = samples.len() / 2;
            let mut output = samples.clone();
            chain.process(&mut output, frames);
            for s in output.iter().take(frames * 2) {
                prop_assert!(s.abs() <= ceiling + 1e-6);
            }
        }
    }
}
