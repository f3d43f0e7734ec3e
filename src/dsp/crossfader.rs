//! Equal-power crossfader
//!
//! Fade-out follows `cos(t·π/2)`, fade-in `sin(t·π/2)`, so the squared gains
//! of the two curves always sum to one.

use std::f32::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

/// Crossfade settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossfaderConfig {
    pub enabled: bool,
    pub duration_sec: f32,
}

impl Default for CrossfaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_sec: 3.0,
        }
    }
}

/// Invoked once when a fade reaches its end
pub type FadeCallback = Box<dyn FnOnce() + Send>;

/// Equal-power crossfader
pub struct DspCrossfader {
    config: CrossfaderConfig,
    sample_rate: u32,
    channels: usize,
    /// Fade position in [0, 1]
    position: f32,
    fading: bool,
    on_complete: Option<FadeCallback>,
}

impl DspCrossfader {
    pub fn new(config: CrossfaderConfig, sample_rate: u32, channels: u16) -> Self {
        Self {
            config,
            sample_rate,
            channels: channels.max(1) as usize,
            position: 0.0,
            fading: false,
            on_complete: None,
        }
    }

    pub fn configure(&mut self, config: CrossfaderConfig, sample_rate: u32, channels: u16) {
        self.config = config;
        self.sample_rate = sample_rate;
        self.channels = channels.max(1) as usize;
    }

    pub fn config(&self) -> &CrossfaderConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_fading(&self) -> bool {
        self.fading
    }

    pub fn position(&self) -> f32 {
        self.position
    }

    /// Begin a new fade from position 0, replacing any pending callback
    pub fn start_fade(&mut self, on_complete: Option<FadeCallback>) {
        self.position = 0.0;
        self.fading = true;
        self.on_complete = on_complete;
    }

    /// Abandon the current fade without firing its callback
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.fading = false;
        self.on_complete = None;
    }

    fn step(&self) -> f32 {
        let total = self.config.duration_sec.max(0.0) * self.sample_rate as f32;
        if total < 1.0 {
            1.0
        } else {
            1.0 / total
        }
    }

    /// Current position, then advance by one frame
    fn advance(&mut self, step: f32) -> f32 {
        let t = self.position;
        if self.fading {
            self.position = (self.position + step).min(1.0);
        }
        t
    }

    fn finish_if_done(&mut self) -> bool {
        if self.fading && self.position >= 1.0 {
            self.fading = false;
            if let Some(callback) = self.on_complete.take() {
                callback();
            }
            return true;
        }
        false
    }

    /// Fade a buffer out in place. Returns true when this call completed the fade.
    pub fn apply_fade_out(&mut self, buffer: &mut [f32], frames: usize) -> bool {
        let step = self.step();
        let channels = self.channels;
        for frame in buffer.chunks_exact_mut(channels).take(frames) {
            let gain = (self.advance(step) * FRAC_PI_2).cos();
            frame.iter_mut().for_each(|s| *s *= gain);
        }
        self.finish_if_done()
    }

    /// Fade a buffer in place from silence. Returns true when the fade completed.
    pub fn apply_fade_in(&mut self, buffer: &mut [f32], frames: usize) -> bool {
        let step = self.step();
        let channels = self.channels;
        for frame in buffer.chunks_exact_mut(channels).take(frames) {
            let gain = (self.advance(step) * FRAC_PI_2).sin();
            frame.iter_mut().for_each(|s| *s *= gain);
        }
        self.finish_if_done()
    }

    /// Equal-power mix of an outgoing and an incoming buffer into `out`.
    ///
    /// When disabled the outgoing buffer passes through untouched.
    pub fn mix(&mut self, outgoing: &[f32], incoming: &[f32], out: &mut [f32], frames: usize) -> bool {
        let channels = self.channels;
        let len = (frames * channels).min(outgoing.len()).min(out.len());
        if !self.config.enabled {
            out[..len].copy_from_slice(&outgoing[..len]);
            return false;
        }

        let step = self.step();
        for (i, frame) in out[..len].chunks_exact_mut(channels).enumerate() {
            let theta = self.advance(step) * FRAC_PI_2;
            let (fade_in, fade_out) = theta.sin_cos();
            for (c, sample) in frame.iter_mut().enumerate() {
                let idx = i * channels + c;
                let b = incoming.get(idx).copied().unwrap_or(0.0);
                *sample = outgoing[idx] * fade_out + b * fade_in;
            }
        }
        self.finish_if_done()
    }
}

impl std::fmt::Debug for DspCrossfader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DspCrossfader")
            .field("config", &self.config)
            .field("position", &self.position)
            .field("fading", &self.fading)
            .finish()
    }
}
