//! Capture device enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::AudioError;

/// Input device as listed to operators; `index` is what slot configs refer to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioDeviceInfo {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// All input devices of the default host, in enumeration order
pub fn list_input_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let Ok(devices) = host.input_devices() else {
        return Vec::new();
    };

    devices
        .enumerate()
        .map(|(index, device)| {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let (sample_rates, channels) = input_capabilities(&device);
            AudioDeviceInfo {
                index,
                is_default: default_name.as_ref() == Some(&name),
                name,
                sample_rates,
                channels,
            }
        })
        .collect()
}

fn input_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_input_configs() {
        for config in configs {
            for rate in [22050u32, 32000, 44100, 48000, 88200, 96000] {
                let sr = cpal::SampleRate(rate);
                if sr >= config.min_sample_rate() && sr <= config.max_sample_rate() && !rates.contains(&rate) {
                    rates.push(rate);
                }
            }
            if !channels.contains(&config.channels()) {
                channels.push(config.channels());
            }
        }
    }

    rates.sort_unstable();
    channels.sort_unstable();
    (rates, channels)
}

/// Input device by index, or the host default
pub fn input_device(index: Option<usize>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    match index {
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string())),
        Some(index) => host
            .input_devices()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .nth(index)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("input #{}", index))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumeration_is_indexed() {
        // Machines without audio hardware simply list nothing
        for (i, device) in list_input_devices().iter().enumerate() {
            assert_eq!(device.index, i);
            assert!(device.sample_rates.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_missing_index_is_reported() {
        assert!(matches!(
            input_device(Some(usize::MAX)),
            Err(AudioError::DeviceNotFound(_))
        ));
    }
}
