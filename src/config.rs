//! Station and relay configuration
//!
//! All structs are serde-backed with defaults so partial TOML files load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::codec::{CodecKind, CodecSettings};
use crate::constants::DEFAULT_RELAY_PORT;
use crate::dsp::eq::preset_names;
use crate::dsp::{AgcConfig, CrossfaderConfig, DspChainConfig};
use crate::error::{Error, Result};

/// Relay protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerProtocol {
    Icecast2,
    ShoutcastV1,
    ShoutcastV2,
}

impl ServerProtocol {
    /// Icecast2 and Shoutcast v2 share the HTTP PUT source handshake
    pub fn uses_http_put(&self) -> bool {
        matches!(self, ServerProtocol::Icecast2 | ServerProtocol::ShoutcastV2)
    }
}

/// Station metadata announced during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationInfo {
    pub name: String,
    pub description: String,
    pub genre: String,
    pub url: String,
    pub content_type: String,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Listed in the relay's public directory
    pub public: bool,
}

impl Default for StationInfo {
    fn default() -> Self {
        Self {
            name: "Relaycast".to_string(),
            description: String::new(),
            genre: String::new(),
            url: String::new(),
            content_type: CodecKind::Mp3.content_type().to_string(),
            bitrate_kbps: crate::constants::DEFAULT_BITRATE_KBPS,
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channels: crate::constants::DEFAULT_CHANNELS,
            public: false,
        }
    }
}

/// Optional social / location headers. Empty fields are not sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedIdentity {
    pub twitter: String,
    pub facebook: String,
    pub instagram: String,
    pub email: String,
    pub language: String,
    pub country: String,
    pub city: String,
}

/// Relay connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTarget {
    pub protocol: ServerProtocol,
    pub host: String,
    pub port: u16,
    pub mount: String,
    pub username: String,
    pub password: String,
    pub station: StationInfo,
    pub identity: ExtendedIdentity,
    pub retry_interval_sec: u32,
    /// -1 means retry forever
    pub max_retries: i32,
}

impl Default for StreamTarget {
    fn default() -> Self {
        Self {
            protocol: ServerProtocol::Icecast2,
            host: "localhost".to_string(),
            port: DEFAULT_RELAY_PORT,
            mount: "/stream".to_string(),
            username: "source".to_string(),
            password: String::new(),
            station: StationInfo::default(),
            identity: ExtendedIdentity::default(),
            retry_interval_sec: 5,
            max_retries: -1,
        }
    }
}

impl StreamTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Where a slot gets its audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    /// Capture device by enumeration index; `None` picks the default input
    Device { index: Option<usize> },
    /// Playlist file (or a single audio file)
    Playlist { path: PathBuf },
    /// Remote stream handed to the source factory
    Url { url: String },
}

impl Default for InputSource {
    fn default() -> Self {
        InputSource::Device { index: None }
    }
}

/// Side recording of the outgoing PCM
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub enabled: bool,
    pub directory: PathBuf,
}

/// Complete description of one station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub slot_id: u32,
    pub name: String,
    pub input: InputSource,
    pub codec: CodecSettings,
    pub stream: StreamTarget,

    pub volume: f32,
    pub shuffle: bool,
    pub repeat_all: bool,

    pub archive: ArchiveSettings,

    pub eq_enabled: bool,
    pub eq_preset: String,
    pub agc: AgcConfig,
    pub crossfade: CrossfaderConfig,

    pub auto_start: bool,
    pub auto_start_delay_sec: u32,
    pub auto_reconnect: bool,
    pub reconnect_interval_sec: u32,
    /// 0 means unlimited
    pub reconnect_max_attempts: i32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            slot_id: 1,
            name: "Station".to_string(),
            input: InputSource::default(),
            codec: CodecSettings::default(),
            stream: StreamTarget::default(),
            volume: 1.0,
            shuffle: false,
            repeat_all: true,
            archive: ArchiveSettings::default(),
            eq_enabled: false,
            eq_preset: "flat".to_string(),
            agc: AgcConfig::default(),
            crossfade: CrossfaderConfig::default(),
            auto_start: false,
            auto_start_delay_sec: 0,
            auto_reconnect: true,
            reconnect_interval_sec: 5,
            reconnect_max_attempts: 0,
        }
    }
}

impl EncoderConfig {
    /// Relay target with the slot's reconnect policy and codec format applied
    pub fn stream_target(&self) -> StreamTarget {
        let mut target = self.stream.clone();
        target.retry_interval_sec = self.reconnect_interval_sec;
        target.max_retries = if !self.auto_reconnect {
            0
        } else if self.reconnect_max_attempts > 0 {
            self.reconnect_max_attempts
        } else {
            -1
        };
        target.station.content_type = self.codec.kind.content_type().to_string();
        target.station.bitrate_kbps = self.codec.bitrate_kbps;
        target.station.sample_rate = self.codec.sample_rate;
        target.station.channels = self.codec.channels;
        if target.station.name.is_empty() {
            target.station.name = self.name.clone();
        }
        target
    }

    /// DSP settings at the codec's format
    pub fn dsp_config(&self) -> DspChainConfig {
        DspChainConfig {
            sample_rate: self.codec.sample_rate,
            channels: self.codec.channels,
            eq_enabled: self.eq_enabled,
            eq_preset: self.eq_preset.clone(),
            agc: self.agc,
            crossfade: self.crossfade,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.codec.sample_rate == 0 {
            return Err(Error::Config(format!("slot {}: sample rate is zero", self.slot_id)));
        }
        if self.codec.channels == 0 || self.codec.channels > 2 {
            return Err(Error::Config(format!(
                "slot {}: {} channels not supported",
                self.slot_id, self.codec.channels
            )));
        }
        if self.stream.host.trim().is_empty() {
            return Err(Error::Config(format!("slot {}: relay host is empty", self.slot_id)));
        }
        if !self.stream.mount.starts_with('/') {
            return Err(Error::Config(format!(
                "slot {}: mount '{}' must start with '/'",
                self.slot_id, self.stream.mount
            )));
        }
        if !preset_names().any(|name| name == self.eq_preset) {
            return Err(Error::Config(format!(
                "slot {}: unknown EQ preset '{}'",
                self.slot_id, self.eq_preset
            )));
        }
        Ok(())
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub master_volume: f32,
    /// Threads running blocking slot lifecycle operations. A stop against an
    /// unreachable relay can hold one for a full connect plus handshake timeout.
    pub worker_threads: usize,
    pub slots: Vec<EncoderConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            master_volume: 1.0,
            worker_threads: crate::constants::DEFAULT_WORKER_THREADS,
            slots: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Default location: `<config dir>/relaycast.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "relaycast", "relaycast")
            .map(|dirs| dirs.config_dir().join("relaycast.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for slot in &self.slots {
            slot.validate()?;
            if !seen.insert(slot.slot_id) {
                return Err(Error::Config(format!("duplicate slot id {}", slot.slot_id)));
            }
        }
        Ok(())
    }
}
