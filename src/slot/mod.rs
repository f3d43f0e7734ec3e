//! Per-station encoder slot
//!
//! ```text
//!            start()                 relay up
//!  IDLE ──► STARTING ──► CONNECTING ─────────► LIVE ◄──┐
//!   ▲          │              │                 │      │ reconnected
//!   │       failure           │ retries         ▼      │
//!   │          ▼              └──exhausted──► RECONNECTING
//!   │        ERROR                  │
//!   │                               ▼
//!   └──── stop() / wake() ◄───── SLEEP
//! ```
//!
//! Locking: `general` guards config and now-playing fields, `playlist`
//! guards entries and position, `advance_lock` serializes track changes
//! only. `runtime` (DSP, codec, archive) is taken by the audio path. No
//! blocking network or thread join happens while any of them is held.

pub mod lifecycle;
pub mod playlist;

pub use lifecycle::{Lifecycle, LifecycleToken};
pub use playlist::{M3uParser, PlaylistEntry, PlaylistParser, PlaylistState};

use std::borrow::Cow;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use crate::archive::{ArchiveWriter, WavArchiveWriter};
use crate::audio::{
    AudioSource, DefaultSourceFactory, FileSource, PcmCallback, SourceFactory, TrackInfo,
};
use crate::codec::{AudioEncoder, DefaultEncoderFactory, EncoderFactory};
use crate::config::{EncoderConfig, InputSource};
use crate::dsp::{DspChain, DspChainConfig};
use crate::error::{Error, Result, SlotError};
use crate::metrics::{MetricsSink, SlotEventKind, TracingMetrics};
use crate::stream::{
    ConnectionState, Connector, StreamClient, StreamEvent, TcpConnector, TrackMetadata,
};

/// Externally visible slot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Idle,
    Starting,
    Connecting,
    Live,
    Reconnecting,
    /// Reconnect attempts exhausted; needs `wake()`
    Sleep,
    Error,
    Stopping,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Idle => "IDLE",
            SlotState::Starting => "STARTING",
            SlotState::Connecting => "CONNECTING",
            SlotState::Live => "LIVE",
            SlotState::Reconnecting => "RECONNECTING",
            SlotState::Sleep => "SLEEP",
            SlotState::Error => "ERROR",
            SlotState::Stopping => "STOPPING",
        }
    }

    /// `start()` is accepted from these states only
    pub fn can_start(&self) -> bool {
        matches!(self, SlotState::Idle | SlotState::Error)
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a slot
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub slot_id: u32,
    pub name: String,
    pub state: SlotState,
    pub state_str: String,
    pub bytes_sent: u64,
    pub uptime_sec: u64,
    pub track_index: usize,
    pub track_count: usize,
    pub title: String,
    pub artist: String,
    pub position_ms: u64,
    pub duration_ms: u64,
    pub volume: f32,
    pub is_live: bool,
    pub gain_reduction_db: f32,
    pub last_error: Option<String>,
}

/// Collaborators a slot builds its lifecycle from
#[derive(Clone)]
pub struct SlotServices {
    pub encoders: Arc<dyn EncoderFactory>,
    pub sources: Arc<dyn SourceFactory>,
    pub connector: Arc<dyn Connector>,
    pub playlists: Arc<dyn PlaylistParser>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Default for SlotServices {
    fn default() -> Self {
        Self {
            encoders: Arc::new(DefaultEncoderFactory),
            sources: Arc::new(DefaultSourceFactory),
            connector: Arc::new(TcpConnector::default()),
            playlists: Arc::new(M3uParser),
            metrics: Arc::new(TracingMetrics),
        }
    }
}

enum ActiveSource {
    Device(Box<dyn AudioSource>),
    File(Box<dyn FileSource>),
}

impl ActiveSource {
    fn stop(&mut self) {
        match self {
            ActiveSource::Device(source) => source.stop(),
            ActiveSource::File(source) => source.stop(),
        }
    }

    fn position_ms(&self) -> u64 {
        match self {
            ActiveSource::Device(_) => 0,
            ActiveSource::File(source) => source.position_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FadePhase {
    None,
    /// Fading out ahead of a skip
    Out,
    /// Fade-out done, muted until the next track opens
    Muted,
    In,
}

struct General {
    config: EncoderConfig,
    title: String,
    artist: String,
    album: Option<String>,
    duration_ms: u64,
    last_error: Option<String>,
    started_at: Option<Instant>,
}

struct Runtime {
    dsp: Option<DspChain>,
    encoder: Option<Box<dyn AudioEncoder>>,
    archive: Option<Box<dyn ArchiveWriter>>,
    fade: FadePhase,
    /// Relay connection the encoder's current bitstream was started for
    stream: u64,
    channels: usize,
}

struct SlotInner {
    id: u32,
    services: SlotServices,
    state: Mutex<SlotState>,
    state_counter: AtomicU64,
    watchers: Mutex<Vec<Sender<SlotState>>>,
    general: Mutex<General>,
    playlist: Mutex<PlaylistState>,
    advance_lock: Mutex<()>,
    runtime: Mutex<Runtime>,
    source: Mutex<Option<ActiveSource>>,
    client: Mutex<Option<Arc<StreamClient>>>,
    lifecycle: Lifecycle,
    skip_requested: AtomicBool,
    /// f32 bits
    volume: AtomicU32,
    has_connected: AtomicBool,
}

/// One independently configured station
pub struct EncoderSlot {
    inner: Arc<SlotInner>,
}

fn spawn_detached(name: String, f: impl FnOnce() + Send + 'static) {
    if let Err(e) = thread::Builder::new().name(name).spawn(f) {
        tracing::error!("Failed to spawn helper thread: {}", e);
    }
}

impl EncoderSlot {
    pub fn new(config: EncoderConfig) -> Self {
        Self::with_services(config, SlotServices::default())
    }

    pub fn with_services(config: EncoderConfig, services: SlotServices) -> Self {
        let volume = config.volume.clamp(0.0, 2.0);
        let channels = config.codec.channels.max(1) as usize;
        Self {
            inner: Arc::new(SlotInner {
                id: config.slot_id,
                services,
                state: Mutex::new(SlotState::Idle),
                state_counter: AtomicU64::new(0),
                watchers: Mutex::new(Vec::new()),
                general: Mutex::new(General {
                    config,
                    title: String::new(),
                    artist: String::new(),
                    album: None,
                    duration_ms: 0,
                    last_error: None,
                    started_at: None,
                }),
                playlist: Mutex::new(PlaylistState::default()),
                advance_lock: Mutex::new(()),
                runtime: Mutex::new(Runtime {
                    dsp: None,
                    encoder: None,
                    archive: None,
                    fade: FadePhase::None,
                    stream: 0,
                    channels,
                }),
                source: Mutex::new(None),
                client: Mutex::new(None),
                lifecycle: Lifecycle::new(),
                skip_requested: AtomicBool::new(false),
                volume: AtomicU32::new(volume.to_bits()),
                has_connected: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn state(&self) -> SlotState {
        *self.inner.state.lock()
    }

    /// Monotonic count of state transitions
    pub fn state_counter(&self) -> u64 {
        self.inner.state_counter.load(Ordering::SeqCst)
    }

    /// Receive every subsequent state transition
    pub fn watch_states(&self) -> Receiver<SlotState> {
        let (tx, rx) = unbounded();
        self.inner.watchers.lock().push(tx);
        rx
    }

    pub fn config(&self) -> EncoderConfig {
        self.inner.general.lock().config.clone()
    }

    /// Replace the configuration; only while idle or failed
    pub fn update_config(&self, config: EncoderConfig) -> Result<()> {
        config.validate()?;
        let state = self.state();
        if !state.can_start() {
            return Err(SlotError::InvalidState(state).into());
        }
        let mut general = self.inner.general.lock();
        if config.slot_id != self.inner.id {
            return Err(Error::Config(format!(
                "slot id {} cannot change to {}",
                self.inner.id, config.slot_id
            )));
        }
        self.inner.store_volume(config.volume);
        self.inner.runtime.lock().channels = config.codec.channels.max(1) as usize;
        general.config = config;
        Ok(())
    }

    /// Bring the station up. Fails unless the slot is `IDLE` or `ERROR`.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Tear everything down and return to `IDLE`
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    /// Leave `SLEEP` and start again
    pub fn wake(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if *state != SlotState::Sleep {
                return Err(SlotError::InvalidState(*state).into());
            }
            self.inner.lifecycle.cancel();
            // STOPPING keeps a concurrent start() out until the old lifecycle is gone
            self.inner.apply_state(&mut state, SlotState::Stopping);
        }
        self.inner.teardown();
        self.inner.set_state(SlotState::Idle);
        tracing::info!("Slot {} woken", self.inner.id);
        self.inner.start()
    }

    /// Feed PCM as if it came from the slot's source
    pub fn on_audio(&self, pcm: &[f32], frames: usize) {
        self.inner.on_audio(pcm, frames);
    }

    /// Jump to the next playlist entry. False when there is no playlist.
    pub fn skip_track(&self) -> bool {
        self.inner.skip_track()
    }

    /// Load a playlist; a running playlist slot switches to its first entry
    pub fn load_playlist(&self, path: &Path) -> Result<usize> {
        self.inner.load_playlist(path)
    }

    /// Per-slot gain, clamped to `[0, 2]`
    pub fn set_volume(&self, volume: f32) {
        let volume = self.inner.store_volume(volume);
        self.inner.general.lock().config.volume = volume;
    }

    pub fn volume(&self) -> f32 {
        self.inner.volume()
    }

    /// Update now-playing text and push it to the relay
    pub fn push_metadata(&self, title: &str, artist: &str) -> bool {
        {
            let mut general = self.inner.general.lock();
            general.title = title.to_string();
            general.artist = artist.to_string();
        }
        let client = self.inner.client.lock().clone();
        match client {
            Some(client) => client.send_admin_metadata(&TrackMetadata::new(title, artist)),
            None => false,
        }
    }

    /// Apply new DSP settings; a running slot uses them from the next buffer
    pub fn reconfigure_dsp(&self, config: DspChainConfig) {
        let config = {
            let mut general = self.inner.general.lock();
            let cfg = &mut general.config;
            cfg.eq_enabled = config.eq_enabled;
            cfg.eq_preset = config.eq_preset.clone();
            cfg.agc = config.agc;
            cfg.crossfade = config.crossfade;
            cfg.dsp_config()
        };
        if let Some(dsp) = self.inner.runtime.lock().dsp.as_mut() {
            dsp.configure(config);
        }
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats()
    }
}

impl Drop for EncoderSlot {
    fn drop(&mut self) {
        if self.state() != SlotState::Idle {
            let _ = self.inner.stop();
        }
    }
}

impl SlotInner {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn store_volume(&self, volume: f32) -> f32 {
        let volume = if volume.is_finite() { volume.clamp(0.0, 2.0) } else { 1.0 };
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
        volume
    }

    fn state(&self) -> SlotState {
        *self.state.lock()
    }

    fn apply_state(&self, state: &mut SlotState, to: SlotState) {
        if *state == to {
            return;
        }
        let from = std::mem::replace(state, to);
        self.state_counter.fetch_add(1, Ordering::SeqCst);
        tracing::info!("Slot {} {} -> {}", self.id, from, to);
        self.watchers.lock().retain(|tx| tx.send(to).is_ok());
    }

    fn set_state(&self, to: SlotState) {
        let mut state = self.state.lock();
        self.apply_state(&mut state, to);
    }

    /// Set `to` only while `token` is the running lifecycle
    fn set_state_for(&self, token: &LifecycleToken, to: SlotState) -> bool {
        let mut state = self.state.lock();
        if !token.is_current() {
            return false;
        }
        self.apply_state(&mut state, to);
        true
    }

    fn mount(&self) -> String {
        self.general.lock().config.stream.mount.clone()
    }

    fn record(&self, kind: SlotEventKind) {
        self.services.metrics.record_event(self.id, &self.mount(), kind);
    }

    fn fail_start(&self, token: &LifecycleToken, error: Error) -> Error {
        tracing::error!("Slot {} failed to start: {}", self.id, error);
        {
            let _state = self.state.lock();
            if !token.is_current() {
                // A stop() already owns the teardown
                return error;
            }
            self.lifecycle.cancel();
        }
        self.general.lock().last_error = Some(error.to_string());
        self.teardown();
        self.set_state(SlotState::Error);
        self.record(SlotEventKind::Error);
        error
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let (config, token) = {
            let mut state = self.state.lock();
            if !state.can_start() {
                return Err(SlotError::InvalidState(*state).into());
            }
            self.apply_state(&mut state, SlotState::Starting);
            let mut general = self.general.lock();
            general.last_error = None;
            (general.config.clone(), self.lifecycle.begin())
        };
        self.has_connected.store(false, Ordering::SeqCst);
        self.skip_requested.store(false, Ordering::SeqCst);

        let encoder = match self.services.encoders.create(&config.codec) {
            Ok(encoder) => encoder,
            Err(e) => return Err(self.fail_start(&token, e.into())),
        };

        let mut archive: Option<Box<dyn ArchiveWriter>> = if config.archive.enabled {
            let mut writer = WavArchiveWriter::new(&config.archive.directory, self.id);
            match writer.open(config.codec.sample_rate, config.codec.channels) {
                Ok(()) => Some(Box::new(writer)),
                Err(e) => {
                    tracing::warn!("Slot {}: archive disabled: {}", self.id, e);
                    None
                }
            }
        } else {
            None
        };

        let client = Arc::new(StreamClient::with_connector(
            config.stream_target(),
            self.services.connector.clone(),
        ));

        // Installed under the state lock so a stop() either sees it or cancels us first
        let installed = {
            let _state = self.state.lock();
            if token.is_current() {
                let mut runtime = self.runtime.lock();
                runtime.dsp = Some(DspChain::new(config.dsp_config()));
                runtime.encoder = Some(encoder);
                runtime.archive = archive.take();
                runtime.fade = FadePhase::None;
                runtime.stream = 0;
                runtime.channels = config.codec.channels.max(1) as usize;
                *self.client.lock() = Some(client.clone());
                true
            } else {
                false
            }
        };
        if !installed {
            if let Some(mut archive) = archive {
                if let Err(e) = archive.close() {
                    tracing::warn!("Slot {}: archive close failed: {}", self.id, e);
                }
            }
            return Err(SlotError::StartFailed("stopped during start".to_string()).into());
        }

        let (event_tx, event_rx) = unbounded();
        client.set_event_sender(event_tx);
        self.spawn_event_thread(event_rx, token.clone());

        // Source construction may load a playlist and probe a file; no locks held
        let source = match self.open_input(&config, &token) {
            Ok(source) => source,
            Err(e) => return Err(self.fail_start(&token, e)),
        };

        if !self.set_state_for(&token, SlotState::Connecting) {
            if let Some(mut source) = source {
                source.stop();
            }
            return Err(SlotError::StartFailed("stopped during start".to_string()).into());
        }
        self.general.lock().started_at = Some(Instant::now());
        self.record(SlotEventKind::Started);
        client.connect();

        match source {
            Some(source) => {
                if let Err(e) = self.start_source(source, &token) {
                    return Err(self.fail_start(&token, e));
                }
            }
            None => tracing::info!("Slot {}: playlist is empty, waiting for a load", self.id),
        }
        Ok(())
    }

    /// Build the configured input; playlist inputs also load the playlist
    fn open_input(
        self: &Arc<Self>,
        config: &EncoderConfig,
        token: &LifecycleToken,
    ) -> Result<Option<ActiveSource>> {
        let (rate, channels) = (config.codec.sample_rate, config.codec.channels);
        match &config.input {
            InputSource::Device { index } => {
                let source = self.services.sources.device(*index, rate, channels)?;
                Ok(Some(ActiveSource::Device(source)))
            }
            InputSource::Playlist { path } => {
                let entries = self.services.playlists.parse(path)?;
                self.install_playlist(entries, config);
                self.open_current(token)
            }
            InputSource::Url { url } => {
                self.install_playlist(vec![PlaylistEntry::new(url.clone())], config);
                self.open_current(token)
            }
        }
    }

    fn install_playlist(&self, entries: Vec<PlaylistEntry>, config: &EncoderConfig) {
        *self.playlist.lock() = PlaylistState::new(entries, config.shuffle, config.repeat_all);
    }

    /// Open the current entry, skipping ones that fail to open
    fn open_current(self: &Arc<Self>, token: &LifecycleToken) -> Result<Option<ActiveSource>> {
        let (rate, channels) = {
            let general = self.general.lock();
            (general.config.codec.sample_rate, general.config.codec.channels)
        };
        let (mut entry, attempts) = {
            let playlist = self.playlist.lock();
            (playlist.current().cloned(), playlist.len())
        };

        let mut last_error = None;
        for _ in 0..attempts {
            let Some(current) = entry.take() else {
                break;
            };
            match self.services.sources.file(&current.location, rate, channels) {
                Ok(mut source) => {
                    self.attach_eof(source.as_mut(), token);
                    self.now_playing(&current, source.track_info(), token);
                    return Ok(Some(ActiveSource::File(source)));
                }
                Err(e) => {
                    tracing::warn!("Slot {}: cannot open {}: {}", self.id, current.location, e);
                    last_error = Some(e);
                    entry = self.playlist.lock().advance().cloned();
                }
            }
        }
        match last_error {
            Some(e) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn attach_eof(self: &Arc<Self>, source: &mut dyn FileSource, token: &LifecycleToken) {
        let weak = Arc::downgrade(self);
        let token = token.clone();
        source.set_eof_callback(Box::new(move || {
            // Runs on the decode thread that the advance has to join
            if token.is_current() {
                spawn_advance(weak, token);
            }
        }));
    }

    fn audio_callback(self: &Arc<Self>) -> PcmCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |pcm: &[f32], frames: usize| {
            if let Some(inner) = weak.upgrade() {
                inner.on_audio(pcm, frames);
            }
        })
    }

    fn start_source(self: &Arc<Self>, mut source: ActiveSource, token: &LifecycleToken) -> Result<()> {
        let callback = self.audio_callback();
        match &mut source {
            ActiveSource::Device(s) => s.start(callback)?,
            ActiveSource::File(s) => s.start(callback)?,
        }

        let mut slot = self.source.lock();
        if !token.is_current() {
            drop(slot);
            source.stop();
            return Ok(());
        }
        if let Some(mut old) = slot.replace(source) {
            // Only reachable if a racing advance slipped in; never join under the lock
            drop(slot);
            old.stop();
        }
        Ok(())
    }

    /// Record the new track and schedule its metadata push
    fn now_playing(self: &Arc<Self>, entry: &PlaylistEntry, info: TrackInfo, token: &LifecycleToken) {
        let (mut title, mut artist) = (info.title, info.artist);
        if artist.is_empty() && !entry.title.is_empty() {
            match entry.title.split_once(" - ") {
                Some((a, t)) => {
                    artist = a.trim().to_string();
                    title = t.trim().to_string();
                }
                None => title = entry.title.clone(),
            }
        }
        let duration_ms = if info.duration_ms > 0 {
            info.duration_ms
        } else if entry.duration_sec > 0 {
            entry.duration_sec as u64 * 1000
        } else {
            0
        };

        let crossfade = {
            let mut general = self.general.lock();
            general.title = title.clone();
            general.artist = artist.clone();
            general.album = info.album.clone();
            general.duration_ms = duration_ms;
            general.config.crossfade
        };
        tracing::info!("Slot {} now playing: {} - {}", self.id, artist, title);
        self.services.metrics.record_play(&title, &artist, self.id, 0);

        // Listeners see the new title once the fade-in is over
        let delay = if crossfade.enabled {
            Duration::from_secs_f32(crossfade.duration_sec.max(0.0))
        } else {
            Duration::ZERO
        };
        let meta = TrackMetadata {
            title,
            artist,
            album: info.album,
            artwork: None,
        };
        self.schedule_metadata(meta, delay, token.clone());
    }

    fn schedule_metadata(self: &Arc<Self>, meta: TrackMetadata, delay: Duration, token: LifecycleToken) {
        let weak = Arc::downgrade(self);
        spawn_detached(format!("slot{}-metadata", self.id), move || {
            if !delay.is_zero() && !token.sleep(delay) {
                return;
            }
            if !token.is_current() {
                return;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let client = inner.client.lock().clone();
            if let Some(client) = client {
                client.send_admin_metadata(&meta);
            }
        });
    }

    fn spawn_event_thread(self: &Arc<Self>, events: Receiver<StreamEvent>, token: LifecycleToken) {
        let weak = Arc::downgrade(self);
        spawn_detached(format!("slot{}-events", self.id), move || {
            // Ends when the stream client (the only sender) is dropped
            for event in events.iter() {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.on_stream_event(event, &token);
            }
        });
    }

    fn on_stream_event(self: &Arc<Self>, event: StreamEvent, token: &LifecycleToken) {
        match event.to {
            ConnectionState::Connected => {
                if !self.set_state_for(token, SlotState::Live) {
                    return;
                }
                if self.has_connected.swap(true, Ordering::SeqCst) {
                    self.record(SlotEventKind::Reconnected);
                    let meta = {
                        let general = self.general.lock();
                        TrackMetadata {
                            title: general.title.clone(),
                            artist: general.artist.clone(),
                            album: general.album.clone(),
                            artwork: None,
                        }
                    };
                    if !meta.title.is_empty() {
                        self.schedule_metadata(meta, Duration::ZERO, token.clone());
                    }
                } else {
                    self.record(SlotEventKind::Connected);
                }
            }
            ConnectionState::Reconnecting => {
                if self.set_state_for(token, SlotState::Reconnecting) {
                    self.record(SlotEventKind::Reconnecting);
                }
            }
            ConnectionState::Stopped => {
                if self.set_state_for(token, SlotState::Sleep) {
                    tracing::warn!("Slot {} asleep after exhausting reconnects", self.id);
                    self.record(SlotEventKind::Sleep);
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {}
        }
    }

    fn stop(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                SlotState::Idle | SlotState::Stopping => return Ok(()),
                _ => {}
            }
            self.lifecycle.cancel();
            self.apply_state(&mut state, SlotState::Stopping);
        }
        self.teardown();
        self.set_state(SlotState::Idle);
        self.record(SlotEventKind::Stopped);
        Ok(())
    }

    /// Release source, client, codec, DSP and archive. Callers hold no locks.
    fn teardown(&self) {
        // Serialize with any in-flight advance so it cannot install a source after us
        let _advance = self.advance_lock.lock();

        let source = self.source.lock().take();
        if let Some(mut source) = source {
            source.stop();
        }

        let client = self.client.lock().take();
        if let Some(client) = client {
            client.disconnect();
        }

        let archive = {
            let mut runtime = self.runtime.lock();
            runtime.dsp = None;
            runtime.encoder = None;
            runtime.fade = FadePhase::None;
            runtime.stream = 0;
            runtime.archive.take()
        };
        if let Some(mut archive) = archive {
            match archive.close() {
                Ok(Some(path)) => tracing::info!("Slot {} archive saved to {}", self.id, path.display()),
                Ok(None) => {}
                Err(e) => tracing::warn!("Slot {}: archive close failed: {}", self.id, e),
            }
        }

        let mut general = self.general.lock();
        general.started_at = None;
    }

    fn on_audio(self: &Arc<Self>, pcm: &[f32], frames: usize) {
        if self.skip_requested.swap(false, Ordering::SeqCst) {
            let token = self.lifecycle.token();
            if token.is_current() {
                spawn_advance(Arc::downgrade(self), token);
            }
        }

        let client = self.client.lock().clone();
        let Some(client) = client else {
            return;
        };
        if !client.is_connected() {
            return;
        }

        let volume = self.volume();
        let mut runtime = self.runtime.lock();
        let Runtime {
            dsp,
            encoder,
            archive,
            fade,
            stream,
            channels,
        } = &mut *runtime;
        let Some(encoder) = encoder.as_mut() else {
            return;
        };

        // Each relay connection is a new listener-facing stream that needs fresh headers
        let connection = client.connection_id();
        if *stream != connection {
            if *stream != 0 {
                if let Err(e) = encoder.reset_stream() {
                    tracing::warn!("Slot {}: encoder reset failed: {}", self.id, e);
                    return;
                }
                tracing::debug!("Slot {}: bitstream restarted for connection {}", self.id, connection);
            }
            *stream = connection;
        }

        let samples = (frames * *channels).min(pcm.len());
        let frames = samples / *channels;
        let mut buffer = Cow::Borrowed(&pcm[..samples]);

        let dsp_active = dsp.as_ref().map_or(false, |d| d.config().is_active());
        if (volume - 1.0).abs() > f32::EPSILON || dsp_active || *fade != FadePhase::None {
            let owned = buffer.to_mut();
            if (volume - 1.0).abs() > f32::EPSILON {
                owned.iter_mut().for_each(|s| *s *= volume);
            }
            if let Some(dsp) = dsp.as_mut() {
                dsp.process(owned, frames);
                match *fade {
                    FadePhase::Out => {
                        if dsp.crossfader_mut().apply_fade_out(owned, frames) {
                            *fade = FadePhase::Muted;
                        }
                    }
                    FadePhase::Muted => owned.fill(0.0),
                    FadePhase::In => {
                        if dsp.crossfader_mut().apply_fade_in(owned, frames) {
                            *fade = FadePhase::None;
                        }
                    }
                    FadePhase::None => {}
                }
            }
        }

        if let Some(writer) = archive.as_mut() {
            if let Err(e) = writer.write_pcm(&buffer, frames) {
                tracing::warn!("Slot {}: archive write failed, disabling: {}", self.id, e);
                *archive = None;
            }
        }

        let encoded = match encoder.encode(&buffer, frames) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Slot {}: encode failed: {}", self.id, e);
                return;
            }
        };
        drop(runtime);

        if !encoded.is_empty() && client.write_for(connection, &encoded) < 0 {
            tracing::debug!("Slot {}: dropped {} bytes, relay not writable", self.id, encoded.len());
        }
    }

    fn has_playlist(&self) -> bool {
        !self.playlist.lock().is_empty()
    }

    fn skip_track(self: &Arc<Self>) -> bool {
        if !self.has_playlist() {
            return false;
        }
        let token = self.lifecycle.token();
        if !token.is_current() {
            // Not running: just move the cursor
            self.playlist.lock().advance();
            return true;
        }

        let source_running = self.source.lock().is_some();
        let live = self.client.lock().as_ref().map_or(false, |c| c.is_connected());
        if source_running && live {
            let mut guard = self.runtime.lock();
            let runtime = &mut *guard;
            let fading_out = matches!(runtime.fade, FadePhase::Out | FadePhase::Muted);
            if let Some(dsp) = runtime.dsp.as_mut() {
                if dsp.crossfader().is_enabled() && !fading_out {
                    let weak: Weak<SlotInner> = Arc::downgrade(self);
                    dsp.crossfader_mut().start_fade(Some(Box::new(move || {
                        // Fires on the decode thread; the next buffer dispatches the advance
                        if let Some(inner) = weak.upgrade() {
                            inner.skip_requested.store(true, Ordering::SeqCst);
                        }
                    })));
                    runtime.fade = FadePhase::Out;
                    return true;
                }
            }
        }

        spawn_advance(Arc::downgrade(self), token);
        true
    }

    /// Move to the next entry and swap sources. Serialized by `advance_lock`.
    fn advance(self: &Arc<Self>, token: &LifecycleToken) {
        let _guard = self.advance_lock.lock();
        if !token.is_current() {
            return;
        }

        let next = self.playlist.lock().advance().cloned();
        let old = self.source.lock().take();
        if let Some(mut old) = old {
            old.stop();
        }

        if next.is_none() {
            tracing::info!("Slot {}: playlist finished", self.id);
            return;
        }
        self.open_and_play(token);
    }

    fn open_and_play(self: &Arc<Self>, token: &LifecycleToken) {
        let source = match self.open_current(token) {
            Ok(Some(source)) => source,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Slot {}: no playable entry: {}", self.id, e);
                self.general.lock().last_error = Some(e.to_string());
                return;
            }
        };

        {
            let crossfade = self.general.lock().config.crossfade;
            let mut runtime = self.runtime.lock();
            runtime.fade = FadePhase::None;
            if let Some(dsp) = runtime.dsp.as_mut() {
                dsp.crossfader_mut().reset();
                if crossfade.enabled {
                    dsp.crossfader_mut().start_fade(None);
                    runtime.fade = FadePhase::In;
                }
            }
        }

        if let Err(e) = self.start_source(source, token) {
            tracing::warn!("Slot {}: track failed to start: {}", self.id, e);
            self.general.lock().last_error = Some(e.to_string());
        }
    }

    fn load_playlist(self: &Arc<Self>, path: &Path) -> Result<usize> {
        let entries = self.services.playlists.parse(path)?;
        if entries.is_empty() {
            return Err(SlotError::EmptyPlaylist.into());
        }
        let count = entries.len();
        let config = self.general.lock().config.clone();
        self.install_playlist(entries, &config);
        tracing::info!("Slot {}: loaded {} entries from {}", self.id, count, path.display());

        let token = self.lifecycle.token();
        let plays_files = !matches!(config.input, InputSource::Device { .. });
        if token.is_current() && plays_files {
            let _guard = self.advance_lock.lock();
            if token.is_current() {
                let old = self.source.lock().take();
                if let Some(mut old) = old {
                    old.stop();
                }
                self.open_and_play(&token);
            }
        }
        Ok(count)
    }

    fn stats(&self) -> Stats {
        let state = self.state();
        let client = self.client.lock().clone();
        let position_ms = self.source.lock().as_ref().map_or(0, |s| s.position_ms());
        let (track_index, track_count) = {
            let playlist = self.playlist.lock();
            (playlist.position(), playlist.len())
        };
        let gain_reduction_db = self
            .runtime
            .lock()
            .dsp
            .as_ref()
            .map_or(0.0, |d| d.gain_reduction_db());
        let general = self.general.lock();

        Stats {
            slot_id: self.id,
            name: general.config.name.clone(),
            state,
            state_str: state.to_string(),
            bytes_sent: client.as_ref().map_or(0, |c| c.bytes_sent()),
            uptime_sec: general.started_at.map_or(0, |t| t.elapsed().as_secs()),
            track_index,
            track_count,
            title: general.title.clone(),
            artist: general.artist.clone(),
            position_ms,
            duration_ms: general.duration_ms,
            volume: self.volume(),
            is_live: state == SlotState::Live,
            gain_reduction_db,
            last_error: general
                .last_error
                .clone()
                .or_else(|| client.as_ref().and_then(|c| c.last_error())),
        }
    }
}

/// Advance on a fresh thread; never on the decode thread that must be joined
fn spawn_advance(weak: Weak<SlotInner>, token: LifecycleToken) {
    let name = weak
        .upgrade()
        .map(|inner| format!("slot{}-advance", inner.id))
        .unwrap_or_else(|| "slot-advance".to_string());
    spawn_detached(name, move || {
        if let Some(inner) = weak.upgrade() {
            inner.advance(&token);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecKind, CodecSettings};
    use crate::error::{AudioError, CodecError, StreamError};
    use crate::stream::RelayConnection;
    use bytes::Bytes;

    /// Emits one byte per input frame
    struct ByteEncoder;

    impl AudioEncoder for ByteEncoder {
        fn encode(&mut self, _: &[f32], frames: usize) -> std::result::Result<Bytes, CodecError> {
            Ok(Bytes::from(vec![0u8; frames]))
        }

        fn kind(&self) -> CodecKind {
            CodecKind::Mp3
        }
    }

    struct ByteEncoders;

    impl EncoderFactory for ByteEncoders {
        fn create(&self, settings: &CodecSettings) -> std::result::Result<Box<dyn AudioEncoder>, CodecError> {
            match settings.kind {
                CodecKind::Flac => Err(CodecError::Unsupported(CodecKind::Flac)),
                _ => Ok(Box::new(ByteEncoder)),
            }
        }
    }

    struct NoDevices;

    impl SourceFactory for NoDevices {
        fn device(&self, _: Option<usize>, _: u32, _: u16) -> std::result::Result<Box<dyn AudioSource>, AudioError> {
            Err(AudioError::DeviceNotFound("test".to_string()))
        }

        fn file(&self, location: &str, rate: u32, channels: u16) -> std::result::Result<Box<dyn FileSource>, AudioError> {
            DefaultSourceFactory.file(location, rate, channels)
        }
    }

    struct SinkConnection;

    impl RelayConnection for SinkConnection {
        fn send(&mut self, _: &[u8]) -> std::io::Result<()> {
            Ok(())
        }

        fn is_alive(&mut self) -> bool {
            true
        }
    }

    struct AcceptAll;

    impl Connector for AcceptAll {
        fn open(&self, _: &crate::config::StreamTarget) -> std::result::Result<Box<dyn RelayConnection>, StreamError> {
            Ok(Box::new(SinkConnection))
        }

        fn request(&self, _: &crate::config::StreamTarget, _: &str) -> std::result::Result<String, StreamError> {
            Ok("<return>1</return>".to_string())
        }
    }

    /// Blocks inside `create` until released
    struct GatedEncoders {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl EncoderFactory for GatedEncoders {
        fn create(&self, _: &CodecSettings) -> std::result::Result<Box<dyn AudioEncoder>, CodecError> {
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(5));
            Ok(Box::new(ByteEncoder))
        }
    }

    /// Refuses connections until `accept` is set
    #[derive(Default)]
    struct GateConnector {
        accept: AtomicBool,
    }

    impl Connector for GateConnector {
        fn open(&self, _: &crate::config::StreamTarget) -> std::result::Result<Box<dyn RelayConnection>, StreamError> {
            if self.accept.load(Ordering::SeqCst) {
                Ok(Box::new(SinkConnection))
            } else {
                Err(StreamError::ConnectionFailed("refused".to_string()))
            }
        }

        fn request(&self, _: &crate::config::StreamTarget, _: &str) -> std::result::Result<String, StreamError> {
            Ok("<return>1</return>".to_string())
        }
    }

    fn services() -> SlotServices {
        SlotServices {
            encoders: Arc::new(ByteEncoders),
            sources: Arc::new(NoDevices),
            connector: Arc::new(AcceptAll),
            playlists: Arc::new(M3uParser),
            metrics: Arc::new(crate::metrics::NullMetrics),
        }
    }

    fn tone_config() -> EncoderConfig {
        EncoderConfig {
            input: InputSource::Url {
                url: "tone:440".to_string(),
            },
            ..Default::default()
        }
    }

    fn wait_for(slot: &EncoderSlot, state: SlotState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while slot.state() != state {
            assert!(Instant::now() < deadline, "stuck in {}", slot.state());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_goes_live_and_stops() {
        let slot = EncoderSlot::with_services(tone_config(), services());
        let states = slot.watch_states();
        slot.start().unwrap();
        wait_for(&slot, SlotState::Live);

        let stats = slot.stats();
        assert!(stats.is_live);
        assert_eq!(stats.title, "440 Hz tone");
        assert_eq!(stats.track_count, 1);

        slot.stop().unwrap();
        assert_eq!(slot.state(), SlotState::Idle);
        let seen: Vec<_> = states.try_iter().collect();
        assert_eq!(seen.first(), Some(&SlotState::Starting));
        assert_eq!(seen.last(), Some(&SlotState::Idle));
        assert!(seen.contains(&SlotState::Stopping));
    }

    #[test]
    fn test_stop_during_start_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        let mut config = tone_config();
        config.archive.enabled = true;
        config.archive.directory = dir.path().to_path_buf();
        let slot = Arc::new(EncoderSlot::with_services(
            config,
            SlotServices {
                encoders: Arc::new(GatedEncoders {
                    entered: entered_tx,
                    release: release_rx,
                }),
                ..services()
            },
        ));

        let starter = {
            let slot = slot.clone();
            thread::spawn(move || slot.start())
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        slot.stop().unwrap();
        assert_eq!(slot.state(), SlotState::Idle);

        release_tx.send(()).unwrap();
        assert!(matches!(
            starter.join().unwrap(),
            Err(Error::Slot(SlotError::StartFailed(_)))
        ));
        assert_eq!(slot.state(), SlotState::Idle);
        assert!(slot.inner.client.lock().is_none());
        assert!(slot.inner.source.lock().is_none());
        let runtime = slot.inner.runtime.lock();
        assert!(runtime.encoder.is_none());
        assert!(runtime.archive.is_none());
    }

    #[test]
    fn test_wake_racing_start_keeps_one_lifecycle() {
        let connector = Arc::new(GateConnector::default());
        let mut config = tone_config();
        config.auto_reconnect = false;
        let slot = Arc::new(EncoderSlot::with_services(
            config,
            SlotServices {
                connector: connector.clone(),
                ..services()
            },
        ));
        slot.start().unwrap();
        wait_for(&slot, SlotState::Sleep);
        connector.accept.store(true, Ordering::SeqCst);

        let starter = {
            let slot = slot.clone();
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(2);
                while Instant::now() < deadline {
                    if slot.start().is_ok() {
                        return true;
                    }
                    thread::yield_now();
                }
                false
            })
        };
        let woke = slot.wake().is_ok();
        let started = starter.join().unwrap();
        assert_ne!(woke, started, "exactly one of wake and start brings the slot up");

        wait_for(&slot, SlotState::Live);
        assert!(slot.inner.client.lock().is_some());
        assert!(slot.inner.source.lock().is_some());
        assert!(slot.inner.runtime.lock().encoder.is_some());
        slot.stop().unwrap();
    }

    #[test]
    fn test_start_rejected_while_running() {
        let slot = EncoderSlot::with_services(tone_config(), services());
        slot.start().unwrap();
        assert!(matches!(
            slot.start(),
            Err(Error::Slot(SlotError::InvalidState(_)))
        ));
        slot.stop().unwrap();
    }

    #[test]
    fn test_codec_failure_is_error_state() {
        let mut config = tone_config();
        config.codec.kind = CodecKind::Flac;
        let slot = EncoderSlot::with_services(config, services());
        assert!(slot.start().is_err());
        assert_eq!(slot.state(), SlotState::Error);
        assert!(slot.stats().last_error.is_some());

        // ERROR accepts a new start after fixing the config
        slot.update_config(tone_config()).unwrap();
        slot.start().unwrap();
        slot.stop().unwrap();
    }

    #[test]
    fn test_missing_device_is_error_state() {
        let config = EncoderConfig {
            input: InputSource::Device { index: Some(3) },
            ..Default::default()
        };
        let slot = EncoderSlot::with_services(config, services());
        assert!(slot.start().is_err());
        assert_eq!(slot.state(), SlotState::Error);
    }

    #[test]
    fn test_update_config_rejected_when_running() {
        let slot = EncoderSlot::with_services(tone_config(), services());
        slot.start().unwrap();
        assert!(slot.update_config(tone_config()).is_err());
        slot.stop().unwrap();
        assert!(slot.update_config(tone_config()).is_ok());
    }

    #[test]
    fn test_volume_clamped() {
        let slot = EncoderSlot::with_services(tone_config(), services());
        slot.set_volume(5.0);
        assert_eq!(slot.volume(), 2.0);
        slot.set_volume(-1.0);
        assert_eq!(slot.volume(), 0.0);
        assert_eq!(slot.config().volume, 0.0);
    }

    #[test]
    fn test_audio_dropped_until_connected() {
        let slot = EncoderSlot::with_services(tone_config(), services());
        slot.on_audio(&[0.0; 64], 32);
        assert_eq!(slot.stats().bytes_sent, 0);
    }

    #[test]
    fn test_wake_requires_sleep() {
        let slot = EncoderSlot::with_services(tone_config(), services());
        assert!(matches!(
            slot.wake(),
            Err(Error::Slot(SlotError::InvalidState(SlotState::Idle)))
        ));
    }

    #[test]
    fn test_stop_on_idle_is_noop() {
        let slot = EncoderSlot::with_services(tone_config(), services());
        let counter = slot.state_counter();
        slot.stop().unwrap();
        assert_eq!(slot.state_counter(), counter);
    }

    #[test]
    fn test_skip_without_playlist() {
        let config = EncoderConfig {
            input: InputSource::Device { index: None },
            ..Default::default()
        };
        let slot = EncoderSlot::with_services(config, services());
        assert!(!slot.skip_track());
    }
}
