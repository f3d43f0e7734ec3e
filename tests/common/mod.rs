//! In-process fakes shared by the scenario tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use relaycast::audio::DefaultSourceFactory;
use relaycast::codec::{AudioEncoder, CodecKind, CodecSettings, EncoderFactory};
use relaycast::config::{EncoderConfig, InputSource, StreamTarget};
use relaycast::error::{CodecError, StreamError};
use relaycast::metrics::NullMetrics;
use relaycast::slot::M3uParser;
use relaycast::stream::{Connector, RelayConnection};
use relaycast::{EncoderSlot, SlotServices, SlotState};

/// One output byte per input frame
pub struct ByteEncoder;

impl AudioEncoder for ByteEncoder {
    fn encode(&mut self, _: &[f32], frames: usize) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(vec![0xffu8; frames]))
    }

    fn kind(&self) -> CodecKind {
        CodecKind::Mp3
    }
}

pub struct ByteEncoders;

impl EncoderFactory for ByteEncoders {
    fn create(&self, _: &CodecSettings) -> Result<Box<dyn AudioEncoder>, CodecError> {
        Ok(Box::new(ByteEncoder))
    }
}

/// Relay fake counting connections and admin requests
#[derive(Default)]
pub struct FakeRelay {
    pub opens: AtomicUsize,
    pub admin_requests: Mutex<Vec<String>>,
    pub received: Arc<AtomicUsize>,
    /// Leading bytes of every connection, in connection order
    pub streams: Arc<Mutex<Vec<Vec<u8>>>>,
    /// When set, the next connection opened reports dead on its first check
    pub drop_next: AtomicBool,
}

/// Bytes kept per connection
const STREAM_CAPTURE: usize = 4096;

struct FakeConnection {
    received: Arc<AtomicUsize>,
    streams: Arc<Mutex<Vec<Vec<u8>>>>,
    index: usize,
    die: bool,
}

impl RelayConnection for FakeConnection {
    fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.received.fetch_add(data.len(), Ordering::SeqCst);
        let mut streams = self.streams.lock();
        let stream = &mut streams[self.index];
        let room = STREAM_CAPTURE.saturating_sub(stream.len());
        stream.extend_from_slice(&data[..room.min(data.len())]);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        !self.die
    }
}

impl Connector for FakeRelay {
    fn open(&self, _: &StreamTarget) -> Result<Box<dyn RelayConnection>, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let index = {
            let mut streams = self.streams.lock();
            streams.push(Vec::new());
            streams.len() - 1
        };
        Ok(Box::new(FakeConnection {
            received: self.received.clone(),
            streams: self.streams.clone(),
            index,
            die: self.drop_next.swap(false, Ordering::SeqCst),
        }))
    }

    fn request(&self, _: &StreamTarget, request: &str) -> Result<String, StreamError> {
        self.admin_requests.lock().push(request.to_string());
        Ok("<iceresponse><return>1</return></iceresponse>".to_string())
    }
}

impl FakeRelay {
    pub fn admin_count(&self) -> usize {
        self.admin_requests.lock().len()
    }
}

/// Relay that refuses every connection
pub struct DeadRelay;

impl Connector for DeadRelay {
    fn open(&self, _: &StreamTarget) -> Result<Box<dyn RelayConnection>, StreamError> {
        Err(StreamError::ConnectionFailed("connection refused".to_string()))
    }

    fn request(&self, _: &StreamTarget, _: &str) -> Result<String, StreamError> {
        Err(StreamError::ConnectionFailed("connection refused".to_string()))
    }
}

pub fn services(connector: Arc<dyn Connector>) -> SlotServices {
    SlotServices {
        encoders: Arc::new(ByteEncoders),
        sources: Arc::new(DefaultSourceFactory),
        connector,
        playlists: Arc::new(M3uParser),
        metrics: Arc::new(NullMetrics),
    }
}

pub fn write_playlist(dir: &Path, lines: &[&str]) -> PathBuf {
    let path = dir.join("list.m3u");
    std::fs::write(&path, lines.join("\n")).expect("write playlist");
    path
}

pub fn playlist_config(path: PathBuf) -> EncoderConfig {
    EncoderConfig {
        input: InputSource::Playlist { path },
        reconnect_interval_sec: 1,
        ..Default::default()
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn wait_for_state(slot: &EncoderSlot, state: SlotState, timeout: Duration) {
    assert!(
        wait_until(timeout, || slot.state() == state),
        "slot stuck in {} waiting for {}",
        slot.state(),
        state
    );
}
