//! File playback through symphonia
//!
//! The file is probed when the source is created so tags and duration are
//! known before playback. Decoding runs on its own thread, converted to the
//! slot format and paced to real time.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;

use crate::audio::convert::FormatConverter;
use crate::audio::{AudioSource, EofCallback, FileSource, PcmCallback, RealtimePacer, TrackInfo};
use crate::error::AudioError;

/// Decoder state moved onto the playback thread
struct Decoding {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
}

/// [`FileSource`] decoding any format symphonia is built with
pub struct SymphoniaFileSource {
    path: PathBuf,
    info: TrackInfo,
    source_rate: u32,
    source_channels: u16,
    sample_rate: u32,
    channels: u16,
    paced: bool,
    decoding: Option<Decoding>,
    running: Arc<AtomicBool>,
    position_frames: Arc<AtomicU64>,
    eof_callback: Arc<Mutex<Option<EofCallback>>>,
    thread_handle: Option<JoinHandle<()>>,
}

fn apply_tags(info: &mut TrackInfo, revision: &MetadataRevision) {
    for tag in revision.tags() {
        match tag.std_key {
            Some(StandardTagKey::TrackTitle) if info.title.is_empty() => {
                info.title = tag.value.to_string()
            }
            Some(StandardTagKey::Artist) if info.artist.is_empty() => {
                info.artist = tag.value.to_string()
            }
            Some(StandardTagKey::Album) if info.album.is_none() => {
                info.album = Some(tag.value.to_string())
            }
            _ => {}
        }
    }
}

impl SymphoniaFileSource {
    pub fn open(path: &Path, sample_rate: u32, channels: u16) -> Result<Self, AudioError> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let mut probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| AudioError::Decode(format!("{}: {}", path.display(), e)))?;

        let mut info = TrackInfo::default();
        if let Some(revision) = probed.metadata.get().as_ref().and_then(|m| m.current()) {
            apply_tags(&mut info, revision);
        }
        if let Some(revision) = probed.format.metadata().current() {
            apply_tags(&mut info, revision);
        }
        if info.title.is_empty() {
            info.title = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
        }

        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AudioError::Decode(format!("{}: no audio track", path.display())))?;

        let params = track.codec_params.clone();
        let track_id = track.id;
        let source_rate = params.sample_rate.unwrap_or(sample_rate);
        let source_channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
        if let Some(n_frames) = params.n_frames {
            info.duration_ms = n_frames * 1000 / source_rate.max(1) as u64;
        }

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| AudioError::UnsupportedFormat(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            path: path.to_path_buf(),
            info,
            source_rate,
            source_channels,
            sample_rate,
            channels,
            paced: true,
            decoding: Some(Decoding {
                format,
                decoder,
                track_id,
            }),
            running: Arc::new(AtomicBool::new(false)),
            position_frames: Arc::new(AtomicU64::new(0)),
            eof_callback: Arc::new(Mutex::new(None)),
            thread_handle: None,
        })
    }

    /// Decode as fast as the consumer accepts
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_format(&self) -> (u32, u16) {
        (self.source_rate, self.source_channels)
    }
}

impl AudioSource for SymphoniaFileSource {
    fn start(&mut self, callback: PcmCallback) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }
        let Decoding {
            mut format,
            mut decoder,
            track_id,
        } = match self.decoding.take() {
            Some(decoding) => decoding,
            // Played once already; reopen from the start
            None => Self::open(&self.path, self.sample_rate, self.channels)?
                .decoding
                .take()
                .ok_or_else(|| AudioError::Decode("decoder unavailable".to_string()))?,
        };

        self.running.store(true, Ordering::SeqCst);
        self.position_frames.store(0, Ordering::SeqCst);

        let running = self.running.clone();
        let position = self.position_frames.clone();
        let eof_callback = self.eof_callback.clone();
        let (source_rate, source_channels) = (self.source_rate, self.source_channels);
        let (sample_rate, channels) = (self.sample_rate, self.channels);
        let paced = self.paced;
        let name = self.info.title.clone();

        let handle = thread::Builder::new()
            .name("file-decode".to_string())
            .spawn(move || {
                let mut converter =
                    FormatConverter::new(source_rate, source_channels, sample_rate, channels);
                let mut pacer = RealtimePacer::new(sample_rate, Duration::from_millis(200));
                let mut sample_buf: Option<SampleBuffer<f32>> = None;
                let out_channels = channels.max(1) as usize;

                while running.load(Ordering::Relaxed) {
                    let packet = match format.next_packet() {
                        Ok(packet) => packet,
                        Err(SymphoniaError::IoError(e))
                            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            break
                        }
                        Err(e) => {
                            tracing::warn!("Read error in '{}': {}", name, e);
                            break;
                        }
                    };
                    if packet.track_id() != track_id {
                        continue;
                    }

                    let decoded = match decoder.decode(&packet) {
                        Ok(decoded) => decoded,
                        Err(SymphoniaError::DecodeError(e)) => {
                            tracing::debug!("Skipping corrupt packet in '{}': {}", name, e);
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("Decode error in '{}': {}", name, e);
                            break;
                        }
                    };

                    let spec = *decoded.spec();
                    let capacity = decoded.capacity() as u64;
                    if sample_buf.as_ref().map_or(true, |b| b.capacity() < capacity as usize) {
                        sample_buf = Some(SampleBuffer::new(capacity, spec));
                    }
                    let Some(buf) = sample_buf.as_mut() else {
                        continue;
                    };
                    buf.copy_interleaved_ref(decoded);

                    let pcm = converter.process(buf.samples());
                    let frames = pcm.len() / out_channels;
                    if frames == 0 {
                        continue;
                    }
                    callback(&pcm, frames);
                    position.fetch_add(frames as u64, Ordering::Relaxed);
                    if paced {
                        pacer.advance(frames);
                    }
                }

                // Reaching here while still running means the track ended
                let finished = running.swap(false, Ordering::SeqCst);
                if finished {
                    if let Some(cb) = eof_callback.lock().take() {
                        cb();
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        tracing::debug!("Playing {}", self.path.display());
        self.thread_handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

impl FileSource for SymphoniaFileSource {
    fn track_info(&self) -> TrackInfo {
        self.info.clone()
    }

    fn set_eof_callback(&mut self, callback: EofCallback) {
        *self.eof_callback.lock() = Some(callback);
    }

    fn position_ms(&self) -> u64 {
        self.position_frames.load(Ordering::Relaxed) * 1000 / self.sample_rate.max(1) as u64
    }
}

impl Drop for SymphoniaFileSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{ArchiveWriter, WavArchiveWriter};
    use crossbeam_channel::bounded;

    /// Half a second of 22.05 kHz mono written through the archive writer
    fn fixture(dir: &Path) -> PathBuf {
        let mut writer = WavArchiveWriter::new(dir, 0);
        writer.open(22050, 1).unwrap();
        let pcm: Vec<f32> = (0..11025).map(|i| (i as f32 * 0.05).sin() * 0.3).collect();
        writer.write_pcm(&pcm, pcm.len()).unwrap();
        writer.close().unwrap().unwrap()
    }

    #[test]
    fn test_probe_reports_duration_and_title() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let source = SymphoniaFileSource::open(&path, 44100, 2).unwrap();

        let info = source.track_info();
        assert_eq!(info.duration_ms, 500);
        assert!(info.title.starts_with("slot0-"));
        assert_eq!(source.source_format(), (22050, 1));
    }

    #[test]
    fn test_decodes_to_slot_format_and_signals_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let mut source = SymphoniaFileSource::open(&path, 44100, 2).unwrap().unpaced();

        let (eof_tx, eof_rx) = bounded(1);
        source.set_eof_callback(Box::new(move || {
            let _ = eof_tx.send(());
        }));
        let frames_seen = Arc::new(AtomicU64::new(0));
        let counter = frames_seen.clone();
        source
            .start(Arc::new(move |pcm: &[f32], frames: usize| {
                assert_eq!(pcm.len(), frames * 2);
                counter.fetch_add(frames as u64, Ordering::SeqCst);
            }))
            .unwrap();

        eof_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        source.stop();
        // 0.5 s upsampled to 44.1 kHz
        let frames = frames_seen.load(Ordering::SeqCst) as i64;
        assert!((frames - 22050).abs() < 64, "got {frames}");
        assert!((source.position_ms() as i64 - 500).abs() <= 2);
    }

    #[test]
    fn test_missing_file() {
        let result = SymphoniaFileSource::open(Path::new("/nonexistent/track.mp3"), 44100, 2);
        assert!(matches!(result, Err(AudioError::Io(_))));
    }
}
