//! Side recording of the broadcast PCM
//!
//! Archive failures are never allowed to disturb the audio path; callers
//! log and carry on.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::f32_to_i16;

/// Sink for a slot's processed PCM
pub trait ArchiveWriter: Send {
    fn open(&mut self, sample_rate: u32, channels: u16) -> std::io::Result<()>;

    fn write_pcm(&mut self, pcm: &[f32], frames: usize) -> std::io::Result<()>;

    /// Finish the recording and return its path
    fn close(&mut self) -> std::io::Result<Option<PathBuf>>;
}

/// 44-byte PCM WAV header; sizes are patched on close
pub fn wav_header(sample_rate: u32, channels: u16, data_len: u32) -> Bytes {
    let mut header = BytesMut::with_capacity(44);

    header.put_slice(b"RIFF");
    header.put_u32_le(data_len.saturating_add(36));
    header.put_slice(b"WAVE");

    header.put_slice(b"fmt ");
    header.put_u32_le(16);
    header.put_u16_le(1); // PCM
    header.put_u16_le(channels);
    header.put_u32_le(sample_rate);
    header.put_u32_le(sample_rate * channels as u32 * 2);
    header.put_u16_le(channels * 2);
    header.put_u16_le(16);

    header.put_slice(b"data");
    header.put_u32_le(data_len);

    header.freeze()
}

/// 16-bit WAV recorder writing `slot<id>-<timestamp>.wav`
pub struct WavArchiveWriter {
    directory: PathBuf,
    slot_id: u32,
    file: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    sample_rate: u32,
    channels: u16,
    data_len: u32,
    scratch: Vec<u8>,
}

impl WavArchiveWriter {
    pub fn new(directory: impl AsRef<Path>, slot_id: u32) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            slot_id,
            file: None,
            path: None,
            sample_rate: 0,
            channels: 0,
            data_len: 0,
            scratch: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

impl ArchiveWriter for WavArchiveWriter {
    fn open(&mut self, sample_rate: u32, channels: u16) -> std::io::Result<()> {
        if self.file.is_some() {
            self.close()?;
        }
        std::fs::create_dir_all(&self.directory)?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let path = self
            .directory
            .join(format!("slot{}-{}.wav", self.slot_id, stamp));

        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(&wav_header(sample_rate, channels, 0))?;

        tracing::info!("Archiving slot {} to {}", self.slot_id, path.display());
        self.file = Some(file);
        self.path = Some(path);
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.data_len = 0;
        Ok(())
    }

    fn write_pcm(&mut self, pcm: &[f32], frames: usize) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let samples = (frames * self.channels as usize).min(pcm.len());
        // RIFF sizes are 32-bit; stop growing at the limit
        let bytes = (samples * 2) as u32;
        if self.data_len.checked_add(bytes).map_or(true, |n| n > u32::MAX - 36) {
            return Ok(());
        }

        self.scratch.clear();
        for sample in &pcm[..samples] {
            self.scratch.extend_from_slice(&f32_to_i16(*sample).to_le_bytes());
        }
        file.write_all(&self.scratch)?;
        self.data_len += bytes;
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<Option<PathBuf>> {
        let Some(mut file) = self.file.take() else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&wav_header(self.sample_rate, self.channels, self.data_len))?;
        file.flush()?;
        tracing::info!("Archive closed ({} bytes of audio)", self.data_len);
        Ok(self.path.clone())
    }
}

impl Drop for WavArchiveWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to finalize archive: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = wav_header(44100, 2, 1000);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes(header[4..8].try_into().unwrap()), 1036);
        assert_eq!(u32::from_le_bytes(header[28..32].try_into().unwrap()), 176_400);
        assert_eq!(u32::from_le_bytes(header[40..44].try_into().unwrap()), 1000);
    }

    #[test]
    fn test_sizes_patched_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WavArchiveWriter::new(dir.path(), 7);
        writer.open(8000, 2).unwrap();
        writer.write_pcm(&vec![0.5f32; 200], 100).unwrap();
        writer.write_pcm(&vec![-0.5f32; 100], 50).unwrap();
        let path = writer.close().unwrap().unwrap();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("slot7-") && name.ends_with(".wav"));

        let data = std::fs::read(&path).unwrap();
        assert_eq!(data.len(), 44 + 600);
        assert_eq!(u32::from_le_bytes(data[40..44].try_into().unwrap()), 600);
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 636);
    }

    #[test]
    fn test_write_without_open_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WavArchiveWriter::new(dir.path(), 1);
        writer.write_pcm(&[0.1, 0.2], 1).unwrap();
        assert!(writer.close().unwrap().is_none());
    }
}
