//! Playlists: parsing and play order

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::Serialize;

use crate::error::SlotError;

/// One playable item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistEntry {
    /// File path, URL or `tone:` generator
    pub location: String,
    /// Display title; empty when the playlist gave none
    pub title: String,
    /// Seconds, -1 when unknown
    pub duration_sec: i64,
}

impl PlaylistEntry {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            title: String::new(),
            duration_sec: -1,
        }
    }
}

/// Turns a playlist file into entries
pub trait PlaylistParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Vec<PlaylistEntry>, SlotError>;
}

/// Plain and extended M3U; any other file is a one-entry playlist
#[derive(Debug, Default, Clone, Copy)]
pub struct M3uParser;

impl PlaylistParser for M3uParser {
    fn parse(&self, path: &Path) -> Result<Vec<PlaylistEntry>, SlotError> {
        let location = path.to_string_lossy();
        if location.starts_with("tone:") {
            return Ok(vec![PlaylistEntry::new(location)]);
        }

        let is_m3u = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("m3u") || e.eq_ignore_ascii_case("m3u8"))
            .unwrap_or(false);

        if !is_m3u {
            if !path.is_file() {
                return Err(SlotError::Playlist(format!("{} not found", path.display())));
            }
            return Ok(vec![PlaylistEntry::new(location)]);
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| SlotError::Playlist(format!("{}: {}", path.display(), e)))?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Ok(parse_m3u(&text, &base))
    }
}

/// Parse M3U text; relative paths resolve against `base`
pub fn parse_m3u(text: &str, base: &Path) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<(i64, String)> = None;

    for line in text.lines() {
        let line = line.trim().trim_start_matches('\u{feff}');
        if line.is_empty() {
            continue;
        }
        if let Some(extinf) = line.strip_prefix("#EXTINF:") {
            let (duration, title) = extinf.split_once(',').unwrap_or((extinf, ""));
            let duration = duration
                .split_whitespace()
                .next()
                .and_then(|d| d.parse::<f64>().ok())
                .map(|d| if d < 0.0 { -1 } else { d as i64 })
                .unwrap_or(-1);
            pending = Some((duration, title.trim().to_string()));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let location = if line.contains("://") || line.starts_with("tone:") {
            line.to_string()
        } else {
            let path = PathBuf::from(line);
            if path.is_absolute() {
                line.to_string()
            } else {
                base.join(path).to_string_lossy().into_owned()
            }
        };

        let mut entry = PlaylistEntry::new(location);
        if let Some((duration, title)) = pending.take() {
            entry.duration_sec = duration;
            entry.title = title;
        }
        entries.push(entry);
    }
    entries
}

/// Entries plus play order and position
#[derive(Debug, Clone, Default)]
pub struct PlaylistState {
    entries: Vec<PlaylistEntry>,
    /// Indices into `entries` in play order
    order: Vec<usize>,
    position: usize,
    shuffle: bool,
    repeat_all: bool,
    /// Set once the last entry finished without repeat
    exhausted: bool,
}

impl PlaylistState {
    pub fn new(entries: Vec<PlaylistEntry>, shuffle: bool, repeat_all: bool) -> Self {
        let mut state = Self {
            order: (0..entries.len()).collect(),
            entries,
            position: 0,
            shuffle,
            repeat_all,
            exhausted: false,
        };
        if shuffle {
            state.reshuffle();
        }
        state
    }

    fn reshuffle(&mut self) {
        self.order.shuffle(&mut rand::thread_rng());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Position in play order
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn current(&self) -> Option<&PlaylistEntry> {
        if self.exhausted {
            return None;
        }
        self.order
            .get(self.position)
            .and_then(|&i| self.entries.get(i))
    }

    /// Move to the next entry. `None` when the list ends without repeat.
    pub fn advance(&mut self) -> Option<&PlaylistEntry> {
        if self.entries.is_empty() {
            return None;
        }
        if self.position + 1 < self.order.len() {
            self.position += 1;
        } else if self.repeat_all {
            self.position = 0;
            if self.shuffle {
                self.reshuffle();
            }
        } else {
            self.exhausted = true;
            return None;
        }
        self.exhausted = false;
        self.current()
    }

    pub fn entries(&self) -> &[PlaylistEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_m3u() {
        let text = "#EXTM3U\n#EXTINF:215,Miles Davis - So What\nmusic/so_what.mp3\n\n/abs/blue.flac\nhttp://radio.example/stream\n";
        let entries = parse_m3u(text, Path::new("/library"));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].location, "/library/music/so_what.mp3");
        assert_eq!(entries[0].title, "Miles Davis - So What");
        assert_eq!(entries[0].duration_sec, 215);
        assert_eq!(entries[1].location, "/abs/blue.flac");
        assert_eq!(entries[1].duration_sec, -1);
        assert_eq!(entries[2].location, "http://radio.example/stream");
    }

    #[test]
    fn test_negative_extinf_is_unknown() {
        let entries = parse_m3u("#EXTINF:-1,Live\ntone:440\n", Path::new("/"));
        assert_eq!(entries[0].duration_sec, -1);
        assert_eq!(entries[0].location, "tone:440");
    }

    #[test]
    fn test_parser_reads_file_and_single_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let track = dir.path().join("a.wav");
        std::fs::write(&track, b"RIFF").unwrap();
        let list = dir.path().join("list.m3u");
        std::fs::write(&list, "a.wav\nb.wav\n").unwrap();

        let entries = M3uParser.parse(&list).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].location.ends_with("a.wav"));

        assert_eq!(M3uParser.parse(&track).unwrap().len(), 1);
        assert!(M3uParser.parse(&dir.path().join("missing.mp3")).is_err());
    }

    #[test]
    fn test_repeat_all_wraps() {
        let entries = (0..3).map(|i| PlaylistEntry::new(format!("tone:{}", 100 + i))).collect();
        let mut playlist = PlaylistState::new(entries, false, true);
        assert_eq!(playlist.current().unwrap().location, "tone:100");
        playlist.advance();
        playlist.advance();
        assert_eq!(playlist.position(), 2);
        assert_eq!(playlist.advance().unwrap().location, "tone:100");
        assert_eq!(playlist.position(), 0);
    }

    #[test]
    fn test_no_repeat_exhausts() {
        let entries = vec![PlaylistEntry::new("tone:100"), PlaylistEntry::new("tone:200")];
        let mut playlist = PlaylistState::new(entries, false, false);
        assert!(playlist.advance().is_some());
        assert!(playlist.advance().is_none());
        assert!(playlist.is_exhausted());
        assert!(playlist.current().is_none());
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let entries: Vec<_> = (0..20).map(|i| PlaylistEntry::new(format!("tone:{}", i + 1))).collect();
        let mut playlist = PlaylistState::new(entries, true, true);
        let mut seen: Vec<String> = Vec::new();
        for _ in 0..20 {
            seen.push(playlist.current().unwrap().location.clone());
            playlist.advance();
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
    }
}
