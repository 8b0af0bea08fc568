//! Background audio loop
//!
//! Collects the tracks under the audio directory (or a fixed fallback list
//! when there are none) and writes them as an ffmpeg concat list that the
//! encoder loops forever.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Track names used when the audio directory has nothing playable
const FALLBACK_TRACKS: &[&str] = &[
    "01 Weatherscan Track 26.mp3",
    "02 Weatherscan Track 3.mp3",
    "03 Tropical Breeze.mp3",
    "04 Late Nite Cafe.mp3",
    "05 Care Free.mp3",
    "06 Weatherscan Track 14.mp3",
    "07 Weatherscan Track 18.mp3",
];

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "aac", "m4a", "ogg", "wav", "flac"];

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("failed to write audio list {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// Ordered tracks plus whether the encoder should loop them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPlaylist {
    tracks: Vec<PathBuf>,
    looped: bool,
}

impl AudioPlaylist {
    pub fn tracks(&self) -> &[PathBuf] {
        &self.tracks
    }

    pub fn is_looped(&self) -> bool {
        self.looped
    }

    /// Concat demuxer syntax, one `file '<path>'` line per track
    pub fn to_concat_list(&self) -> String {
        let mut out = String::new();
        for track in &self.tracks {
            out.push_str("file '");
            out.push_str(&track.to_string_lossy().replace('\'', r"'\''"));
            out.push_str("'\n");
        }
        out
    }
}

/// Builds the playlist and writes its loop descriptor
#[derive(Debug, Clone)]
pub struct AudioPlaylistBuilder {
    audio_dir: PathBuf,
    list_path: PathBuf,
}

impl AudioPlaylistBuilder {
    pub fn new(audio_dir: impl Into<PathBuf>, list_path: impl Into<PathBuf>) -> Self {
        Self {
            audio_dir: audio_dir.into(),
            list_path: list_path.into(),
        }
    }

    pub fn list_path(&self) -> &Path {
        &self.list_path
    }

    /// Scan the audio directory, falling back to the built-in track names
    pub fn discover(&self) -> AudioPlaylist {
        let audio_dir = absolute(&self.audio_dir);
        let mut tracks = scan_tracks(&audio_dir);

        if tracks.is_empty() {
            debug!("No tracks in {:?}, using fallback list", audio_dir);
            tracks = FALLBACK_TRACKS.iter().map(|name| audio_dir.join(name)).collect();
        }

        AudioPlaylist {
            tracks,
            looped: true,
        }
    }

    /// Discover tracks and replace the loop descriptor in one step
    pub fn build(&self) -> Result<AudioPlaylist, PlaylistError> {
        let playlist = self.discover();
        self.write(&playlist)?;
        info!(
            "Audio loop: {} tracks written to {:?}",
            playlist.tracks.len(),
            self.list_path
        );
        Ok(playlist)
    }

    fn write(&self, playlist: &AudioPlaylist) -> Result<(), PlaylistError> {
        let to_err = |source| PlaylistError::Write {
            path: self.list_path.clone(),
            source,
        };

        if let Some(parent) = self.list_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(to_err)?;
            }
        }

        // Readers only ever see a complete file
        let tmp = self.list_path.with_extension("txt.tmp");
        std::fs::write(&tmp, playlist.to_concat_list()).map_err(to_err)?;
        std::fs::rename(&tmp, &self.list_path).map_err(to_err)
    }
}

fn scan_tracks(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot read audio directory {:?}: {}", dir, e);
            return Vec::new();
        }
    };

    let mut tracks: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_audio(path))
        .collect();
    tracks.sort();
    tracks
}

fn is_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    }
}
