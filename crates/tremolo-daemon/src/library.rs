//! Song-id to file-path resolution.
//!
//! The real library (tag scanner, metadata store) is a separate
//! concern; this stand-in assigns stable ids from a flat directory
//! listing and is the single seam that component plugs into. Ids are
//! positions in the name-sorted listing, so the same directory always
//! produces the same ids.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use tremolo_core::SongId;

/// Extensions the decoder can open.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "ogg", "wav"];

pub struct Library {
    songs: Vec<PathBuf>,
}

impl Library {
    /// A library with no songs, for when no music directory is usable.
    #[must_use]
    pub fn empty() -> Self {
        Self { songs: Vec::new() }
    }

    /// Build the library from a flat, non-recursive directory listing.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be read.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut songs = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read music directory: {dir:?}"))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let known = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if known {
                songs.push(path);
            }
        }
        songs.sort();
        info!(dir = %dir.display(), count = songs.len(), "music library scanned");
        Ok(Self { songs })
    }

    /// Path of a song id, if the id is known.
    #[must_use]
    pub fn path(&self, id: SongId) -> Option<&Path> {
        usize::try_from(id).ok().and_then(|idx| self.songs.get(idx)).map(PathBuf::as_path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.songs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }
}
