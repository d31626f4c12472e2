//! Mirrored playback enums and identifiers.
//!
//! These enums cross the wire as bare ordinals, so the daemon and the
//! client controller must agree on the numbering. The ordinal helpers
//! are the single source of truth for that mapping.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifier of a song in the metadata store.
///
/// The store itself is an external collaborator; the daemon only ever
/// passes ids through and resolves them to file paths at play time.
pub type SongId = i64;

/// Repeat behaviour once the queue index reaches the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    /// Stop at the end of the queue
    #[default]
    Off,
    /// Repeat the current song indefinitely
    One,
    /// Wrap around to the start of the queue
    All,
}

impl RepeatMode {
    /// Wire ordinal for this mode.
    #[must_use]
    pub fn ordinal(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::One => 1,
            Self::All => 2,
        }
    }

    /// Decode a wire ordinal.
    ///
    /// # Errors
    /// Returns an error if the ordinal is not a known mode.
    pub fn from_ordinal(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Off),
            1 => Ok(Self::One),
            2 => Ok(Self::All),
            _ => Err(Error::UnknownOrdinal { kind: "repeat", value }),
        }
    }
}

/// Shuffle behaviour for the play order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShuffleMode {
    /// Play the queue in its stored order
    #[default]
    Off,
    /// Play the queue in a shuffled order
    On,
}

impl ShuffleMode {
    /// Wire ordinal for this mode.
    #[must_use]
    pub fn ordinal(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }

    /// Decode a wire ordinal.
    ///
    /// # Errors
    /// Returns an error if the ordinal is not a known mode.
    pub fn from_ordinal(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Off),
            1 => Ok(Self::On),
            _ => Err(Error::UnknownOrdinal { kind: "shuffle", value }),
        }
    }
}

/// Playback status of the daemon's voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    /// The daemon could not report a usable status
    Error,
    /// A song is currently rendering
    Playing,
    /// A song is loaded but the voice is held
    Paused,
    /// No song is rendering
    #[default]
    Stopped,
}

impl PlaybackStatus {
    /// Wire ordinal for this status.
    #[must_use]
    pub fn ordinal(self) -> i64 {
        match self {
            Self::Error => 0,
            Self::Playing => 1,
            Self::Paused => 2,
            Self::Stopped => 3,
        }
    }

    /// Decode a wire ordinal.
    ///
    /// # Errors
    /// Returns an error if the ordinal is not a known status.
    pub fn from_ordinal(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Error),
            1 => Ok(Self::Playing),
            2 => Ok(Self::Paused),
            3 => Ok(Self::Stopped),
            _ => Err(Error::UnknownOrdinal { kind: "status", value }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_ordinal_round_trip() {
        for mode in [RepeatMode::Off, RepeatMode::One, RepeatMode::All] {
            assert_eq!(RepeatMode::from_ordinal(mode.ordinal()).unwrap(), mode);
        }
    }

    #[test]
    fn test_shuffle_ordinal_round_trip() {
        for mode in [ShuffleMode::Off, ShuffleMode::On] {
            assert_eq!(ShuffleMode::from_ordinal(mode.ordinal()).unwrap(), mode);
        }
    }

    #[test]
    fn test_status_ordinal_round_trip() {
        for status in [
            PlaybackStatus::Error,
            PlaybackStatus::Playing,
            PlaybackStatus::Paused,
            PlaybackStatus::Stopped,
        ] {
            assert_eq!(PlaybackStatus::from_ordinal(status.ordinal()).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_ordinal_rejected() {
        assert!(RepeatMode::from_ordinal(3).is_err());
        assert!(ShuffleMode::from_ordinal(2).is_err());
        assert!(PlaybackStatus::from_ordinal(4).is_err());
    }
}
