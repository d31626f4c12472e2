//! Tremolo Core - shared playback vocabulary.
//!
//! This crate contains the domain types shared between the daemon, the
//! audio engine, and the client controller: the mirrored playback enums
//! and the song identifier.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{PlaybackStatus, RepeatMode, ShuffleMode, SongId};
