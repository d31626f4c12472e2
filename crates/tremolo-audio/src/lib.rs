//! Tremolo audio - playback engine of the daemon.
//!
//! This crate owns everything between a song path and the speakers:
//! - A fixed ring of pre-allocated PCM slots ([`pool::BufferPool`])
//! - The hardware output seam ([`voice::Voice`]) and its cpal-backed
//!   implementation
//! - The symphonia file decoder ([`decoder::Decoder`])
//! - The engine worker threads that tie them together ([`engine::Engine`])

pub mod decoder;
pub mod engine;
pub mod error;
pub mod pool;
pub mod voice;

pub use decoder::Decoder;
pub use engine::{Engine, EngineCommand, EngineEvent};
pub use error::{AudioError, AudioResult};
pub use pool::{BufferPool, SLOT_CAPACITY, SLOT_COUNT};
pub use voice::{CpalBackend, Voice, VoiceBackend};
