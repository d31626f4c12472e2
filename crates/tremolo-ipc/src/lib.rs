//! Tremolo IPC - loopback control protocol and client library.
//!
//! This crate defines the wire protocol between the playback daemon and
//! its UI, the framed socket transport both sides share, the daemon-side
//! listener, and the client-side controller that mirrors remote state.

pub mod client;
pub mod error;
pub mod listener;
pub mod protocol;
pub mod transfer;

pub use client::{ConnectionState, ErrorKind, PlayerClient};
pub use error::{IpcError, IpcResult};
pub use listener::Listener;
pub use protocol::Command;
pub use transfer::{Connector, Transfer};
