//! Tremolo Daemon - background music playback service.
//!
//! This is the main entry point for the Tremolo daemon, which owns the
//! audio engine and serves the loopback control protocol the UI
//! connects to.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod library;
mod server;
mod signals;

use tremolo_audio::{CpalBackend, Engine, EngineEvent};
use tremolo_core::{PlaybackStatus, SongId};
use tremolo_ipc::{Command, Listener, Transfer};

use library::Library;
use server::Interpreter;

/// Pause between listener polls while no client is connected.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// The engine plus the library, as the interpreter sees them.
struct EnginePlayback {
    engine: Engine,
    library: Library,
}

impl server::Playback for EnginePlayback {
    fn play(&mut self, id: SongId) {
        match self.library.path(id) {
            Some(path) => self.engine.play(path.to_path_buf(), id),
            None => warn!(id, "unknown song id; nothing to play"),
        }
    }

    fn stop(&mut self) {
        self.engine.stop_playback();
    }

    fn pause(&mut self) {
        if let Err(e) = self.engine.pause() {
            warn!(error = %e, "pause failed");
        }
    }

    fn resume(&mut self) {
        if let Err(e) = self.engine.resume() {
            warn!(error = %e, "resume failed");
        }
    }

    fn set_position(&mut self, percent: f64) {
        self.engine.set_position(percent);
    }

    fn position(&self) -> f64 {
        self.engine.position()
    }

    fn volume(&self) -> f64 {
        self.engine.volume()
    }

    fn set_volume(&mut self, percent: f64) {
        self.engine.set_volume(percent);
    }

    fn status(&self) -> PlaybackStatus {
        self.engine.status()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so its log level can seed the filter.
    let config = config::load_config()?;

    let level = &config.daemon.log_level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tremolo={level},tremolo_daemon={level},tremolo_audio={level}"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Tremolo daemon");

    // Build the music library
    let music_dir = music_dir(&config);
    let library = match &music_dir {
        Some(dir) => Library::scan(dir).unwrap_or_else(|e| {
            warn!(error = %e, "library scan failed; starting with an empty library");
            Library::empty()
        }),
        None => {
            warn!("no music directory configured or discoverable");
            Library::empty()
        }
    };

    // Spawn the audio engine threads
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel::<EngineEvent>(16);
    let engine = Engine::start(Box::new(CpalBackend), event_tx);
    info!("Audio engine started");

    // Bind the control listener
    let listener = Listener::bind(config.network.port)
        .await
        .context("Failed to bind control listener")?;
    info!(port = listener.port(), "Control listener started");

    // Set up signal handling
    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);

    let mut interpreter = Interpreter::new(EnginePlayback { engine, library });
    let mut active: Option<Transfer> = None;

    info!("Daemon running. Press Ctrl+C to exit.");

    loop {
        tokio::select! {
            // Song boundaries from the engine
            Some(event) = event_rx.recv() => {
                match event {
                    EngineEvent::SongEnded { song_id } => {
                        debug!(song_id, "song ended");
                        interpreter.song_ended();
                    }
                }
            }

            // Requests from the active client, one at a time
            frame = next_frame(&mut active, &listener) => {
                if let Some(frame) = frame {
                    match Command::decode(&frame) {
                        Ok(command) => {
                            let reply = interpreter.handle_command(command);
                            if let Some(transfer) = active.as_mut() {
                                if let Err(e) = transfer.write_message(&reply).await {
                                    warn!(error = %e, "reply failed; dropping client");
                                    active = None;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "ignoring malformed request");
                        }
                    }
                }
            }

            // Shutdown signal
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "signal handler failed; shutting down");
                }
                break;
            }
        }
    }

    // Cleanup
    info!("Shutting down...");
    listener.stop();
    drop(interpreter);

    info!("Tremolo daemon stopped");
    Ok(())
}

/// Read the next request frame, adopting a newly accepted connection
/// whenever there is no active one. Dead channels are dropped so the
/// next listener poll can replace them.
async fn next_frame(active: &mut Option<Transfer>, listener: &Listener) -> Option<String> {
    loop {
        if active.is_none() {
            match listener.get_transfer() {
                Some(transfer) => {
                    info!("client connected");
                    *active = Some(transfer);
                }
                None => {
                    sleep(ACCEPT_POLL).await;
                    continue;
                }
            }
        }
        let transfer = active.as_mut()?;
        match transfer.read_message().await {
            Ok(frame) => return Some(frame),
            Err(e) => {
                if transfer.is_connected() {
                    debug!(error = %e, "read failed; retrying on the same channel");
                } else {
                    info!(error = %e, "client disconnected");
                    *active = None;
                }
            }
        }
    }
}

fn music_dir(config: &config::Config) -> Option<PathBuf> {
    if let Some(dir) = &config.library.music_dir {
        return Some(dir.clone());
    }
    directories::UserDirs::new()
        .and_then(|dirs| dirs.audio_dir().map(std::path::Path::to_path_buf))
}
