//! Engine worker: the blocking decode loop and the voice process loop.
//!
//! The interpreter talks to the engine through a control channel; the
//! engine reports upward on a tokio channel so the async side can react
//! to song boundaries. Decoding and the voice wait both block, so each
//! runs on its own OS thread; the slot ring is the only backpressure
//! between them.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tremolo_core::{PlaybackStatus, SongId};

use crate::decoder::Decoder;
use crate::error::AudioResult;
use crate::pool::BufferPool;
use crate::voice::VoiceBackend;

/// Sleep while the ring is full or nothing is loaded.
const DECODE_BACKOFF: Duration = Duration::from_millis(3);
const IDLE_RECV: Duration = Duration::from_millis(100);

/// Control messages into the decode worker.
#[derive(Debug)]
pub enum EngineCommand {
    Play { path: PathBuf, song_id: SongId },
    /// Seek within the current song, percent 0-100.
    SetPosition(f64),
    Stop,
    Shutdown,
}

/// Reports from the worker to the daemon.
#[derive(Debug, PartialEq, Eq)]
pub enum EngineEvent {
    SongEnded { song_id: SongId },
}

/// Handle to the running engine threads.
pub struct Engine {
    commands: Sender<EngineCommand>,
    pool: Arc<Mutex<BufferPool>>,
    total_frames: Arc<AtomicU64>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    process: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Spawn the decode worker and the process loop.
    #[must_use]
    pub fn start(
        backend: Box<dyn VoiceBackend>,
        events: tokio::sync::mpsc::Sender<EngineEvent>,
    ) -> Self {
        let pool = Arc::new(Mutex::new(BufferPool::new(backend)));
        let total_frames = Arc::new(AtomicU64::new(0));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (commands, command_rx) = crossbeam_channel::unbounded();

        let worker = {
            let pool = Arc::clone(&pool);
            let total_frames = Arc::clone(&total_frames);
            thread::spawn(move || worker_loop(&command_rx, &pool, &total_frames, &events))
        };
        let process = {
            let pool = Arc::clone(&pool);
            let stop_flag = Arc::clone(&stop_flag);
            thread::spawn(move || process_loop(&pool, &stop_flag))
        };

        Self { commands, pool, total_frames, stop_flag, worker: Some(worker), process: Some(process) }
    }

    pub fn play(&self, path: PathBuf, song_id: SongId) {
        self.send(EngineCommand::Play { path, song_id });
    }

    pub fn set_position(&self, percent: f64) {
        self.send(EngineCommand::SetPosition(percent.clamp(0.0, 100.0)));
    }

    pub fn stop_playback(&self) {
        self.send(EngineCommand::Stop);
    }

    /// # Errors
    /// Returns an error if no voice is programmed.
    pub fn pause(&self) -> AudioResult<()> {
        self.pool.lock().pause()
    }

    /// # Errors
    /// Returns an error if no voice is programmed.
    pub fn resume(&self) -> AudioResult<()> {
        self.pool.lock().resume()
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.pool.lock().status()
    }

    #[must_use]
    pub fn volume(&self) -> f64 {
        self.pool.lock().volume()
    }

    pub fn set_volume(&self, percent: f64) {
        self.pool.lock().set_volume(percent);
    }

    /// Playback position in percent of the current song, 0-100.
    #[must_use]
    pub fn position(&self) -> f64 {
        let total = self.total_frames.load(Ordering::Acquire);
        if total == 0 {
            return 0.0;
        }
        let played = self.pool.lock().samples_played();
        (played as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Stop both threads and join them.
    pub fn shutdown(&mut self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.process.take() {
            let _ = handle.join();
        }
    }

    fn send(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            warn!("engine worker is gone; command dropped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct CurrentSong {
    decoder: Decoder,
    song_id: SongId,
}

/// Blocking decode loop. Owns the open file; one block per tick.
fn worker_loop(
    commands: &Receiver<EngineCommand>,
    pool: &Arc<Mutex<BufferPool>>,
    total_frames: &Arc<AtomicU64>,
    events: &tokio::sync::mpsc::Sender<EngineEvent>,
) {
    let mut current: Option<CurrentSong> = None;
    let mut block = Vec::new();

    loop {
        let command = if current.is_some() {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => return,
            }
        } else {
            match commands.recv_timeout(IDLE_RECV) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        };

        match command {
            Some(EngineCommand::Play { path, song_id }) => {
                match start_song(&path, pool) {
                    Ok(decoder) => {
                        total_frames.store(decoder.total_frames(), Ordering::Release);
                        pool.lock().set_samples_played(0);
                        current = Some(CurrentSong { decoder, song_id });
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "could not start song");
                        pool.lock().stop();
                        current = None;
                        let _ = events.blocking_send(EngineEvent::SongEnded { song_id });
                    }
                }
            }
            Some(EngineCommand::SetPosition(percent)) => {
                if let Some(song) = &mut current {
                    let fraction = percent / 100.0;
                    if let Err(e) = song.decoder.seek_to(fraction) {
                        warn!(error = %e, "seek failed");
                    } else {
                        // Flush queued audio and rebase the position.
                        let frame = song.decoder.frame_at(fraction);
                        let mut pool = pool.lock();
                        pool.stop();
                        pool.set_samples_played(frame);
                    }
                }
            }
            Some(EngineCommand::Stop) => {
                pool.lock().stop();
                current = None;
            }
            Some(EngineCommand::Shutdown) => {
                pool.lock().stop();
                return;
            }
            None => {}
        }

        let Some(song) = &mut current else { continue };
        if !pool.lock().buffer_available() {
            thread::sleep(DECODE_BACKOFF);
            continue;
        }
        match song.decoder.next_block(&mut block) {
            Ok(true) => {
                if !pool.lock().add_buffer(&block) {
                    // Slot was reclaimed out from under us; retry next tick.
                    thread::sleep(DECODE_BACKOFF);
                }
            }
            Ok(false) => {
                debug!(song_id = song.song_id, "song decoded to the end");
                let song_id = song.song_id;
                current = None;
                let _ = events.blocking_send(EngineEvent::SongEnded { song_id });
            }
            Err(e) => {
                warn!(song_id = song.song_id, error = %e, "decode failed; stopping song");
                let song_id = song.song_id;
                pool.lock().stop();
                current = None;
                let _ = events.blocking_send(EngineEvent::SongEnded { song_id });
            }
        }
    }
}

fn start_song(path: &std::path::Path, pool: &Arc<Mutex<BufferPool>>) -> AudioResult<Decoder> {
    let decoder = Decoder::open(path)?;
    pool.lock().new_song(decoder.sample_rate(), decoder.channels())?;
    info!(path = %path.display(), rate = decoder.sample_rate(), "song loaded");
    Ok(decoder)
}

/// Voice-side loop: push pending updates, reclaim drained slots, then
/// wait for the next render quantum without holding the pool lock.
fn process_loop(pool: &Arc<Mutex<BufferPool>>, stop: &Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        let voice = {
            let mut pool = pool.lock();
            if pool.status() == PlaybackStatus::Playing {
                pool.flush_updates();
                pool.reclaim();
                pool.voice_handle()
            } else {
                None
            }
        };
        match voice {
            Some(voice) => voice.wait_tick(),
            None => thread::sleep(IDLE_RECV),
        }
    }
}
