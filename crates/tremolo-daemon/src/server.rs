//! Command interpreter: the authoritative playback state.
//!
//! One interpreter serves one control connection at a time. Every wire
//! command maps to one `handle_command` arm producing the reply frame
//! body; song boundaries reported by the engine come in through
//! [`Interpreter::song_ended`].

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use tremolo_core::{PlaybackStatus, RepeatMode, ShuffleMode, SongId};
use tremolo_ipc::protocol::{self, Command};

/// What the interpreter drives. The engine plus library implement this
/// in the daemon; tests substitute a recorder.
pub trait Playback {
    fn play(&mut self, id: SongId);
    fn stop(&mut self);
    fn pause(&mut self);
    fn resume(&mut self);
    fn set_position(&mut self, percent: f64);
    fn position(&self) -> f64;
    fn volume(&self) -> f64;
    fn set_volume(&mut self, percent: f64);
    fn status(&self) -> PlaybackStatus;
}

/// Reply for a rejected positional argument; never a valid echo, so the
/// client falls back to a full resync.
const REJECTED: i64 = -1;

#[derive(Default)]
struct PlayerState {
    queue: Vec<SongId>,
    sub_queue: Vec<SongId>,
    song_idx: usize,
    repeat: RepeatMode,
    shuffle: ShuffleMode,
    current_song: SongId,
    /// Volume to restore on unmute; `None` while unmuted.
    pre_mute_volume: Option<f64>,
    /// Queue order before shuffling, for restoring on shuffle-off.
    unshuffled: Option<Vec<SongId>>,
}

pub struct Interpreter<P: Playback> {
    state: PlayerState,
    playback: P,
}

impl<P: Playback> Interpreter<P> {
    pub fn new(playback: P) -> Self {
        Self { state: PlayerState { current_song: -1, ..PlayerState::default() }, playback }
    }

    /// Handle one decoded request, producing the reply frame body.
    #[allow(clippy::too_many_lines)]
    pub fn handle_command(&mut self, command: Command) -> String {
        debug!(?command, "handling request");
        match command {
            Command::Version => protocol::VERSION.to_string(),

            Command::Resume => {
                match self.playback.status() {
                    PlaybackStatus::Paused => self.playback.resume(),
                    PlaybackStatus::Stopped => {
                        if let Some(&id) = self.state.queue.get(self.state.song_idx) {
                            self.play(id);
                        }
                    }
                    _ => {}
                }
                self.state.current_song.to_string()
            }
            Command::Pause => {
                self.playback.pause();
                self.state.current_song.to_string()
            }
            Command::Previous => self.previous().to_string(),
            Command::Next => self.next().to_string(),

            Command::GetVolume => self.playback.volume().to_string(),
            Command::SetVolume(volume) => {
                self.state.pre_mute_volume = None;
                self.playback.set_volume(volume);
                self.playback.volume().to_string()
            }
            Command::Mute => {
                if self.state.pre_mute_volume.is_none() {
                    self.state.pre_mute_volume = Some(self.playback.volume());
                    self.playback.set_volume(0.0);
                }
                self.playback.volume().to_string()
            }
            Command::Unmute => {
                if let Some(volume) = self.state.pre_mute_volume.take() {
                    self.playback.set_volume(volume);
                }
                self.playback.volume().to_string()
            }

            Command::GetSubQueue { start, count } => {
                slice_ids(&self.state.sub_queue, start, count)
            }
            Command::SkipSubQueueSongs(count) => {
                let count = count.min(self.state.sub_queue.len());
                self.state.sub_queue.drain(..count);
                self.state.sub_queue.len().to_string()
            }
            Command::SubQueueSize => self.state.sub_queue.len().to_string(),
            Command::AddToSubQueue(id) => {
                self.state.sub_queue.push(id);
                id.to_string()
            }
            Command::RemoveFromSubQueue(pos) => {
                if pos < self.state.sub_queue.len() {
                    self.state.sub_queue.remove(pos);
                    pos.to_string()
                } else {
                    warn!(pos, len = self.state.sub_queue.len(), "sub-queue removal out of range");
                    REJECTED.to_string()
                }
            }

            Command::QueueIdx => self.state.song_idx.to_string(),
            Command::SetQueueIdx(pos) => {
                if let Some(&id) = self.state.queue.get(pos) {
                    self.state.song_idx = pos;
                    self.play(id);
                    pos.to_string()
                } else {
                    warn!(pos, len = self.state.queue.len(), "queue index out of range");
                    REJECTED.to_string()
                }
            }
            Command::QueueSize => self.state.queue.len().to_string(),
            Command::RemoveFromQueue(pos) => {
                if pos < self.state.queue.len() {
                    self.state.queue.remove(pos);
                    if pos < self.state.song_idx {
                        self.state.song_idx -= 1;
                    } else {
                        let last = self.state.queue.len().saturating_sub(1);
                        self.state.song_idx = self.state.song_idx.min(last);
                    }
                    pos.to_string()
                } else {
                    warn!(pos, len = self.state.queue.len(), "queue removal out of range");
                    REJECTED.to_string()
                }
            }
            Command::GetQueue { start, count } => slice_ids(&self.state.queue, start, count),
            Command::SetQueue(ids) => {
                let count = ids.len();
                self.state.queue = ids;
                self.state.song_idx = 0;
                self.state.unshuffled = None;
                count.to_string()
            }

            Command::GetRepeat => self.state.repeat.ordinal().to_string(),
            Command::SetRepeat(mode) => {
                self.state.repeat = mode;
                mode.ordinal().to_string()
            }
            Command::GetShuffle => self.state.shuffle.ordinal().to_string(),
            Command::SetShuffle(mode) => {
                self.set_shuffle(mode);
                mode.ordinal().to_string()
            }

            Command::GetSong => self.state.current_song.to_string(),
            Command::GetStatus => self.playback.status().ordinal().to_string(),
            Command::GetPosition => self.playback.position().to_string(),
            Command::SetPosition(percent) => {
                self.playback.set_position(percent);
                percent.to_string()
            }

            Command::Reset => {
                info!("playback state reset");
                self.playback.stop();
                self.state = PlayerState { current_song: -1, ..PlayerState::default() };
                protocol::VERSION.to_string()
            }
        }
    }

    /// The current song finished on its own. Repeat-one replays it;
    /// otherwise this is an ordinary advance.
    pub fn song_ended(&mut self) {
        if self.state.repeat == RepeatMode::One && self.state.current_song >= 0 {
            let id = self.state.current_song;
            self.play(id);
            return;
        }
        self.next();
    }

    /// Advance: the sub-queue is consumed before the main queue moves.
    fn next(&mut self) -> SongId {
        if !self.state.sub_queue.is_empty() {
            let id = self.state.sub_queue.remove(0);
            self.play(id);
            return id;
        }
        if self.state.queue.is_empty() {
            self.stop_current();
            return REJECTED;
        }
        let next = self.state.song_idx + 1;
        if next >= self.state.queue.len() {
            if self.state.repeat == RepeatMode::All {
                self.state.song_idx = 0;
            } else {
                self.stop_current();
                return REJECTED;
            }
        } else {
            self.state.song_idx = next;
        }
        let id = self.state.queue[self.state.song_idx];
        self.play(id);
        id
    }

    fn previous(&mut self) -> SongId {
        if self.state.queue.is_empty() {
            return REJECTED;
        }
        if self.state.song_idx > 0 {
            self.state.song_idx -= 1;
        } else if self.state.repeat == RepeatMode::All {
            self.state.song_idx = self.state.queue.len() - 1;
        }
        let id = self.state.queue[self.state.song_idx];
        self.play(id);
        id
    }

    fn set_shuffle(&mut self, mode: ShuffleMode) {
        if mode == self.state.shuffle {
            return;
        }
        self.state.shuffle = mode;
        match mode {
            ShuffleMode::On => {
                self.state.unshuffled = Some(self.state.queue.clone());
                let current = self.state.queue.get(self.state.song_idx).copied();
                self.state.queue.shuffle(&mut rand::thread_rng());
                // The playing song keeps its index so position-relative
                // views stay coherent.
                if let Some(id) = current {
                    if let Some(pos) = self.state.queue.iter().position(|&x| x == id) {
                        self.state.queue.swap(pos, self.state.song_idx);
                    }
                }
            }
            ShuffleMode::Off => {
                if let Some(original) = self.state.unshuffled.take() {
                    let current = self.state.queue.get(self.state.song_idx).copied();
                    self.state.queue = original;
                    if let Some(id) = current {
                        self.state.song_idx =
                            self.state.queue.iter().position(|&x| x == id).unwrap_or(0);
                    }
                }
            }
        }
    }

    fn play(&mut self, id: SongId) {
        self.playback.play(id);
        self.state.current_song = id;
    }

    fn stop_current(&mut self) {
        self.playback.stop();
        self.state.current_song = -1;
    }
}

fn slice_ids(ids: &[SongId], start: usize, count: usize) -> String {
    let start = start.min(ids.len());
    let end = start.saturating_add(count).min(ids.len());
    protocol::encode_ids(&ids[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recorder standing in for the engine.
    #[derive(Default)]
    struct FakePlayback {
        played: Vec<SongId>,
        stopped: usize,
        paused: bool,
        volume: f64,
        position: f64,
        status: PlaybackStatus,
    }

    impl FakePlayback {
        fn new() -> Self {
            Self { volume: 100.0, status: PlaybackStatus::Stopped, ..Self::default() }
        }
    }

    impl Playback for FakePlayback {
        fn play(&mut self, id: SongId) {
            self.played.push(id);
            self.status = PlaybackStatus::Playing;
        }
        fn stop(&mut self) {
            self.stopped += 1;
            self.status = PlaybackStatus::Stopped;
        }
        fn pause(&mut self) {
            self.paused = true;
            self.status = PlaybackStatus::Paused;
        }
        fn resume(&mut self) {
            self.paused = false;
            self.status = PlaybackStatus::Playing;
        }
        fn set_position(&mut self, percent: f64) {
            self.position = percent;
        }
        fn position(&self) -> f64 {
            self.position
        }
        fn volume(&self) -> f64 {
            self.volume
        }
        fn set_volume(&mut self, percent: f64) {
            self.volume = percent;
        }
        fn status(&self) -> PlaybackStatus {
            self.status
        }
    }

    fn interpreter_with_queue(ids: &[SongId]) -> Interpreter<FakePlayback> {
        let mut interp = Interpreter::new(FakePlayback::new());
        interp.handle_command(Command::SetQueue(ids.to_vec()));
        interp
    }

    #[test]
    fn test_sub_queue_consumed_before_main_queue() {
        let mut interp = interpreter_with_queue(&[1, 2, 3]);
        interp.handle_command(Command::AddToSubQueue(42));

        assert_eq!(interp.handle_command(Command::Next), "42");
        // Main queue index never moved.
        assert_eq!(interp.handle_command(Command::QueueIdx), "0");
        // Sub-queue is empty, so the next advance moves the main queue.
        assert_eq!(interp.handle_command(Command::Next), "2");
        assert_eq!(interp.handle_command(Command::QueueIdx), "1");
    }

    #[test]
    fn test_repeat_all_wraps_at_queue_end() {
        let mut interp = interpreter_with_queue(&[1, 2]);
        interp.handle_command(Command::SetRepeat(RepeatMode::All));

        assert_eq!(interp.handle_command(Command::Next), "2");
        assert_eq!(interp.handle_command(Command::Next), "1");
        assert_eq!(interp.handle_command(Command::QueueIdx), "0");
    }

    #[test]
    fn test_repeat_off_stops_at_queue_end() {
        let mut interp = interpreter_with_queue(&[1, 2]);
        interp.handle_command(Command::SetQueueIdx(1));

        assert_eq!(interp.handle_command(Command::Next), "-1");
        assert_eq!(interp.handle_command(Command::GetSong), "-1");
        assert_eq!(interp.playback.status(), PlaybackStatus::Stopped);
    }

    #[test]
    fn test_repeat_one_replays_on_song_ended() {
        let mut interp = interpreter_with_queue(&[1, 2]);
        interp.handle_command(Command::SetQueueIdx(0));
        interp.handle_command(Command::SetRepeat(RepeatMode::One));

        interp.song_ended();
        assert_eq!(interp.playback.played, vec![1, 1]);
        assert_eq!(interp.handle_command(Command::QueueIdx), "0");
    }

    #[test]
    fn test_mute_stores_and_unmute_restores_volume() {
        let mut interp = interpreter_with_queue(&[]);
        interp.handle_command(Command::SetVolume(62.5));

        assert_eq!(interp.handle_command(Command::Mute), "0");
        // A second mute does not clobber the stored volume.
        assert_eq!(interp.handle_command(Command::Mute), "0");
        assert_eq!(interp.handle_command(Command::Unmute), "62.5");
        // Unmuted already; a no-op.
        assert_eq!(interp.handle_command(Command::Unmute), "62.5");
    }

    #[test]
    fn test_set_volume_clears_mute() {
        let mut interp = interpreter_with_queue(&[]);
        interp.handle_command(Command::Mute);
        interp.handle_command(Command::SetVolume(40.0));
        // Unmute must not resurrect the pre-mute volume.
        assert_eq!(interp.handle_command(Command::Unmute), "40");
    }

    #[test]
    fn test_reset_clears_state_and_echoes_version() {
        let mut interp = interpreter_with_queue(&[1, 2, 3]);
        interp.handle_command(Command::AddToSubQueue(9));
        interp.handle_command(Command::SetQueueIdx(1));

        assert_eq!(interp.handle_command(Command::Reset), protocol::VERSION.to_string());
        assert_eq!(interp.handle_command(Command::QueueSize), "0");
        assert_eq!(interp.handle_command(Command::SubQueueSize), "0");
        assert_eq!(interp.handle_command(Command::GetSong), "-1");
        assert!(interp.playback.stopped > 0);
    }

    #[test]
    fn test_out_of_range_positions_rejected() {
        let mut interp = interpreter_with_queue(&[1, 2]);
        assert_eq!(interp.handle_command(Command::SetQueueIdx(5)), "-1");
        assert_eq!(interp.handle_command(Command::RemoveFromQueue(7)), "-1");
        assert_eq!(interp.handle_command(Command::RemoveFromSubQueue(0)), "-1");
    }

    #[test]
    fn test_remove_before_current_shifts_index() {
        let mut interp = interpreter_with_queue(&[1, 2, 3]);
        interp.handle_command(Command::SetQueueIdx(2));

        assert_eq!(interp.handle_command(Command::RemoveFromQueue(0)), "0");
        assert_eq!(interp.handle_command(Command::QueueIdx), "1");
        assert_eq!(interp.handle_command(Command::GetQueue { start: 0, count: 10 }), "2\u{1e}3");
    }

    #[test]
    fn test_shuffle_preserves_current_and_off_restores_order() {
        let ids: Vec<SongId> = (0..16).collect();
        let mut interp = interpreter_with_queue(&ids);
        interp.handle_command(Command::SetQueueIdx(5));

        interp.handle_command(Command::SetShuffle(ShuffleMode::On));
        let shuffled = interp.handle_command(Command::GetQueue { start: 5, count: 1 });
        assert_eq!(shuffled, "5");

        interp.handle_command(Command::SetShuffle(ShuffleMode::Off));
        let restored = interp.handle_command(Command::GetQueue { start: 0, count: 16 });
        assert_eq!(restored, protocol::encode_ids(&ids));
        assert_eq!(interp.handle_command(Command::QueueIdx), "5");
    }

    #[test]
    fn test_get_queue_slice_clamps_range() {
        let mut interp = interpreter_with_queue(&[1, 2, 3]);
        assert_eq!(interp.handle_command(Command::GetQueue { start: 2, count: 100 }), "3");
        assert_eq!(interp.handle_command(Command::GetQueue { start: 9, count: 5 }), "");
    }
}
