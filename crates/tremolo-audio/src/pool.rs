//! Fixed ring of pre-allocated PCM slots between decoder and voice.
//!
//! The decoder writes into the slot at the ring index only when that
//! slot is `Done`; the voice marks slots `Done` again as the hardware
//! drains them. The ring index advances mod [`SLOT_COUNT`] on every
//! accepted buffer, so the producer is never more than the pool depth
//! ahead of playback.

use std::sync::Arc;

use tracing::{debug, warn};

use tremolo_core::PlaybackStatus;

use crate::error::{AudioError, AudioResult};
use crate::voice::{Voice, VoiceBackend};

/// Number of slots in the ring.
pub const SLOT_COUNT: usize = 4;

/// Capacity of one slot, in interleaved i16 samples.
pub const SLOT_CAPACITY: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Drained by the voice; free for the decoder.
    Done,
    /// Submitted and not yet drained.
    Queued,
}

/// Owns the slot ring, the active voice, and the playback status.
///
/// Shared as `Arc<parking_lot::Mutex<BufferPool>>` between the decode
/// worker, the process loop, and the command interpreter.
pub struct BufferPool {
    backend: Box<dyn VoiceBackend>,
    voice: Option<Arc<dyn Voice>>,
    slots: [SlotState; SLOT_COUNT],
    write_idx: usize,
    channels: u16,
    status: PlaybackStatus,
    /// Frames played on voices that have already been dropped.
    samples_base: u64,
    volume: f64,
    volume_dirty: bool,
    mix: (f32, f32),
    mix_dirty: bool,
}

impl BufferPool {
    #[must_use]
    pub fn new(backend: Box<dyn VoiceBackend>) -> Self {
        Self {
            backend,
            voice: None,
            slots: [SlotState::Done; SLOT_COUNT],
            write_idx: 0,
            channels: 2,
            status: PlaybackStatus::Stopped,
            samples_base: 0,
            volume: 100.0,
            volume_dirty: false,
            mix: (1.0, 1.0),
            mix_dirty: false,
        }
    }

    /// Whether the slot about to be reused is free.
    #[must_use]
    pub fn buffer_available(&self) -> bool {
        self.slots[self.write_idx] == SlotState::Done
    }

    /// Submit one decoded block. Returns `false` without touching the
    /// ring when the block exceeds slot capacity or the target slot is
    /// still queued.
    pub fn add_buffer(&mut self, pcm: &[i16]) -> bool {
        if pcm.len() > SLOT_CAPACITY {
            warn!(samples = pcm.len(), "block exceeds slot capacity; rejected");
            return false;
        }
        if self.slots[self.write_idx] != SlotState::Done {
            return false;
        }
        let Some(voice) = &self.voice else {
            return false;
        };

        voice.submit(self.write_idx, pcm);
        self.slots[self.write_idx] = SlotState::Queued;
        self.write_idx = (self.write_idx + 1) % SLOT_COUNT;

        if self.status == PlaybackStatus::Stopped {
            if let Err(e) = voice.start() {
                warn!(error = %e, "voice failed to start");
                self.status = PlaybackStatus::Error;
                return true;
            }
            self.status = PlaybackStatus::Playing;
        }
        true
    }

    /// Tear down the current voice and program a new one for the next
    /// song's stream format. Frames played so far are folded into the
    /// running total before the old voice goes away.
    ///
    /// # Errors
    /// Returns an error if the backend cannot produce a voice for the
    /// format; the old voice is released either way.
    pub fn new_song(&mut self, rate: u32, channels: u16) -> AudioResult<()> {
        if let Some(voice) = self.voice.take() {
            self.samples_base += voice.consumed_samples();
            if let Err(e) = voice.stop() {
                debug!(error = %e, "stopping outgoing voice failed");
            }
        }
        self.slots = [SlotState::Done; SLOT_COUNT];
        self.write_idx = 0;
        self.status = PlaybackStatus::Stopped;
        self.channels = channels;

        let voice = self.backend.create(rate, channels)?;
        // Mono sources duplicate to both outputs; stereo maps 1:1.
        self.mix = (1.0, 1.0);
        voice.set_mix(self.mix.0, self.mix.1);
        voice.set_volume(self.volume);
        self.voice = Some(voice);
        debug!(rate, channels, "voice programmed for new song");
        Ok(())
    }

    /// Stop playback and free every slot.
    pub fn stop(&mut self) {
        if let Some(voice) = &self.voice {
            if let Err(e) = voice.stop() {
                debug!(error = %e, "voice stop failed");
            }
        }
        self.slots = [SlotState::Done; SLOT_COUNT];
        self.write_idx = 0;
        self.status = PlaybackStatus::Stopped;
    }

    /// # Errors
    /// Returns [`AudioError::NoVoice`] when nothing is programmed.
    pub fn pause(&mut self) -> AudioResult<()> {
        let voice = self.voice.as_ref().ok_or(AudioError::NoVoice)?;
        voice.pause()?;
        self.status = PlaybackStatus::Paused;
        Ok(())
    }

    /// # Errors
    /// Returns [`AudioError::NoVoice`] when nothing is programmed.
    pub fn resume(&mut self) -> AudioResult<()> {
        let voice = self.voice.as_ref().ok_or(AudioError::NoVoice)?;
        voice.resume()?;
        self.status = PlaybackStatus::Playing;
        Ok(())
    }

    /// Reclaim slots the voice reports drained; transition to Stopped
    /// once everything queued has played out.
    pub fn reclaim(&mut self) {
        let Some(voice) = &self.voice else { return };
        for slot in voice.released() {
            if slot < SLOT_COUNT {
                self.slots[slot] = SlotState::Done;
            }
        }
        if self.status == PlaybackStatus::Playing
            && self.slots.iter().all(|s| *s == SlotState::Done)
        {
            debug!("all slots drained; playback stopped");
            self.stop();
        }
    }

    /// Push any pending volume/mix change to the voice. Called from the
    /// process loop so the interpreter never blocks on the voice.
    pub fn flush_updates(&mut self) {
        let Some(voice) = &self.voice else { return };
        if self.volume_dirty {
            voice.set_volume(self.volume);
            self.volume_dirty = false;
        }
        if self.mix_dirty {
            voice.set_mix(self.mix.0, self.mix.1);
            self.mix_dirty = false;
        }
    }

    /// Handle for waiting on the voice outside the pool lock.
    #[must_use]
    pub fn voice_handle(&self) -> Option<Arc<dyn Voice>> {
        self.voice.clone()
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    /// Source frames played across the life of the pool, including
    /// voices already torn down.
    #[must_use]
    pub fn samples_played(&self) -> u64 {
        let live = self.voice.as_ref().map_or(0, |v| v.consumed_samples());
        self.samples_base + live
    }

    /// Rebase the played-frame counter, e.g. after a seek.
    pub fn set_samples_played(&mut self, frames: u64) {
        let live = self.voice.as_ref().map_or(0, |v| v.consumed_samples());
        self.samples_base = frames.saturating_sub(live);
    }

    #[must_use]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn set_volume(&mut self, percent: f64) {
        self.volume = percent.clamp(0.0, 100.0);
        self.volume_dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Silent test double: everything is recorded, nothing plays.
    pub(crate) struct TestVoice {
        pub started: AtomicBool,
        pub stopped: AtomicBool,
        pub consumed: AtomicU64,
        pub submitted: Mutex<Vec<(usize, usize)>>,
        pub releasable: Mutex<Vec<usize>>,
        pub mix: Mutex<(f32, f32)>,
    }

    impl TestVoice {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                consumed: AtomicU64::new(0),
                submitted: Mutex::new(Vec::new()),
                releasable: Mutex::new(Vec::new()),
                mix: Mutex::new((1.0, 1.0)),
            })
        }
    }

    impl Voice for TestVoice {
        fn start(&self) -> AudioResult<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) -> AudioResult<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn pause(&self) -> AudioResult<()> {
            Ok(())
        }
        fn resume(&self) -> AudioResult<()> {
            Ok(())
        }
        fn submit(&self, slot: usize, pcm: &[i16]) {
            self.submitted.lock().push((slot, pcm.len()));
        }
        fn released(&self) -> Vec<usize> {
            std::mem::take(&mut *self.releasable.lock())
        }
        fn set_mix(&self, left: f32, right: f32) {
            *self.mix.lock() = (left, right);
        }
        fn set_volume(&self, _percent: f64) {}
        fn wait_tick(&self) {}
        fn consumed_samples(&self) -> u64 {
            self.consumed.load(Ordering::SeqCst)
        }
    }

    /// Backend handing out clones of one shared [`TestVoice`].
    pub(crate) struct TestBackend {
        pub voice: Arc<TestVoice>,
    }

    impl VoiceBackend for TestBackend {
        fn create(&self, _rate: u32, _channels: u16) -> AudioResult<Arc<dyn Voice>> {
            Ok(Arc::clone(&self.voice) as Arc<dyn Voice>)
        }
    }

    fn pool_with_voice() -> (BufferPool, Arc<TestVoice>) {
        let voice = TestVoice::new();
        let mut pool = BufferPool::new(Box::new(TestBackend { voice: Arc::clone(&voice) }));
        pool.new_song(44_100, 2).unwrap();
        (pool, voice)
    }

    #[test]
    fn test_first_buffer_starts_stopped_voice() {
        let (mut pool, voice) = pool_with_voice();
        assert_eq!(pool.status(), PlaybackStatus::Stopped);

        assert!(pool.add_buffer(&[0; 512]));
        assert_eq!(pool.status(), PlaybackStatus::Playing);
        assert!(voice.started.load(Ordering::SeqCst));
    }

    #[test]
    fn test_all_slots_queued_rejects_buffer() {
        let (mut pool, voice) = pool_with_voice();
        for _ in 0..SLOT_COUNT {
            assert!(pool.add_buffer(&[0; 512]));
        }
        assert!(!pool.buffer_available());

        // Ring full: the fifth block is a no-op.
        assert!(!pool.add_buffer(&[0; 512]));
        assert_eq!(voice.submitted.lock().len(), SLOT_COUNT);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let (mut pool, voice) = pool_with_voice();
        assert!(!pool.add_buffer(&vec![0; SLOT_CAPACITY + 1]));
        assert!(voice.submitted.lock().is_empty());
        assert!(pool.buffer_available());
    }

    #[test]
    fn test_reclaim_frees_slots_in_ring_order() {
        let (mut pool, voice) = pool_with_voice();
        for _ in 0..SLOT_COUNT {
            assert!(pool.add_buffer(&[0; 512]));
        }
        voice.releasable.lock().push(0);
        pool.reclaim();

        // Slot 0 freed; the write head is back on it.
        assert!(pool.buffer_available());
        assert!(pool.add_buffer(&[0; 512]));
    }

    #[test]
    fn test_drained_ring_stops_playback() {
        let (mut pool, voice) = pool_with_voice();
        assert!(pool.add_buffer(&[0; 512]));

        voice.releasable.lock().push(0);
        pool.reclaim();
        assert_eq!(pool.status(), PlaybackStatus::Stopped);
        assert!(voice.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_new_song_accumulates_samples_and_resets_ring() {
        let (mut pool, voice) = pool_with_voice();
        for _ in 0..SLOT_COUNT {
            assert!(pool.add_buffer(&[0; 512]));
        }
        voice.consumed.store(1234, Ordering::SeqCst);

        pool.new_song(48_000, 1).unwrap();
        // The backend hands the same double back; zero its counter so
        // only the folded-in total remains.
        voice.consumed.store(0, Ordering::SeqCst);
        assert_eq!(pool.samples_played(), 1234);
        assert!(pool.buffer_available());
        assert_eq!(pool.status(), PlaybackStatus::Stopped);
    }

    #[test]
    fn test_volume_flushed_by_process_loop() {
        let (mut pool, _voice) = pool_with_voice();
        pool.set_volume(250.0);
        assert!((pool.volume() - 100.0).abs() < f64::EPSILON);
        pool.flush_updates();
        assert!(!pool.volume_dirty);
    }
}
