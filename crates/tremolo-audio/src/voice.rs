//! Output voice: the seam between the buffer pool and the hardware.
//!
//! [`Voice`] is what the pool programs; [`CpalVoice`] implements it over
//! a cpal output stream fed by a lock-free SPSC ring. cpal streams are
//! not `Send`, so each voice owns a dedicated thread that builds and
//! drives the stream; control crosses over on a channel, audio on the
//! ring, accounting on shared atomics.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Producer, Split};
use tracing::{debug, warn};

use crate::error::{AudioError, AudioResult};
use crate::pool::{SLOT_CAPACITY, SLOT_COUNT};

/// Granularity of [`Voice::wait_tick`].
const TICK: Duration = Duration::from_millis(5);

/// A programmed output voice for one stream format.
///
/// All methods take `&self`; implementations synchronize internally so
/// the pool can hand a voice handle to the process loop without holding
/// its own lock across a blocking wait.
pub trait Voice: Send + Sync {
    /// Start rendering.
    ///
    /// # Errors
    /// Returns an error if the underlying stream refuses to start.
    fn start(&self) -> AudioResult<()>;

    /// Stop rendering and drop anything still queued.
    ///
    /// # Errors
    /// Returns an error if the underlying stream refuses to stop.
    fn stop(&self) -> AudioResult<()>;

    /// Suspend rendering, keeping queued audio.
    ///
    /// # Errors
    /// Returns an error if the underlying stream refuses to pause.
    fn pause(&self) -> AudioResult<()>;

    /// Resume rendering after a pause.
    ///
    /// # Errors
    /// Returns an error if the underlying stream refuses to resume.
    fn resume(&self) -> AudioResult<()>;

    /// Queue one slot's worth of interleaved source PCM.
    fn submit(&self, slot: usize, pcm: &[i16]);

    /// Slots fully consumed by the hardware since the last call.
    fn released(&self) -> Vec<usize>;

    /// Per-output-channel gain factors.
    fn set_mix(&self, left: f32, right: f32);

    /// Playback volume in percent, 0-100.
    fn set_volume(&self, percent: f64);

    /// Block until roughly the next render quantum.
    fn wait_tick(&self);

    /// Total source frames consumed since this voice was created.
    fn consumed_samples(&self) -> u64;
}

/// Creates voices for a stream format. The pool goes through this seam
/// so tests can substitute a silent double.
pub trait VoiceBackend: Send {
    /// Create a voice rendering `channels`-channel PCM at `rate` Hz.
    ///
    /// # Errors
    /// Returns an error if no output device is usable for the format.
    fn create(&self, rate: u32, channels: u16) -> AudioResult<Arc<dyn Voice>>;
}

/// Convert interleaved source PCM to stereo f32 with mix factors
/// applied. Mono input is duplicated to both outputs; anything wider
/// than stereo keeps its first two channels.
pub(crate) fn interleave_stereo(pcm: &[i16], channels: u16, left: f32, right: f32) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    let scale = f32::from(i16::MAX);
    let mut out = Vec::with_capacity((pcm.len() / channels) * 2);
    for frame in pcm.chunks_exact(channels) {
        let l = f32::from(frame[0]) / scale;
        let r = f32::from(frame[channels.min(2) - 1]) / scale;
        out.push(l * left);
        out.push(r * right);
    }
    out
}

enum StreamControl {
    Start,
    Stop,
    Pause,
    Shutdown,
}

/// State shared between the submitting side, the stream thread, and the
/// render callback.
struct VoiceShared {
    /// Source frames fully rendered so far.
    consumed: AtomicU64,
    /// Frame watermark: ring contents below this cursor were flushed by
    /// a stop and must be discarded, not rendered.
    discard_below: AtomicU64,
    /// Volume as a 0-1 f32 scalar, bit-cast.
    volume_bits: AtomicU32,
    mix_left_bits: AtomicU32,
    mix_right_bits: AtomicU32,
}

impl VoiceShared {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }
}

/// Frame accounting for queued slots: a running cursor of pushed frames
/// and the cursor each queued slot ends at. A flush drops every queued
/// entry so stale end cursors can never release a slot that was refilled
/// afterwards.
pub(crate) struct SlotLedger {
    cursor: u64,
    inflight: VecDeque<(usize, u64)>,
}

impl SlotLedger {
    pub(crate) fn new() -> Self {
        Self { cursor: 0, inflight: VecDeque::new() }
    }

    pub(crate) fn record(&mut self, slot: usize, frames: u64) {
        self.cursor += frames;
        self.inflight.push_back((slot, self.cursor));
    }

    pub(crate) fn released(&mut self, consumed: u64) -> Vec<usize> {
        let mut done = Vec::new();
        while let Some(&(slot, end)) = self.inflight.front() {
            if end > consumed {
                break;
            }
            self.inflight.pop_front();
            done.push(slot);
        }
        done
    }

    /// Drop every queued entry and return the frame watermark below
    /// which ring contents are stale.
    pub(crate) fn flush(&mut self) -> u64 {
        self.inflight.clear();
        self.cursor
    }
}

/// The producer half of the ring plus the slot ledger.
struct SubmitState {
    producer: ringbuf::HeapProd<f32>,
    ledger: SlotLedger,
}

/// cpal-backed [`Voice`]. Dropping it shuts the stream thread down.
pub struct CpalVoice {
    shared: Arc<VoiceShared>,
    submit: Mutex<SubmitState>,
    control: Sender<StreamControl>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    channels: u16,
}

impl CpalVoice {
    fn new(rate: u32, channels: u16) -> AudioResult<Self> {
        if channels == 0 {
            return Err(AudioError::UnsupportedFormat("zero channels"));
        }
        let shared = Arc::new(VoiceShared {
            consumed: AtomicU64::new(0),
            discard_below: AtomicU64::new(0),
            volume_bits: AtomicU32::new(1f32.to_bits()),
            mix_left_bits: AtomicU32::new(1f32.to_bits()),
            mix_right_bits: AtomicU32::new(1f32.to_bits()),
        });

        // Stereo f32 output; capacity covers every pool slot at once.
        let ring = HeapRb::<f32>::new(SLOT_COUNT * SLOT_CAPACITY * 2);
        let (producer, consumer) = ring.split();

        let (control, control_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("tremolo-voice".into())
            .spawn(move || stream_thread(rate, consumer, thread_shared, &control_rx, &ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(AudioError::VoiceGone),
        }

        Ok(Self {
            shared,
            submit: Mutex::new(SubmitState { producer, ledger: SlotLedger::new() }),
            control,
            thread: Mutex::new(Some(handle)),
            channels,
        })
    }

    fn send(&self, control: StreamControl) -> AudioResult<()> {
        self.control.send(control).map_err(|_| AudioError::VoiceGone)
    }
}

impl Voice for CpalVoice {
    fn start(&self) -> AudioResult<()> {
        self.send(StreamControl::Start)
    }

    fn stop(&self) -> AudioResult<()> {
        // Drop anything still queued: clear the ledger and tell the
        // callback to discard every frame pushed so far, so a restart
        // never renders pre-stop PCM or releases refilled slots against
        // stale end cursors.
        {
            let mut state = self.submit.lock();
            let watermark = state.ledger.flush();
            self.shared.discard_below.store(watermark, Ordering::Release);
        }
        self.send(StreamControl::Stop)
    }

    fn pause(&self) -> AudioResult<()> {
        self.send(StreamControl::Pause)
    }

    fn resume(&self) -> AudioResult<()> {
        self.send(StreamControl::Start)
    }

    fn submit(&self, slot: usize, pcm: &[i16]) {
        let left = f32::from_bits(self.shared.mix_left_bits.load(Ordering::Relaxed));
        let right = f32::from_bits(self.shared.mix_right_bits.load(Ordering::Relaxed));
        let samples = interleave_stereo(pcm, self.channels, left, right);
        let frames = (samples.len() / 2) as u64;

        let mut state = self.submit.lock();
        let pushed = state.producer.push_slice(&samples);
        if pushed < samples.len() {
            // Cannot happen while the pool respects slot states; the
            // remainder would play as a glitch, so drop it loudly.
            warn!(slot, dropped = samples.len() - pushed, "output ring overrun");
        }
        state.ledger.record(slot, frames);
    }

    fn released(&self) -> Vec<usize> {
        let consumed = self.shared.consumed.load(Ordering::Acquire);
        self.submit.lock().ledger.released(consumed)
    }

    fn set_mix(&self, left: f32, right: f32) {
        self.shared.mix_left_bits.store(left.to_bits(), Ordering::Relaxed);
        self.shared.mix_right_bits.store(right.to_bits(), Ordering::Relaxed);
    }

    fn set_volume(&self, percent: f64) {
        let scalar = (percent.clamp(0.0, 100.0) / 100.0) as f32;
        self.shared.volume_bits.store(scalar.to_bits(), Ordering::Relaxed);
    }

    fn wait_tick(&self) {
        thread::sleep(TICK);
    }

    fn consumed_samples(&self) -> u64 {
        self.shared.consumed.load(Ordering::Acquire)
    }
}

impl Drop for CpalVoice {
    fn drop(&mut self) {
        let _ = self.control.send(StreamControl::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Owns the cpal stream for one voice's lifetime.
fn stream_thread(
    rate: u32,
    consumer: ringbuf::HeapCons<f32>,
    shared: Arc<VoiceShared>,
    control: &Receiver<StreamControl>,
    ready: &Sender<AudioResult<()>>,
) {
    let stream = match build_stream(rate, consumer, &shared) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Ok(message) = control.recv() {
        let result = match message {
            StreamControl::Start => stream.play().map_err(AudioError::from),
            StreamControl::Pause | StreamControl::Stop => {
                stream.pause().map_err(AudioError::from)
            }
            StreamControl::Shutdown => break,
        };
        if let Err(e) = result {
            warn!(error = %e, "output stream control failed");
        }
    }
    debug!("voice stream thread exiting");
}

fn build_stream(
    rate: u32,
    mut consumer: ringbuf::HeapCons<f32>,
    shared: &Arc<VoiceShared>,
) -> AudioResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoOutputDevice)?;
    let config = cpal::StreamConfig {
        channels: 2,
        sample_rate: cpal::SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let callback_shared = Arc::clone(shared);

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            // Frames below the discard watermark were flushed by a stop;
            // eat them out of the ring instead of rendering them.
            let discard = callback_shared.discard_below.load(Ordering::Acquire);
            let consumed = callback_shared.consumed.load(Ordering::Acquire);
            if consumed < discard {
                let stale = ((discard - consumed) as usize) * 2;
                let skipped = consumer.skip(stale);
                callback_shared.consumed.fetch_add((skipped / 2) as u64, Ordering::AcqRel);
            }
            let volume = callback_shared.volume();
            let popped = consumer.pop_slice(data);
            for sample in &mut data[..popped] {
                *sample *= volume;
            }
            // Underrun renders silence rather than stale samples.
            for sample in &mut data[popped..] {
                *sample = 0.0;
            }
            callback_shared.consumed.fetch_add((popped / 2) as u64, Ordering::AcqRel);
        },
        |err| warn!(error = %err, "output stream error"),
        None,
    )?;
    Ok(stream)
}

/// Default backend creating [`CpalVoice`]s.
pub struct CpalBackend;

impl VoiceBackend for CpalBackend {
    fn create(&self, rate: u32, channels: u16) -> AudioResult<Arc<dyn Voice>> {
        Ok(Arc::new(CpalVoice::new(rate, channels)?))
    }
}
