//! Client-side controller: command queue plus a cached mirror of the
//! daemon's playback state.
//!
//! The UI never touches the socket. It reads cached fields without
//! blocking and enqueues fire-and-forget requests; a single run-loop
//! task drains the queue one request at a time, applies each reply to
//! the cache, and refreshes the volatile fields every 100 ms. Any I/O
//! failure turns into a sticky error: nothing is retried, everything
//! still queued is discarded, and only an explicit [`PlayerClient::reconnect`]
//! restores service.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tremolo_core::{PlaybackStatus, RepeatMode, ShuffleMode, SongId};

use crate::error::IpcError;
use crate::protocol::{self, Command, FULL_RANGE, REPLY_TIMEOUT};
use crate::transfer::{Connector, Transfer};

/// How often the volatile cached fields are refreshed.
const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Idle tick of the run loop, and the retry sleep while in error.
const IDLE_TICK: Duration = Duration::from_millis(10);
const ERROR_RETRY: Duration = Duration::from_millis(100);

/// Poll interval of the blocking `wait_*` variants.
const WAIT_POLL: Duration = Duration::from_millis(5);

/// Sentinel returned by the `wait_*` variants when the client is in
/// error.
pub const WAIT_FAILED: i64 = -1;

/// Kinds of sticky client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The daemon could not be reached.
    NotConnected,
    /// The daemon speaks a different protocol version.
    DifferentVersion,
    /// The channel failed mid-use.
    Unknown,
}

/// Connection state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error(ErrorKind),
}

/// Completion flag for the blocking `wait_*` variants. The run loop
/// sets the value and then the flag; waiters poll the flag.
struct WaitCell {
    done: AtomicBool,
    value: AtomicI64,
}

impl WaitCell {
    fn new() -> Self {
        Self { done: AtomicBool::new(false), value: AtomicI64::new(WAIT_FAILED) }
    }

    fn complete(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// One queued request. The completion callback of the source becomes a
/// tagged value: the run loop matches on the command to decode the
/// reply, so no closure and no lock is ever held across the cache
/// application.
struct PendingRequest {
    command: Command,
    waiter: Option<Arc<WaitCell>>,
}

/// Locally cached mirror of the daemon's playback state. Written only
/// by the run loop; read from any thread.
struct CachedState {
    current_song: AtomicI64,
    position_bits: AtomicU64,
    volume_bits: AtomicU64,
    queue: ArcSwap<Vec<SongId>>,
    sub_queue: ArcSwap<Vec<SongId>>,
    queue_size: AtomicI64,
    sub_queue_size: AtomicI64,
    song_idx: AtomicI64,
    repeat: AtomicI64,
    shuffle: AtomicI64,
    status: AtomicI64,
    playing_from: Mutex<String>,
    queue_dirty: AtomicBool,
    sub_queue_dirty: AtomicBool,
}

impl CachedState {
    fn new() -> Self {
        Self {
            current_song: AtomicI64::new(-1),
            position_bits: AtomicU64::new(0f64.to_bits()),
            volume_bits: AtomicU64::new(100f64.to_bits()),
            queue: ArcSwap::from_pointee(Vec::new()),
            sub_queue: ArcSwap::from_pointee(Vec::new()),
            queue_size: AtomicI64::new(0),
            sub_queue_size: AtomicI64::new(0),
            song_idx: AtomicI64::new(0),
            repeat: AtomicI64::new(RepeatMode::Off.ordinal()),
            shuffle: AtomicI64::new(ShuffleMode::Off.ordinal()),
            status: AtomicI64::new(PlaybackStatus::Stopped.ordinal()),
            playing_from: Mutex::new(String::new()),
            queue_dirty: AtomicBool::new(false),
            sub_queue_dirty: AtomicBool::new(false),
        }
    }

    /// Replace the queue vector wholesale; never patched in place.
    fn store_queue(&self, ids: Vec<SongId>) {
        if **self.queue.load() != ids {
            self.queue_dirty.store(true, Ordering::Release);
        }
        self.queue_size.store(ids.len() as i64, Ordering::Relaxed);
        self.queue.store(Arc::new(ids));
    }

    fn store_sub_queue(&self, ids: Vec<SongId>) {
        if **self.sub_queue.load() != ids {
            self.sub_queue_dirty.store(true, Ordering::Release);
        }
        self.sub_queue_size.store(ids.len() as i64, Ordering::Relaxed);
        self.sub_queue.store(Arc::new(ids));
    }

    fn reset(&self) {
        self.current_song.store(-1, Ordering::Relaxed);
        self.position_bits.store(0f64.to_bits(), Ordering::Relaxed);
        self.song_idx.store(0, Ordering::Relaxed);
        self.status.store(PlaybackStatus::Stopped.ordinal(), Ordering::Relaxed);
        self.store_queue(Vec::new());
        self.store_sub_queue(Vec::new());
        self.playing_from.lock().clear();
    }
}

struct Shared {
    cache: CachedState,
    write_queue: Mutex<VecDeque<PendingRequest>>,
    state: RwLock<ConnectionState>,
    exit: AtomicBool,
    transfer: tokio::sync::Mutex<Option<Transfer>>,
    port: u16,
}

/// Handle to the controller. Cheap getters mirror the remote state;
/// `send_*` mutators are fire-and-forget.
pub struct PlayerClient {
    shared: Arc<Shared>,
    run_loop: tokio::task::JoinHandle<()>,
}

impl PlayerClient {
    /// Create a controller, attempt the initial connection and version
    /// handshake, and start the run loop. Inspect
    /// [`PlayerClient::error_kind`] to see whether the connection
    /// succeeded.
    pub async fn connect() -> Self {
        Self::connect_to(protocol::PORT).await
    }

    /// As [`PlayerClient::connect`], against a specific loopback port.
    pub async fn connect_to(port: u16) -> Self {
        let shared = Arc::new(Shared {
            cache: CachedState::new(),
            write_queue: Mutex::new(VecDeque::new()),
            state: RwLock::new(ConnectionState::Disconnected),
            exit: AtomicBool::new(false),
            transfer: tokio::sync::Mutex::new(None),
            port,
        });
        let run_loop = tokio::spawn(run_loop(Arc::clone(&shared)));
        let client = Self { shared, run_loop };
        let _ = client.reconnect().await;
        client
    }

    // ---- connection ----------------------------------------------------

    /// Whether the controller is in a sticky error state.
    #[must_use]
    pub fn error(&self) -> bool {
        matches!(*self.shared.state.read(), ConnectionState::Error(_))
    }

    /// The sticky error kind, if any.
    #[must_use]
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match *self.shared.state.read() {
            ConnectionState::Error(kind) => Some(kind),
            _ => None,
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Tear down any existing channel, open a fresh one and exchange
    /// versions. This is the only transition out of error. Nothing
    /// pending is replayed; whatever was queued is lost.
    pub async fn reconnect(&self) -> bool {
        let shared = &self.shared;
        let mut guard = shared.transfer.lock().await;
        *guard = None;
        shared.write_queue.lock().clear();

        let mut transfer = match Connector::connect_to(shared.port).await {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!(error = %e, "connect failed");
                *shared.state.write() = ConnectionState::Error(ErrorKind::NotConnected);
                return false;
            }
        };

        match handshake(&mut transfer).await {
            Ok(()) => {
                *guard = Some(transfer);
                *shared.state.write() = ConnectionState::Connected;
                info!(version = protocol::VERSION, "connected to playback daemon");
                true
            }
            Err(e @ IpcError::VersionMismatch { .. }) => {
                warn!(error = %e, "daemon protocol version mismatch");
                *shared.state.write() = ConnectionState::Error(ErrorKind::DifferentVersion);
                false
            }
            Err(e) => {
                warn!(error = %e, "version handshake failed");
                *shared.state.write() = ConnectionState::Error(ErrorKind::Unknown);
                false
            }
        }
    }

    /// Stop the run loop. Pending requests are dropped.
    pub fn shutdown(&self) {
        self.shared.exit.store(true, Ordering::Release);
    }

    // ---- cached state getters (non-blocking, any thread) ---------------

    #[must_use]
    pub fn current_song(&self) -> SongId {
        self.shared.cache.current_song.load(Ordering::Relaxed)
    }

    /// Playback position in percent, 0-100.
    #[must_use]
    pub fn position(&self) -> f64 {
        f64::from_bits(self.shared.cache.position_bits.load(Ordering::Relaxed))
    }

    /// Volume in percent, 0-100.
    #[must_use]
    pub fn volume(&self) -> f64 {
        f64::from_bits(self.shared.cache.volume_bits.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn queue(&self) -> Arc<Vec<SongId>> {
        self.shared.cache.queue.load_full()
    }

    #[must_use]
    pub fn sub_queue(&self) -> Arc<Vec<SongId>> {
        self.shared.cache.sub_queue.load_full()
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        usize::try_from(self.shared.cache.queue_size.load(Ordering::Relaxed)).unwrap_or(0)
    }

    #[must_use]
    pub fn sub_queue_size(&self) -> usize {
        usize::try_from(self.shared.cache.sub_queue_size.load(Ordering::Relaxed)).unwrap_or(0)
    }

    #[must_use]
    pub fn song_idx(&self) -> usize {
        usize::try_from(self.shared.cache.song_idx.load(Ordering::Relaxed)).unwrap_or(0)
    }

    #[must_use]
    pub fn repeat_mode(&self) -> RepeatMode {
        RepeatMode::from_ordinal(self.shared.cache.repeat.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn shuffle_mode(&self) -> ShuffleMode {
        ShuffleMode::from_ordinal(self.shared.cache.shuffle.load(Ordering::Relaxed))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus::from_ordinal(self.shared.cache.status.load(Ordering::Relaxed))
            .unwrap_or(PlaybackStatus::Error)
    }

    /// Label of the view playback was started from. Maintained locally
    /// by the UI, it never crosses the wire.
    #[must_use]
    pub fn playing_from(&self) -> String {
        self.shared.cache.playing_from.lock().clone()
    }

    pub fn set_playing_from(&self, label: &str) {
        *self.shared.cache.playing_from.lock() = label.to_owned();
    }

    /// True exactly once per actual queue change, then false until the
    /// next change.
    #[must_use]
    pub fn queue_changed(&self) -> bool {
        self.shared.cache.queue_dirty.swap(false, Ordering::AcqRel)
    }

    /// As [`PlayerClient::queue_changed`], for the sub-queue.
    #[must_use]
    pub fn sub_queue_changed(&self) -> bool {
        self.shared.cache.sub_queue_dirty.swap(false, Ordering::AcqRel)
    }

    // ---- fire-and-forget mutators --------------------------------------

    pub fn send_resume(&self) {
        self.enqueue(Command::Resume, None);
    }

    pub fn send_pause(&self) {
        self.enqueue(Command::Pause, None);
    }

    pub fn send_previous(&self) {
        self.enqueue(Command::Previous, None);
    }

    pub fn send_next(&self) {
        self.enqueue(Command::Next, None);
    }

    pub fn send_set_volume(&self, volume: f64) {
        self.enqueue(Command::SetVolume(volume.clamp(0.0, 100.0)), None);
    }

    pub fn send_mute(&self) {
        self.enqueue(Command::Mute, None);
    }

    pub fn send_unmute(&self) {
        self.enqueue(Command::Unmute, None);
    }

    pub fn send_set_position(&self, percent: f64) {
        self.enqueue(Command::SetPosition(percent.clamp(0.0, 100.0)), None);
    }

    pub fn send_set_queue(&self, ids: Vec<SongId>) {
        self.enqueue(Command::SetQueue(ids), None);
    }

    pub fn send_set_queue_idx(&self, idx: usize) {
        self.enqueue(Command::SetQueueIdx(idx), None);
    }

    pub fn send_remove_from_queue(&self, pos: usize) {
        self.enqueue(Command::RemoveFromQueue(pos), None);
    }

    pub fn send_get_queue(&self, start: usize, count: usize) {
        self.enqueue(Command::GetQueue { start, count }, None);
    }

    pub fn send_add_to_sub_queue(&self, id: SongId) {
        self.enqueue(Command::AddToSubQueue(id), None);
    }

    pub fn send_remove_from_sub_queue(&self, pos: usize) {
        self.enqueue(Command::RemoveFromSubQueue(pos), None);
    }

    pub fn send_skip_sub_queue_songs(&self, count: usize) {
        self.enqueue(Command::SkipSubQueueSongs(count), None);
    }

    pub fn send_get_sub_queue(&self, start: usize, count: usize) {
        self.enqueue(Command::GetSubQueue { start, count }, None);
    }

    pub fn send_set_repeat(&self, mode: RepeatMode) {
        self.enqueue(Command::SetRepeat(mode), None);
    }

    pub fn send_set_shuffle(&self, mode: ShuffleMode) {
        self.enqueue(Command::SetShuffle(mode), None);
    }

    // ---- blocking variants ---------------------------------------------

    /// Fetch the remote queue index, waiting for the reply. Returns
    /// [`WAIT_FAILED`] immediately if the client is (or becomes) errored.
    pub async fn wait_song_idx(&self) -> i64 {
        self.wait_for(Command::QueueIdx).await
    }

    /// Ask the daemon to reset playback state, waiting for the protocol
    /// version it replies with. Returns [`WAIT_FAILED`] on error.
    pub async fn wait_reset(&self) -> i64 {
        self.wait_for(Command::Reset).await
    }

    async fn wait_for(&self, command: Command) -> i64 {
        let cell = Arc::new(WaitCell::new());
        if !self.enqueue(command, Some(Arc::clone(&cell))) {
            return WAIT_FAILED;
        }
        loop {
            if cell.is_done() {
                return cell.value();
            }
            if self.error() {
                return WAIT_FAILED;
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    // ---- internals -----------------------------------------------------

    /// Append a request. A no-op while in error: commands are rejected
    /// outright rather than buffered.
    fn enqueue(&self, command: Command, waiter: Option<Arc<WaitCell>>) -> bool {
        enqueue(&self.shared, command, waiter)
    }
}

impl Drop for PlayerClient {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::Release);
        self.run_loop.abort();
    }
}

fn enqueue(shared: &Shared, command: Command, waiter: Option<Arc<WaitCell>>) -> bool {
    if matches!(*shared.state.read(), ConnectionState::Error(_)) {
        debug!(?command, "rejecting request while in error state");
        return false;
    }
    shared.write_queue.lock().push_back(PendingRequest { command, waiter });
    true
}

async fn handshake(transfer: &mut Transfer) -> Result<(), IpcError> {
    transfer.write_message(&Command::Version.encode()).await?;
    let reply = transfer.read_message_timeout(REPLY_TIMEOUT).await?;
    let version = protocol::parse_int(&reply)
        .ok_or_else(|| IpcError::Malformed(format!("bad version reply {reply:?}")))?;
    if version != protocol::VERSION {
        return Err(IpcError::VersionMismatch { expected: protocol::VERSION, actual: version });
    }
    Ok(())
}

/// The controller run loop: the only place that performs socket I/O on
/// behalf of the UI.
async fn run_loop(shared: Arc<Shared>) {
    let mut last_refresh = Instant::now();

    while !shared.exit.load(Ordering::Acquire) {
        if matches!(*shared.state.read(), ConnectionState::Error(_)) {
            tokio::time::sleep(ERROR_RETRY).await;
            continue;
        }

        // Drain the FIFO one request at a time; exactly one in flight.
        loop {
            let Some(entry) = shared.write_queue.lock().pop_front() else { break };
            match perform(&shared, &entry).await {
                Ok(()) => {}
                Err(e) => {
                    let kind = match e {
                        IpcError::NotConnected => ErrorKind::NotConnected,
                        _ => ErrorKind::Unknown,
                    };
                    warn!(error = %e, "request failed; entering error state");
                    *shared.state.write() = ConnectionState::Error(kind);
                    // Everything still queued is dropped without
                    // completing its waiter.
                    let dropped = {
                        let mut queue = shared.write_queue.lock();
                        let len = queue.len();
                        queue.clear();
                        len
                    };
                    if dropped > 0 {
                        debug!(dropped, "discarded pending requests");
                    }
                    break;
                }
            }
        }

        if matches!(*shared.state.read(), ConnectionState::Connected)
            && last_refresh.elapsed() >= REFRESH_INTERVAL
        {
            // The sole mechanism keeping the cache live absent explicit
            // UI action.
            for command in [
                Command::GetPosition,
                Command::QueueSize,
                Command::SubQueueSize,
                Command::GetRepeat,
                Command::GetShuffle,
                Command::GetSong,
                Command::QueueIdx,
                Command::GetStatus,
                Command::GetVolume,
            ] {
                enqueue(&shared, command, None);
            }
            last_refresh = Instant::now();
        }

        tokio::time::sleep(IDLE_TICK).await;
    }
}

/// Write one request, read its reply, apply it to the cache. The
/// transfer lock is released before the cache application runs.
async fn perform(shared: &Arc<Shared>, entry: &PendingRequest) -> Result<(), IpcError> {
    let reply = {
        let mut guard = shared.transfer.lock().await;
        let transfer = guard.as_mut().ok_or(IpcError::NotConnected)?;
        transfer.write_message(&entry.command.encode()).await?;
        transfer.read_message_timeout(REPLY_TIMEOUT).await?
    };
    apply_reply(shared, entry, &reply);
    Ok(())
}

/// Decode the reply according to the request's tag and fold it into the
/// cached state.
#[allow(clippy::too_many_lines)]
fn apply_reply(shared: &Arc<Shared>, entry: &PendingRequest, reply: &str) {
    let cache = &shared.cache;
    let as_int = protocol::parse_int(reply);
    let as_double = protocol::parse_double(reply);

    match &entry.command {
        Command::Version | Command::Reset => {
            // Version is normally exchanged during reconnect; Reset
            // echoes the version and clears local playback state.
            if matches!(entry.command, Command::Reset) {
                cache.reset();
            }
        }
        Command::Resume | Command::Pause | Command::Previous | Command::Next => {
            if let Some(id) = as_int {
                cache.current_song.store(id, Ordering::Relaxed);
            }
        }
        Command::GetVolume | Command::SetVolume(_) | Command::Mute | Command::Unmute => {
            if let Some(volume) = as_double {
                cache.volume_bits.store(volume.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
            }
        }
        Command::GetPosition | Command::SetPosition(_) => {
            if let Some(position) = as_double {
                cache.position_bits.store(position.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
            }
        }
        Command::GetSong => {
            if let Some(id) = as_int {
                cache.current_song.store(id, Ordering::Relaxed);
            }
        }
        Command::QueueIdx | Command::SetQueueIdx(_) => {
            if let Some(idx) = as_int {
                cache.song_idx.store(idx, Ordering::Relaxed);
            }
        }
        Command::QueueSize => {
            if let Some(size) = as_int {
                cache.queue_size.store(size, Ordering::Relaxed);
            }
        }
        Command::SubQueueSize => {
            if let Some(size) = as_int {
                cache.sub_queue_size.store(size, Ordering::Relaxed);
            }
        }
        Command::GetRepeat | Command::SetRepeat(_) => {
            if let Some(ordinal) = as_int {
                cache.repeat.store(ordinal, Ordering::Relaxed);
            }
        }
        Command::GetShuffle | Command::SetShuffle(_) => {
            if let Some(ordinal) = as_int {
                cache.shuffle.store(ordinal, Ordering::Relaxed);
            }
            if matches!(entry.command, Command::SetShuffle(_)) {
                // The daemon re-derives the play order; pull the whole
                // queue rather than guessing at it.
                enqueue(shared, Command::GetQueue { start: 0, count: FULL_RANGE }, None);
            }
        }
        Command::GetStatus => {
            let status = as_int
                .and_then(|o| PlaybackStatus::from_ordinal(o).ok())
                .unwrap_or(PlaybackStatus::Error);
            cache.status.store(status.ordinal(), Ordering::Relaxed);
        }
        Command::GetQueue { .. } => {
            cache.store_queue(protocol::decode_ids(reply));
        }
        Command::GetSubQueue { .. } => {
            cache.store_sub_queue(protocol::decode_ids(reply));
        }
        Command::SetQueue(ids) => {
            if as_int == Some(ids.len() as i64) {
                cache.store_queue(ids.clone());
            } else {
                resync_queue(shared, "SetQueue count mismatch");
            }
        }
        Command::RemoveFromQueue(pos) => {
            if as_int == Some(*pos as i64) {
                let mut ids = (**cache.queue.load()).clone();
                if *pos < ids.len() {
                    ids.remove(*pos);
                }
                cache.store_queue(ids);
            } else {
                resync_queue(shared, "RemoveFromQueue echo mismatch");
            }
        }
        Command::AddToSubQueue(id) => {
            if as_int == Some(*id) {
                let mut ids = (**cache.sub_queue.load()).clone();
                ids.push(*id);
                cache.store_sub_queue(ids);
            } else {
                resync_queue(shared, "AddToSubQueue echo mismatch");
            }
        }
        Command::RemoveFromSubQueue(pos) => {
            if as_int == Some(*pos as i64) {
                let mut ids = (**cache.sub_queue.load()).clone();
                if *pos < ids.len() {
                    ids.remove(*pos);
                }
                cache.store_sub_queue(ids);
            } else {
                resync_queue(shared, "RemoveFromSubQueue echo mismatch");
            }
        }
        Command::SkipSubQueueSongs(count) => {
            let mut ids = (**cache.sub_queue.load()).clone();
            ids.drain(..(*count).min(ids.len()));
            cache.store_sub_queue(ids);
        }
    }

    if let Some(waiter) = &entry.waiter {
        waiter.complete(as_int.unwrap_or(WAIT_FAILED));
    }
}

/// Echoed reply disagreed with what was sent: discard the local copy
/// and pull everything, favouring consistency over latency.
fn resync_queue(shared: &Arc<Shared>, reason: &str) {
    warn!(reason, "cache out of sync; requesting full queue");
    enqueue(shared, Command::GetQueue { start: 0, count: FULL_RANGE }, None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;

    use crate::transfer::FrameCodec;

    /// Canned daemon replies: enough of the real command table for the
    /// controller to run against.
    fn canned_reply(command: &Command) -> String {
        match command {
            Command::Version | Command::Reset => protocol::VERSION.to_string(),
            Command::Resume | Command::Pause | Command::Previous | Command::Next => "2".into(),
            Command::GetStatus => "2".into(),
            Command::GetVolume => "50".into(),
            Command::SetVolume(v) => v.to_string(),
            Command::Mute => "0".into(),
            Command::Unmute => "50".into(),
            Command::GetPosition => "42.5".into(),
            Command::SetPosition(v) => v.to_string(),
            Command::GetSong => "2".into(),
            Command::QueueIdx => "1".into(),
            Command::SetQueueIdx(n) => n.to_string(),
            Command::QueueSize => "3".into(),
            Command::SubQueueSize => "0".into(),
            Command::GetRepeat | Command::GetShuffle => "0".into(),
            Command::SetRepeat(m) => m.ordinal().to_string(),
            Command::SetShuffle(m) => m.ordinal().to_string(),
            Command::GetQueue { .. } => protocol::encode_ids(&[1, 2, 3]),
            Command::GetSubQueue { .. } => String::new(),
            Command::SetQueue(ids) => ids.len().to_string(),
            Command::RemoveFromQueue(n) | Command::RemoveFromSubQueue(n) => n.to_string(),
            Command::AddToSubQueue(id) => id.to_string(),
            Command::SkipSubQueueSongs(n) => n.to_string(),
        }
    }

    type Override = dyn Fn(&Command) -> Option<String> + Send + Sync;

    /// Minimal scripted daemon: answers canned replies, records every
    /// request, optionally overrides specific replies, optionally drops
    /// the connection after a number of replies.
    async fn spawn_stub(
        overrides: Arc<Override>,
        close_after: Option<usize>,
    ) -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let mut framed = Framed::new(stream, FrameCodec);
                let mut replies = 0usize;
                while let Some(Ok(frame)) = framed.next().await {
                    log_clone.lock().push(frame.clone());
                    let Ok(command) = Command::decode(&frame) else { continue };
                    let reply =
                        (overrides)(&command).unwrap_or_else(|| canned_reply(&command));
                    if framed.send(reply.as_str()).await.is_err() {
                        break;
                    }
                    replies += 1;
                    if close_after.is_some_and(|n| replies >= n) {
                        break;
                    }
                }
            }
        });
        (port, log)
    }

    fn no_overrides() -> Arc<Override> {
        Arc::new(|_| None)
    }

    async fn eventually<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true: {what}");
    }

    #[tokio::test]
    async fn test_set_volume_round_trip_updates_cache() {
        let (port, _log) = spawn_stub(no_overrides(), None).await;
        let client = PlayerClient::connect_to(port).await;
        assert!(!client.error());

        client.send_set_volume(37.5);
        eventually("volume cached", || (client.volume() - 37.5).abs() < f64::EPSILON).await;
    }

    #[tokio::test]
    async fn test_version_mismatch_is_sticky() {
        let overrides: Arc<Override> = Arc::new(|command| {
            matches!(command, Command::Version).then(|| "9".to_string())
        });
        let (port, log) = spawn_stub(overrides, None).await;
        let client = PlayerClient::connect_to(port).await;

        assert!(client.error());
        assert_eq!(client.error_kind(), Some(ErrorKind::DifferentVersion));

        // Rejected outright; nothing further reaches the daemon.
        client.send_resume();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*log.lock(), vec![Command::Version.encode()]);
    }

    #[tokio::test]
    async fn test_add_to_sub_queue_echo() {
        let (port, _log) = spawn_stub(no_overrides(), None).await;
        let client = PlayerClient::connect_to(port).await;

        client.send_add_to_sub_queue(7);
        eventually("sub-queue appended", || client.sub_queue().as_slice() == [7]).await;
    }

    #[tokio::test]
    async fn test_echo_mismatch_triggers_full_resync() {
        let overrides: Arc<Override> = Arc::new(|command| {
            matches!(command, Command::AddToSubQueue(_)).then(|| "0".to_string())
        });
        let (port, log) = spawn_stub(overrides, None).await;
        let client = PlayerClient::connect_to(port).await;

        client.send_add_to_sub_queue(7);
        let resync = Command::GetQueue { start: 0, count: FULL_RANGE }.encode();
        eventually("resync requested", || log.lock().contains(&resync)).await;
        // The mismatched id was not appended locally.
        assert!(client.sub_queue().is_empty());
    }

    #[tokio::test]
    async fn test_error_mid_drain_discards_pending() {
        // The stub answers the handshake, then drops the connection.
        let (port, _log) = spawn_stub(no_overrides(), Some(1)).await;
        let client = PlayerClient::connect_to(port).await;
        assert!(!client.error());

        client.send_pause();
        client.send_next();
        let idx = client.wait_song_idx().await;
        assert_eq!(idx, WAIT_FAILED);
        assert!(client.error());
        assert_eq!(client.error_kind(), Some(ErrorKind::Unknown));
        assert!(client.shared.write_queue.lock().is_empty());
    }

    #[tokio::test]
    async fn test_queue_changed_exactly_once_per_change() {
        let (port, _log) = spawn_stub(no_overrides(), None).await;
        let client = PlayerClient::connect_to(port).await;

        client.send_get_queue(0, FULL_RANGE);
        eventually("queue cached", || client.queue().as_slice() == [1, 2, 3]).await;
        assert!(client.queue_changed());
        assert!(!client.queue_changed());

        // An identical refetch is idempotent: same ids, no new change.
        client.send_get_queue(0, FULL_RANGE);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.queue().as_slice(), [1, 2, 3]);
        assert!(!client.queue_changed());
    }

    #[tokio::test]
    async fn test_wait_reset_returns_version_and_clears_cache() {
        let (port, _log) = spawn_stub(no_overrides(), None).await;
        let client = PlayerClient::connect_to(port).await;

        client.send_get_queue(0, FULL_RANGE);
        eventually("queue cached", || !client.queue().is_empty()).await;

        let version = client.wait_reset().await;
        assert_eq!(version, protocol::VERSION);
        assert!(client.queue().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_clears_error() {
        let (port, _log) = spawn_stub(no_overrides(), Some(1)).await;
        let client = PlayerClient::connect_to(port).await;

        client.send_pause();
        eventually("error raised", || client.error()).await;

        // The stub accepts again; a fresh handshake restores service.
        assert!(client.reconnect().await);
        assert!(!client.error());
    }
}
