//! Daemon-side listening socket and accept loop.
//!
//! The accept loop runs as its own task and tracks a consecutive-failure
//! streak. At [`REBIND_FAILURES`] the listening socket is closed and
//! rebound; at [`FATAL_FAILURES`] the loop stops accepting and sleeps in
//! 1-second ticks until a rebind succeeds or it is told to stop. A "no
//! route to host" accept failure (seen after device sleep/wake) triggers
//! an immediate rebind without counting toward the ordinary streak.
//!
//! Accepted connections are wrapped as [`Transfer`]s and pushed to a
//! mutex-guarded FIFO the consumer polls.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::IpcResult;
use crate::transfer::Transfer;

/// Consecutive accept failures before the listening socket is rebound.
pub const REBIND_FAILURES: u32 = 10;

/// Consecutive accept failures before the listener stops accepting and
/// backs off in 1-second ticks.
pub const FATAL_FAILURES: u32 = 20;

const FATAL_TICK: Duration = Duration::from_secs(1);

/// What the accept loop should do after one accept attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptAction {
    Continue,
    Rebind,
    FatalSleep,
}

/// Outcome of one accept attempt, as seen by the streak tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptOutcome {
    Accepted,
    Failed,
    HostUnreachable,
}

/// Consecutive-failure streak. Only a successful accept resets it; a
/// rebind does not, so a persistently broken socket still escalates to
/// the fatal backoff.
#[derive(Debug, Default)]
pub(crate) struct FailureStreak {
    count: u32,
}

impl FailureStreak {
    pub(crate) fn record(&mut self, outcome: AcceptOutcome) -> AcceptAction {
        match outcome {
            AcceptOutcome::Accepted => {
                self.count = 0;
                AcceptAction::Continue
            }
            AcceptOutcome::HostUnreachable => AcceptAction::Rebind,
            AcceptOutcome::Failed => {
                self.count += 1;
                if self.count >= FATAL_FAILURES {
                    AcceptAction::FatalSleep
                } else if self.count == REBIND_FAILURES {
                    AcceptAction::Rebind
                } else {
                    AcceptAction::Continue
                }
            }
        }
    }
}

/// Owns the listening socket and the FIFO of accepted channels.
pub struct Listener {
    queue: Arc<Mutex<VecDeque<Transfer>>>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    port: u16,
}

impl Listener {
    /// Bind the listening socket and start the accept loop.
    ///
    /// # Errors
    /// Returns an error if the initial bind fails; later bind failures
    /// are handled by the loop's own backoff.
    pub async fn bind(port: u16) -> IpcResult<Self> {
        let socket = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        // Port 0 asks the OS for an ephemeral port; rebinds must reuse
        // the resolved one.
        let port = socket.local_addr()?.port();
        info!(port, "control listener bound");

        let queue: Arc<Mutex<VecDeque<Transfer>>> = Arc::new(Mutex::new(VecDeque::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle =
            tokio::spawn(accept_loop(socket, port, Arc::clone(&queue), Arc::clone(&stop)));
        Ok(Self { queue, stop, handle, port })
    }

    /// Port the listener was bound to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether an accepted channel is waiting.
    #[must_use]
    pub fn has_transfer(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Pop the oldest accepted channel, if any.
    #[must_use]
    pub fn get_transfer(&self) -> Option<Transfer> {
        self.queue.lock().pop_front()
    }

    /// Tell the accept loop to exit at its next tick.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.handle.abort();
    }
}

async fn accept_loop(
    mut socket: TcpListener,
    port: u16,
    queue: Arc<Mutex<VecDeque<Transfer>>>,
    stop: Arc<AtomicBool>,
) {
    let mut streak = FailureStreak::default();

    while !stop.load(Ordering::Acquire) {
        let outcome = match socket.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "control connection accepted");
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "could not disable Nagle on accepted socket");
                }
                queue.lock().push_back(Transfer::new(stream));
                AcceptOutcome::Accepted
            }
            Err(e) if e.raw_os_error() == Some(libc::EHOSTUNREACH) => {
                warn!(error = %e, "no route to host on accept; rebinding immediately");
                AcceptOutcome::HostUnreachable
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                AcceptOutcome::Failed
            }
        };

        match streak.record(outcome) {
            AcceptAction::Continue => {}
            AcceptAction::Rebind => {
                // On rebind failure the old socket stays in place and
                // the streak keeps climbing toward the fatal backoff.
                if let Some(rebound) = rebind(port).await {
                    socket = rebound;
                }
            }
            AcceptAction::FatalSleep => {
                error!(port, "accept failure streak is fatal; backing off");
                loop {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    tokio::time::sleep(FATAL_TICK).await;
                    if let Some(rebound) = rebind(port).await {
                        socket = rebound;
                        break;
                    }
                }
            }
        }
    }
}

async fn rebind(port: u16) -> Option<TcpListener> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
        Ok(socket) => {
            info!(port, "listening socket rebound");
            Some(socket)
        }
        Err(e) => {
            debug!(port, error = %e, "rebind attempt failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[test]
    fn test_streak_rebinds_at_ten_failures() {
        let mut streak = FailureStreak::default();
        for _ in 0..REBIND_FAILURES - 1 {
            assert_eq!(streak.record(AcceptOutcome::Failed), AcceptAction::Continue);
        }
        assert_eq!(streak.record(AcceptOutcome::Failed), AcceptAction::Rebind);
    }

    #[test]
    fn test_streak_goes_fatal_at_twenty_failures() {
        let mut streak = FailureStreak::default();
        for _ in 0..FATAL_FAILURES - 1 {
            let _ = streak.record(AcceptOutcome::Failed);
        }
        assert_eq!(streak.record(AcceptOutcome::Failed), AcceptAction::FatalSleep);
        // Every further failure stays fatal.
        assert_eq!(streak.record(AcceptOutcome::Failed), AcceptAction::FatalSleep);
    }

    #[test]
    fn test_streak_reset_by_success_only() {
        let mut streak = FailureStreak::default();
        for _ in 0..REBIND_FAILURES {
            let _ = streak.record(AcceptOutcome::Failed);
        }
        // Host-unreachable rebinds immediately but does not touch the
        // ordinary streak.
        assert_eq!(streak.record(AcceptOutcome::HostUnreachable), AcceptAction::Rebind);
        assert_eq!(streak.count, REBIND_FAILURES);

        assert_eq!(streak.record(AcceptOutcome::Accepted), AcceptAction::Continue);
        assert_eq!(streak.count, 0);
    }

    #[tokio::test]
    async fn test_accepted_connections_queue_in_order() {
        let listener = Listener::bind(0).await.unwrap();
        let port = listener.port();

        assert!(!listener.has_transfer());
        let _a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        // Give the accept loop a moment to run.
        for _ in 0..50 {
            if listener.has_transfer() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(listener.has_transfer());
        assert!(listener.get_transfer().is_some());
        listener.stop();
    }
}
