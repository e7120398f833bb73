//! # Reply Tracking
//!
//! A request expecting a reply arms a tracker. The tracker is owned by the
//! reply list of the connection that owes the reply; the waiting sender
//! holds a non-owning handle. Synchronous senders block on the tracker's
//! condition variable; asynchronous senders learn the outcome through
//! reply-timeout / reply-dead notifications.
//!
//! Deadlines are swept by a per-bus worker thread driven by a crossbeam
//! channel: every tracker insertion or removal re-arms the worker, which
//! sleeps until the nearest deadline and emits timeout notifications for
//! expired asynchronous trackers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::util::monotonic_ns;

/// What a synchronous waiter receives when the reply arrives: the
/// published slice in the waiter's own pool, plus delivered handle tokens.
#[derive(Debug, Clone)]
pub struct ReplyDelivery {
    pub offset: usize,
    pub size: usize,
    pub fds: Vec<u64>,
}

#[derive(Debug)]
enum Outcome {
    Delivered(ReplyDelivery),
    Failed(&'static FailKind),
}

/// Completion errors are a closed set so outcomes stay copyable.
#[derive(Debug)]
pub struct FailKind(fn() -> Error);

pub static FAIL_BROKEN_PIPE: FailKind = FailKind(|| Error::BrokenPipe);
pub static FAIL_CANCELLED: FailKind = FailKind(|| Error::Cancelled);

#[derive(Debug, Default)]
struct TrackerState {
    interrupted: bool,
    done: Option<Outcome>,
    taken: bool,
}

/// Sender-side bookkeeping for one in-flight request.
#[derive(Debug)]
pub struct ReplyTracker {
    /// Connection expected to produce the reply; the tracker lives in its
    /// reply list.
    pub replier_id: u64,
    /// Connection blocked on (or subscribed to) the outcome.
    pub waiter_id: u64,
    pub cookie: u64,
    /// Name-id the original request targeted, zero for id addressing.
    pub name_id: u64,
    pub sync: bool,
    /// Absolute monotonic deadline; zero once the peer died.
    deadline_ns: AtomicU64,
    state: Mutex<TrackerState>,
    cond: Condvar,
}

impl ReplyTracker {
    pub fn new(replier_id: u64, waiter_id: u64, cookie: u64, name_id: u64, deadline_ns: u64, sync: bool) -> Self {
        ReplyTracker {
            replier_id,
            waiter_id,
            cookie,
            name_id,
            sync,
            deadline_ns: AtomicU64::new(deadline_ns),
            state: Mutex::new(TrackerState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns.load(Ordering::Acquire)
    }

    /// Complete with a delivered reply. Returns false when the tracker was
    /// already resolved.
    pub fn complete_delivered(&self, delivery: ReplyDelivery) -> bool {
        self.finish(Outcome::Delivered(delivery))
    }

    /// Complete with a failure kind (peer death, cancellation).
    pub fn complete_failed(&self, kind: &'static FailKind) -> bool {
        if std::ptr::eq(kind, &FAIL_BROKEN_PIPE) {
            // Peer died: the deadline invariant pins this to zero.
            self.deadline_ns.store(0, Ordering::Release);
        }
        self.finish(Outcome::Failed(kind))
    }

    fn finish(&self, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if state.done.is_some() || state.taken {
            return false;
        }
        state.done = Some(outcome);
        self.cond.notify_all();
        true
    }

    /// Mark the waiter externally interrupted; the tracker stays linked so
    /// a restarted call can resume it.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().interrupted
    }

    pub fn is_resolved(&self) -> bool {
        let state = self.state.lock();
        state.done.is_some() || state.taken
    }

    /// Clear the interrupted mark when a restarted send re-binds.
    pub fn resume(&self) {
        self.state.lock().interrupted = false;
    }

    /// Block until the reply arrives, the deadline passes, or the wait is
    /// interrupted. Used by synchronous senders only.
    pub fn wait(&self) -> Result<ReplyDelivery> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.done.take() {
                state.taken = true;
                return match outcome {
                    Outcome::Delivered(delivery) => Ok(delivery),
                    Outcome::Failed(kind) => Err((kind.0)()),
                };
            }
            if state.interrupted {
                return Err(Error::Interrupted);
            }
            let deadline = self.deadline_ns.load(Ordering::Acquire);
            let now = monotonic_ns();
            if now >= deadline {
                state.taken = true;
                return Err(Error::TimedOut);
            }
            let timeout = Duration::from_nanos(deadline - now);
            if self.cond.wait_for(&mut state, timeout).timed_out() {
                // Re-check; completion may have raced the timeout.
                if let Some(outcome) = state.done.take() {
                    state.taken = true;
                    return match outcome {
                        Outcome::Delivered(delivery) => Ok(delivery),
                        Outcome::Failed(kind) => Err((kind.0)()),
                    };
                }
                state.taken = true;
                return Err(Error::TimedOut);
            }
        }
    }
}

enum WorkerCmd {
    Rearm,
    Shutdown,
}

/// The per-bus deadline sweeper.
///
/// One thread, one channel. `rearm` pokes the worker whenever the set of
/// tracked deadlines changed; the worker asks the bus for a sweep, which
/// emits timeout notifications and reports the nearest remaining deadline.
#[derive(Debug)]
pub struct ReplyWorker {
    tx: Sender<WorkerCmd>,
    handle: Option<JoinHandle<()>>,
}

impl ReplyWorker {
    pub fn spawn(bus: Weak<Bus>) -> Self {
        let (tx, rx) = channel::unbounded();
        let handle = std::thread::spawn(move || loop {
                let next_deadline = match bus.upgrade() {
                    Some(bus) => bus.sweep_reply_deadlines(),
                    None => break,
                };
                let cmd = match next_deadline {
                    Some(deadline) => {
                        let wait = deadline.saturating_sub(monotonic_ns());
                        match rx.recv_timeout(Duration::from_nanos(wait.max(1))) {
                            Ok(cmd) => cmd,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match rx.recv() {
                        Ok(cmd) => cmd,
                        Err(_) => break,
                    },
                };
                match cmd {
                    WorkerCmd::Rearm => continue,
                    WorkerCmd::Shutdown => break,
                }
            });
        ReplyWorker {
            tx,
            handle: Some(handle),
        }
    }

    /// Poke the worker after a tracker was added or removed.
    pub fn rearm(&self) {
        trace!("re-arming reply sweeper");
        let _ = self.tx.send(WorkerCmd::Rearm);
    }

    pub fn shutdown(&mut self) {
        let _ = self.tx.send(WorkerCmd::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplyWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(deadline: u64, sync: bool) -> ReplyTracker {
        ReplyTracker::new(2, 1, 42, 0, deadline, sync)
    }

    /// A completed tracker hands its delivery to exactly one waiter.
    #[test]
    fn complete_then_wait() {
        let t = tracker(monotonic_ns() + 1_000_000_000, true);
        assert!(t.complete_delivered(ReplyDelivery {
            offset: 8,
            size: 16,
            fds: vec![],
        }));
        let delivery = t.wait().unwrap();
        assert_eq!(delivery.offset, 8);
        // Second completion attempts are refused.
        assert!(!t.complete_failed(&FAIL_CANCELLED));
    }

    /// The wait honours its absolute deadline.
    #[test]
    fn wait_times_out() {
        let t = tracker(monotonic_ns() + 20_000_000, true);
        let err = t.wait().unwrap_err();
        assert!(matches!(err, Error::TimedOut));
    }

    /// Peer death completes with BrokenPipe and zeroes the deadline.
    #[test]
    fn broken_pipe_zeroes_deadline() {
        let t = tracker(monotonic_ns() + 1_000_000_000, true);
        t.complete_failed(&FAIL_BROKEN_PIPE);
        assert_eq!(t.deadline_ns(), 0);
        assert!(matches!(t.wait(), Err(Error::BrokenPipe)));
    }

    /// Interruption wakes the waiter without resolving the tracker, and a
    /// resumed tracker can still complete.
    #[test]
    fn interrupt_preserves_tracker() {
        let t = tracker(monotonic_ns() + 1_000_000_000, true);
        crossbeam::thread::scope(|scope| {
            let waiter = scope.spawn(|_| t.wait());
            std::thread::sleep(Duration::from_millis(20));
            t.interrupt();
            assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));
        })
        .unwrap();

        assert!(!t.is_resolved());
        t.resume();
        assert!(t.complete_delivered(ReplyDelivery {
            offset: 0,
            size: 4,
            fds: vec![],
        }));
        assert!(t.wait().is_ok());
    }

    /// A delivery racing the deadline is still handed over.
    #[test]
    fn late_completion_beats_timeout_check() {
        let t = tracker(monotonic_ns() + 50_000_000, true);
        crossbeam::thread::scope(|scope| {
            scope.spawn(|_| {
                std::thread::sleep(Duration::from_millis(10));
                t.complete_delivered(ReplyDelivery {
                    offset: 0,
                    size: 1,
                    fds: vec![],
                });
            });
            assert!(t.wait().is_ok());
        })
        .unwrap();
    }
}
