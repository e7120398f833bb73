//! # Active-Reference Gate
//!
//! The shutdown barrier every connection carries. Callers entering an
//! operation take an active reference; disconnect closes the gate and
//! waits until in-flight references drain. Once closed, the gate never
//! reopens, so teardown observes a quiescent connection.
//!
//! Holders of an active reference may call any engine operation on the
//! connection without racing teardown, but must not block indefinitely
//! without arranging a wake on the connection's wait machinery.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::{Condvar, Mutex};

/// A gate with a non-negative in-use counter and a sticky closed flag.
#[derive(Debug, Default)]
pub struct ActiveGate {
    count: AtomicI64,
    closed: AtomicBool,
    lock: Mutex<()>,
    drained: Condvar,
}

/// RAII active reference; dropping releases the gate.
#[derive(Debug)]
pub struct ActiveRef<'a> {
    gate: &'a ActiveGate,
}

impl ActiveGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the gate has been closed. Closed is sticky.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take an active reference; fails once the gate is closed.
    pub fn acquire(&self) -> Option<ActiveRef<'_>> {
        if self.is_closed() {
            return None;
        }
        self.count.fetch_add(1, Ordering::AcqRel);
        // Re-check: close may have slipped in between the flag test and
        // the increment. Backing out keeps the closer's drain count exact.
        if self.is_closed() {
            self.release();
            return None;
        }
        Some(ActiveRef { gate: self })
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.lock.lock();
            self.drained.notify_all();
        }
    }

    /// Claim the close. Returns `false` when the gate was already closed;
    /// exactly one caller observes `true` and proceeds to drain.
    pub fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Block until every in-flight reference has been released.
    pub fn wait_drained(&self) {
        let mut guard = self.lock.lock();
        while self.count.load(Ordering::Acquire) > 0 {
            self.drained.wait(&mut guard);
        }
    }

    /// Close the gate and wait for in-flight references to drain.
    ///
    /// Returns `false` without waiting when the gate was already closed;
    /// exactly one caller observes `true`.
    pub fn close(&self) -> bool {
        if !self.begin_close() {
            return false;
        }
        self.wait_drained();
        true
    }
}

impl Drop for ActiveRef<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
