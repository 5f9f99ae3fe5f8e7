// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Condvar, Mutex,
    },
    time::{Duration, Instant},
};

/// Lifecycle of one transaction attempt.
///
/// `Running -> Committing -> Committed` on success; `Retry` and `Killed` are
/// terminal for the attempt (the outer loop may begin a fresh one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxStatus {
    Running = 0,
    Committing = 1,
    Retry = 2,
    Killed = 3,
    Committed = 4,
}

impl TxStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TxStatus::Running,
            1 => TxStatus::Committing,
            2 => TxStatus::Retry,
            3 => TxStatus::Killed,
            _ => TxStatus::Committed,
        }
    }
}

/// Shared status of one transaction attempt.
///
/// This is the piece of a transaction other threads may see: a reference
/// marked with a `TxInfo` carries that transaction's write intent. Status
/// transitions go through compare-and-swap so that barging and committing
/// race deterministically, and the monitor lets conflicting transactions
/// wait, bounded, for this one to stop.
pub(crate) struct TxInfo {
    pub start_point: u64,
    status: AtomicU8,
    monitor: Mutex<()>,
    stopped: Condvar,
}

impl TxInfo {
    pub fn new(status: TxStatus, start_point: u64) -> Self {
        Self {
            start_point,
            status: AtomicU8::new(status as u8),
            monitor: Mutex::new(()),
            stopped: Condvar::new(),
        }
    }

    pub fn status(&self) -> TxStatus {
        TxStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Running or mid-commit: the transaction still owns its write intents.
    pub fn is_running(&self) -> bool {
        matches!(self.status(), TxStatus::Running | TxStatus::Committing)
    }

    pub fn compare_and_set(&self, expected: TxStatus, updated: TxStatus) -> bool {
        self.status
            .compare_exchange(
                expected as u8,
                updated as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Moves to a terminal status and wakes every waiter.
    pub fn stop(&self, status: TxStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
        self.broadcast();
    }

    /// Wakes waiters without changing status; used after a CAS already moved
    /// the status (e.g. a successful barge).
    pub fn broadcast(&self) {
        let _guard = self.monitor.lock().expect("transaction monitor poisoned");
        self.stopped.notify_all();
    }

    /// Waits until this transaction stops running, or until `timeout`
    /// elapses. Always bounded.
    pub fn wait_while_running(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut guard = self.monitor.lock().expect("transaction monitor poisoned");
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            let (next, result) = self
                .stopped
                .wait_timeout(guard, deadline - now)
                .expect("transaction monitor poisoned");
            guard = next;
            if result.timed_out() {
                return;
            }
        }
    }
}
