// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    clock,
    errors::StmError,
    stm::{
        error::TxError,
        history::History,
        info::TxStatus,
        reference::{Ref, RefCore, RefState, DEFAULT_MAX_HISTORY, DEFAULT_MIN_HISTORY},
        transaction::{LockingTransaction, RETRY_LIMIT},
        Val,
    },
};
use log::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    thread::{self, ThreadId},
};

struct StmInner {
    /// Global commit-point counter; advanced only when a commit publishes.
    last_point: Arc<AtomicU64>,
    tx_ids: AtomicU64,
    ref_ids: AtomicU64,
    retry_limit: AtomicU64,
    /// Per-thread transactions. A thread has an entry exactly while it is
    /// inside a transactional scope; transactions never migrate.
    transactions: Mutex<HashMap<ThreadId, Arc<Mutex<LockingTransaction>>>>,
}

/// The engine handle.
///
/// An `Stm` owns the global commit-point counter and the registry of
/// per-thread transactions. It is cheap to clone and all clones share the
/// same engine; references are created from a handle and carry it, which is
/// what lets zero-argument computations reach the current transaction
/// without any ambient global state.
///
/// ```
/// use persistent_stm::Stm;
///
/// let stm = Stm::default();
/// let counter = stm.create(0usize);
///
/// let c = counter.clone();
/// let committed = stm.atomic(move || c.alter(|n| n + 1)).unwrap();
/// assert_eq!(committed, 1);
/// assert_eq!(counter.deref().unwrap(), 1);
/// ```
#[derive(Clone)]
pub struct Stm {
    inner: Arc<StmInner>,
}

impl Default for Stm {
    fn default() -> Self {
        Self::with_retry_limit(RETRY_LIMIT)
    }
}

impl Stm {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose transactions give up after `retry_limit` attempts.
    pub fn with_retry_limit(retry_limit: u64) -> Self {
        Self {
            inner: Arc::new(StmInner {
                last_point: Arc::new(AtomicU64::new(0)),
                tx_ids: AtomicU64::new(0),
                ref_ids: AtomicU64::new(0),
                retry_limit: AtomicU64::new(retry_limit),
                transactions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn retry_limit(&self) -> u64 {
        self.inner.retry_limit.load(Ordering::SeqCst)
    }

    /// Applies to transactions begun after the call.
    pub fn set_retry_limit(&self, retry_limit: u64) {
        self.inner.retry_limit.store(retry_limit, Ordering::SeqCst);
    }

    /// The most recently assigned commit point.
    pub fn last_commit_point(&self) -> u64 {
        self.inner.last_point.load(Ordering::SeqCst)
    }

    /// Creates a reference holding `value`, with default history bounds.
    pub fn create<T>(&self, value: T) -> Ref<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.make_ref(value, DEFAULT_MIN_HISTORY, DEFAULT_MAX_HISTORY)
    }

    /// Creates a reference with explicit history bounds, seeding the initial
    /// committed entry.
    pub fn create_with_history<T>(&self, value: T, min_history: usize, max_history: usize) -> Ref<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.make_ref(value, min_history, max_history)
    }

    fn make_ref<T>(&self, value: T, min_history: usize, max_history: usize) -> Ref<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.inner.ref_ids.fetch_add(1, Ordering::SeqCst) + 1;
        let core = Arc::new(RefCore {
            id,
            lock: RwLock::new(RefState {
                // point 0 predates every transaction, so the seed value is
                // visible to all of them
                history: History::new(Arc::new(value) as Val, 0, clock::millis()),
                tinfo: None,
                ensured_by: Vec::new(),
            }),
            faults: AtomicU64::new(0),
            min_history: AtomicUsize::new(min_history),
            max_history: AtomicUsize::new(max_history),
        });
        Ref::new(core, self.clone())
    }

    /// Runs `body` transactionally and returns its committed result.
    ///
    /// If the calling thread is already inside a running transaction, `body`
    /// joins it: its effects commit or retry with the enclosing transaction.
    /// Otherwise a transaction is begun and `body` re-executed until it
    /// commits, up to the engine's retry limit. `body` must be free of side
    /// effects other than reference operations, and must propagate every
    /// reference-operation error with `?`.
    pub fn atomic<T, F>(&self, mut body: F) -> Result<T, StmError>
    where
        F: FnMut() -> Result<T, StmError>,
    {
        if let Some(tx) = self.current() {
            if tx.lock().expect("transaction poisoned").is_running() {
                return body();
            }
        }
        let tx = self.register()?;
        let result = self.run(&tx, &mut body);
        self.unregister();
        result
    }

    /// Like [`Stm::atomic`], but reports failure through `on_error` and
    /// returns `None` instead of an `Err`.
    pub fn atomic_or_else<T, F, H>(&self, body: F, on_error: H) -> Option<T>
    where
        F: FnMut() -> Result<T, StmError>,
        H: FnOnce(&StmError),
    {
        match self.atomic(body) {
            Ok(value) => Some(value),
            Err(err) => {
                on_error(&err);
                None
            }
        }
    }

    /// Begins a transaction on the calling thread. Idempotent while one is
    /// already running.
    pub fn begin(&self) -> Result<(), StmError> {
        let tx = self.register()?;
        tx.lock().expect("transaction poisoned").begin();
        Ok(())
    }

    /// Commits the calling thread's transaction.
    ///
    /// Unlike [`Stm::atomic`], conflicts are not retried here: the caller
    /// receives [`StmError::Retry`] and decides what to do.
    pub fn commit(&self) -> Result<(), StmError> {
        let tx = self.current().ok_or(StmError::NotInTransaction)?;
        let result = {
            let mut tx = tx.lock().expect("transaction poisoned");
            let result = tx.commit();
            match &result {
                Ok(()) => tx.cleanup(TxStatus::Committed),
                Err(_) => tx.cleanup(TxStatus::Retry),
            }
            result
        };
        self.unregister();
        result.map_err(Into::into)
    }

    /// Aborts the calling thread's transaction, discarding every buffered
    /// operation. No reference retains any trace. A no-op without a
    /// transaction.
    pub fn abort(&self) {
        if let Some(tx) = self.current() {
            tx.lock().expect("transaction poisoned").abort();
            self.unregister();
        }
    }

    /// Whether the calling thread is inside a running transaction.
    pub fn is_running(&self) -> bool {
        self.current()
            .map_or(false, |tx| tx.lock().expect("transaction poisoned").is_running())
    }

    fn run<T>(
        &self,
        tx: &Arc<Mutex<LockingTransaction>>,
        body: &mut dyn FnMut() -> Result<T, StmError>,
    ) -> Result<T, StmError> {
        let retry_limit = tx.lock().expect("transaction poisoned").retry_limit;
        for attempt in 1..=retry_limit {
            tx.lock().expect("transaction poisoned").begin();
            match body() {
                Ok(value) => {
                    let committed = {
                        let mut tx = tx.lock().expect("transaction poisoned");
                        let result = tx.commit();
                        match &result {
                            Ok(()) => tx.cleanup(TxStatus::Committed),
                            Err(_) => tx.cleanup(TxStatus::Retry),
                        }
                        result
                    };
                    match committed {
                        Ok(()) => return Ok(value),
                        Err(TxError::Retry(cause)) => {
                            info!("transaction retrying after attempt {}: {}", attempt, cause);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(StmError::Retry) => {
                    tx.lock()
                        .expect("transaction poisoned")
                        .cleanup(TxStatus::Retry);
                    debug!("transaction retrying after attempt {}", attempt);
                }
                Err(err) => {
                    // user error: unwind the attempt, then propagate
                    tx.lock()
                        .expect("transaction poisoned")
                        .cleanup(TxStatus::Killed);
                    return Err(err);
                }
            }
        }
        warn!("transaction exhausted {} attempts", retry_limit);
        Err(StmError::RetryLimit {
            attempts: retry_limit,
        })
    }

    /// The calling thread's transaction, if a transactional scope is open.
    pub(crate) fn current(&self) -> Option<Arc<Mutex<LockingTransaction>>> {
        let registry = self.inner.transactions.lock().ok()?;
        registry.get(&thread::current().id()).cloned()
    }

    /// Smallest read point across live transactions; `None` when idle.
    /// Used to decide how much reference history is still needed.
    pub(crate) fn min_live_read_point(&self) -> Option<u64> {
        let registry = self.inner.transactions.lock().ok()?;
        registry
            .values()
            .filter_map(|tx| match tx.try_lock() {
                Ok(tx) => tx.running_read_point(),
                // busy transaction, assume it still needs everything
                Err(_) => Some(0),
            })
            .min()
    }

    fn register(&self) -> Result<Arc<Mutex<LockingTransaction>>, StmError> {
        let mut registry = self.inner.transactions.lock().map_err(|_| StmError::Init)?;
        let entry = registry
            .entry(thread::current().id())
            .or_insert_with(|| {
                let id = self.inner.tx_ids.fetch_add(1, Ordering::SeqCst) + 1;
                Arc::new(Mutex::new(LockingTransaction::new(
                    id,
                    self.inner.last_point.clone(),
                    self.inner.retry_limit.load(Ordering::SeqCst),
                )))
            });
        Ok(entry.clone())
    }

    fn unregister(&self) {
        if let Ok(mut registry) = self.inner.transactions.lock() {
            registry.remove(&thread::current().id());
        }
    }
}
