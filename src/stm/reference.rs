// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    errors::StmError,
    stm::{
        error::{RetryCause, TxError},
        history::History,
        info::TxInfo,
        stm::Stm,
        Val,
    },
};
use log::*;
use std::{
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::{Duration, Instant},
};

/// Default bounds on a reference's committed-value history.
pub(crate) const DEFAULT_MIN_HISTORY: usize = 0;
pub(crate) const DEFAULT_MAX_HISTORY: usize = 10;

/// State behind a reference's reader/writer lock.
///
/// The lock serializes access to these fields only; transactional isolation
/// is enforced by the write-intent (`tinfo`) and barge protocol, never by
/// lock ownership alone.
pub(crate) struct RefState {
    pub history: History,
    /// Write intent: the transaction currently claiming this reference.
    /// A stopped info counts as no claim.
    pub tinfo: Option<Arc<TxInfo>>,
    /// Transactions holding a read intent (`ensure`) on this reference,
    /// blocking others from acquiring write intent without being bargeable.
    pub ensured_by: Vec<Arc<TxInfo>>,
}

/// Untyped core of a reference, shared by all clones of a [`Ref`].
pub(crate) struct RefCore {
    pub id: u64,
    pub lock: RwLock<RefState>,
    /// Reads that found no entry old enough; any fault requests history
    /// growth at the next commit.
    pub faults: AtomicU64,
    pub min_history: AtomicUsize,
    pub max_history: AtomicUsize,
}

impl RefCore {
    pub fn read(&self) -> RwLockReadGuard<'_, RefState> {
        self.lock.read().expect("reference lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RefState> {
        self.lock.write().expect("reference lock poisoned")
    }

    /// Bounded write acquisition: try, back off briefly, give up with a
    /// retry signal once `timeout` elapses.
    pub fn try_write_for(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, RefState>, TxError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(guard) = self.lock.try_write() {
                return Ok(guard);
            }
            if Instant::now() >= deadline {
                warn!("ref {} write lock timed out", self.id);
                return Err(TxError::Retry(RetryCause::LockTimeout));
            }
            std::thread::sleep(Duration::from_millis(1));
            std::hint::spin_loop();
        }
    }
}

/// A mutable cell holding a succession of committed values.
///
/// A `Ref` is the unit of contention of the engine: writes must happen inside
/// a transaction, while reads may happen anywhere. Read inside a transaction,
/// a `Ref` yields a value from the consistent snapshot shared by every
/// reference the transaction touches; read outside, it yields the newest
/// committed value.
///
/// Values move in and out by clone. Cheaply clonable value types such as
/// [`crate::PersistentHashMap`] are the intended cargo.
///
/// Clones of a `Ref` are handles to the same cell; equality and hashing
/// follow the cell identity, not the value.
pub struct Ref<T> {
    pub(crate) core: Arc<RefCore>,
    pub(crate) ctrl: Stm,
    marker: PhantomData<fn() -> T>,
}

fn downcast<T: Clone + Send + Sync + 'static>(value: &Val) -> T {
    value
        .downcast_ref::<T>()
        .expect("reference holds a value of a different type")
        .clone()
}

impl<T: Clone + Send + Sync + 'static> Ref<T> {
    pub(crate) fn new(core: Arc<RefCore>, ctrl: Stm) -> Self {
        Self {
            core,
            ctrl,
            marker: PhantomData,
        }
    }

    /// The current value.
    ///
    /// Inside a running transaction this is the in-transaction value if one
    /// is pending, otherwise the newest committed value visible at the
    /// transaction's read point; an unreadable history raises the internal
    /// retry signal. Outside a transaction it is the newest committed value.
    pub fn deref(&self) -> Result<T, StmError> {
        match self.ctrl.current() {
            Some(tx) => {
                let mut tx = tx.lock().expect("transaction poisoned");
                let value = tx.value_of(&self.core)?;
                Ok(downcast(&value))
            }
            None => {
                let state = self.core.read();
                Ok(downcast(&state.history.newest().value))
            }
        }
    }

    /// Sets the in-transaction value, acquiring write intent on first touch.
    pub fn set(&self, value: T) -> Result<(), StmError> {
        let tx = self.ctrl.current().ok_or(StmError::NotInTransaction)?;
        let mut tx = tx.lock().expect("transaction poisoned");
        tx.do_set(&self.core, Arc::new(value) as Val)?;
        Ok(())
    }

    /// Reads the transaction-scoped value, applies `f`, and stores the
    /// result. Returns the new value.
    pub fn alter<F>(&self, f: F) -> Result<T, StmError>
    where
        F: FnOnce(&T) -> T,
    {
        let tx = self.ctrl.current().ok_or(StmError::NotInTransaction)?;
        let mut tx = tx.lock().expect("transaction poisoned");
        let current = tx.value_of(&self.core)?;
        let updated = f(current
            .downcast_ref::<T>()
            .expect("reference holds a value of a different type"));
        tx.do_set(&self.core, Arc::new(updated.clone()) as Val)?;
        Ok(updated)
    }

    /// Records `f` as a deferred, order-independent update.
    ///
    /// The function is applied once now, against the transaction-scoped
    /// value, for the returned preview; at commit it is re-applied to the
    /// then-latest committed value. Independent transactions commuting the
    /// same reference therefore do not invalidate each other. `f` must be
    /// pure: it may run several times across retries.
    pub fn commute<F>(&self, f: F) -> Result<T, StmError>
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        let tx = self.ctrl.current().ok_or(StmError::NotInTransaction)?;
        let mut tx = tx.lock().expect("transaction poisoned");
        let erased = Arc::new(move |value: &Val| -> Val {
            Arc::new(f(value
                .downcast_ref::<T>()
                .expect("reference holds a value of a different type"))) as Val
        });
        let result = tx.do_commute(&self.core, erased)?;
        Ok(downcast(&result))
    }

    /// Takes a read intent on this reference for the rest of the
    /// transaction: others are blocked from acquiring write intent, without
    /// this transaction gaining write access. Useful for references a
    /// computation depends on but does not modify.
    pub fn ensure(&self) -> Result<(), StmError> {
        let tx = self.ctrl.current().ok_or(StmError::NotInTransaction)?;
        let mut tx = tx.lock().expect("transaction poisoned");
        tx.do_ensure(&self.core)?;
        Ok(())
    }

    /// Alias for [`Ref::ensure`].
    pub fn touch(&self) -> Result<(), StmError> {
        self.ensure()
    }

    /// Drops history entries that no live transaction's read point can still
    /// need, keeping at least `min_history` entries.
    pub fn trim_history(&self) {
        // compute the floor before taking the reference lock
        let floor = self.ctrl.min_live_read_point();
        let min = self.core.min_history.load(Ordering::SeqCst);
        let mut state = self.core.write();
        let needed = match floor {
            Some(read_point) => state.history.keep_count(read_point),
            None => 1,
        };
        state.history.trim(needed.max(min));
    }
}

impl<T> Ref<T> {
    /// Sequential identifier assigned at creation; totally orders
    /// references for consistent lock acquisition.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Number of committed values currently retained.
    pub fn history_count(&self) -> usize {
        self.core.read().history.len()
    }

    /// Read faults recorded since the last history growth.
    pub fn faults(&self) -> u64 {
        self.core.faults.load(Ordering::SeqCst)
    }

    pub fn min_history(&self) -> usize {
        self.core.min_history.load(Ordering::SeqCst)
    }

    pub fn max_history(&self) -> usize {
        self.core.max_history.load(Ordering::SeqCst)
    }

    pub fn set_min_history(&self, min: usize) {
        self.core.min_history.store(min, Ordering::SeqCst);
    }

    pub fn set_max_history(&self, max: usize) {
        self.core.max_history.store(max, Ordering::SeqCst);
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            ctrl: self.ctrl.clone(),
            marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl<T> Eq for Ref<T> {}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.core) as usize).hash(state);
    }
}

impl<T> Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref").field("id", &self.core.id).finish()
    }
}
