// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-thread transaction engine.
//!
//! A [`LockingTransaction`] buffers every read and write against the
//! references it touches; nothing becomes visible to other threads before
//! [`LockingTransaction::commit`]. Contention is resolved by wound-wait
//! barging: the transaction with the older start point may kill a younger
//! claimant, so some transaction always makes progress and no attempt waits
//! unbounded.

use crate::{
    clock,
    stm::{
        error::{RetryCause, TxError},
        info::{TxInfo, TxStatus},
        reference::{RefCore, RefState},
        CommuteFn, Val,
    },
};
use log::*;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLockWriteGuard,
    },
    time::Duration,
};

/// Attempts before the engine reports a retry-limit error.
pub(crate) const RETRY_LIMIT: u64 = 10_000;

/// Bound for timed waits on a conflicting transaction's monitor and for
/// write-lock acquisition during commit.
pub(crate) const LOCK_WAIT: Duration = Duration::from_millis(100);

/// A transaction may only barge once it has been running this long.
const BARGE_WAIT_NANOS: u64 = 10_000_000;

pub(crate) struct LockingTransaction {
    pub id: u64,
    /// Shared status of the current attempt; recreated per attempt.
    info: Option<Arc<TxInfo>>,
    /// Snapshot bound: only history entries at or below this point are
    /// visible to this attempt.
    read_point: u64,
    /// Taken from the first attempt's read point and kept across retries,
    /// so the transaction ages into barge priority.
    start_point: u64,
    /// Monotonic begin time of the first attempt.
    start_time: u64,
    attempts: u64,
    /// Pending values: everything this attempt will write at commit, plus
    /// commute previews.
    vals: BTreeMap<u64, Val>,
    /// References written with set/alter; write intent is claimed eagerly.
    sets: BTreeSet<u64>,
    /// Deferred functions per commuted reference, applied in order at commit.
    commutes: BTreeMap<u64, Vec<CommuteFn>>,
    /// References with a read intent taken via ensure.
    ensures: BTreeSet<u64>,
    /// Cores of every reference this attempt touched, keyed by id; the
    /// BTreeMap order doubles as the deadlock-avoiding lock order.
    touched: BTreeMap<u64, Arc<RefCore>>,
    /// Global commit-point counter, shared with the engine handle.
    last_point: Arc<AtomicU64>,
    pub retry_limit: u64,
}

impl LockingTransaction {
    pub fn new(id: u64, last_point: Arc<AtomicU64>, retry_limit: u64) -> Self {
        Self {
            id,
            info: None,
            read_point: 0,
            start_point: 0,
            start_time: 0,
            attempts: 0,
            vals: BTreeMap::new(),
            sets: BTreeSet::new(),
            commutes: BTreeMap::new(),
            ensures: BTreeSet::new(),
            touched: BTreeMap::new(),
            last_point,
            retry_limit,
        }
    }

    pub fn is_running(&self) -> bool {
        self.info.as_ref().map_or(false, |info| info.is_running())
    }

    /// Read point of this transaction if it is still live, for history
    /// trimming decisions.
    pub fn running_read_point(&self) -> Option<u64> {
        self.is_running().then_some(self.read_point)
    }

    /// Starts an attempt. Idempotent while the current attempt is running.
    ///
    /// Every attempt gets a fresh read point so it can observe commits that
    /// invalidated its predecessor; the start point and start time stay fixed
    /// from the first attempt so the transaction eventually wins barges.
    pub fn begin(&mut self) {
        if self.is_running() {
            return;
        }
        self.release_ensures();
        self.vals.clear();
        self.sets.clear();
        self.commutes.clear();
        self.touched.clear();
        self.read_point = self.last_point.load(Ordering::SeqCst);
        if self.attempts == 0 {
            self.start_point = self.read_point;
            self.start_time = clock::nanos();
        }
        self.attempts += 1;
        self.info = Some(Arc::new(TxInfo::new(TxStatus::Running, self.start_point)));
        debug!(
            "TX({}): begin attempt {}, read point {}",
            self.id, self.attempts, self.read_point
        );
    }

    /// Discards every buffer without touching any reference.
    pub fn abort(&mut self) {
        info!("TX({}): abort", self.id);
        self.cleanup(TxStatus::Killed);
    }

    /// The transaction-scoped value of a reference: a pending write if one
    /// exists, otherwise the newest committed entry visible at the read
    /// point. A miss is a fault: the counter is bumped so the next commit
    /// grows the history, and the attempt retries.
    pub fn value_of(&mut self, core: &Arc<RefCore>) -> Result<Val, TxError> {
        self.running_info()?;
        if let Some(value) = self.vals.get(&core.id) {
            return Ok(value.clone());
        }
        {
            let state = core.read();
            if let Some(tval) = state.history.rfind(self.read_point) {
                return Ok(tval.value.clone());
            }
        }
        core.faults.fetch_add(1, Ordering::SeqCst);
        info!(
            "TX({}): fault reading ref {}, history growth requested",
            self.id, core.id
        );
        Err(TxError::Retry(RetryCause::Fault))
    }

    /// Buffers a write. The first write to a reference claims write intent.
    pub fn do_set(&mut self, core: &Arc<RefCore>, value: Val) -> Result<(), TxError> {
        self.running_info()?;
        if self.commutes.contains_key(&core.id) {
            return Err(TxError::SetAfterCommute);
        }
        if !self.sets.contains(&core.id) {
            self.lock_ref(core)?;
            self.sets.insert(core.id);
            self.touched.insert(core.id, core.clone());
        }
        self.vals.insert(core.id, value);
        Ok(())
    }

    /// Takes a read intent: others cannot acquire write intent on the
    /// reference while this transaction runs, and cannot barge their way in.
    pub fn do_ensure(&mut self, core: &Arc<RefCore>) -> Result<(), TxError> {
        let info = self.running_info()?.clone();
        if self.ensures.contains(&core.id) {
            return Ok(());
        }
        let mut state = core.write();
        if state.history.newest().point > self.read_point {
            return Err(TxError::Retry(RetryCause::Stale));
        }
        if let Some(other) = state.tinfo.clone() {
            if other.is_running() {
                if Arc::ptr_eq(&other, &info) {
                    // we already hold write intent, nothing to ensure
                    return Ok(());
                }
                drop(state);
                return Err(self.block_and_bail(other));
            }
        }
        state.ensured_by.push(info);
        drop(state);
        self.ensures.insert(core.id);
        self.touched.insert(core.id, core.clone());
        Ok(())
    }

    /// Defers `f` to commit time. The preview returned here is computed
    /// against the transaction-scoped value; the committed result is
    /// computed against the latest committed value at commit.
    pub fn do_commute(&mut self, core: &Arc<RefCore>, f: CommuteFn) -> Result<Val, TxError> {
        self.running_info()?;
        if !self.vals.contains_key(&core.id) {
            let newest = core.read().history.newest().value.clone();
            self.vals.insert(core.id, newest);
        }
        self.touched.insert(core.id, core.clone());
        self.commutes.entry(core.id).or_default().push(f.clone());
        let current = self.vals.get(&core.id).expect("pending value missing");
        let updated = f(current);
        self.vals.insert(core.id, updated.clone());
        Ok(updated)
    }

    /// Validates and publishes the attempt.
    ///
    /// Write locks for every written reference are taken in id order, each
    /// reference is revalidated against the read point, commutes are
    /// recomputed from the latest committed values, and one commit point
    /// covers every write. On any conflict the attempt unwinds with a retry
    /// signal and no reference shows a trace of it.
    pub fn commit(&mut self) -> Result<(), TxError> {
        let info = match &self.info {
            Some(info) => info.clone(),
            None => return Err(TxError::NotRunning),
        };
        if !info.compare_and_set(TxStatus::Running, TxStatus::Committing) {
            return Err(TxError::Retry(RetryCause::Killed));
        }

        let write_ids: BTreeSet<u64> = self
            .sets
            .iter()
            .chain(self.commutes.keys())
            .copied()
            .collect();

        // read intents of our own must not block our write locks
        let was_ensured: BTreeSet<u64> =
            write_ids.intersection(&self.ensures).copied().collect();
        for id in &was_ensured {
            let core = self
                .touched
                .get(id)
                .expect("touched reference missing")
                .clone();
            self.release_if_ensured(&core);
        }

        let cores: Vec<(u64, Arc<RefCore>)> = write_ids
            .iter()
            .map(|id| {
                (
                    *id,
                    self.touched
                        .get(id)
                        .expect("touched reference missing")
                        .clone(),
                )
            })
            .collect();

        let mut guards: Vec<(u64, RwLockWriteGuard<'_, RefState>)> =
            Vec::with_capacity(cores.len());
        for (id, core) in &cores {
            let mut state = core.try_write_for(LOCK_WAIT)?;
            state.ensured_by.retain(|i| i.is_running());
            if state
                .ensured_by
                .iter()
                .any(|i| !Arc::ptr_eq(i, &info))
            {
                debug!("TX({}): ref {} is ensured elsewhere", self.id, id);
                return Err(TxError::Retry(RetryCause::Busy));
            }
            if (self.sets.contains(id) || was_ensured.contains(id))
                && state.history.newest().point > self.read_point
            {
                debug!("TX({}): ref {} advanced past read point", self.id, id);
                return Err(TxError::Retry(RetryCause::Stale));
            }
            if !self.sets.contains(id) {
                // commuted only: claim write intent now, barging if allowed
                if let Some(other) = state.tinfo.clone() {
                    if other.is_running() && !Arc::ptr_eq(&other, &info) && !self.barge(&other) {
                        debug!("TX({}): ref {} claimed by a live transaction", self.id, id);
                        return Err(TxError::Retry(RetryCause::Busy));
                    }
                }
            }
            guards.push((*id, state));
        }

        // recompute commutes from the values committed by whoever ran before us
        for (id, guard) in &guards {
            if self.sets.contains(id) {
                continue;
            }
            if let Some(fns) = self.commutes.get(id) {
                let mut value = guard.history.newest().value.clone();
                for f in fns {
                    value = f(&value);
                }
                self.vals.insert(*id, value);
            }
        }

        if !guards.is_empty() {
            let commit_point = self.last_point.fetch_add(1, Ordering::SeqCst) + 1;
            let msecs = clock::millis();
            for ((_, core), (id, guard)) in cores.iter().zip(guards.iter_mut()) {
                let value = self
                    .vals
                    .get(id)
                    .expect("pending value missing")
                    .clone();
                let depth = guard.history.len();
                let min = core.min_history.load(Ordering::SeqCst);
                let max = core.max_history.load(Ordering::SeqCst);
                if depth < min || (core.faults.load(Ordering::SeqCst) > 0 && depth < max) {
                    guard.history.grow(value, commit_point, msecs);
                    core.faults.store(0, Ordering::SeqCst);
                } else {
                    guard.history.recycle(value, commit_point, msecs);
                }
            }
            info!(
                "TX({}): committed {} refs at point {}",
                self.id,
                guards.len(),
                commit_point
            );
        }
        drop(guards);

        info.stop(TxStatus::Committed);
        Ok(())
    }

    /// Releases read intents, stops the attempt with `status` if it is still
    /// running, and drops every buffer. Safe to call in any state.
    pub fn cleanup(&mut self, status: TxStatus) {
        self.release_ensures();
        self.stop(status);
        self.touched.clear();
    }

    fn running_info(&self) -> Result<&Arc<TxInfo>, TxError> {
        match &self.info {
            Some(info) if info.is_running() => Ok(info),
            Some(_) => Err(TxError::Retry(RetryCause::Killed)),
            None => Err(TxError::NotRunning),
        }
    }

    /// Claims write intent on a reference.
    ///
    /// Fails with a retry signal when the reference already advanced past
    /// our read point, is ensured elsewhere, or is claimed by a running
    /// transaction we cannot barge; in the latter cases the attempt first
    /// waits, bounded, for the conflicting transaction to stop.
    fn lock_ref(&mut self, core: &Arc<RefCore>) -> Result<(), TxError> {
        let info = self.running_info()?.clone();
        self.release_if_ensured(core);
        let mut state = core.try_write_for(LOCK_WAIT)?;
        if state.history.newest().point > self.read_point {
            debug!(
                "TX({}): ref {} advanced past read point {}",
                self.id, core.id, self.read_point
            );
            return Err(TxError::Retry(RetryCause::Stale));
        }
        state.ensured_by.retain(|i| i.is_running());
        if let Some(ensurer) = state
            .ensured_by
            .iter()
            .find(|i| !Arc::ptr_eq(i, &info))
            .cloned()
        {
            drop(state);
            debug!("TX({}): ref {} is ensured elsewhere", self.id, core.id);
            return Err(self.block_and_bail(ensurer));
        }
        if let Some(other) = state.tinfo.clone() {
            if other.is_running() && !Arc::ptr_eq(&other, &info) {
                if !self.barge(&other) {
                    drop(state);
                    debug!(
                        "TX({}): lost ref {} to an older transaction",
                        self.id, core.id
                    );
                    return Err(self.block_and_bail(other));
                }
            }
        }
        state.tinfo = Some(info);
        Ok(())
    }

    /// Wound-wait: an old enough transaction kills a younger claimant and
    /// takes the reference. Returns whether the barge won.
    fn barge(&self, other: &Arc<TxInfo>) -> bool {
        let elapsed = clock::nanos().saturating_sub(self.start_time);
        let mut barged = false;
        if elapsed >= BARGE_WAIT_NANOS && self.start_point < other.start_point {
            barged = other.compare_and_set(TxStatus::Running, TxStatus::Killed);
            if barged {
                info!(
                    "TX({}): barged transaction started at point {}",
                    self.id, other.start_point
                );
                other.broadcast();
            }
        }
        barged
    }

    /// Loser's path: stop this attempt, wait (bounded) for the winner to
    /// stop, and hand back the retry signal.
    fn block_and_bail(&mut self, other: Arc<TxInfo>) -> TxError {
        self.stop(TxStatus::Retry);
        other.wait_while_running(LOCK_WAIT);
        TxError::Retry(RetryCause::Busy)
    }

    fn stop(&mut self, status: TxStatus) {
        if let Some(info) = &self.info {
            if info.is_running() {
                info.stop(status);
            } else {
                info.broadcast();
            }
        }
        self.vals.clear();
        self.sets.clear();
        self.commutes.clear();
    }

    fn release_if_ensured(&mut self, core: &Arc<RefCore>) {
        if self.ensures.remove(&core.id) {
            if let Some(info) = &self.info {
                let mut state = core.write();
                state.ensured_by.retain(|i| !Arc::ptr_eq(i, info));
            }
        }
    }

    fn release_ensures(&mut self) {
        if let Some(info) = self.info.clone() {
            for id in std::mem::take(&mut self.ensures) {
                if let Some(core) = self.touched.get(&id) {
                    let mut state = core.write();
                    state.ensured_by.retain(|i| !Arc::ptr_eq(i, &info));
                }
            }
        }
        self.ensures.clear();
    }
}
