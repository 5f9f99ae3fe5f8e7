// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Monotonic clock utilities.
//!
//! Timestamps produced here annotate committed history entries and seed
//! per-transaction start times. They are informational: transactional
//! correctness rests solely on the logical commit-point counter.

use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Milliseconds elapsed since the process epoch.
pub fn millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Nanoseconds elapsed since the process epoch.
pub fn nanos() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Seconds elapsed since the process epoch.
pub fn secs() -> u64 {
    EPOCH.elapsed().as_secs()
}
