// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Why an attempt had to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeriveError)]
pub(crate) enum RetryCause {
    /// The reference advanced past the transaction's read point.
    #[error("reference advanced past the read point")]
    Stale,

    /// Another running transaction holds write intent or an ensure on the
    /// reference and could not be barged.
    #[error("reference claimed by a conflicting transaction")]
    Busy,

    /// The transaction was stopped, typically barged by an older one.
    #[error("transaction was stopped")]
    Killed,

    /// No committed entry in the reference's history is visible at the
    /// transaction's read point.
    #[error("no committed value visible at the read point")]
    Fault,

    /// A reference lock could not be acquired within the wait bound.
    #[error("reference lock acquisition timed out")]
    LockTimeout,
}

/// Engine-internal error type. Converted to [`crate::StmError`] at the
/// public API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeriveError)]
pub(crate) enum TxError {
    /// The attempt cannot proceed consistently and must be retried.
    #[error("transaction must be retried: {0}")]
    Retry(RetryCause),

    /// No transaction has begun on the calling thread.
    #[error("no transaction running on this thread")]
    NotRunning,

    /// Set on a reference that already has pending commutes.
    #[error("cannot set a reference after commuting it")]
    SetAfterCommute,
}
