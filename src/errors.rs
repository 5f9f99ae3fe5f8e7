// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::stm::error::TxError;
use thiserror::Error as DeriveError;

/// Errors surfaced by the transactional API.
///
/// [`StmError::Retry`] is primarily an engine-internal signal: reference
/// operations return it when the current attempt can no longer produce a
/// consistent outcome, and the retry loop in [`crate::Stm::atomic`] consumes
/// it. Transaction bodies must propagate it with `?` and never swallow it.
/// It only reaches callers through the manual [`crate::Stm::commit`] surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DeriveError)]
pub enum StmError {
    /// The per-thread transaction could not be initialized.
    #[error("transaction initialization failed")]
    Init,

    /// The current attempt hit a conflict and must be retried.
    #[error("transaction conflict, retry required")]
    Retry,

    /// The transaction kept conflicting until the bounded retry count ran out.
    #[error("transaction retry limit exceeded after {attempts} attempts")]
    RetryLimit { attempts: u64 },

    /// A transactional reference operation was invoked with no transaction
    /// running on the calling thread.
    #[error("no transaction running on this thread")]
    NotInTransaction,

    /// A reference was set after being commuted in the same transaction.
    #[error("cannot set a reference after commuting it in the same transaction")]
    SetAfterCommute,
}

impl From<TxError> for StmError {
    fn from(err: TxError) -> Self {
        match err {
            TxError::Retry(_) => StmError::Retry,
            TxError::NotRunning => StmError::NotInTransaction,
            TxError::SetAfterCommute => StmError::SetAfterCommute,
        }
    }
}
