// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::module_inception)]

//! The transaction engine: reference cells with MVCC value histories and the
//! snapshot-isolated, retrying transactions that mutate them.

pub(crate) mod error;
pub(crate) mod history;
pub(crate) mod info;
pub mod reference;
pub mod stm;
pub(crate) mod transaction;

use std::{any::Any, sync::Arc};

/// Type-erased reference value. References are generically typed at the API
/// boundary; inside the engine values travel erased so one transaction can
/// span references of different types.
pub(crate) type Val = Arc<dyn Any + Send + Sync>;

/// Type-erased commute function, re-applied at commit time.
pub(crate) type CommuteFn = Arc<dyn Fn(&Val) -> Val + Send + Sync>;
