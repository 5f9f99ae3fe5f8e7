// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Persistent STM
//!
//! Two coupled primitives for safe concurrent shared state:
//!
//! - [`PersistentHashMap`]: an immutable hash-array-mapped trie. Mutations
//!   return new maps sharing every unchanged subtree, so any number of
//!   versions coexist and reads never need a lock.
//! - [`Stm`] and [`Ref`]: a software transactional memory. A [`Ref`] is a
//!   mutable cell whose committed values form a timestamped history;
//!   transactions read a consistent snapshot across every reference they
//!   touch and publish their writes atomically at a single commit point.
//!   Conflicting transactions retry, wound-wait barging keeps them live, and
//!   a bounded retry count keeps failure deterministic.
//!
//! The two are designed to meet: a persistent map inside a reference gives
//! shared, transactionally updated state with constant-time snapshots.
//!
//! ```
//! use persistent_stm::{PersistentHashMap, Stm};
//!
//! let stm = Stm::default();
//! let index = stm.create(PersistentHashMap::new());
//!
//! let r = index.clone();
//! stm.atomic(move || r.alter(|m| m.insert("answer", 42))).unwrap();
//!
//! assert_eq!(index.deref().unwrap().get(&"answer"), Some(&42));
//! ```

pub mod clock;
pub mod errors;
pub mod hamt;
pub mod stm;

pub use errors::StmError;
pub use hamt::{Iter, Keys, PersistentHashMap, Values};
pub use stm::{reference::Ref, stm::Stm};
