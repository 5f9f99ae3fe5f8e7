// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Persistent hash map: an immutable hash-array-mapped trie with 64-way
//! branching and structural sharing between versions.

pub mod iter;
pub mod map;
pub(crate) mod node;

pub use iter::{Iter, Keys, Values};
pub use map::PersistentHashMap;
