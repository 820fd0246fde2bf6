// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Intrusive collections: data structures threaded through
//! fields embedded in the items they store, rather than through
//! separately allocated nodes.
//!
//! These are used throughout the memory management core to
//! track free physical pages and free virtual ranges without
//! needing an allocator of their own to do so.

#![no_std]
#![deny(clippy::wildcard_imports)]
#![deny(missing_docs)]
#![deny(unused)]

#[cfg(test)]
extern crate alloc;

pub mod avl;
pub mod list;

pub use avl::AvlTree;
pub use list::IntrusiveList;
