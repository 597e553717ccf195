// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # jsonheap
//!
//! An in-memory document model for JSON-shaped trees, engineered for
//! minimal footprint and locality rather than for parsing:
//!
//! - every value is a 16-byte packed cell, every object member 24 bytes;
//! - strings under 14 bytes live inline in the cell, everything longer is
//!   interned once in a string pool that shares its allocator with its
//!   own payload;
//! - homogeneous arrays of booleans, 64-bit integers or doubles are raw
//!   packed buffers with no per-element tags;
//! - all container storage comes from slab pool allocators with dead-cell
//!   recycling and a fallback list for oversized requests.
//!
//! Parsing and serialization stay outside: a tokenizer drives the
//! [EventSink] events of a [BuildHandler], and [walk] replays a document
//! through the same grammar.
//!
//! ```
//! use jsonheap::DynamicDocument;
//!
//! let mut doc = DynamicDocument::new();
//! let mut root = doc.root();
//! root.entry("name").set_str("jsonheap");
//! root.entry("answer").set_i64(42);
//! {
//!     let mut tags = root.entry("tags");
//!     tags.to_iarray();
//!     tags.iarray_push(1);
//!     tags.iarray_push(2);
//! }
//! assert_eq!(doc.croot().object_len(), 3);
//! ```
//!
//! Documents are single-threaded by contract; a string pool may be shared
//! between documents on one thread via [SharedStringPool].

mod alloc;
mod containers;
mod document;
mod error;
mod handler;
mod strings;
mod value;
mod view;
mod walk;

/// Default per-chunk byte size of both pool allocators.
pub const DEFAULT_CHUNK_SIZE: u16 = 32768;

pub use short_string::ShortString;

pub use alloc::{BaseAlloc, CompactPool, CompactRef, HeapAlloc, ObjectPool, StackAlloc, BASE_ALIGN};
pub use document::{
    Document, DynamicDocument, MemberMut, PathStep, SharedStringPool, ValueMut,
};
pub use error::AccessError;
pub use handler::{BuildHandler, EventSink};
pub use strings::interned::{PooledStr, MAX_STR_LEN};
pub use strings::pool::StringPool;
pub use value::{Meta, Tag};
pub use view::{ArrayIter, MemberIter, MemberRef, ValueRef};
pub use walk::walk;
