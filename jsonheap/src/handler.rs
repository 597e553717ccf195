// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming build handler.
//!
//! Consumes the 13-event token grammar and assembles a document bottom-up
//! on a byte stack of half-built cells. Arrays specialize themselves by
//! observing the values that arrive: a run of booleans, 64-bit integers or
//! doubles stays a raw packed buffer; any other mix widens the pending run
//! to generic value cells in place. On container end the finished run is
//! copied into the object pool in one shot.

use std::mem::size_of;
use std::ptr::NonNull;
use std::rc::Rc;

use short_string::ShortString;
use tracing::debug;

use crate::alloc::{BaseAlloc, HeapAlloc};
use crate::document::Document;
use crate::strings::interned::PooledStr;
use crate::value::{PackedMember, PackedValue, Tag, Widen, BIG_CAPA};
use crate::DEFAULT_CHUNK_SIZE;

const CELL: usize = size_of::<PackedValue>();
const MEMBER: usize = size_of::<PackedMember>();
const STACK_INITIAL: usize = 1024;

/// The event grammar shared by the build handler and the walker. A
/// document builder never fails on well-formed input; sinks with early
/// exit return false.
pub trait EventSink {
    fn start_object(&mut self) -> bool;
    fn end_object(&mut self, member_count: u32) -> bool;
    fn start_array(&mut self) -> bool;
    fn end_array(&mut self, element_count: u32) -> bool;
    fn push_key(&mut self, key: &str) -> bool;
    fn push_null(&mut self) -> bool;
    fn push_bool(&mut self, b: bool) -> bool;
    fn push_int(&mut self, i: i32) -> bool {
        self.push_int64(i as i64)
    }
    fn push_int64(&mut self, i: i64) -> bool;
    /// Folds into the signed event so integer runs stay specialized.
    fn push_uint(&mut self, u: u32) -> bool {
        self.push_int64(u as i64)
    }
    fn push_uint64(&mut self, u: u64) -> bool;
    fn push_double(&mut self, d: f64) -> bool;
    fn push_string(&mut self, s: &str) -> bool;
}

/// Growable byte stack over the base allocator; 8-aligned, 1 KiB initial,
/// doubling growth.
struct EventStack<A: BaseAlloc> {
    base: A,
    size: usize,
    capa: usize,
    data: *mut u8,
}

impl<A: BaseAlloc> EventStack<A> {
    fn new(base: A) -> EventStack<A> {
        let data = base.allocate(STACK_INITIAL).as_ptr();
        EventStack {
            base,
            size: 0,
            capa: STACK_INITIAL,
            data,
        }
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn end(&self) -> *mut u8 {
        // SAFETY: size <= capa.
        unsafe { self.data.add(self.size) }
    }

    /// The topmost value cell (or the value slot of the topmost member).
    fn last_value(&self) -> *mut PackedValue {
        debug_assert!(self.size >= CELL);
        // SAFETY: size-checked.
        unsafe { self.data.add(self.size - CELL) as *mut PackedValue }
    }

    fn reserve(&mut self, need: usize) {
        if self.capa >= need {
            return;
        }
        let grown = if self.capa > 0 { self.capa * 2 } else { 1 };
        let new_capa = need.max(grown);
        let fresh = self.base.allocate(new_capa).as_ptr();
        if self.size > 0 {
            // SAFETY: distinct blocks, `size` initialized bytes.
            unsafe { std::ptr::copy_nonoverlapping(self.data, fresh, self.size) };
        }
        if self.capa > 0 {
            // SAFETY: `data` came from this base allocator with `capa`.
            self.base
                .deallocate(unsafe { NonNull::new_unchecked(self.data) }, self.capa);
        }
        self.data = fresh;
        self.capa = new_capa;
    }

    fn increment(&mut self, n: usize) {
        debug_assert!(self.size + n <= self.capa);
        self.size += n;
    }

    fn decrement(&mut self, n: usize) {
        debug_assert!(self.size >= n);
        self.size -= n;
    }

    fn clear(&mut self) {
        self.size = 0;
    }

    fn release(&mut self) {
        if self.capa > 0 {
            // SAFETY: as in reserve.
            self.base
                .deallocate(unsafe { NonNull::new_unchecked(self.data) }, self.capa);
        }
        self.data = std::ptr::null_mut();
        self.size = 0;
        self.capa = 0;
    }
}

impl<A: BaseAlloc> Drop for EventStack<A> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Streaming builder scoped to one document.
pub struct BuildHandler<
    'doc,
    A: BaseAlloc + Clone = Rc<HeapAlloc>,
    const STR_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
    const OBJ_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
> {
    doc: &'doc mut Document<A, STR_CHUNK, OBJ_CHUNK>,
    stack: EventStack<A>,
    member_val: bool,
    root_init: bool,
    int_to_double: bool,
    array_size: u32,
    array_type: Tag,
}

impl<A: BaseAlloc + Clone, const STR_CHUNK: u16, const OBJ_CHUNK: u16>
    Document<A, STR_CHUNK, OBJ_CHUNK>
{
    /// A streaming builder writing into this document's root.
    ///
    /// With `allow_int_to_double`, an integer run that meets a double
    /// promotes to a double array instead of degenerating to generic
    /// cells.
    pub fn make_handler(
        &mut self,
        allow_int_to_double: bool,
    ) -> BuildHandler<'_, A, STR_CHUNK, OBJ_CHUNK> {
        let base = self.pool.borrow().base().clone();
        BuildHandler {
            doc: self,
            stack: EventStack::new(base),
            member_val: false,
            root_init: false,
            int_to_double: allow_int_to_double,
            array_size: 0,
            array_type: Tag::Null,
        }
    }
}

impl<'doc, A: BaseAlloc + Clone, const STR_CHUNK: u16, const OBJ_CHUNK: u16>
    BuildHandler<'doc, A, STR_CHUNK, OBJ_CHUNK>
{
    pub fn stack_capacity(&self) -> usize {
        self.stack.capa
    }

    /// Resets the handler for a fresh event stream, keeping the stack
    /// buffer.
    pub fn clear(&mut self) {
        self.stack.clear();
        self.member_val = false;
        self.root_init = false;
        self.array_size = 0;
        self.array_type = Tag::Null;
    }

    /// Ends the build: the stack must be balanced-out, its buffer is
    /// released, and the document is optionally shrunk.
    #[track_caller]
    pub fn finalize(&mut self, shrink_document: bool, rehash_string_pool: bool) {
        assert!(
            self.stack.is_empty(),
            "finalize with unbalanced container events"
        );
        self.stack.release();
        self.member_val = false;
        self.root_init = false;
        self.array_size = 0;
        self.array_type = Tag::Null;
        debug!(shrink_document, rehash_string_pool, "build handler finalized");
        if shrink_document {
            self.doc.shrink(rehash_string_pool);
        }
    }

    fn str_cell(&mut self, s: &str) -> PackedValue {
        match ShortString::try_from_str(s) {
            Some(short) => PackedValue::from_short(short),
            None => {
                let (interned, _) = self.doc.pool.borrow_mut().provide(s, false);
                // SAFETY: owned pool bytes live until the pool drops them.
                let bytes = unsafe { PooledStr::bytes(interned.as_ptr()) };
                PackedValue::from_long(bytes.as_ptr(), s.len() as u32)
            }
        }
    }

    unsafe fn str_cell_borrowed(&mut self, s: &str) -> PackedValue {
        match ShortString::try_from_str(s) {
            Some(short) => PackedValue::from_short(short),
            None => {
                let (interned, _) =
                    unsafe { self.doc.pool.borrow_mut().provide_borrowed(s, false) };
                let bytes = unsafe { PooledStr::bytes(interned.as_ptr()) };
                PackedValue::from_long(bytes.as_ptr(), s.len() as u32)
            }
        }
    }

    /// Widens the pending specialized run to generic value cells, in
    /// reverse order so sources are read before their slots are clobbered.
    fn widen_run<T: Widen>(&mut self) {
        let count = self.array_size as usize;
        let esize = size_of::<T>();
        let added = count * (CELL - esize);
        // Headroom for the widened run plus the incoming cell.
        self.stack.reserve(self.stack.size + added + CELL);
        // SAFETY: the run occupies the top `count * esize` stack bytes.
        let base = unsafe { self.stack.end().sub(count * esize) };
        let src = base as *const T;
        let dst = base as *mut PackedValue;
        for i in (0..count).rev() {
            // SAFETY: slot i is read before any write at or below it.
            unsafe {
                let v = src.add(i).read();
                dst.add(i).write(v.widen());
            }
        }
        self.stack.increment(added);
    }

    /// Array-context bookkeeping for an arriving value of kind `kind`.
    /// Returns true when the array is (still) specialized for it.
    fn converted_for(&mut self, kind: Tag) -> bool {
        debug_assert!(kind.is_array_kind());
        if self.array_type == kind || self.array_type == Tag::Null {
            self.array_size += 1;
            self.array_type = kind;
            return true;
        }

        if self.int_to_double {
            if self.array_type == Tag::DoubleArray && kind == Tag::IntArray {
                self.array_size += 1;
                return true;
            }
            if self.array_type == Tag::IntArray && kind == Tag::DoubleArray {
                // Same slot width: widen the integer run in place.
                debug_assert!(self.array_size > 0);
                let count = self.array_size as usize;
                // SAFETY: the run occupies the top `count * 8` stack bytes.
                let data = unsafe { self.stack.end().sub(count * 8) } as *mut i64;
                for i in 0..count {
                    // SAFETY: each 8-byte slot is read then overwritten.
                    unsafe {
                        let v = *data.add(i);
                        (data as *mut f64).add(i).write(v as f64);
                    }
                }
                self.array_size += 1;
                self.array_type = Tag::DoubleArray;
                return true;
            }
        }

        match self.array_type {
            Tag::BoolArray => self.widen_run::<bool>(),
            Tag::IntArray => self.widen_run::<i64>(),
            Tag::DoubleArray => self.widen_run::<f64>(),
            Tag::Array => {}
            _ => debug_assert!(false, "value event outside any array run"),
        }
        self.array_type = Tag::Array;
        false
    }

    /// Writes a finished scalar into the pending member's value slot.
    fn fill_member(&mut self, cell: PackedValue) {
        debug_assert!(unsafe { (*self.stack.last_value()).tag() } == Tag::Null);
        // SAFETY: the member's value slot is the topmost cell.
        unsafe { self.stack.last_value().write(cell) };
        self.member_val = false;
    }

    /// Pushes a finished value cell onto the stack.
    fn push_cell(&mut self, cell: PackedValue) {
        self.stack.reserve(self.stack.size + CELL);
        // SAFETY: reserved above.
        unsafe { (self.stack.end() as *mut PackedValue).write(cell) };
        self.stack.increment(CELL);
    }

    fn push_scalar(&mut self, cell: PackedValue) {
        if self.member_val {
            self.fill_member(cell);
        } else {
            self.converted_for(Tag::Array);
            self.push_cell(cell);
        }
    }

    fn start_container(&mut self, tag: Tag) {
        if !self.root_init {
            match tag {
                Tag::Object => self.doc.root().to_object(),
                _ => self.doc.root().to_array(),
            }
            self.root_init = true;
        } else if self.member_val {
            self.fill_member(PackedValue::container(tag));
        } else {
            self.converted_for(Tag::Array);
            self.push_cell(PackedValue::container(tag));
        }
    }

    /// Copies the finished run of `count` packed `T` records into the
    /// object pool and points the enclosing cell (stack top, or the root)
    /// at it, retagged to `kind`.
    fn end_container<T>(&mut self, kind: Tag, count: u32) {
        let mem_size = count as usize * size_of::<T>();
        // SAFETY: the run occupies the top `mem_size` stack bytes.
        let src = unsafe { self.stack.end().sub(mem_size) };
        let ptr = if count < BIG_CAPA as u32 {
            self.doc.objects.mem_push(src, mem_size as u32)
        } else {
            self.doc.objects.mem_push_big::<T>(src, count)
        };
        self.stack.decrement(mem_size);
        debug_assert!(self.stack.size == 0 || self.stack.size >= CELL);

        let val: *mut PackedValue = if self.stack.is_empty() {
            &mut self.doc.root
        } else {
            self.stack.last_value()
        };
        // SAFETY: `val` is the enclosing container cell, initialized by
        // its start event with the shared container layout.
        unsafe {
            debug_assert!((*val).tag().is_container());
            (*val).force_tag(kind);
            match kind {
                Tag::Object => (*val).set_raw::<PackedMember>(ptr.as_ptr(), count),
                Tag::Array => (*val).set_raw::<PackedValue>(ptr.as_ptr(), count),
                Tag::BoolArray => (*val).set_raw::<bool>(ptr.as_ptr(), count),
                Tag::IntArray => (*val).set_raw::<i64>(ptr.as_ptr(), count),
                Tag::DoubleArray => (*val).set_raw::<f64>(ptr.as_ptr(), count),
                _ => unreachable!(),
            }
        }
    }

    /// Zero-copy member key: the pool entry borrows the caller's bytes.
    ///
    /// # Safety
    /// The bytes behind `key` must outlive the document's string pool
    /// entry.
    pub unsafe fn push_key_borrowed(&mut self, key: &str) -> bool {
        debug_assert!(!self.member_val);
        let (interned, _) = unsafe { self.doc.pool.borrow_mut().provide_borrowed(key, true) };
        self.push_member_cell(interned.as_ptr());
        true
    }

    /// Zero-copy string value.
    ///
    /// # Safety
    /// As [Self::push_key_borrowed].
    pub unsafe fn push_string_borrowed(&mut self, s: &str) -> bool {
        let cell = unsafe { self.str_cell_borrowed(s) };
        self.push_scalar(cell);
        true
    }

    fn push_member_cell(&mut self, key: *const PooledStr) {
        self.stack.reserve(self.stack.size + MEMBER);
        // SAFETY: reserved above.
        unsafe { (self.stack.end() as *mut PackedMember).write(PackedMember::new(key)) };
        self.stack.increment(MEMBER);
        self.member_val = true;
    }
}

impl<A: BaseAlloc + Clone, const STR_CHUNK: u16, const OBJ_CHUNK: u16> EventSink
    for BuildHandler<'_, A, STR_CHUNK, OBJ_CHUNK>
{
    fn start_object(&mut self) -> bool {
        self.start_container(Tag::Object);
        true
    }

    fn end_object(&mut self, member_count: u32) -> bool {
        debug_assert!(!self.member_val);
        if member_count > 0 {
            self.end_container::<PackedMember>(Tag::Object, member_count);
        }
        self.array_type = Tag::Array;
        true
    }

    fn start_array(&mut self) -> bool {
        self.start_container(Tag::Array);
        self.array_size = 0;
        self.array_type = Tag::Null;
        true
    }

    fn end_array(&mut self, element_count: u32) -> bool {
        debug_assert!(!self.member_val);
        if element_count > 0 {
            debug_assert!(self.array_type != Tag::Null);
            match self.array_type {
                Tag::Array => self.end_container::<PackedValue>(Tag::Array, element_count),
                Tag::BoolArray => self.end_container::<bool>(Tag::BoolArray, element_count),
                Tag::IntArray => self.end_container::<i64>(Tag::IntArray, element_count),
                Tag::DoubleArray => self.end_container::<f64>(Tag::DoubleArray, element_count),
                _ => debug_assert!(false, "end_array outside an array run"),
            }
        }
        self.array_type = Tag::Array;
        true
    }

    fn push_key(&mut self, key: &str) -> bool {
        debug_assert!(!self.member_val);
        let (interned, _) = self.doc.pool.borrow_mut().provide(key, true);
        self.push_member_cell(interned.as_ptr());
        true
    }

    fn push_null(&mut self) -> bool {
        if self.member_val {
            debug_assert!(unsafe { (*self.stack.last_value()).tag() } == Tag::Null);
            self.member_val = false;
        } else {
            self.converted_for(Tag::Array);
            self.push_cell(PackedValue::NULL);
        }
        true
    }

    fn push_bool(&mut self, b: bool) -> bool {
        if self.member_val {
            self.fill_member(PackedValue::from_bool(b));
        } else if self.converted_for(Tag::BoolArray) {
            self.stack.reserve(self.stack.size + 1);
            // SAFETY: reserved above.
            unsafe { (self.stack.end() as *mut bool).write(b) };
            self.stack.increment(1);
        } else {
            self.push_cell(PackedValue::from_bool(b));
        }
        true
    }

    fn push_int64(&mut self, i: i64) -> bool {
        if self.member_val {
            self.fill_member(PackedValue::from_i64(i));
        } else if self.converted_for(Tag::IntArray) {
            self.stack.reserve(self.stack.size + 8);
            if self.array_type == Tag::IntArray {
                // SAFETY: reserved above; run start is 8-aligned.
                unsafe { (self.stack.end() as *mut i64).write(i) };
            } else {
                debug_assert!(self.array_type == Tag::DoubleArray);
                // SAFETY: as above.
                unsafe { (self.stack.end() as *mut f64).write(i as f64) };
            }
            self.stack.increment(8);
        } else {
            self.push_cell(PackedValue::from_i64(i));
        }
        true
    }

    /// Values that fit i64 fold into the signed event so integer runs
    /// stay specialized; larger values keep the unsigned tag.
    fn push_uint64(&mut self, u: u64) -> bool {
        if u <= i64::MAX as u64 {
            return self.push_int64(u as i64);
        }
        self.push_scalar(PackedValue::from_u64(u));
        true
    }

    fn push_double(&mut self, d: f64) -> bool {
        if self.member_val {
            self.fill_member(PackedValue::from_f64(d));
        } else if self.converted_for(Tag::DoubleArray) {
            self.stack.reserve(self.stack.size + 8);
            // SAFETY: reserved above; run start is 8-aligned.
            unsafe { (self.stack.end() as *mut f64).write(d) };
            self.stack.increment(8);
        } else {
            self.push_cell(PackedValue::from_f64(d));
        }
        true
    }

    fn push_string(&mut self, s: &str) -> bool {
        let cell = self.str_cell(s);
        self.push_scalar(cell);
        true
    }
}
