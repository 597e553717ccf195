// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Document root, editor cursors, and the release walk.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::rc::Rc;

use short_string::ShortString;
use tracing::debug;

use crate::alloc::{BaseAlloc, HeapAlloc, ObjectPool};
use crate::containers;
use crate::error::AccessError;
use crate::strings::interned::PooledStr;
use crate::strings::pool::StringPool;
use crate::value::{big, ContElem, Meta, PackedMember, PackedValue, Tag, BIG_CAPA};
use crate::view::{MemberRef, ValueRef};
use crate::DEFAULT_CHUNK_SIZE;

/// A string pool shared between documents on one thread. Documents built
/// over the same pool deduplicate strings across each other.
pub type SharedStringPool<A = Rc<HeapAlloc>, const CHUNK: u16 = DEFAULT_CHUNK_SIZE> =
    Rc<RefCell<StringPool<A, CHUNK>>>;

/// One step of a path from the document root to a cell.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PathStep<'k> {
    Index(u32),
    Key(&'k str),
}

/// In-memory JSON document: a root value cell, a (shareable) string pool,
/// and the slab pool every container buffer comes from. The object pool
/// borrows the string pool's base allocator handle so instrumentation
/// spans both.
pub struct Document<
    A: BaseAlloc + Clone = Rc<HeapAlloc>,
    const STR_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
    const OBJ_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
> {
    pub(crate) root: PackedValue,
    pub(crate) pool: SharedStringPool<A, STR_CHUNK>,
    pub(crate) objects: ObjectPool<A, OBJ_CHUNK>,
}

/// Document over the process heap with the default chunk sizes.
pub type DynamicDocument = Document<Rc<HeapAlloc>, DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_SIZE>;

impl DynamicDocument {
    pub fn new() -> DynamicDocument {
        Document::with_base(Rc::new(HeapAlloc::new()))
    }
}

impl Default for DynamicDocument {
    fn default() -> Self {
        DynamicDocument::new()
    }
}

impl<A: BaseAlloc + Clone, const STR_CHUNK: u16, const OBJ_CHUNK: u16>
    Document<A, STR_CHUNK, OBJ_CHUNK>
{
    /// A document with its own fresh string pool over `base`.
    pub fn with_base(base: A) -> Self {
        let objects = ObjectPool::new(base.clone());
        Document {
            root: PackedValue::NULL,
            pool: Rc::new(RefCell::new(StringPool::new(base))),
            objects,
        }
    }

    /// A document over an existing (possibly shared) string pool.
    pub fn with_pool(pool: SharedStringPool<A, STR_CHUNK>) -> Self {
        let base = pool.borrow().base().clone();
        Document {
            root: PackedValue::NULL,
            pool,
            objects: ObjectPool::new(base),
        }
    }

    /// A pool for constructing documents that deduplicate strings across
    /// each other.
    pub fn make_shared_string_pool(base: A) -> SharedStringPool<A, STR_CHUNK> {
        Rc::new(RefCell::new(StringPool::new(base)))
    }

    /// Mutable cursor at the root cell.
    pub fn root(&mut self) -> ValueMut<'_, A, STR_CHUNK, OBJ_CHUNK> {
        let value = NonNull::from(&mut self.root);
        ValueMut { doc: self, value }
    }

    /// Read cursor at the root cell.
    pub fn croot(&self) -> ValueRef<'_> {
        ValueRef::new(&self.root)
    }

    pub fn string_pool(&self) -> SharedStringPool<A, STR_CHUNK> {
        Rc::clone(&self.pool)
    }

    pub fn object_allocator(&self) -> &ObjectPool<A, OBJ_CHUNK> {
        &self.objects
    }

    /// Drops the whole tree and every string.
    ///
    /// With a shared pool this would strand sibling documents; sole
    /// ownership is debug-asserted.
    pub fn clear(&mut self) {
        self.clear_objects();
        debug_assert!(
            Rc::strong_count(&self.pool) == 1,
            "clear() on a document sharing its string pool"
        );
        // SAFETY: the tree was just dropped, so no cell of this document
        // references the pool; sole ownership is asserted above.
        unsafe { self.pool.borrow_mut().clear() };
    }

    /// Drops the tree, keeping the interned strings.
    pub fn clear_objects(&mut self) {
        self.root.force_null();
        self.objects.clear();
    }

    /// Drops every interned string, keeping the tree's containers.
    ///
    /// # Safety
    /// No long-string cell or member key of any document sharing this
    /// pool may be read afterwards; callers normally pair this with
    /// [Self::clear_objects].
    pub unsafe fn clear_strings(&mut self) {
        unsafe { self.pool.borrow_mut().clear() };
    }

    /// Returns unused chunks of both pools; optionally rehashes the
    /// string pool to a tight bucket count first.
    pub fn shrink(&mut self, rehash_string_pool: bool) {
        debug!(rehash_string_pool, "document shrink");
        self.objects.shrink();
        self.pool.borrow_mut().shrink(rehash_string_pool);
    }

    /// Exchanges the cells at two root-relative paths.
    ///
    /// Overlapping paths (one a prefix of the other) would detach a
    /// subtree into itself and are rejected.
    pub fn swap(&mut self, a: &[PathStep], b: &[PathStep]) -> Result<(), AccessError> {
        fn is_prefix(short: &[PathStep], long: &[PathStep]) -> bool {
            short.len() <= long.len() && short.iter().zip(long).all(|(a, b)| a == b)
        }
        if is_prefix(a, b) || is_prefix(b, a) {
            return Err(AccessError::OverlappingSwap);
        }
        let pa = self.resolve_path(a)?;
        let pb = self.resolve_path(b)?;
        // SAFETY: distinct non-overlapping cells of this document.
        unsafe { std::ptr::swap(pa.as_ptr(), pb.as_ptr()) };
        Ok(())
    }

    fn resolve_path(&mut self, path: &[PathStep]) -> Result<NonNull<PackedValue>, AccessError> {
        let mut cur: *mut PackedValue = &mut self.root;
        for step in path {
            // SAFETY: `cur` always points at a live cell of this tree.
            let cell = unsafe { &*cur };
            match *step {
                PathStep::Index(index) => {
                    if cell.tag() != Tag::Array {
                        return Err(AccessError::NotAContainer);
                    }
                    if index >= cell.cont_size() {
                        return Err(AccessError::OutOfRange {
                            index,
                            len: cell.cont_size(),
                        });
                    }
                    cur = unsafe { cell.data::<PackedValue>().add(index as usize) };
                }
                PathStep::Key(key) => {
                    if cell.tag() != Tag::Object {
                        return Err(AccessError::NotAContainer);
                    }
                    let interned = self
                        .pool
                        .borrow()
                        .get(key)
                        .ok_or(AccessError::KeyNotFound)?;
                    let mut found = None;
                    let data = cell.data::<PackedMember>();
                    for i in 0..cell.cont_size() {
                        // SAFETY: index-checked member slot.
                        let member = unsafe { &*data.add(i as usize) };
                        if std::ptr::eq(member.key, interned.as_ptr()) {
                            found = Some(unsafe {
                                &mut (*data.add(i as usize)).value as *mut PackedValue
                            });
                            break;
                        }
                    }
                    cur = found.ok_or(AccessError::KeyNotFound)?;
                }
            }
        }
        // SAFETY: `cur` was derived from live cells.
        Ok(unsafe { NonNull::new_unchecked(cur) })
    }
}

/// Releases a cell's owned storage back to the object pool with an
/// explicit worklist, so pathological nesting cannot overflow the thread
/// stack. Strings are borrowed from the pool and never freed here.
pub(crate) fn release_value<A: BaseAlloc, const C: u16>(
    opa: &mut ObjectPool<A, C>,
    root: PackedValue,
) {
    fn free_storage<T: ContElem, A: BaseAlloc, const C: u16>(
        opa: &mut ObjectPool<A, C>,
        cell: &PackedValue,
    ) {
        let raw = cell.cont_capa_raw();
        if raw < BIG_CAPA {
            if raw > 0 {
                opa.deallocate(cell.cont_ptr(), raw as u32 * std::mem::size_of::<T>() as u32);
            }
        } else {
            opa.deallocate(cell.cont_ptr(), big::alloc_size::<T>(cell.capacity::<T>()));
        }
    }

    let mut work: Vec<PackedValue> = Vec::new();
    let mut current = root;
    loop {
        match current.tag() {
            Tag::Object => {
                let data = current.data::<PackedMember>();
                for i in 0..current.cont_size() {
                    // SAFETY: index-checked member slot; the copy outlives
                    // the buffer freed below.
                    work.push(unsafe { (*data.add(i as usize)).value });
                }
                free_storage::<PackedMember, A, C>(opa, &current);
            }
            Tag::Array => {
                let data = current.data::<PackedValue>();
                for i in 0..current.cont_size() {
                    // SAFETY: as above.
                    work.push(unsafe { *data.add(i as usize) });
                }
                free_storage::<PackedValue, A, C>(opa, &current);
            }
            Tag::BoolArray => free_storage::<bool, A, C>(opa, &current),
            Tag::IntArray => free_storage::<i64, A, C>(opa, &current),
            Tag::DoubleArray => free_storage::<f64, A, C>(opa, &current),
            _ => {}
        }
        match work.pop() {
            Some(next) => current = next,
            None => break,
        }
    }
}

/// Mutable cursor over one cell of a document. Holds the document borrow,
/// so at most one editing cursor chain is live at a time; descending
/// reborrows it.
pub struct ValueMut<
    'a,
    A: BaseAlloc + Clone = Rc<HeapAlloc>,
    const STR_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
    const OBJ_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
> {
    doc: &'a mut Document<A, STR_CHUNK, OBJ_CHUNK>,
    value: NonNull<PackedValue>,
}

impl<'a, A: BaseAlloc + Clone, const STR_CHUNK: u16, const OBJ_CHUNK: u16>
    ValueMut<'a, A, STR_CHUNK, OBJ_CHUNK>
{
    fn cell(&self) -> &PackedValue {
        // SAFETY: the cursor's cell stays valid while the document borrow
        // is held.
        unsafe { self.value.as_ref() }
    }

    fn cell_mut(&mut self) -> &mut PackedValue {
        // SAFETY: as above, and the borrow is exclusive.
        unsafe { self.value.as_mut() }
    }

    /// Read view of this cell.
    pub fn as_ref(&self) -> ValueRef<'_> {
        ValueRef::new(self.cell())
    }

    pub fn tag(&self) -> Tag {
        self.cell().tag()
    }

    pub fn meta(&self) -> Meta {
        self.cell().meta()
    }

    #[track_caller]
    fn expect(&self, tag: Tag) {
        assert!(
            self.tag() == tag,
            "expected a {tag:?} value, found {:?}",
            self.tag()
        );
    }

    /// Releases whatever structure the cell owns and leaves it Null.
    fn release(&mut self) {
        let cell = *self.cell();
        release_value(&mut self.doc.objects, cell);
        self.cell_mut().force_null();
    }

    /// Builds a string cell under the short/pooled policy: anything under
    /// the inline limit is stored in the cell, everything else is
    /// interned (copied) into the pool.
    fn make_str_cell(&mut self, s: &str) -> PackedValue {
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

    /// As [Self::make_str_cell], but long strings borrow the caller's
    /// bytes instead of copying.
    ///
    /// # Safety
    /// The bytes behind `s` must outlive the document's string pool entry.
    unsafe fn make_str_cell_borrowed(&mut self, s: &str) -> PackedValue {
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

    // Assignment. Each drops the previous structure first.

    pub fn set_null(&mut self) {
        self.release();
    }

    pub fn set_bool(&mut self, b: bool) {
        self.release();
        *self.cell_mut() = PackedValue::from_bool(b);
    }

    pub fn set_i64(&mut self, i: i64) {
        self.release();
        *self.cell_mut() = PackedValue::from_i64(i);
    }

    pub fn set_u64(&mut self, u: u64) {
        self.release();
        *self.cell_mut() = PackedValue::from_u64(u);
    }

    pub fn set_f64(&mut self, d: f64) {
        self.release();
        *self.cell_mut() = PackedValue::from_f64(d);
    }

    pub fn set_str(&mut self, s: &str) {
        self.release();
        let cell = self.make_str_cell(s);
        *self.cell_mut() = cell;
    }

    /// Zero-copy string assignment.
    ///
    /// # Safety
    /// The bytes behind `s` must outlive the document's string pool entry.
    pub unsafe fn set_str_borrowed(&mut self, s: &str) {
        self.release();
        let cell = unsafe { self.make_str_cell_borrowed(s) };
        *self.cell_mut() = cell;
    }

    // Retagging modifiers.

    pub fn to_null(&mut self) {
        self.release();
    }

    pub fn to_array(&mut self) {
        self.release();
        *self.cell_mut() = PackedValue::container(Tag::Array);
    }

    pub fn to_barray(&mut self) {
        self.release();
        *self.cell_mut() = PackedValue::container(Tag::BoolArray);
    }

    pub fn to_iarray(&mut self) {
        self.release();
        *self.cell_mut() = PackedValue::container(Tag::IntArray);
    }

    pub fn to_darray(&mut self) {
        self.release();
        *self.cell_mut() = PackedValue::container(Tag::DoubleArray);
    }

    pub fn to_object(&mut self) {
        self.release();
        *self.cell_mut() = PackedValue::container(Tag::Object);
    }

    // Descent.

    /// Cursor at array element `index`. A Null cell becomes an empty
    /// array; `index == len` appends a Null element first (the upsert
    /// idiom `doc.root().index(0).set_i64(1)`).
    #[track_caller]
    pub fn index(&mut self, index: u32) -> ValueMut<'_, A, STR_CHUNK, OBJ_CHUNK> {
        if self.tag() == Tag::Null {
            *self.cell_mut() = PackedValue::container(Tag::Array);
        }
        self.expect(Tag::Array);
        let len = self.cell().cont_size();
        assert!(index <= len, "array index {index} past extendable end (len {len})");
        if index == len {
            if self.cell().is_full::<PackedValue>() {
                containers::grow::<PackedValue, A, OBJ_CHUNK>(
                    // SAFETY: exclusive cursor borrow.
                    unsafe { self.value.as_mut() },
                    &mut self.doc.objects,
                );
            }
            self.cell_mut().inc_size_null();
        }
        // SAFETY: index-checked slot.
        let slot = unsafe { self.cell().data::<PackedValue>().add(index as usize) };
        ValueMut {
            doc: &mut *self.doc,
            // SAFETY: slot is inside a live buffer.
            value: unsafe { NonNull::new_unchecked(slot) },
        }
    }

    /// Checked cursor at array element `index`; never extends.
    pub fn at(&mut self, index: u32) -> Result<ValueMut<'_, A, STR_CHUNK, OBJ_CHUNK>, AccessError> {
        self.expect(Tag::Array);
        let len = self.cell().cont_size();
        if index >= len {
            return Err(AccessError::OutOfRange { index, len });
        }
        // SAFETY: index-checked slot.
        let slot = unsafe { self.cell().data::<PackedValue>().add(index as usize) };
        Ok(ValueMut {
            doc: &mut *self.doc,
            value: unsafe { NonNull::new_unchecked(slot) },
        })
    }

    /// Upsert cursor at the member named `key`. A Null cell becomes an
    /// empty object; a missing key appends a Null-valued member; any
    /// other non-object tag is a caller error and panics.
    #[track_caller]
    pub fn entry(&mut self, key: &str) -> ValueMut<'_, A, STR_CHUNK, OBJ_CHUNK> {
        if self.tag() == Tag::Null {
            *self.cell_mut() = PackedValue::container(Tag::Object);
        }
        assert!(
            self.tag() == Tag::Object,
            "keyed access on a {:?} value",
            self.tag()
        );
        let (interned, found) = self.doc.pool.borrow_mut().provide(key, true);
        let key_ptr = interned.as_ptr() as *const PooledStr;

        let mut slot: *mut PackedValue = std::ptr::null_mut();
        if found {
            let data = self.cell().data::<PackedMember>();
            for i in 0..self.cell().cont_size() {
                // SAFETY: index-checked member slot.
                unsafe {
                    if std::ptr::eq((*data.add(i as usize)).key, key_ptr) {
                        slot = &mut (*data.add(i as usize)).value;
                        break;
                    }
                }
            }
        }
        if slot.is_null() {
            if self.cell().is_full::<PackedMember>() {
                containers::grow::<PackedMember, A, OBJ_CHUNK>(
                    // SAFETY: exclusive cursor borrow.
                    unsafe { self.value.as_mut() },
                    &mut self.doc.objects,
                );
            }
            slot = self.cell_mut().push_member(key_ptr);
        }
        ValueMut {
            doc: &mut *self.doc,
            // SAFETY: slot is inside a live member buffer.
            value: unsafe { NonNull::new_unchecked(slot) },
        }
    }

    /// Checked member cursor by position.
    pub fn member_at(
        &mut self,
        index: u32,
    ) -> Result<MemberMut<'_, A, STR_CHUNK, OBJ_CHUNK>, AccessError> {
        self.expect(Tag::Object);
        let len = self.cell().cont_size();
        if index >= len {
            return Err(AccessError::OutOfRange { index, len });
        }
        // SAFETY: index-checked member slot.
        let member = unsafe { self.cell().data::<PackedMember>().add(index as usize) };
        Ok(MemberMut {
            doc: &mut *self.doc,
            member: unsafe { NonNull::new_unchecked(member) },
        })
    }

    /// Finds a member by its interned key reference (the pool makes equal
    /// keys pointer-equal, so no byte comparison is needed per member).
    pub fn find_member(&self, key: &str) -> Option<MemberRef<'_>> {
        self.expect(Tag::Object);
        let size = self.cell().cont_size();
        if size == 0 {
            return None;
        }
        let interned = self.doc.pool.borrow().get(key)?;
        let data = self.cell().data::<PackedMember>();
        for i in 0..size {
            // SAFETY: index-checked member slot.
            let member = unsafe { &*data.add(i as usize) };
            if std::ptr::eq(member.key, interned.as_ptr()) {
                return Some(MemberRef::new(member));
            }
        }
        None
    }

    pub fn find_value(&self, key: &str) -> Option<ValueRef<'_>> {
        self.find_member(key).map(|member| member.value())
    }

    // Clear / reserve / shrink, per kind.

    pub fn array_clear(&mut self) {
        self.expect(Tag::Array);
        let data = self.cell().data::<PackedValue>();
        for i in 0..self.cell().cont_size() {
            // SAFETY: index-checked slot; the copy is released.
            let child = unsafe { *data.add(i as usize) };
            release_value(&mut self.doc.objects, child);
        }
        self.cell_mut().set_cont_size(0);
    }

    pub fn barray_clear(&mut self) {
        self.expect(Tag::BoolArray);
        self.cell_mut().set_cont_size(0);
    }

    pub fn iarray_clear(&mut self) {
        self.expect(Tag::IntArray);
        self.cell_mut().set_cont_size(0);
    }

    pub fn darray_clear(&mut self) {
        self.expect(Tag::DoubleArray);
        self.cell_mut().set_cont_size(0);
    }

    pub fn object_clear(&mut self) {
        self.expect(Tag::Object);
        let data = self.cell().data::<PackedMember>();
        for i in 0..self.cell().cont_size() {
            // SAFETY: as array_clear.
            let child = unsafe { (*data.add(i as usize)).value };
            release_value(&mut self.doc.objects, child);
        }
        self.cell_mut().set_cont_size(0);
    }

    pub fn array_reserve(&mut self, new_capacity: u32) {
        self.expect(Tag::Array);
        // SAFETY: exclusive cursor borrow.
        containers::reserve::<PackedValue, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            new_capacity,
            &mut self.doc.objects,
        );
    }

    pub fn barray_reserve(&mut self, new_capacity: u32) {
        self.expect(Tag::BoolArray);
        // SAFETY: exclusive cursor borrow.
        containers::reserve::<bool, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            new_capacity,
            &mut self.doc.objects,
        );
    }

    pub fn iarray_reserve(&mut self, new_capacity: u32) {
        self.expect(Tag::IntArray);
        // SAFETY: exclusive cursor borrow.
        containers::reserve::<i64, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            new_capacity,
            &mut self.doc.objects,
        );
    }

    pub fn darray_reserve(&mut self, new_capacity: u32) {
        self.expect(Tag::DoubleArray);
        // SAFETY: exclusive cursor borrow.
        containers::reserve::<f64, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            new_capacity,
            &mut self.doc.objects,
        );
    }

    pub fn object_reserve(&mut self, new_capacity: u32) {
        self.expect(Tag::Object);
        // SAFETY: exclusive cursor borrow.
        containers::reserve::<PackedMember, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            new_capacity,
            &mut self.doc.objects,
        );
    }

    pub fn array_shrink(&mut self) {
        self.expect(Tag::Array);
        // SAFETY: exclusive cursor borrow.
        containers::shrink::<PackedValue, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            &mut self.doc.objects,
        );
    }

    pub fn barray_shrink(&mut self) {
        self.expect(Tag::BoolArray);
        // SAFETY: exclusive cursor borrow.
        containers::shrink::<bool, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            &mut self.doc.objects,
        );
    }

    pub fn iarray_shrink(&mut self) {
        self.expect(Tag::IntArray);
        // SAFETY: exclusive cursor borrow.
        containers::shrink::<i64, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            &mut self.doc.objects,
        );
    }

    pub fn darray_shrink(&mut self) {
        self.expect(Tag::DoubleArray);
        // SAFETY: exclusive cursor borrow.
        containers::shrink::<f64, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            &mut self.doc.objects,
        );
    }

    pub fn object_shrink(&mut self) {
        self.expect(Tag::Object);
        // SAFETY: exclusive cursor borrow.
        containers::shrink::<PackedMember, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            &mut self.doc.objects,
        );
    }

    // Push / pop / erase.

    /// Appends a Null slot to a generic array and returns it for the
    /// caller to overwrite.
    fn array_append(&mut self) -> *mut PackedValue {
        self.expect(Tag::Array);
        if self.cell().is_full::<PackedValue>() {
            containers::grow::<PackedValue, A, OBJ_CHUNK>(
                // SAFETY: exclusive cursor borrow.
                unsafe { self.value.as_mut() },
                &mut self.doc.objects,
            );
        }
        self.cell_mut().inc_size_null();
        let last = self.cell().cont_size() - 1;
        // SAFETY: size-checked slot.
        unsafe { self.cell().data::<PackedValue>().add(last as usize) }
    }

    pub fn array_push_null(&mut self) {
        self.array_append();
    }

    pub fn array_push_bool(&mut self, b: bool) {
        let slot = self.array_append();
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_bool(b)) };
    }

    pub fn array_push_i64(&mut self, i: i64) {
        let slot = self.array_append();
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_i64(i)) };
    }

    pub fn array_push_u64(&mut self, u: u64) {
        let slot = self.array_append();
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_u64(u)) };
    }

    pub fn array_push_f64(&mut self, d: f64) {
        let slot = self.array_append();
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_f64(d)) };
    }

    pub fn array_push_str(&mut self, s: &str) {
        let slot = self.array_append();
        let cell = self.make_str_cell(s);
        // SAFETY: fresh slot (still valid: interning never moves element
        // buffers).
        unsafe { slot.write(cell) };
    }

    pub fn barray_push(&mut self, b: bool) {
        self.expect(Tag::BoolArray);
        if self.cell().is_full::<bool>() {
            containers::grow::<bool, A, OBJ_CHUNK>(
                // SAFETY: exclusive cursor borrow.
                unsafe { self.value.as_mut() },
                &mut self.doc.objects,
            );
        }
        let index = self.cell_mut().inc_size_uninit::<bool>();
        // SAFETY: capacity-checked slot.
        unsafe { self.cell().data::<bool>().add(index as usize).write(b) };
    }

    pub fn iarray_push(&mut self, i: i64) {
        self.expect(Tag::IntArray);
        if self.cell().is_full::<i64>() {
            containers::grow::<i64, A, OBJ_CHUNK>(
                // SAFETY: exclusive cursor borrow.
                unsafe { self.value.as_mut() },
                &mut self.doc.objects,
            );
        }
        let index = self.cell_mut().inc_size_uninit::<i64>();
        // SAFETY: capacity-checked slot.
        unsafe { self.cell().data::<i64>().add(index as usize).write(i) };
    }

    pub fn darray_push(&mut self, d: f64) {
        self.expect(Tag::DoubleArray);
        if self.cell().is_full::<f64>() {
            containers::grow::<f64, A, OBJ_CHUNK>(
                // SAFETY: exclusive cursor borrow.
                unsafe { self.value.as_mut() },
                &mut self.doc.objects,
            );
        }
        let index = self.cell_mut().inc_size_uninit::<f64>();
        // SAFETY: capacity-checked slot.
        unsafe { self.cell().data::<f64>().add(index as usize).write(d) };
    }

    /// Appends a member (no key dedup; use [Self::entry] for upserts) and
    /// returns its value slot.
    fn object_append(&mut self, key: &str) -> *mut PackedValue {
        self.expect(Tag::Object);
        if self.cell().is_full::<PackedMember>() {
            containers::grow::<PackedMember, A, OBJ_CHUNK>(
                // SAFETY: exclusive cursor borrow.
                unsafe { self.value.as_mut() },
                &mut self.doc.objects,
            );
        }
        let (interned, _) = self.doc.pool.borrow_mut().provide(key, true);
        self.cell_mut().push_member(interned.as_ptr())
    }

    pub fn object_push_null(&mut self, key: &str) {
        self.object_append(key);
    }

    pub fn object_push_bool(&mut self, key: &str, b: bool) {
        let slot = self.object_append(key);
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_bool(b)) };
    }

    pub fn object_push_i64(&mut self, key: &str, i: i64) {
        let slot = self.object_append(key);
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_i64(i)) };
    }

    pub fn object_push_u64(&mut self, key: &str, u: u64) {
        let slot = self.object_append(key);
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_u64(u)) };
    }

    pub fn object_push_f64(&mut self, key: &str, d: f64) {
        let slot = self.object_append(key);
        // SAFETY: fresh slot.
        unsafe { slot.write(PackedValue::from_f64(d)) };
    }

    pub fn object_push_str(&mut self, key: &str, s: &str) {
        let slot = self.object_append(key);
        let cell = self.make_str_cell(s);
        // SAFETY: fresh slot (interning never moves element buffers).
        unsafe { slot.write(cell) };
    }

    #[track_caller]
    pub fn array_pop(&mut self) {
        self.expect(Tag::Array);
        let len = self.cell().cont_size();
        assert!(len > 0, "pop from an empty array");
        // SAFETY: size-checked slot; the copy is released.
        let last = unsafe { *self.cell().data::<PackedValue>().add(len as usize - 1) };
        release_value(&mut self.doc.objects, last);
        self.cell_mut().dec_size();
    }

    #[track_caller]
    pub fn barray_pop(&mut self) {
        self.expect(Tag::BoolArray);
        assert!(self.cell().cont_size() > 0, "pop from an empty barray");
        self.cell_mut().dec_size();
    }

    #[track_caller]
    pub fn iarray_pop(&mut self) {
        self.expect(Tag::IntArray);
        assert!(self.cell().cont_size() > 0, "pop from an empty iarray");
        self.cell_mut().dec_size();
    }

    #[track_caller]
    pub fn darray_pop(&mut self) {
        self.expect(Tag::DoubleArray);
        assert!(self.cell().cont_size() > 0, "pop from an empty darray");
        self.cell_mut().dec_size();
    }

    #[track_caller]
    pub fn object_pop(&mut self) {
        self.expect(Tag::Object);
        let len = self.cell().cont_size();
        assert!(len > 0, "pop from an empty object");
        // SAFETY: size-checked slot; the copy is released.
        let last = unsafe { (*self.cell().data::<PackedMember>().add(len as usize - 1)).value };
        release_value(&mut self.doc.objects, last);
        self.cell_mut().dec_size();
    }

    /// Removes element `index`, preserving the order of the rest.
    #[track_caller]
    pub fn array_erase(&mut self, index: u32) {
        self.expect(Tag::Array);
        assert!(index < self.cell().cont_size(), "erase past end");
        // SAFETY: index-checked slot; the copy is released.
        let child = unsafe { *self.cell().data::<PackedValue>().add(index as usize) };
        release_value(&mut self.doc.objects, child);
        containers::erase::<PackedValue>(self.cell_mut(), index);
    }

    #[track_caller]
    pub fn barray_erase(&mut self, index: u32) {
        self.expect(Tag::BoolArray);
        assert!(index < self.cell().cont_size(), "erase past end");
        containers::erase::<bool>(self.cell_mut(), index);
    }

    #[track_caller]
    pub fn iarray_erase(&mut self, index: u32) {
        self.expect(Tag::IntArray);
        assert!(index < self.cell().cont_size(), "erase past end");
        containers::erase::<i64>(self.cell_mut(), index);
    }

    #[track_caller]
    pub fn darray_erase(&mut self, index: u32) {
        self.expect(Tag::DoubleArray);
        assert!(index < self.cell().cont_size(), "erase past end");
        containers::erase::<f64>(self.cell_mut(), index);
    }

    #[track_caller]
    pub fn object_erase(&mut self, index: u32) {
        self.expect(Tag::Object);
        assert!(index < self.cell().cont_size(), "erase past end");
        // SAFETY: index-checked slot; the copy is released.
        let child = unsafe { (*self.cell().data::<PackedMember>().add(index as usize)).value };
        release_value(&mut self.doc.objects, child);
        containers::erase::<PackedMember>(self.cell_mut(), index);
    }

    // Conversions. `reserve_extra` adds headroom beyond the current size.

    pub fn convert_barray_to_array(&mut self, reserve_extra: u32) {
        self.expect(Tag::BoolArray);
        // SAFETY: exclusive cursor borrow.
        containers::convert_to_generic::<bool, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            reserve_extra,
            &mut self.doc.objects,
        );
    }

    pub fn convert_iarray_to_array(&mut self, reserve_extra: u32) {
        self.expect(Tag::IntArray);
        // SAFETY: exclusive cursor borrow.
        containers::convert_to_generic::<i64, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            reserve_extra,
            &mut self.doc.objects,
        );
    }

    pub fn convert_darray_to_array(&mut self, reserve_extra: u32) {
        self.expect(Tag::DoubleArray);
        // SAFETY: exclusive cursor borrow.
        containers::convert_to_generic::<f64, A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            reserve_extra,
            &mut self.doc.objects,
        );
    }

    pub fn convert_iarray_to_darray(&mut self, reserve_extra: u32) {
        self.expect(Tag::IntArray);
        // SAFETY: exclusive cursor borrow.
        containers::convert_int_to_double::<A, OBJ_CHUNK>(
            unsafe { self.value.as_mut() },
            reserve_extra,
            &mut self.doc.objects,
        );
    }
}

/// Mutable cursor over one object member.
pub struct MemberMut<
    'a,
    A: BaseAlloc + Clone = Rc<HeapAlloc>,
    const STR_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
    const OBJ_CHUNK: u16 = DEFAULT_CHUNK_SIZE,
> {
    doc: &'a mut Document<A, STR_CHUNK, OBJ_CHUNK>,
    member: NonNull<PackedMember>,
}

impl<'a, A: BaseAlloc + Clone, const STR_CHUNK: u16, const OBJ_CHUNK: u16>
    MemberMut<'a, A, STR_CHUNK, OBJ_CHUNK>
{
    fn member(&self) -> &PackedMember {
        // SAFETY: valid while the document borrow is held.
        unsafe { self.member.as_ref() }
    }

    pub fn key(&self) -> &str {
        // SAFETY: member keys reference live pool entries.
        unsafe { self.member().key_str() }
    }

    pub fn key_len(&self) -> u32 {
        // SAFETY: as above.
        unsafe { (*self.member().key).len() }
    }

    pub fn key_owned(&self) -> bool {
        // SAFETY: as above.
        unsafe { (*self.member().key).owns() }
    }

    pub fn value(&mut self) -> ValueMut<'_, A, STR_CHUNK, OBJ_CHUNK> {
        // SAFETY: exclusive member borrow.
        let value = unsafe { NonNull::new_unchecked(&mut self.member.as_mut().value as *mut _) };
        ValueMut {
            doc: &mut *self.doc,
            value,
        }
    }

    /// Rebinds the member to a (possibly new) interned key. The old key
    /// stays in the pool; keys are never reclaimed while flagged.
    pub fn set_key(&mut self, key: &str) {
        let (interned, _) = self.doc.pool.borrow_mut().provide(key, true);
        // SAFETY: exclusive member borrow.
        unsafe { self.member.as_mut().key = interned.as_ptr() };
    }

    /// Zero-copy key rebind.
    ///
    /// # Safety
    /// The bytes behind `key` must outlive the document's string pool
    /// entry.
    pub unsafe fn set_key_borrowed(&mut self, key: &str) {
        let (interned, _) = unsafe { self.doc.pool.borrow_mut().provide_borrowed(key, true) };
        // SAFETY: exclusive member borrow.
        unsafe { self.member.as_mut().key = interned.as_ptr() };
    }
}
