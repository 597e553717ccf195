// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interning string pool: a separate-chaining hash set of [PooledStr]
//! records over a [CompactPool], with chain links stored inside the
//! records themselves and buckets stored as [CompactRef]s in the same
//! pool. Chains are kept strictly increasing by (length, bytes) so a miss
//! is detected without walking the whole chain.

use std::ptr::NonNull;
use std::rc::Rc;

use tracing::trace;

use crate::alloc::{BaseAlloc, CompactPool, CompactRef, HeapAlloc};
use crate::strings::interned::{PooledStr, MAX_STR_LEN};
use crate::DEFAULT_CHUNK_SIZE;

const START_BUCKETS: u32 = 16;
const GROWTH_FACTOR: f32 = 2.0;
const DEFAULT_MAX_LOAD: f32 = 1.5;

const _: () = assert!(START_BUCKETS > 1);

#[cfg(feature = "xxhash")]
fn hash_bytes(bytes: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64(bytes) as u32
}

/// FNV-1a, 32-bit (public domain).
#[cfg(not(feature = "xxhash"))]
fn hash_bytes(bytes: &[u8]) -> u32 {
    const FNV_PRIME: u32 = 16777619;
    const OFFSET_BASIS: u32 = 2166136261;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash = (hash ^ b as u32).wrapping_mul(FNV_PRIME);
    }
    hash
}

fn fast_mod(input: u32, ceil: u32) -> u32 {
    debug_assert!(ceil > 0);
    #[cfg(feature = "power-of-two-buckets")]
    {
        input & (ceil - 1)
    }
    #[cfg(not(feature = "power-of-two-buckets"))]
    {
        input % ceil
    }
}

/// Hash set of interned strings sharing its allocator with its payload.
pub struct StringPool<A: BaseAlloc = Rc<HeapAlloc>, const CHUNK: u16 = DEFAULT_CHUNK_SIZE> {
    alloc: CompactPool<A, CHUNK>,
    max_load: f32,
    item_count: u32,
    bucket_count: u32,
    buckets: CompactRef,
}

impl<A: BaseAlloc, const CHUNK: u16> StringPool<A, CHUNK> {
    pub fn new(base: A) -> Self {
        StringPool {
            alloc: CompactPool::new(base),
            max_load: DEFAULT_MAX_LOAD,
            item_count: 0,
            bucket_count: 0,
            buckets: CompactRef::NULL,
        }
    }

    pub fn base(&self) -> &A {
        self.alloc.base()
    }

    /// Number of interned strings.
    pub fn len(&self) -> u32 {
        self.item_count
    }

    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    pub fn load_factor(&self) -> f32 {
        if self.bucket_count == 0 {
            0.0
        } else {
            self.item_count as f32 / self.bucket_count as f32
        }
    }

    pub fn max_load_factor(&self) -> f32 {
        self.max_load
    }

    /// Sets the rehash threshold; values that are not > 0 are rejected.
    pub fn set_max_load_factor(&mut self, max_load: f32) {
        if max_load > 0.0 {
            self.max_load = max_load;
        } else {
            debug_assert!(false, "max load factor must be > 0");
        }
    }

    fn resolve(&self, r: CompactRef) -> *mut PooledStr {
        self.alloc.resolve(r) as *mut PooledStr
    }

    fn bucket_at(&self, index: u32) -> CompactRef {
        debug_assert!(index < self.bucket_count);
        // SAFETY: the bucket array holds `bucket_count` entries.
        unsafe { *(self.alloc.resolve(self.buckets) as *const CompactRef).add(index as usize) }
    }

    fn set_bucket(&mut self, index: u32, r: CompactRef) {
        debug_assert!(index < self.bucket_count);
        // SAFETY: the bucket array holds `bucket_count` entries.
        unsafe { *(self.alloc.resolve(self.buckets) as *mut CompactRef).add(index as usize) = r };
    }

    /// Interns `s`, copying its bytes into the pool. Returns the record
    /// and whether it already existed; on a hit the key flag is merged in.
    pub fn provide(&mut self, s: &str, key: bool) -> (NonNull<PooledStr>, bool) {
        self.provide_impl(s.as_bytes(), true, key)
    }

    /// Interns `s` without copying: the record points at the caller's
    /// bytes.
    ///
    /// # Safety
    /// The caller guarantees the bytes behind `s` stay alive and unchanged
    /// for as long as this pool retains the entry.
    pub unsafe fn provide_borrowed(&mut self, s: &str, key: bool) -> (NonNull<PooledStr>, bool) {
        self.provide_impl(s.as_bytes(), false, key)
    }

    /// Read-only lookup: no insertion, no key-flag update.
    pub fn get(&self, s: &str) -> Option<NonNull<PooledStr>> {
        let bytes = s.as_bytes();
        debug_assert!(bytes.len() as u32 <= MAX_STR_LEN);
        if self.item_count == 0 {
            return None;
        }
        let index = fast_mod(hash_bytes(bytes), self.bucket_count);
        let mut it = self.resolve(self.bucket_at(index));
        while !it.is_null() {
            // SAFETY: chain records are live pool entries.
            unsafe {
                if PooledStr::compare(it, bytes) == std::cmp::Ordering::Equal {
                    return Some(NonNull::new_unchecked(it));
                }
                it = self.resolve((*it).next());
            }
        }
        None
    }

    fn provide_impl(&mut self, bytes: &[u8], own: bool, key: bool) -> (NonNull<PooledStr>, bool) {
        debug_assert!(bytes.len() as u32 <= MAX_STR_LEN);
        debug_assert!(self.item_count < u32::MAX);

        // Grow by anticipation so insertion never immediately re-walks.
        if (self.item_count + 1) as f32 > self.bucket_count as f32 * self.max_load {
            let new_count = if self.bucket_count > 0 {
                (self.bucket_count as f32 * GROWTH_FACTOR).ceil() as u32
            } else {
                START_BUCKETS
            };
            self.rehash(new_count);
        }

        let index = fast_mod(hash_bytes(bytes), self.bucket_count);

        let head_ref = self.bucket_at(index);
        let head = self.resolve(head_ref);
        if head.is_null() {
            let r = self.create_record(bytes, own, key, CompactRef::NULL);
            self.set_bucket(index, r);
            self.item_count += 1;
            // SAFETY: just created.
            return (unsafe { NonNull::new_unchecked(self.resolve(r)) }, false);
        }
        // SAFETY: chain records are live pool entries.
        unsafe {
            match PooledStr::compare(head, bytes) {
                std::cmp::Ordering::Equal => {
                    (*head).mark_key(key);
                    return (NonNull::new_unchecked(head), true);
                }
                std::cmp::Ordering::Greater => {
                    let r = self.create_record(bytes, own, key, head_ref);
                    self.set_bucket(index, r);
                    self.item_count += 1;
                    return (NonNull::new_unchecked(self.resolve(r)), false);
                }
                std::cmp::Ordering::Less => {}
            }

            let mut it = head;
            loop {
                let next_ref = (*it).next();
                let next = self.resolve(next_ref);
                if next.is_null() {
                    let r = self.create_record(bytes, own, key, CompactRef::NULL);
                    (*it).set_next(r);
                    self.item_count += 1;
                    return (NonNull::new_unchecked(self.resolve(r)), false);
                }
                match PooledStr::compare(next, bytes) {
                    std::cmp::Ordering::Equal => {
                        (*next).mark_key(key);
                        return (NonNull::new_unchecked(next), true);
                    }
                    std::cmp::Ordering::Greater => {
                        let r = self.create_record(bytes, own, key, next_ref);
                        (*it).set_next(r);
                        self.item_count += 1;
                        return (NonNull::new_unchecked(self.resolve(r)), false);
                    }
                    std::cmp::Ordering::Less => it = next,
                }
            }
        }
    }

    fn create_record(&mut self, bytes: &[u8], own: bool, key: bool, next: CompactRef) -> CompactRef {
        let size = PooledStr::total_size(own, bytes.len() as u32);
        let r = self.alloc.allocate(size);
        let raw = self.alloc.resolve(r) as *mut u8;
        // SAFETY: `raw` holds `size` fresh bytes; the borrowed-lifetime
        // contract is carried by the caller of provide_borrowed.
        unsafe { PooledStr::construct(raw, bytes, own, key, next) };
        r
    }

    /// Re-homes every record into `new_count` buckets, preserving chain
    /// order within each bucket.
    fn rehash(&mut self, new_count: u32) {
        debug_assert!(new_count > 0);
        trace!(from = self.bucket_count, to = new_count, items = self.item_count, "string pool rehash");

        let new_bytes = std::mem::size_of::<CompactRef>() as u32 * new_count;
        let new_ref = self.alloc.allocate(new_bytes);
        let new_buckets = self.alloc.resolve(new_ref) as *mut CompactRef;
        for i in 0..new_count {
            // SAFETY: the fresh array holds `new_count` entries.
            unsafe { new_buckets.add(i as usize).write(CompactRef::NULL) };
        }

        let mut moved = 0u32;
        let mut index = 0u32;
        while moved < self.item_count {
            debug_assert!(index < self.bucket_count);
            let mut r = self.bucket_at(index);
            let mut it = self.resolve(r);
            while !it.is_null() {
                // SAFETY: chain records are live pool entries.
                unsafe {
                    let next_ref = (*it).next();
                    let next = self.resolve(next_ref);
                    let hash = hash_bytes(PooledStr::bytes(it));
                    let new_index = fast_mod(hash, new_count);
                    Self::push_sorted(&self.alloc, new_buckets, new_index, r, it);
                    moved += 1;
                    r = next_ref;
                    it = next;
                }
            }
            index += 1;
        }

        if self.bucket_count > 0 {
            self.alloc.deallocate(
                self.buckets,
                std::mem::size_of::<CompactRef>() as u32 * self.bucket_count,
            );
        }
        self.buckets = new_ref;
        self.bucket_count = new_count;
    }

    /// Inserts an existing record into a bucket keeping the chain sorted.
    ///
    /// # Safety (internal)
    /// `record` must be a live record addressed by `rref`; duplicates
    /// would violate the set invariant and are debug-asserted against.
    unsafe fn push_sorted(
        alloc: &CompactPool<A, CHUNK>,
        buckets: *mut CompactRef,
        index: u32,
        rref: CompactRef,
        record: *mut PooledStr,
    ) {
        unsafe {
            let slot = buckets.add(index as usize);
            let head_ref = *slot;
            let head = alloc.resolve(head_ref) as *mut PooledStr;
            if head.is_null() {
                (*record).set_next(CompactRef::NULL);
                *slot = rref;
                return;
            }

            let order = PooledStr::compare_records(head, record);
            debug_assert!(order != std::cmp::Ordering::Equal, "duplicate while rehashing");
            if order == std::cmp::Ordering::Greater {
                (*record).set_next(head_ref);
                *slot = rref;
                return;
            }

            let mut it = head;
            loop {
                let next_ref = (*it).next();
                let next = alloc.resolve(next_ref) as *mut PooledStr;
                if next.is_null() {
                    (*record).set_next(CompactRef::NULL);
                    (*it).set_next(rref);
                    return;
                }
                let order = PooledStr::compare_records(next, record);
                debug_assert!(order != std::cmp::Ordering::Equal, "duplicate while rehashing");
                if order == std::cmp::Ordering::Greater {
                    (*record).set_next(next_ref);
                    (*it).set_next(rref);
                    return;
                }
                it = next;
            }
        }
    }

    /// Reclaims every string never used as a member key.
    ///
    /// # Safety
    /// No live value cell (in any document sharing this pool) may still
    /// reference a non-key entry.
    pub unsafe fn release_values(&mut self) {
        for index in 0..self.bucket_count {
            // Non-key heads.
            let mut head_ref = self.bucket_at(index);
            loop {
                let head = self.resolve(head_ref);
                if head.is_null() {
                    break;
                }
                // SAFETY: live record.
                unsafe {
                    if (*head).is_key() {
                        break;
                    }
                    let next = (*head).next();
                    self.set_bucket(index, next);
                    self.item_count -= 1;
                    let size = PooledStr::total_size((*head).owns(), (*head).len());
                    self.alloc.deallocate(head_ref, size);
                    head_ref = next;
                }
            }
            // Non-key interior records.
            let mut it = self.resolve(head_ref);
            if it.is_null() {
                continue;
            }
            // SAFETY: live records throughout; the chain stays linked
            // around each removal.
            unsafe {
                let mut next_ref = (*it).next();
                loop {
                    let next = self.resolve(next_ref);
                    if next.is_null() {
                        break;
                    }
                    if !(*next).is_key() {
                        (*it).set_next((*next).next());
                        self.item_count -= 1;
                        let size = PooledStr::total_size((*next).owns(), (*next).len());
                        self.alloc.deallocate(next_ref, size);
                        next_ref = (*it).next();
                    } else {
                        it = next;
                        next_ref = (*next).next();
                    }
                }
            }
        }
        #[cfg(debug_assertions)]
        self.sanity_check();
    }

    /// Drops every string and the bucket array, keeping the chunks for
    /// reuse.
    ///
    /// # Safety
    /// No live value cell may still reference any entry of this pool.
    pub unsafe fn clear(&mut self) {
        for index in 0..self.bucket_count {
            let mut r = self.bucket_at(index);
            let mut it = self.resolve(r);
            while !it.is_null() {
                // SAFETY: live record.
                unsafe {
                    let next_ref = (*it).next();
                    let next = self.resolve(next_ref);
                    let size = PooledStr::total_size((*it).owns(), (*it).len());
                    self.alloc.deallocate(r, size);
                    r = next_ref;
                    it = next;
                }
            }
        }
        if self.bucket_count > 0 {
            self.alloc.deallocate(
                self.buckets,
                std::mem::size_of::<CompactRef>() as u32 * self.bucket_count,
            );
        }
        self.item_count = 0;
        self.bucket_count = 0;
        self.buckets = CompactRef::NULL;
    }

    /// Drops every string, the bucket array, and the underlying chunks.
    ///
    /// # Safety
    /// As [Self::clear].
    pub unsafe fn release_all(&mut self) {
        self.alloc.release_all();
        self.item_count = 0;
        self.bucket_count = 0;
        self.buckets = CompactRef::NULL;
    }

    /// Optionally rehashes to a tight bucket count (only worthwhile when
    /// the bucket array has outgrown the chunks), then shrinks the
    /// allocator.
    pub fn shrink(&mut self, rehash: bool) {
        #[cfg(feature = "power-of-two-buckets")]
        let _ = rehash;
        #[cfg(not(feature = "power-of-two-buckets"))]
        if rehash && self.bucket_count > 0 {
            let bucket_bytes = std::mem::size_of::<CompactRef>() as u32 * self.bucket_count;
            if !CompactPool::<A, CHUNK>::chunk_sized(bucket_bytes) {
                let new_count = (self.item_count as f32 / self.max_load).ceil() as u32;
                if new_count > 0 {
                    self.rehash(new_count);
                }
            }
        }
        self.alloc.shrink();
    }

    // Statistics.

    pub fn count_strings_length(&self) -> u64 {
        let mut total = 0u64;
        self.for_each_record(|record| total += unsafe { (*record).len() } as u64);
        total
    }

    pub fn count_used_buckets(&self) -> u32 {
        let mut used = 0;
        for index in 0..self.bucket_count {
            if !self.resolve(self.bucket_at(index)).is_null() {
                used += 1;
            }
        }
        used
    }

    pub fn count_max_chaining(&self) -> u32 {
        let mut max = 0i64;
        for index in 0..self.bucket_count {
            let mut chains = -1i64;
            let mut it = self.resolve(self.bucket_at(index));
            while !it.is_null() {
                chains += 1;
                it = self.resolve(unsafe { (*it).next() });
            }
            max = max.max(chains);
        }
        max.max(0) as u32
    }

    pub fn count_mean_chaining(&self) -> f32 {
        let mut used = 0u32;
        let mut total = 0u32;
        for index in 0..self.bucket_count {
            let mut chains = -1i64;
            let mut it = self.resolve(self.bucket_at(index));
            while !it.is_null() {
                chains += 1;
                it = self.resolve(unsafe { (*it).next() });
            }
            if chains >= 0 {
                used += 1;
                total += chains as u32;
            }
        }
        if used > 0 {
            total as f32 / used as f32
        } else {
            0.0
        }
    }

    fn for_each_record(&self, mut f: impl FnMut(*mut PooledStr)) {
        for index in 0..self.bucket_count {
            let mut it = self.resolve(self.bucket_at(index));
            while !it.is_null() {
                f(it);
                it = self.resolve(unsafe { (*it).next() });
            }
        }
    }

    /// Checks chain ordering and the item count; a debug aid for pool
    /// tests.
    pub fn sanity_check(&self) {
        let mut count = 0u32;
        for index in 0..self.bucket_count {
            let mut it = self.resolve(self.bucket_at(index));
            while !it.is_null() {
                // SAFETY: live records.
                unsafe {
                    let next = self.resolve((*it).next());
                    if !next.is_null() {
                        assert!(
                            PooledStr::compare_records(it, next) == std::cmp::Ordering::Less,
                            "chain must be strictly increasing"
                        );
                    }
                    count += 1;
                    it = next;
                }
            }
        }
        assert_eq!(count, self.item_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StringPool<Rc<HeapAlloc>, 4096> {
        StringPool::new(Rc::new(HeapAlloc::new()))
    }

    #[test]
    fn provide_dedups_and_marks_keys() {
        let mut p = pool();
        let (a, found) = p.provide("a long enough string", false);
        assert!(!found);
        assert_eq!(p.len(), 1);

        let (b, found) = p.provide("a long enough string", false);
        assert!(found);
        assert_eq!(a, b);
        assert_eq!(p.len(), 1);
        assert!(!unsafe { a.as_ref() }.is_key());

        // A hit as key makes the flag stick.
        let (c, found) = p.provide("a long enough string", true);
        assert!(found);
        assert_eq!(a, c);
        assert!(unsafe { a.as_ref() }.is_key());

        assert_eq!(p.get("a long enough string"), Some(a));
        assert_eq!(p.get("missing"), None);
        p.sanity_check();
    }

    #[test]
    fn borrowed_records_point_at_caller_bytes() {
        let mut p = pool();
        let backing = String::from("external storage for the pool");
        let (r, found) = unsafe { p.provide_borrowed(&backing, false) };
        assert!(!found);
        let record = r.as_ptr() as *const PooledStr;
        assert!(!unsafe { (*record).owns() });
        assert_eq!(unsafe { PooledStr::as_str(record) }, backing.as_str());
        assert_eq!(
            unsafe { PooledStr::bytes(record) }.as_ptr(),
            backing.as_ptr()
        );
    }

    #[test]
    fn growth_rehashes_past_max_load() {
        let mut p = pool();
        assert_eq!(p.bucket_count(), 0);
        let mut refs = Vec::new();
        for i in 0..100 {
            let s = format!("string number {i} padded well past inline");
            let (r, found) = p.provide(&s, i % 2 == 0);
            assert!(!found);
            refs.push((s, r));
        }
        assert_eq!(p.len(), 100);
        assert!(p.bucket_count() >= 64);
        assert!(p.load_factor() <= p.max_load_factor());
        // Rehashing must not move records.
        for (s, r) in &refs {
            assert_eq!(p.get(s), Some(*r));
        }
        p.sanity_check();
    }

    #[test]
    fn release_values_keeps_keys() {
        let mut p = pool();
        p.provide("value only string, rather long", false);
        let (key, _) = p.provide("key string, also rather long", true);
        // Value first used as value, later as key: must survive.
        let (mixed, _) = p.provide("mixed usage string, long too", false);
        p.provide("mixed usage string, long too", true);
        assert_eq!(p.len(), 3);

        unsafe { p.release_values() };
        assert_eq!(p.len(), 2);
        assert_eq!(p.get("value only string, rather long"), None);
        assert_eq!(p.get("key string, also rather long"), Some(key));
        assert_eq!(p.get("mixed usage string, long too"), Some(mixed));
    }

    #[test]
    fn clear_then_reuse() {
        let base = Rc::new(HeapAlloc::new());
        let mut p: StringPool<Rc<HeapAlloc>, 4096> = StringPool::new(Rc::clone(&base));
        for i in 0..40 {
            p.provide(&format!("payload {i} stretched past the inline limit"), false);
        }
        unsafe { p.clear() };
        assert_eq!(p.len(), 0);
        assert_eq!(p.bucket_count(), 0);
        assert_eq!(p.get("payload 7 stretched past the inline limit"), None);

        let (_, found) = p.provide("fresh after clear, nice and long", false);
        assert!(!found);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn shrink_on_empty_pool_releases_chunks() {
        let base = Rc::new(HeapAlloc::new());
        {
            let mut p: StringPool<Rc<HeapAlloc>, 4096> = StringPool::new(Rc::clone(&base));
            p.provide("some string that takes chunk space", false);
            unsafe { p.clear() };
            p.shrink(false);
            assert_eq!(base.allocated(), 0);
        }
        assert_eq!(base.allocated(), 0);
    }

    #[test]
    fn short_strings_intern_too() {
        // The pool itself has no shortness policy; that belongs to the
        // value layer. Single-byte strings must round-trip fine.
        let mut p = pool();
        let (a, _) = p.provide("a", false);
        let (b, found) = p.provide("a", true);
        assert!(found);
        assert_eq!(a, b);
        assert_eq!(unsafe { PooledStr::as_str(a.as_ptr()) }, "a");
    }
}
