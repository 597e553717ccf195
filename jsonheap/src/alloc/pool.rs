// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Slab pool allocator with dead-cell recycling.
//!
//! Two faces over one core: [ObjectPool] hands out raw pointers and keeps
//! its chunks address-sorted so deallocation can find the owning chunk by
//! binary search; [CompactPool] hands out 4-byte [CompactRef] handles and
//! keeps chunk indices stable instead.

use std::ptr::NonNull;

use tracing::trace;

use super::base::{BaseAlloc, BASE_ALIGN};
use super::compact::CompactRef;
use crate::value::big;

/// Smallest region the freelist can describe.
const DEAD_CELL_SIZE: u32 = 4;

/// Bookkeeping for one fixed-size chunk. `first_dead == CHUNK` means the
/// freelist is empty.
struct Chunk {
    first_avail: u16,
    first_dead: u16,
    total_dead: u16,
    data: NonNull<u8>,
}

/// Freed intra-chunk region: `{size, next}` written into the region itself.
unsafe fn dead_set(ptr: *mut u8, size: u16, next: u16) {
    unsafe {
        (ptr as *mut u16).write_unaligned(size);
        (ptr.add(2) as *mut u16).write_unaligned(next);
    }
}

unsafe fn dead_size(ptr: *const u8) -> u16 {
    unsafe { (ptr as *const u16).read_unaligned() }
}

unsafe fn dead_next(ptr: *const u8) -> u16 {
    unsafe { (ptr.add(2) as *const u16).read_unaligned() }
}

/// Oversized allocations live as standalone records in a forward list.
#[repr(C)]
struct FallbackHeader {
    next: *mut FallbackHeader,
    size: u32,
}

const FB_HEADER: usize = std::mem::size_of::<FallbackHeader>();

unsafe fn fallback_payload(hdr: *mut FallbackHeader) -> *mut u8 {
    unsafe { (hdr as *mut u8).add(FB_HEADER) }
}

/// Shared state of both pool faces. `SORTED` selects the nominal scheme
/// (chunks ordered by data address) over the stable-index alt scheme.
struct PoolCore<A: BaseAlloc, const CHUNK: u16, const SORTED: bool> {
    last_chunk: usize,
    total_dead: u32,
    chunks: Vec<Chunk>,
    fallbacks: *mut FallbackHeader,
    fallback_count: u32,
    base: A,
}

impl<A: BaseAlloc, const CHUNK: u16, const SORTED: bool> PoolCore<A, CHUNK, SORTED> {
    fn new(base: A) -> Self {
        assert!(
            CHUNK == 0 || (CHUNK as u32 >= big::MIN_CHUNK && CHUNK < u16::MAX),
            "chunk size must be 0 or in [{}, 65534]",
            big::MIN_CHUNK,
        );
        PoolCore {
            last_chunk: 0,
            total_dead: 0,
            chunks: Vec::new(),
            fallbacks: std::ptr::null_mut(),
            fallback_count: 0,
            base,
        }
    }

    fn align_size(size: u32) -> u32 {
        debug_assert!(size > 0 && size <= i32::MAX as u32);
        (size + (BASE_ALIGN as u32 - 1)) & !(BASE_ALIGN as u32 - 1)
    }

    fn chunkable(aligned: u32) -> bool {
        aligned <= CHUNK as u32
    }

    fn avail(&self, idx: usize) -> u16 {
        CHUNK - self.chunks[idx].first_avail
    }

    fn grow_directory(&mut self) {
        if self.chunks.len() == self.chunks.capacity() {
            let additional = ((self.chunks.capacity() + 1) / 2).max(1);
            self.chunks.reserve_exact(additional);
        }
    }

    /// Creates a chunk, positions it (sorted insert under the nominal
    /// scheme, append under alt), and makes it the last-used chunk.
    fn push_new_chunk(&mut self) -> usize {
        self.grow_directory();
        let data = self.base.allocate(CHUNK as usize);
        trace!(chunk_size = CHUNK, chunks = self.chunks.len() + 1, "pool chunk created");
        let chunk = Chunk {
            first_avail: 0,
            first_dead: CHUNK,
            total_dead: 0,
            data,
        };
        let idx = if SORTED {
            let at = self
                .chunks
                .partition_point(|c| c.data.as_ptr() < data.as_ptr());
            self.chunks.insert(at, chunk);
            at
        } else {
            self.chunks.push(chunk);
            self.chunks.len() - 1
        };
        self.last_chunk = idx;
        idx
    }

    /// The chunk-scheme allocation search. `aligned` must be chunkable.
    /// Returns the serving chunk index and the offset within it.
    fn alloc_chunked(&mut self, aligned: u32) -> (usize, u16) {
        debug_assert!(aligned >= DEAD_CELL_SIZE && Self::chunkable(aligned));
        let size = aligned as u16;

        if self.chunks.is_empty() {
            self.push_new_chunk();
        }

        // Last-used chunk: tail, then freelist.
        let last = self.last_chunk;
        if self.avail(last) >= size {
            let pos = self.chunks[last].first_avail;
            self.chunks[last].first_avail += size;
            return (last, pos);
        }
        if let Some(pos) = self.allocate_from_dead(last, size) {
            return (last, pos);
        }

        // Other chunks: tails.
        for i in 0..self.chunks.len() {
            if i != last && self.avail(i) >= size {
                self.last_chunk = i;
                let pos = self.chunks[i].first_avail;
                self.chunks[i].first_avail += size;
                return (i, pos);
            }
        }
        // Other chunks: freelists. Last-used is deliberately not moved on a
        // freelist hit.
        if self.total_dead >= aligned {
            for i in 0..self.chunks.len() {
                if i != last {
                    if let Some(pos) = self.allocate_from_dead(i, size) {
                        return (i, pos);
                    }
                }
            }
        }

        let idx = self.push_new_chunk();
        self.chunks[idx].first_avail = size;
        (idx, 0)
    }

    /// Freelist fit policy: exact match unlinks the cell; a cell at least
    /// twice the request is split from its tail; otherwise the smallest
    /// cell larger than the request donates its tail.
    fn allocate_from_dead(&mut self, idx: usize, size: u16) -> Option<u16> {
        if self.chunks[idx].total_dead < size {
            return None;
        }
        let data = self.chunks[idx].data.as_ptr();
        let size_of_two = size as u32 * 2;
        let mut cur = self.chunks[idx].first_dead;
        let mut prev = CHUNK;
        let mut smallest = CHUNK;
        let mut smallest_size = CHUNK;

        while cur < CHUNK {
            // SAFETY: freelist offsets always point at a dead cell inside
            // the chunk.
            let cell = unsafe { data.add(cur as usize) };
            let dsize = unsafe { dead_size(cell) };

            if dsize == size {
                let next = unsafe { dead_next(cell) };
                if prev >= CHUNK {
                    self.chunks[idx].first_dead = next;
                } else {
                    unsafe {
                        let prev_cell = data.add(prev as usize);
                        dead_set(prev_cell, dead_size(prev_cell), next);
                    }
                }
                self.total_dead -= size as u32;
                self.chunks[idx].total_dead -= size;
                return Some(cur);
            }
            if dsize as u32 >= size_of_two {
                let remaining = dsize - size;
                debug_assert!(remaining as u32 >= DEAD_CELL_SIZE);
                unsafe { dead_set(cell, remaining, dead_next(cell)) };
                self.total_dead -= size as u32;
                self.chunks[idx].total_dead -= size;
                return Some(cur + remaining);
            }
            if dsize < smallest_size && dsize > size {
                smallest = cur;
                smallest_size = dsize;
            }

            prev = cur;
            cur = unsafe { dead_next(cell) };
        }

        if smallest < CHUNK {
            let cell = unsafe { data.add(smallest as usize) };
            debug_assert_eq!(unsafe { dead_size(cell) }, smallest_size);
            let remaining = smallest_size - size;
            unsafe { dead_set(cell, remaining, dead_next(cell)) };
            self.total_dead -= size as u32;
            self.chunks[idx].total_dead -= size;
            return Some(smallest + remaining);
        }
        None
    }

    fn dealloc_at(&mut self, idx: usize, pos: u16, aligned: u32) {
        debug_assert!(aligned >= DEAD_CELL_SIZE && Self::chunkable(aligned));
        let chunk = &mut self.chunks[idx];

        if chunk.total_dead as u32 + aligned == chunk.first_avail as u32 {
            // This return empties the chunk: reset it wholesale.
            self.total_dead -= chunk.total_dead as u32;
            chunk.first_avail = 0;
            chunk.first_dead = CHUNK;
            chunk.total_dead = 0;
            // Prefer a neighbor that still has tail room as last-used.
            let count = self.chunks.len();
            if self.last_chunk == idx && count > 1 {
                let prev = (idx + count - 1) % count;
                if self.chunks[prev].first_avail < CHUNK {
                    self.last_chunk = prev;
                } else {
                    let next = (idx + 1) % count;
                    if self.chunks[next].first_avail < CHUNK {
                        self.last_chunk = next;
                    }
                }
            }
        } else if pos as u32 + aligned == chunk.first_avail as u32 {
            chunk.first_avail = pos;
        } else {
            // SAFETY: the region being freed is at least DEAD_CELL_SIZE
            // bytes and lies inside the chunk.
            unsafe { dead_set(chunk.data.as_ptr().add(pos as usize), aligned as u16, chunk.first_dead) };
            self.total_dead += aligned;
            chunk.first_dead = pos;
            chunk.total_dead += aligned as u16;
        }
    }

    /// In-place growth; only succeeds for the region at the live tail of
    /// its chunk when the new size still fits.
    fn realloc_at(&mut self, idx: usize, pos: u16, aligned_old: u32, aligned_new: u32) -> bool {
        debug_assert!(aligned_new >= aligned_old);
        let chunk = &mut self.chunks[idx];
        if pos as u32 + aligned_old == chunk.first_avail as u32
            && pos as u32 + aligned_new <= CHUNK as u32
        {
            chunk.first_avail = (pos as u32 + aligned_new) as u16;
            return true;
        }
        false
    }

    fn fallback_alloc(&mut self, size: u32) -> NonNull<u8> {
        let raw = self.base.allocate(FB_HEADER + size as usize);
        let hdr = raw.as_ptr() as *mut FallbackHeader;
        // SAFETY: the block is large enough for the header and 8-aligned.
        unsafe {
            hdr.write(FallbackHeader {
                next: self.fallbacks,
                size,
            })
        };
        self.fallbacks = hdr;
        self.fallback_count += 1;
        trace!(size, "pool fallback allocation");
        // SAFETY: payload starts within the block.
        unsafe { NonNull::new_unchecked(fallback_payload(hdr)) }
    }

    fn free_fallback(&self, hdr: *mut FallbackHeader) {
        let size = unsafe { (*hdr).size };
        // SAFETY: fallback records are whole base-allocator blocks.
        self.base
            .deallocate(unsafe { NonNull::new_unchecked(hdr as *mut u8) }, FB_HEADER + size as usize);
    }

    /// Unlinks the fallback owning `payload` (nominal scheme).
    fn fallback_remove(&mut self, payload: *mut u8, size: u32) {
        let mut it = self.fallbacks;
        let mut prev: *mut FallbackHeader = std::ptr::null_mut();
        while !it.is_null() {
            if unsafe { fallback_payload(it) } == payload {
                debug_assert_eq!(unsafe { (*it).size }, size);
                let next = unsafe { (*it).next };
                if prev.is_null() {
                    self.fallbacks = next;
                } else {
                    unsafe { (*prev).next = next };
                }
                self.free_fallback(it);
                return;
            }
            prev = it;
            it = unsafe { (*it).next };
        }
        debug_assert!(false, "pointer to deallocate does not belong to this pool");
    }

    /// Swaps the fallback at `pos` positions from the head for a 1-byte
    /// placeholder so later positions stay addressable (alt scheme).
    fn fallback_replace(&mut self, pos_from_tail: u16, size: u32) {
        debug_assert!((pos_from_tail as u32) < self.fallback_count);
        let pos = self.fallback_count - 1 - pos_from_tail as u32;

        let raw = self.base.allocate(FB_HEADER + 1);
        let placeholder = raw.as_ptr() as *mut FallbackHeader;

        let mut it = self.fallbacks;
        let mut prev: *mut FallbackHeader = std::ptr::null_mut();
        for _ in 0..pos {
            debug_assert!(!it.is_null());
            prev = it;
            it = unsafe { (*it).next };
        }
        debug_assert_eq!(unsafe { (*it).size }, size);
        // SAFETY: placeholder block is header-sized plus one byte.
        unsafe {
            placeholder.write(FallbackHeader {
                next: (*it).next,
                size: 1,
            })
        };
        if prev.is_null() {
            self.fallbacks = placeholder;
        } else {
            unsafe { (*prev).next = placeholder };
        }
        self.free_fallback(it);
    }

    fn fallback_at(&self, pos_from_tail: u16) -> *mut u8 {
        debug_assert!((pos_from_tail as u32) < self.fallback_count);
        let pos = self.fallback_count - 1 - pos_from_tail as u32;
        let mut it = self.fallbacks;
        for _ in 0..pos {
            debug_assert!(!it.is_null());
            it = unsafe { (*it).next };
        }
        unsafe { fallback_payload(it) }
    }

    fn free_all_fallbacks(&mut self) {
        let mut it = self.fallbacks;
        while !it.is_null() {
            let next = unsafe { (*it).next };
            self.free_fallback(it);
            it = next;
        }
        self.fallbacks = std::ptr::null_mut();
        self.fallback_count = 0;
    }

    /// Forgets every allocation but keeps the chunks for reuse.
    fn clear(&mut self) {
        for chunk in &mut self.chunks {
            chunk.first_avail = 0;
            chunk.first_dead = CHUNK;
            chunk.total_dead = 0;
        }
        self.total_dead = 0;
        self.free_all_fallbacks();
    }

    /// Returns every chunk and fallback to the base allocator.
    fn release_all(&mut self) {
        for chunk in &self.chunks {
            self.base.deallocate(chunk.data, CHUNK as usize);
        }
        self.chunks = Vec::new();
        self.last_chunk = 0;
        self.total_dead = 0;
        self.free_all_fallbacks();
    }

    // Statistics.

    fn count_fallbacks(&self) -> u32 {
        let mut count = 0;
        let mut it = self.fallbacks;
        while !it.is_null() {
            count += 1;
            it = unsafe { (*it).next };
        }
        count
    }

    fn count_allocated(&self) -> u64 {
        let mut count = 0u64;
        for chunk in &self.chunks {
            count += (chunk.first_avail - chunk.total_dead) as u64;
        }
        let mut it = self.fallbacks;
        while !it.is_null() {
            count += unsafe { (*it).size } as u64;
            it = unsafe { (*it).next };
        }
        count
    }

    fn count_direct_available(&self) -> u64 {
        let mut count = 0u64;
        for idx in 0..self.chunks.len() {
            count += self.avail(idx) as u64;
        }
        count
    }

    fn count_dead_cells(&self) -> u64 {
        let mut count = 0u64;
        for chunk in &self.chunks {
            let mut next = chunk.first_dead;
            while next != CHUNK {
                let cell = unsafe { chunk.data.as_ptr().add(next as usize) };
                next = unsafe { dead_next(cell) };
                count += 1;
            }
        }
        count
    }

    fn sanity_check(&self) {
        assert!(self.chunks.capacity() >= self.chunks.len());
        let mut total_dead = 0u32;
        let mut prev_data: *const u8 = std::ptr::null();
        for chunk in &self.chunks {
            assert!(SORTED == false || chunk.data.as_ptr() as *const u8 > prev_data);
            assert!(chunk.first_avail > chunk.first_dead || chunk.first_dead == CHUNK);
            if chunk.total_dead == 0 {
                assert!(chunk.first_avail <= CHUNK);
                assert!(chunk.first_dead == CHUNK);
            } else {
                assert!(chunk.first_avail > 0);
                assert!(chunk.first_dead < CHUNK);
                let mut chunk_dead = 0u32;
                let mut next = chunk.first_dead;
                while next != CHUNK {
                    let cell = unsafe { chunk.data.as_ptr().add(next as usize) };
                    let dsize = unsafe { dead_size(cell) };
                    assert!(dsize <= chunk.total_dead);
                    chunk_dead += dsize as u32;
                    next = unsafe { dead_next(cell) };
                }
                assert_eq!(chunk_dead, chunk.total_dead as u32);
                total_dead += chunk_dead;
            }
            prev_data = chunk.data.as_ptr();
        }
        assert_eq!(total_dead, self.total_dead);
    }
}

impl<A: BaseAlloc, const CHUNK: u16, const SORTED: bool> Drop for PoolCore<A, CHUNK, SORTED> {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Nominal-scheme slab pool: raw pointers, address-sorted chunks.
pub struct ObjectPool<A: BaseAlloc, const CHUNK: u16> {
    core: PoolCore<A, CHUNK, true>,
}

impl<A: BaseAlloc, const CHUNK: u16> ObjectPool<A, CHUNK> {
    pub fn new(base: A) -> Self {
        ObjectPool {
            core: PoolCore::new(base),
        }
    }

    pub fn base(&self) -> &A {
        &self.core.base
    }

    /// Would a region of `size` bytes live inside a chunk (as opposed to a
    /// fallback record)?
    pub fn chunk_sized(size: u32) -> bool {
        PoolCore::<A, CHUNK, true>::chunkable(PoolCore::<A, CHUNK, true>::align_size(size))
    }

    pub fn allocate(&mut self, size: u32) -> NonNull<u8> {
        let aligned = PoolCore::<A, CHUNK, true>::align_size(size);
        if PoolCore::<A, CHUNK, true>::chunkable(aligned) {
            let (idx, pos) = self.core.alloc_chunked(aligned);
            // SAFETY: pos is inside the chunk.
            unsafe {
                NonNull::new_unchecked(self.core.chunks[idx].data.as_ptr().add(pos as usize))
            }
        } else {
            self.core.fallback_alloc(size)
        }
    }

    pub fn deallocate(&mut self, ptr: *mut u8, size: u32) {
        if ptr.is_null() {
            return;
        }
        let aligned = PoolCore::<A, CHUNK, true>::align_size(size);
        if PoolCore::<A, CHUNK, true>::chunkable(aligned) {
            let idx = self
                .find_chunk(ptr)
                .expect("pointer to deallocate does not belong to this pool");
            let pos = (ptr as usize - self.core.chunks[idx].data.as_ptr() as usize) as u16;
            self.core.dealloc_at(idx, pos, aligned);
        } else {
            self.core.fallback_remove(ptr, size);
        }
    }

    /// Grows the region in place when it sits at the live tail of its
    /// chunk; callers fall back to allocate-copy-free on `false`.
    pub fn realloc(&mut self, ptr: *mut u8, capacity: u32, new_capacity: u32) -> bool {
        if capacity == 0 {
            return false;
        }
        debug_assert!(!ptr.is_null());
        let aligned_old = PoolCore::<A, CHUNK, true>::align_size(capacity);
        if !PoolCore::<A, CHUNK, true>::chunkable(aligned_old) {
            return false;
        }
        let idx = self
            .find_chunk(ptr)
            .expect("pointer to realloc does not belong to this pool");
        let pos = (ptr as usize - self.core.chunks[idx].data.as_ptr() as usize) as u16;
        let aligned_new = PoolCore::<A, CHUNK, true>::align_size(new_capacity);
        self.core.realloc_at(idx, pos, aligned_old, aligned_new)
    }

    /// Copies `size` raw bytes into the pool.
    pub(crate) fn mem_push(&mut self, src: *const u8, size: u32) -> NonNull<u8> {
        debug_assert!(!src.is_null() && size > 0);
        let dst = self.allocate(size);
        // SAFETY: dst was just allocated with `size` bytes and cannot
        // overlap the source.
        unsafe { std::ptr::copy_nonoverlapping(src, dst.as_ptr(), size as usize) };
        dst
    }

    /// Copies a packed run of `count` elements into a fresh big-container
    /// descriptor (`u32` capacity header followed by the elements).
    pub(crate) fn mem_push_big<T>(&mut self, src: *const u8, count: u32) -> NonNull<u8> {
        debug_assert!(!src.is_null() && count > 0);
        let dst = self.allocate(big::alloc_size::<T>(count));
        // SAFETY: dst holds the header plus `count` elements.
        unsafe {
            big::set_capa(dst.as_ptr(), count);
            std::ptr::copy_nonoverlapping(
                src,
                big::data::<T>(dst.as_ptr()) as *mut u8,
                count as usize * std::mem::size_of::<T>(),
            );
        }
        dst
    }

    /// Frees empty chunks; when none survive, the chunk directory itself is
    /// dropped so an empty pool holds no memory at all.
    pub fn shrink(&mut self) {
        let base = &self.core.base;
        self.core.chunks.retain(|chunk| {
            if chunk.first_avail == 0 {
                base.deallocate(chunk.data, CHUNK as usize);
                false
            } else {
                true
            }
        });
        if self.core.chunks.is_empty() {
            self.core.chunks = Vec::new();
        }
        self.core.last_chunk = 0;
    }

    pub fn clear(&mut self) {
        self.core.clear();
    }

    pub fn release_all(&mut self) {
        self.core.release_all();
    }

    pub fn chunks_count(&self) -> u32 {
        self.core.chunks.len() as u32
    }

    pub fn chunks_capacity(&self) -> u32 {
        self.core.chunks.capacity() as u32
    }

    pub fn count_fallbacks(&self) -> u32 {
        self.core.count_fallbacks()
    }

    pub fn count_allocated(&self) -> u64 {
        self.core.count_allocated()
    }

    pub fn count_direct_available(&self) -> u64 {
        self.core.count_direct_available()
    }

    pub fn count_dead_cells(&self) -> u64 {
        self.core.count_dead_cells()
    }

    pub fn total_dead(&self) -> u32 {
        self.core.total_dead
    }

    /// Walks every freelist and checks the dead-byte accounting; a debug
    /// aid for allocator tests.
    pub fn sanity_check(&self) {
        self.core.sanity_check();
    }

    /// Binary search over the address-sorted chunks.
    fn find_chunk(&self, ptr: *mut u8) -> Option<usize> {
        let mut begin = 0usize;
        let mut end = self.core.chunks.len();
        while begin < end {
            let mid = (begin + end) / 2;
            let data = self.core.chunks[mid].data.as_ptr();
            if (ptr as usize) < data as usize {
                end = mid;
            } else if ptr as usize >= data as usize + CHUNK as usize {
                begin = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }
}

/// Alt-scheme slab pool: [CompactRef] handles, stable chunk indices.
pub struct CompactPool<A: BaseAlloc, const CHUNK: u16> {
    core: PoolCore<A, CHUNK, false>,
}

impl<A: BaseAlloc, const CHUNK: u16> CompactPool<A, CHUNK> {
    pub fn new(base: A) -> Self {
        CompactPool {
            core: PoolCore::new(base),
        }
    }

    pub fn base(&self) -> &A {
        &self.core.base
    }

    pub fn chunk_sized(size: u32) -> bool {
        PoolCore::<A, CHUNK, false>::chunkable(PoolCore::<A, CHUNK, false>::align_size(size))
    }

    pub fn allocate(&mut self, size: u32) -> CompactRef {
        let aligned = PoolCore::<A, CHUNK, false>::align_size(size);
        if PoolCore::<A, CHUNK, false>::chunkable(aligned) {
            let (idx, pos) = self.core.alloc_chunked(aligned);
            debug_assert!(idx < CompactRef::FALLBACK_CHUNK as usize);
            CompactRef::new(idx as u16, pos)
        } else {
            self.core.fallback_alloc(size);
            debug_assert!(self.core.fallback_count - 1 <= u16::MAX as u32);
            CompactRef::new(CompactRef::FALLBACK_CHUNK, (self.core.fallback_count - 1) as u16)
        }
    }

    pub fn deallocate(&mut self, r: CompactRef, size: u32) {
        if r.is_null() {
            return;
        }
        if (r.chunk() as usize) < self.core.chunks.len() {
            let aligned = PoolCore::<A, CHUNK, false>::align_size(size);
            debug_assert!(PoolCore::<A, CHUNK, false>::chunkable(aligned));
            self.core.dealloc_at(r.chunk() as usize, r.pos(), aligned);
        } else {
            debug_assert!(r.is_fallback());
            self.core.fallback_replace(r.pos(), size);
        }
    }

    /// Materializes the handle; the null handle resolves to a null pointer.
    pub fn resolve(&self, r: CompactRef) -> *mut u8 {
        if r.is_null() {
            return std::ptr::null_mut();
        }
        if (r.chunk() as usize) < self.core.chunks.len() {
            // SAFETY: pos is within the chunk it was allocated from.
            unsafe {
                self.core.chunks[r.chunk() as usize]
                    .data
                    .as_ptr()
                    .add(r.pos() as usize)
            }
        } else {
            debug_assert!(r.is_fallback());
            self.core.fallback_at(r.pos())
        }
    }

    /// All-or-none: handles stay valid unless every chunk is empty, in
    /// which case everything including the directory is released.
    pub fn shrink(&mut self) {
        for chunk in &self.core.chunks {
            if chunk.first_avail != 0 {
                return;
            }
        }
        for chunk in &self.core.chunks {
            self.core.base.deallocate(chunk.data, CHUNK as usize);
        }
        self.core.chunks = Vec::new();
        self.core.last_chunk = 0;
    }

    pub(crate) fn clear(&mut self) {
        self.core.clear();
    }

    pub(crate) fn release_all(&mut self) {
        self.core.release_all();
    }

    pub fn chunks_count(&self) -> u32 {
        self.core.chunks.len() as u32
    }

    pub fn chunks_capacity(&self) -> u32 {
        self.core.chunks.capacity() as u32
    }

    pub fn count_fallbacks(&self) -> u32 {
        self.core.count_fallbacks()
    }

    pub fn count_allocated(&self) -> u64 {
        self.core.count_allocated()
    }

    pub fn count_direct_available(&self) -> u64 {
        self.core.count_direct_available()
    }

    pub fn count_dead_cells(&self) -> u64 {
        self.core.count_dead_cells()
    }

    pub fn total_dead(&self) -> u32 {
        self.core.total_dead
    }

    /// Walks every freelist and checks the dead-byte accounting; a debug
    /// aid for allocator tests.
    pub fn sanity_check(&self) {
        self.core.sanity_check();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::base::HeapAlloc;
    use crate::alloc::base::StackAlloc;

    #[test]
    fn compact_pool_chunks_and_fallbacks() {
        let mut pool = CompactPool::<HeapAlloc, 64>::new(HeapAlloc::new());
        assert_eq!(pool.chunks_count(), 0);
        assert_eq!(pool.count_fallbacks(), 0);

        let r0 = pool.allocate(32);
        assert_eq!(pool.chunks_count(), 1);
        assert_eq!(pool.count_fallbacks(), 0);

        let r1 = pool.allocate(128);
        assert_eq!(pool.chunks_count(), 1);
        assert_eq!(pool.count_fallbacks(), 1);
        assert_ne!(pool.resolve(r0), pool.resolve(r1));

        let r2 = pool.allocate(32);
        assert_eq!(pool.chunks_count(), 1);
        assert_eq!(pool.count_fallbacks(), 1);
        assert_ne!(pool.resolve(r1), pool.resolve(r2));

        let r3 = pool.allocate(14);
        assert_eq!(pool.chunks_count(), 2);
        assert_eq!(pool.count_fallbacks(), 1);
        assert_ne!(pool.resolve(r0), pool.resolve(r3));

        let r4 = pool.allocate(50);
        assert_eq!(pool.chunks_count(), 3);
        assert_eq!(pool.count_fallbacks(), 1);
        assert_ne!(pool.resolve(r3), pool.resolve(r4));

        let r5 = pool.allocate(65);
        assert_eq!(pool.chunks_count(), 3);
        assert_eq!(pool.count_fallbacks(), 2);
        assert_ne!(pool.resolve(r1), pool.resolve(r5));

        let r6 = pool.allocate(64);
        assert_eq!(pool.chunks_count(), 4);
        assert_eq!(pool.count_fallbacks(), 2);
        assert_ne!(pool.resolve(r4), pool.resolve(r6));

        // Fits the tail room chunk 1 still has.
        let r7 = pool.allocate(1);
        assert_eq!(pool.chunks_count(), 4);
        assert_eq!(pool.count_fallbacks(), 2);
        assert_ne!(pool.resolve(r6), pool.resolve(r7));
        pool.sanity_check();
    }

    #[test]
    fn compact_fallback_indices_stay_stable() {
        let mut pool = CompactPool::<HeapAlloc, 64>::new(HeapAlloc::new());
        let a = pool.allocate(100);
        let b = pool.allocate(200);
        let c = pool.allocate(300);
        let b_ptr = pool.resolve(b);
        let c_ptr = pool.resolve(c);
        assert_ne!(b_ptr, c_ptr);

        // Freeing the middle record must not shift the others.
        pool.deallocate(a, 100);
        assert_eq!(pool.resolve(b), b_ptr);
        assert_eq!(pool.resolve(c), c_ptr);
        pool.deallocate(c, 300);
        assert_eq!(pool.resolve(b), b_ptr);
    }

    #[test]
    fn object_pool_on_stack_allocator() {
        let base = StackAlloc::<256>::new();
        {
            let mut opa = ObjectPool::<&StackAlloc<256>, 64>::new(&base);
            let m0 = opa.allocate(31);
            assert_eq!(opa.chunks_count(), 1);
            assert_eq!(base.used(), 64);

            let m1 = opa.allocate(32);
            assert_eq!(opa.chunks_count(), 1);
            assert_eq!(base.used(), 64);
            assert_ne!(m0, m1);

            opa.deallocate(m0.as_ptr(), 31);
            assert_eq!(opa.total_dead(), 32);

            opa.deallocate(m1.as_ptr(), 32);
            assert_eq!(opa.total_dead(), 0);
            assert_eq!(base.used(), 64);
        }
        // Dropping the pool returns the chunk.
        assert_eq!(base.used(), 0);
    }

    #[test]
    fn object_pool_dead_cell_recycling() {
        let base = HeapAlloc::new();
        let mut opa = ObjectPool::<&HeapAlloc, 64>::new(&base);

        // Fill chunk 0 exactly: 16 + 16 + 32.
        let m0 = opa.allocate(16);
        let m1 = opa.allocate(15);
        let m2 = opa.allocate(32);
        assert_eq!(opa.chunks_count(), 1);
        assert_ne!(m0, m1);
        assert_ne!(m1, m2);

        // Fill chunk 1: 32 + 32.
        let m3 = opa.allocate(32);
        let m4 = opa.allocate(30);
        assert_eq!(opa.chunks_count(), 2);
        assert_ne!(m2, m3);
        assert_ne!(m3, m4);

        opa.deallocate(m1.as_ptr(), 15);
        opa.deallocate(m3.as_ptr(), 32);
        assert_eq!(opa.total_dead(), 48);

        // Both tails are exhausted, so the freed slots are reused exactly.
        let m3_again = opa.allocate(32);
        let m1_again = opa.allocate(15);
        assert_eq!(opa.total_dead(), 0);
        assert_eq!(m1, m1_again);
        assert_eq!(m3, m3_again);
        opa.sanity_check();
    }

    #[test]
    fn realloc_in_place_only_at_tail() {
        let base = HeapAlloc::new();
        let mut opa = ObjectPool::<&HeapAlloc, 64>::new(&base);

        let a = opa.allocate(16);
        assert!(opa.realloc(a.as_ptr(), 16, 32));
        // `a` now spans 32 bytes; a second region lands after it.
        let b = opa.allocate(16);
        assert_ne!(a, b);
        // `a` is no longer at the tail.
        assert!(!opa.realloc(a.as_ptr(), 32, 48));
        // Growth past the chunk end fails too.
        assert!(!opa.realloc(b.as_ptr(), 16, 64));
    }

    #[test]
    fn shrink_reaches_zero_allocated() {
        let base = HeapAlloc::new();
        {
            let mut opa = ObjectPool::<&HeapAlloc, 64>::new(&base);
            let a = opa.allocate(16);
            let f = opa.allocate(100);
            opa.deallocate(a.as_ptr(), 16);
            opa.deallocate(f.as_ptr(), 100);
            opa.shrink();
            assert_eq!(opa.chunks_count(), 0);
            assert_eq!(opa.count_fallbacks(), 0);
            assert_eq!(base.allocated(), 0);
            // Idempotent.
            opa.shrink();
            assert_eq!(base.allocated(), 0);
        }
        assert_eq!(base.allocated(), 0);
    }

    #[test]
    fn big_descriptor_push() {
        let base = HeapAlloc::new();
        let mut opa = ObjectPool::<&HeapAlloc, 4096>::new(&base);
        let values: Vec<i64> = (0..100).collect();
        let dst = opa.mem_push_big::<i64>(values.as_ptr() as *const u8, 100);
        unsafe {
            assert_eq!(big::capa(dst.as_ptr()), 100);
            let data = big::data::<i64>(dst.as_ptr());
            assert_eq!(*data, 0);
            assert_eq!(*data.add(99), 99);
        }
        opa.deallocate(dst.as_ptr(), big::alloc_size::<i64>(100));
        assert_eq!(opa.count_allocated(), 0);
    }
}
