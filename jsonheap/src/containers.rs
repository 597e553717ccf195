// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reserve / grow / shrink / erase / convert primitives for the five
//! container kinds, generic over the element type.
//!
//! Every reallocation honors the same protocol: try the allocator's
//! in-place realloc first, fall back to allocate-copy-free. Crossing the
//! 0xFFFF capacity sentinel in either direction switches between a plain
//! element buffer and a big-container descriptor.

use std::mem::size_of;
use std::ptr;

use crate::alloc::{BaseAlloc, ObjectPool, BASE_ALIGN};
use crate::value::{big, ContElem, PackedValue, Tag, Widen, BIG_CAPA};

const fn align_up(size: u32) -> u32 {
    (size + (BASE_ALIGN as u32 - 1)) & !(BASE_ALIGN as u32 - 1)
}

/// Grows the container's storage to at least `new_capacity` elements.
pub(crate) fn reserve<T: ContElem, A: BaseAlloc, const C: u16>(
    value: &mut PackedValue,
    new_capacity: u32,
    opa: &mut ObjectPool<A, C>,
) {
    debug_assert!(value.tag() == T::TAG);
    let capacity = value.capacity::<T>();
    if new_capacity <= capacity {
        return;
    }
    let size = value.cont_size();
    let esize = size_of::<T>() as u32;

    if new_capacity < BIG_CAPA as u32 {
        // The old buffer is inline too (capacity < new_capacity).
        let old = value.cont_ptr();
        let grown_in_place =
            capacity > 0 && opa.realloc(old, capacity * esize, new_capacity * esize);
        if !grown_in_place {
            let fresh = opa.allocate(new_capacity * esize).as_ptr();
            if capacity > 0 {
                // SAFETY: both buffers hold at least `size` elements.
                unsafe { ptr::copy_nonoverlapping(old, fresh, (size * esize) as usize) };
                opa.deallocate(old, capacity * esize);
            }
            value.set_cont_ptr(fresh);
        }
        value.set_cont_capa_raw(new_capacity as u16);
    } else {
        let fresh = opa.allocate(big::alloc_size::<T>(new_capacity)).as_ptr();
        // SAFETY: freshly allocated descriptor of the right size.
        unsafe { big::set_capa(fresh, new_capacity) };
        if capacity > 0 {
            let old_data = value.data::<T>() as *const u8;
            // SAFETY: both element runs hold at least `size` elements.
            unsafe {
                ptr::copy_nonoverlapping(
                    old_data,
                    big::data::<T>(fresh) as *mut u8,
                    (size * esize) as usize,
                )
            };
            if value.cont_capa_raw() < BIG_CAPA {
                opa.deallocate(value.cont_ptr(), capacity * esize);
            } else {
                opa.deallocate(value.cont_ptr(), big::alloc_size::<T>(capacity));
            }
        }
        value.set_cont_ptr(fresh);
        value.set_cont_capa_raw(BIG_CAPA);
    }
}

/// Amortized growth: ceil(capacity * 1.5), or 1 from empty.
pub(crate) fn grow<T: ContElem, A: BaseAlloc, const C: u16>(
    value: &mut PackedValue,
    opa: &mut ObjectPool<A, C>,
) {
    let capacity = value.capacity::<T>();
    let new_capacity = if capacity > 0 {
        capacity + (capacity + 1) / 2
    } else {
        1
    };
    reserve::<T, A, C>(value, new_capacity, opa);
}

/// Trims capacity down to size. Chunk-resident buffers give their tail
/// back in place; everything else is moved to an exact-fit allocation.
/// A big descriptor whose size dropped below the sentinel becomes a plain
/// buffer again.
pub(crate) fn shrink<T: ContElem, A: BaseAlloc, const C: u16>(
    value: &mut PackedValue,
    opa: &mut ObjectPool<A, C>,
) {
    debug_assert!(value.tag() == T::TAG);
    let size = value.cont_size();
    let capacity = value.capacity::<T>();
    if size == capacity {
        return;
    }
    let esize = size_of::<T>() as u32;

    if value.cont_capa_raw() < BIG_CAPA {
        let old = value.cont_ptr();
        if ObjectPool::<A, C>::chunk_sized(capacity * esize) {
            // In place: release the aligned tail of the buffer.
            let kept = align_up(size * esize);
            let whole = align_up(capacity * esize);
            if kept < whole {
                // SAFETY: the tail region belongs to this buffer.
                opa.deallocate(unsafe { old.add(kept as usize) }, whole - kept);
            }
        } else {
            if size > 0 {
                let fresh = opa.allocate(size * esize).as_ptr();
                // SAFETY: both buffers hold at least `size` elements.
                unsafe { ptr::copy_nonoverlapping(old, fresh, (size * esize) as usize) };
                value.set_cont_ptr(fresh);
            }
            opa.deallocate(old, capacity * esize);
        }
        if size == 0 {
            value.set_cont_ptr(ptr::null_mut());
        }
        value.set_cont_capa_raw(size as u16);
    } else if size < BIG_CAPA as u32 {
        // Big descriptor back to a plain buffer.
        let descriptor = value.cont_ptr();
        if size > 0 {
            let fresh = opa.allocate(size * esize).as_ptr();
            // SAFETY: the descriptor holds at least `size` elements.
            unsafe {
                ptr::copy_nonoverlapping(
                    big::data::<T>(descriptor) as *const u8,
                    fresh,
                    (size * esize) as usize,
                )
            };
            value.set_cont_ptr(fresh);
        } else {
            value.set_cont_ptr(ptr::null_mut());
        }
        opa.deallocate(descriptor, big::alloc_size::<T>(capacity));
        value.set_cont_capa_raw(size as u16);
    } else {
        // Big to smaller big.
        let descriptor = value.cont_ptr();
        let fresh = opa.allocate(big::alloc_size::<T>(size)).as_ptr();
        // SAFETY: fresh descriptor sized for `size` elements.
        unsafe {
            big::set_capa(fresh, size);
            ptr::copy_nonoverlapping(
                big::data::<T>(descriptor) as *const u8,
                big::data::<T>(fresh) as *mut u8,
                (size * esize) as usize,
            );
        }
        opa.deallocate(descriptor, big::alloc_size::<T>(capacity));
        value.set_cont_ptr(fresh);
    }
}

/// Removes the element at `index`, sliding the tail left. Element order is
/// preserved. The caller has already released anything the element owned.
pub(crate) fn erase<T: ContElem>(value: &mut PackedValue, index: u32) {
    debug_assert!(value.tag() == T::TAG);
    let size = value.cont_size();
    debug_assert!(index < size);
    let data = value.data::<T>();
    // SAFETY: both ranges lie inside the live element run.
    unsafe {
        ptr::copy(
            data.add(index as usize + 1),
            data.add(index as usize),
            (size - 1 - index) as usize,
        )
    };
    value.dec_size();
}

/// Rewrites a specialized array as a generic one, widening every element
/// to a full value cell. `reserve_extra` adds headroom beyond the current
/// size; the result capacity never drops below the current one.
pub(crate) fn convert_to_generic<T: Widen, A: BaseAlloc, const C: u16>(
    value: &mut PackedValue,
    reserve_extra: u32,
    opa: &mut ObjectPool<A, C>,
) {
    debug_assert!(value.tag() == T::TAG);
    let size = value.cont_size();
    let capacity = value.capacity::<T>();
    let new_capacity = (size + reserve_extra).max(capacity);
    if new_capacity == 0 {
        value.force_tag(Tag::Array);
        return;
    }

    let (raw, data, big_dest) = if new_capacity < BIG_CAPA as u32 {
        let raw = opa
            .allocate(new_capacity * size_of::<PackedValue>() as u32)
            .as_ptr();
        (raw, raw as *mut PackedValue, false)
    } else {
        let raw = opa.allocate(big::alloc_size::<PackedValue>(new_capacity)).as_ptr();
        // SAFETY: fresh descriptor.
        unsafe { big::set_capa(raw, new_capacity) };
        (raw, unsafe { big::data::<PackedValue>(raw) }, true)
    };

    let src = value.data::<T>();
    for i in 0..size as usize {
        // SAFETY: src holds `size` elements, data holds new_capacity.
        unsafe { data.add(i).write((*src.add(i)).widen()) };
    }

    let esize = size_of::<T>() as u32;
    if value.cont_capa_raw() < BIG_CAPA {
        if capacity > 0 {
            opa.deallocate(value.cont_ptr(), capacity * esize);
        }
    } else {
        opa.deallocate(value.cont_ptr(), big::alloc_size::<T>(capacity));
    }

    value.force_tag(Tag::Array);
    value.set_cont_ptr(raw);
    value.set_cont_capa_raw(if big_dest { BIG_CAPA } else { new_capacity as u16 });
}

/// Widens an int array to a double array. Same-capacity conversions run in
/// place over the existing buffer; the allocator hands out whole 8-byte
/// slots, so an i64 slot always has room for the f64 that replaces it.
pub(crate) fn convert_int_to_double<A: BaseAlloc, const C: u16>(
    value: &mut PackedValue,
    reserve_extra: u32,
    opa: &mut ObjectPool<A, C>,
) {
    debug_assert!(value.tag() == Tag::IntArray);
    let size = value.cont_size();
    let capacity = value.capacity::<i64>();
    let new_capacity = (size + reserve_extra).max(capacity);
    if new_capacity == 0 {
        value.force_tag(Tag::DoubleArray);
        return;
    }
    let esize = size_of::<i64>() as u32;

    if new_capacity == capacity {
        let data = value.data::<i64>();
        for i in 0..size as usize {
            // SAFETY: slot i is 8 bytes; read the integer before
            // overwriting it with its widened image.
            unsafe {
                let v = *data.add(i);
                (data as *mut f64).add(i).write(v as f64);
            }
        }
        value.force_tag(Tag::DoubleArray);
    } else if new_capacity < BIG_CAPA as u32 {
        // The old buffer is inline (capacity <= new_capacity).
        let old = value.cont_ptr();
        if capacity > 0 && opa.realloc(old, capacity * esize, new_capacity * esize) {
            let data = old as *mut i64;
            for i in 0..size as usize {
                // SAFETY: as above.
                unsafe {
                    let v = *data.add(i);
                    (data as *mut f64).add(i).write(v as f64);
                }
            }
        } else {
            let fresh = opa.allocate(new_capacity * esize).as_ptr() as *mut f64;
            let src = old as *const i64;
            for i in 0..size as usize {
                // SAFETY: disjoint buffers of sufficient size.
                unsafe { fresh.add(i).write(*src.add(i) as f64) };
            }
            if capacity > 0 {
                opa.deallocate(old, capacity * esize);
            }
            value.set_cont_ptr(fresh as *mut u8);
        }
        value.force_tag(Tag::DoubleArray);
        value.set_cont_capa_raw(new_capacity as u16);
    } else {
        let fresh = opa.allocate(big::alloc_size::<f64>(new_capacity)).as_ptr();
        // SAFETY: fresh descriptor; source run holds `size` elements.
        unsafe {
            big::set_capa(fresh, new_capacity);
            let dst = big::data::<f64>(fresh);
            let src = value.data::<i64>();
            for i in 0..size as usize {
                dst.add(i).write(*src.add(i) as f64);
            }
        }
        if value.cont_capa_raw() < BIG_CAPA {
            if capacity > 0 {
                opa.deallocate(value.cont_ptr(), capacity * esize);
            }
        } else {
            opa.deallocate(value.cont_ptr(), big::alloc_size::<i64>(capacity));
        }
        value.force_tag(Tag::DoubleArray);
        value.set_cont_ptr(fresh);
        value.set_cont_capa_raw(BIG_CAPA);
    }
}
