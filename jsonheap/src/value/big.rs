// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Out-of-line big-container descriptors.
//!
//! When a container's capacity reaches the 16-bit inline limit, the value
//! cell stores a pointer to `{capa: u32, data: [T; capa]}` instead of a
//! plain element buffer; the cell's inline capacity field holds the 0xFFFF
//! sentinel. These helpers define that layout once for every element kind.

use std::mem::{align_of, size_of};

/// Byte offset of the element run after the `u32` capacity header.
pub(crate) const fn data_offset<T>() -> usize {
    let align = align_of::<T>();
    if align > 4 {
        align
    } else {
        4
    }
}

/// Allocation size of a descriptor holding `capa` elements.
pub(crate) fn alloc_size<T>(capa: u32) -> u32 {
    debug_assert!(capa > 0);
    debug_assert!(capa as u64 * size_of::<T>() as u64 + data_offset::<T>() as u64 <= u32::MAX as u64);
    data_offset::<T>() as u32 + capa * size_of::<T>() as u32
}

/// Reads the real capacity from a descriptor.
///
/// # Safety
/// `big` must point at a descriptor produced by this module's layout.
pub(crate) unsafe fn capa(big: *const u8) -> u32 {
    unsafe { (big as *const u32).read() }
}

/// # Safety
/// `big` must point at an allocation of at least [alloc_size]`::<T>(capa)`.
pub(crate) unsafe fn set_capa(big: *mut u8, capa: u32) {
    unsafe { (big as *mut u32).write(capa) };
}

/// # Safety
/// `big` must point at a descriptor for element type `T`.
pub(crate) unsafe fn data<T>(big: *const u8) -> *mut T {
    unsafe { big.add(data_offset::<T>()) as *mut T }
}

/// Smallest chunk able to hold any one-element descriptor; the member
/// descriptor is the largest of the five kinds.
pub(crate) const MIN_CHUNK: u32 =
    (data_offset::<super::PackedMember>() + size_of::<super::PackedMember>()) as u32;
