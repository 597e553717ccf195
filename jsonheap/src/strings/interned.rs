// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Immutable string record, element of a [StringPool](super::pool::StringPool).
//!
//! The record is a 16-byte header whose payload either continues past the
//! header (owned bytes) or points at external storage (borrowed bytes).
//! Because the payload may overflow the nominal struct, all byte access
//! goes through raw-pointer associated functions rather than `&self`.

use std::cmp::Ordering;

use crate::alloc::CompactRef;

/// Strings are capped at 2^30 - 1 bytes so the length fits the flags word.
pub const MAX_STR_LEN: u32 = (1 << 30) - 1;

const PAYLOAD_OFFSET: usize = 8;
const INLINE_CAPACITY: u32 = 8;

/// Pooled string: `flags = len << 2 | key << 1 | own`, the intrusive chain
/// link, then the payload.
#[repr(C)]
pub struct PooledStr {
    flags: u32,
    next: CompactRef,
    payload: Payload,
}

#[derive(Clone, Copy)]
#[repr(C)]
union Payload {
    ext: *const u8,
    inline: [u8; INLINE_CAPACITY as usize],
}

const _: () = assert!(std::mem::size_of::<PooledStr>() == 16);
const _: () = assert!(std::mem::align_of::<PooledStr>() == 8);

impl PooledStr {
    /// Allocation size of a record for a string of `len` bytes.
    pub(crate) fn total_size(own: bool, len: u32) -> u32 {
        debug_assert!(len <= MAX_STR_LEN);
        let overflow = if own && len > INLINE_CAPACITY {
            len - INLINE_CAPACITY
        } else {
            0
        };
        std::mem::size_of::<PooledStr>() as u32 + overflow
    }

    /// Writes a record into `raw`.
    ///
    /// # Safety
    /// `raw` must hold [Self::total_size]`(own, bytes.len())` writable
    /// bytes, 8-aligned. When `own` is false the caller guarantees `bytes`
    /// outlives the record.
    pub(crate) unsafe fn construct(
        raw: *mut u8,
        bytes: &[u8],
        own: bool,
        key: bool,
        next: CompactRef,
    ) {
        debug_assert!(bytes.len() as u32 <= MAX_STR_LEN);
        let flags = ((bytes.len() as u32) << 2) | ((key as u32) << 1) | own as u32;
        unsafe {
            (raw as *mut u32).write(flags);
            (raw.add(4) as *mut CompactRef).write(next);
            if own {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), raw.add(PAYLOAD_OFFSET), bytes.len());
            } else {
                (raw.add(PAYLOAD_OFFSET) as *mut *const u8).write(bytes.as_ptr());
            }
        }
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.flags >> 2
    }

    /// Payload appended in place, as opposed to borrowed external bytes.
    #[inline]
    pub fn owns(&self) -> bool {
        self.flags & 0x01 != 0
    }

    /// Has this string been used as an object key at least once?
    #[inline]
    pub fn is_key(&self) -> bool {
        self.flags & 0x02 != 0
    }

    /// Sticky OR of the key flag.
    #[inline]
    pub(crate) fn mark_key(&mut self, key: bool) {
        self.flags |= (key as u32) << 1;
    }

    #[inline]
    pub(crate) fn next(&self) -> CompactRef {
        self.next
    }

    #[inline]
    pub(crate) fn set_next(&mut self, next: CompactRef) {
        self.next = next;
    }

    /// # Safety
    /// `this` must point at a live record; for a borrowed record the
    /// external bytes must still be alive.
    pub(crate) unsafe fn bytes<'a>(this: *const PooledStr) -> &'a [u8] {
        unsafe {
            let len = (*this).len() as usize;
            let ptr = if (*this).owns() {
                (this as *const u8).add(PAYLOAD_OFFSET)
            } else {
                (*this).payload.ext
            };
            std::slice::from_raw_parts(ptr, len)
        }
    }

    /// # Safety
    /// As [Self::bytes]; the payload must be valid UTF-8 (both
    /// constructors only accept `&str` data).
    pub unsafe fn as_str<'a>(this: *const PooledStr) -> &'a str {
        unsafe { std::str::from_utf8_unchecked(Self::bytes(this)) }
    }

    /// Ordering against probe bytes: length first, then lexicographic.
    ///
    /// # Safety
    /// As [Self::bytes].
    pub(crate) unsafe fn compare(this: *const PooledStr, other: &[u8]) -> Ordering {
        unsafe {
            let len = (*this).len();
            match len.cmp(&(other.len() as u32)) {
                Ordering::Equal => {}
                order => return order,
            }
            if !(*this).owns() && std::ptr::eq((*this).payload.ext, other.as_ptr()) {
                return Ordering::Equal;
            }
            Self::bytes(this).cmp(other)
        }
    }

    /// Chain-order comparison of two records.
    ///
    /// # Safety
    /// As [Self::bytes], for both records.
    pub(crate) unsafe fn compare_records(a: *const PooledStr, b: *const PooledStr) -> Ordering {
        unsafe { Self::compare(a, Self::bytes(b)) }
    }
}
