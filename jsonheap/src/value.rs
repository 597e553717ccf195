// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packed tagged value and member cells.
//!
//! A value is a 16-byte, 8-aligned cell whose first byte is the tag; the
//! remaining 15 bytes are interpreted per tag. A member is a 24-byte
//! (key reference, value cell) pair. The layouts are expressed as a
//! `#[repr(C)]` union of Copy structs that all lead with the tag byte.

pub(crate) mod big;

use short_string::ShortString;

use crate::strings::interned::PooledStr;

/// Container capacities at or above this sentinel live in a big-container
/// descriptor; the inline capacity field holds the sentinel itself.
pub(crate) const BIG_CAPA: u16 = u16::MAX;

/// Value discriminant. One byte at offset 0 of every cell.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Tag {
    Object = 0,
    Array = 1,
    BoolArray = 2,
    IntArray = 3,
    DoubleArray = 4,
    ShortString = 5,
    LongString = 6,
    Int64 = 7,
    UInt64 = 8,
    Double = 9,
    True = 10,
    False = 11,
    Null = 12,
}

/// Folds the 13 tags into the 6 JSON-visible kinds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Meta {
    Object,
    Array,
    String,
    Number,
    Bool,
    Null,
}

impl Tag {
    pub fn meta(self) -> Meta {
        match self {
            Tag::Object => Meta::Object,
            Tag::Array | Tag::BoolArray | Tag::IntArray | Tag::DoubleArray => Meta::Array,
            Tag::ShortString | Tag::LongString => Meta::String,
            Tag::Int64 | Tag::UInt64 | Tag::Double => Meta::Number,
            Tag::True | Tag::False => Meta::Bool,
            Tag::Null => Meta::Null,
        }
    }

    /// Object or any of the four array kinds: the tags with the shared
    /// `{capa, size, ptr}` layout.
    pub(crate) fn is_container(self) -> bool {
        matches!(
            self,
            Tag::Object | Tag::Array | Tag::BoolArray | Tag::IntArray | Tag::DoubleArray
        )
    }

    pub(crate) fn is_array_kind(self) -> bool {
        self.meta() == Meta::Array
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
struct TagRep {
    tag: Tag,
    _pad: [u8; 15],
}

#[derive(Clone, Copy)]
#[repr(C)]
struct NumberRep {
    tag: Tag,
    _pad: [u8; 7],
    bits: u64,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ShortRep {
    tag: Tag,
    str: ShortString,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct LongRep {
    tag: Tag,
    _pad0: u8,
    _pad1: u16,
    len: u32,
    ptr: *const u8,
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ContRep {
    tag: Tag,
    capa: u16,
    size: u32,
    ptr: *mut u8,
}

#[derive(Clone, Copy)]
#[repr(C)]
union CellRepr {
    t: TagRep,
    n: NumberRep,
    ss: ShortRep,
    ls: LongRep,
    c: ContRep,
}

/// The 16-byte packed value cell.
#[derive(Clone, Copy)]
pub(crate) struct PackedValue {
    repr: CellRepr,
}

// The cell layout is the point of the whole crate. These asserts must
// never be removed or broken.
const _: () = assert!(std::mem::size_of::<PackedValue>() == 16);
const _: () = assert!(std::mem::align_of::<PackedValue>() == 8);
const _: () = assert!(std::mem::size_of::<ContRep>() == 16);
const _: () = assert!(std::mem::size_of::<NumberRep>() == 16);
const _: () = assert!(std::mem::size_of::<LongRep>() == 16);
const _: () = assert!(std::mem::size_of::<ShortRep>() == 16);

impl PackedValue {
    pub(crate) const NULL: PackedValue = PackedValue {
        repr: CellRepr {
            t: TagRep {
                tag: Tag::Null,
                _pad: [0; 15],
            },
        },
    };

    pub(crate) fn from_bool(b: bool) -> PackedValue {
        PackedValue {
            repr: CellRepr {
                t: TagRep {
                    tag: if b { Tag::True } else { Tag::False },
                    _pad: [0; 15],
                },
            },
        }
    }

    pub(crate) fn from_i64(i: i64) -> PackedValue {
        PackedValue {
            repr: CellRepr {
                n: NumberRep {
                    tag: Tag::Int64,
                    _pad: [0; 7],
                    bits: i as u64,
                },
            },
        }
    }

    pub(crate) fn from_u64(u: u64) -> PackedValue {
        PackedValue {
            repr: CellRepr {
                n: NumberRep {
                    tag: Tag::UInt64,
                    _pad: [0; 7],
                    bits: u,
                },
            },
        }
    }

    pub(crate) fn from_f64(d: f64) -> PackedValue {
        PackedValue {
            repr: CellRepr {
                n: NumberRep {
                    tag: Tag::Double,
                    _pad: [0; 7],
                    bits: d.to_bits(),
                },
            },
        }
    }

    pub(crate) fn from_short(s: ShortString) -> PackedValue {
        PackedValue {
            repr: CellRepr {
                ss: ShortRep {
                    tag: Tag::ShortString,
                    str: s,
                },
            },
        }
    }

    /// A long-string cell referencing `len` pooled bytes at `ptr`.
    pub(crate) fn from_long(ptr: *const u8, len: u32) -> PackedValue {
        debug_assert!(!ptr.is_null());
        PackedValue {
            repr: CellRepr {
                ls: LongRep {
                    tag: Tag::LongString,
                    _pad0: 0,
                    _pad1: 0,
                    len,
                    ptr,
                },
            },
        }
    }

    /// An empty container of the given kind.
    pub(crate) fn container(tag: Tag) -> PackedValue {
        debug_assert!(tag.is_container());
        PackedValue {
            repr: CellRepr {
                c: ContRep {
                    tag,
                    capa: 0,
                    size: 0,
                    ptr: std::ptr::null_mut(),
                },
            },
        }
    }

    // Reading.

    #[inline]
    pub(crate) fn tag(&self) -> Tag {
        // SAFETY: every variant leads with the tag byte.
        unsafe { self.repr.t.tag }
    }

    #[inline]
    pub(crate) fn meta(&self) -> Meta {
        self.tag().meta()
    }

    pub(crate) fn get_bool(&self) -> bool {
        debug_assert!(self.meta() == Meta::Bool);
        self.tag() == Tag::True
    }

    pub(crate) fn get_i64(&self) -> i64 {
        debug_assert!(self.tag() == Tag::Int64);
        // SAFETY: tag-checked number layout.
        unsafe { self.repr.n.bits as i64 }
    }

    pub(crate) fn get_u64(&self) -> u64 {
        debug_assert!(self.tag() == Tag::UInt64);
        // SAFETY: tag-checked number layout.
        unsafe { self.repr.n.bits }
    }

    pub(crate) fn get_f64(&self) -> f64 {
        debug_assert!(self.tag() == Tag::Double);
        // SAFETY: tag-checked number layout.
        unsafe { f64::from_bits(self.repr.n.bits) }
    }

    pub(crate) fn as_number(&self) -> f64 {
        match self.tag() {
            Tag::Int64 => self.get_i64() as f64,
            Tag::UInt64 => self.get_u64() as f64,
            Tag::Double => self.get_f64(),
            _ => {
                debug_assert!(false, "not a number");
                0.0
            }
        }
    }

    pub(crate) fn short(&self) -> &ShortString {
        debug_assert!(self.tag() == Tag::ShortString);
        // SAFETY: tag-checked short-string layout.
        unsafe { &self.repr.ss.str }
    }

    pub(crate) fn long_len(&self) -> u32 {
        debug_assert!(self.tag() == Tag::LongString);
        // SAFETY: tag-checked long-string layout.
        unsafe { self.repr.ls.len }
    }

    /// String bytes of either string representation.
    ///
    /// # Safety
    /// For a long string the referenced pool entry must still be alive.
    pub(crate) unsafe fn str_bytes(&self) -> &[u8] {
        match self.tag() {
            Tag::ShortString => self.short().as_bytes(),
            Tag::LongString => unsafe {
                std::slice::from_raw_parts(self.repr.ls.ptr, self.repr.ls.len as usize)
            },
            _ => {
                debug_assert!(false, "not a string");
                &[]
            }
        }
    }

    pub(crate) fn str_len(&self) -> u32 {
        match self.tag() {
            Tag::ShortString => self.short().len() as u32,
            Tag::LongString => self.long_len(),
            _ => {
                debug_assert!(false, "not a string");
                0
            }
        }
    }

    // Container reading. All of these require a container tag; mismatches
    // are programming errors caught in debug builds.

    #[inline]
    pub(crate) fn cont_size(&self) -> u32 {
        debug_assert!(self.tag().is_container());
        // SAFETY: tag-checked container layout.
        unsafe { self.repr.c.size }
    }

    #[inline]
    pub(crate) fn cont_capa_raw(&self) -> u16 {
        debug_assert!(self.tag().is_container());
        // SAFETY: tag-checked container layout.
        unsafe { self.repr.c.capa }
    }

    #[inline]
    pub(crate) fn cont_ptr(&self) -> *mut u8 {
        debug_assert!(self.tag().is_container());
        // SAFETY: tag-checked container layout.
        unsafe { self.repr.c.ptr }
    }

    pub(crate) fn capacity<T: ContElem>(&self) -> u32 {
        debug_assert!(self.tag() == T::TAG);
        let raw = self.cont_capa_raw();
        if raw < BIG_CAPA {
            raw as u32
        } else {
            // SAFETY: the sentinel guarantees a big descriptor.
            unsafe { big::capa(self.cont_ptr()) }
        }
    }

    /// Element buffer, reaching through the big descriptor when present.
    pub(crate) fn data<T: ContElem>(&self) -> *mut T {
        debug_assert!(self.tag() == T::TAG);
        let ptr = self.cont_ptr();
        if self.cont_capa_raw() < BIG_CAPA {
            ptr as *mut T
        } else {
            // SAFETY: the sentinel guarantees a big descriptor.
            unsafe { big::data::<T>(ptr) }
        }
    }

    pub(crate) fn is_full<T: ContElem>(&self) -> bool {
        self.cont_size() == self.capacity::<T>()
    }

    /// Bytes currently reserved for this container's storage.
    pub(crate) fn mem_size<T: ContElem>(&self) -> u32 {
        debug_assert!(self.tag() == T::TAG);
        let raw = self.cont_capa_raw();
        if raw < BIG_CAPA {
            raw as u32 * std::mem::size_of::<T>() as u32
        } else {
            big::alloc_size::<T>(self.capacity::<T>())
        }
    }

    /// Bytes of that reservation holding live elements (plus the big
    /// header when out of line).
    pub(crate) fn mem_used<T: ContElem>(&self) -> u32 {
        debug_assert!(self.tag() == T::TAG);
        let used = self.cont_size() * std::mem::size_of::<T>() as u32;
        if self.cont_capa_raw() < BIG_CAPA {
            used
        } else {
            big::data_offset::<T>() as u32 + used
        }
    }

    // Writing.

    pub(crate) fn force_null(&mut self) {
        *self = PackedValue::NULL;
    }

    /// Retags a cell among the container kinds without touching storage.
    pub(crate) fn force_tag(&mut self, tag: Tag) {
        debug_assert!(tag.is_container() && self.tag().is_container());
        // SAFETY: tag-checked container layout.
        let mut c = unsafe { self.repr.c };
        c.tag = tag;
        self.repr = CellRepr { c };
    }

    pub(crate) fn set_cont_ptr(&mut self, ptr: *mut u8) {
        debug_assert!(self.tag().is_container());
        // SAFETY: tag-checked container layout.
        let mut c = unsafe { self.repr.c };
        c.ptr = ptr;
        self.repr = CellRepr { c };
    }

    pub(crate) fn set_cont_capa_raw(&mut self, capa: u16) {
        debug_assert!(self.tag().is_container());
        // SAFETY: tag-checked container layout.
        let mut c = unsafe { self.repr.c };
        c.capa = capa;
        self.repr = CellRepr { c };
    }

    pub(crate) fn set_cont_size(&mut self, size: u32) {
        debug_assert!(self.tag().is_container());
        // SAFETY: tag-checked container layout.
        let mut c = unsafe { self.repr.c };
        c.size = size;
        self.repr = CellRepr { c };
    }

    /// Points the cell at a raw element run: a plain buffer under the
    /// sentinel, a big descriptor at or above it. `count` becomes both
    /// size and (inline) capacity.
    pub(crate) fn set_raw<T: ContElem>(&mut self, ptr: *mut u8, count: u32) {
        debug_assert!(self.tag() == T::TAG);
        if count < BIG_CAPA as u32 {
            self.set_cont_ptr(ptr);
            self.set_cont_capa_raw(count as u16);
        } else {
            debug_assert_eq!(unsafe { big::capa(ptr) }, count);
            self.set_cont_ptr(ptr);
            self.set_cont_capa_raw(BIG_CAPA);
        }
        self.set_cont_size(count);
    }

    /// Appends a null element to a generic array with spare capacity.
    pub(crate) fn inc_size_null(&mut self) {
        debug_assert!(self.tag() == Tag::Array);
        debug_assert!(self.capacity::<PackedValue>() > self.cont_size());
        let size = self.cont_size();
        // SAFETY: capacity-checked slot inside the element buffer.
        unsafe { self.data::<PackedValue>().add(size as usize).write(PackedValue::NULL) };
        self.set_cont_size(size + 1);
    }

    /// Bumps the size without initializing the new slot; the caller writes
    /// it immediately after.
    pub(crate) fn inc_size_uninit<T: ContElem>(&mut self) -> u32 {
        debug_assert!(self.capacity::<T>() > self.cont_size());
        let size = self.cont_size();
        self.set_cont_size(size + 1);
        size
    }

    pub(crate) fn dec_size(&mut self) {
        debug_assert!(self.cont_size() > 0);
        let size = self.cont_size();
        self.set_cont_size(size - 1);
    }

    /// Appends a member with a null value; returns the value slot.
    pub(crate) fn push_member(&mut self, key: *const PooledStr) -> *mut PackedValue {
        debug_assert!(!key.is_null());
        debug_assert!(self.tag() == Tag::Object);
        debug_assert!(self.capacity::<PackedMember>() > self.cont_size());
        let size = self.cont_size();
        // SAFETY: capacity-checked slot inside the member buffer.
        unsafe {
            let slot = self.data::<PackedMember>().add(size as usize);
            slot.write(PackedMember::new(key));
            self.set_cont_size(size + 1);
            &mut (*slot).value as *mut PackedValue
        }
    }
}

/// The 24-byte (key reference, value) member cell.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct PackedMember {
    pub(crate) key: *const PooledStr,
    pub(crate) value: PackedValue,
}

const _: () = assert!(std::mem::size_of::<PackedMember>() == 24);
const _: () = assert!(std::mem::align_of::<PackedMember>() == 8);

impl PackedMember {
    pub(crate) fn new(key: *const PooledStr) -> PackedMember {
        PackedMember {
            key,
            value: PackedValue::NULL,
        }
    }

    /// # Safety
    /// The pool entry behind the key reference must still be alive.
    pub(crate) unsafe fn key_str(&self) -> &str {
        debug_assert!(!self.key.is_null());
        unsafe { PooledStr::as_str(self.key) }
    }
}

/// The five element kinds a container cell can hold. Sealed by being
/// crate-private.
pub(crate) trait ContElem: Copy {
    const TAG: Tag;
}

impl ContElem for PackedValue {
    const TAG: Tag = Tag::Array;
}

impl ContElem for bool {
    const TAG: Tag = Tag::BoolArray;
}

impl ContElem for i64 {
    const TAG: Tag = Tag::IntArray;
}

impl ContElem for f64 {
    const TAG: Tag = Tag::DoubleArray;
}

impl ContElem for PackedMember {
    const TAG: Tag = Tag::Object;
}

/// Scalar element kinds that widen to a full value cell when a
/// specialized array is promoted to a generic one.
pub(crate) trait Widen: ContElem {
    fn widen(self) -> PackedValue;
}

impl Widen for bool {
    fn widen(self) -> PackedValue {
        PackedValue::from_bool(self)
    }
}

impl Widen for i64 {
    fn widen(self) -> PackedValue {
        PackedValue::from_i64(self)
    }
}

impl Widen for f64 {
    fn widen(self) -> PackedValue {
        PackedValue::from_f64(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_cells() {
        let v = PackedValue::from_i64(-42);
        assert_eq!(v.tag(), Tag::Int64);
        assert_eq!(v.meta(), Meta::Number);
        assert_eq!(v.get_i64(), -42);
        assert_eq!(v.as_number(), -42.0);

        let v = PackedValue::from_u64(u64::MAX);
        assert_eq!(v.get_u64(), u64::MAX);

        let v = PackedValue::from_f64(2.5);
        assert_eq!(v.get_f64(), 2.5);

        assert_eq!(PackedValue::from_bool(true).tag(), Tag::True);
        assert_eq!(PackedValue::from_bool(false).tag(), Tag::False);
        assert!(PackedValue::from_bool(true).get_bool());
        assert_eq!(PackedValue::NULL.tag(), Tag::Null);
    }

    #[test]
    fn short_string_cell() {
        let s = ShortString::try_from_str("hi there").unwrap();
        let v = PackedValue::from_short(s);
        assert_eq!(v.tag(), Tag::ShortString);
        assert_eq!(v.str_len(), 8);
        assert_eq!(unsafe { v.str_bytes() }, b"hi there");
    }

    #[test]
    fn empty_container_cells() {
        for tag in [
            Tag::Object,
            Tag::Array,
            Tag::BoolArray,
            Tag::IntArray,
            Tag::DoubleArray,
        ] {
            let v = PackedValue::container(tag);
            assert_eq!(v.tag(), tag);
            assert_eq!(v.cont_size(), 0);
            assert_eq!(v.cont_capa_raw(), 0);
        }
        assert_eq!(PackedValue::container(Tag::Array).capacity::<PackedValue>(), 0);
        assert_eq!(PackedValue::container(Tag::IntArray).capacity::<i64>(), 0);
    }

    #[test]
    fn retag_keeps_container_fields() {
        let mut v = PackedValue::container(Tag::IntArray);
        v.set_cont_size(3);
        v.force_tag(Tag::DoubleArray);
        assert_eq!(v.tag(), Tag::DoubleArray);
        assert_eq!(v.cont_size(), 3);
    }
}
