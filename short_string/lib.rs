// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::cmp::Ordering;

/// Number of bytes reserved for character data. Strings of this length or
/// longer do not fit inline and must be stored out of line.
const MAX_REGION: usize = 14;

/// Maximum number of bytes a [ShortString] can inline.
pub const MAX_LEN: usize = MAX_REGION - 1;

/// A string of up to [MAX_LEN] bytes of UTF-8 stored inline in 15 bytes.
///
/// The first 14 bytes are the character region; the last byte stores
/// `14 - len`, so the length is recovered in constant time and a value cell
/// embedding a [ShortString] after its one-byte tag is exactly 16 bytes.
/// Unused character bytes are zeroed, which makes derived equality and
/// hashing agree with string equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShortString {
    bytes: [u8; MAX_REGION + 1],
}

impl ShortString {
    pub const EMPTY: ShortString = ShortString {
        bytes: [
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            0,
            MAX_REGION as u8,
        ],
    };

    /// Does a string of `len` bytes fit inline?
    #[inline]
    pub const fn fits(len: usize) -> bool {
        len <= MAX_LEN
    }

    /// Builds a ShortString from `string`, or returns None if it is too
    /// long to inline.
    pub fn try_from_str(string: &str) -> Option<ShortString> {
        if !Self::fits(string.len()) {
            return None;
        }
        let mut bytes = [0u8; MAX_REGION + 1];
        bytes[..string.len()].copy_from_slice(string.as_bytes());
        bytes[MAX_REGION] = (MAX_REGION - string.len()) as u8;
        Some(ShortString { bytes })
    }

    #[inline]
    pub const fn len(&self) -> usize {
        MAX_REGION - self.bytes[MAX_REGION] as usize
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len()]
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: construction only ever copies in a whole `&str`, and the
        // length byte never splits what was copied.
        unsafe { core::str::from_utf8_unchecked(self.as_bytes()) }
    }

    /// The full 15-byte backing region, length byte included.
    #[inline]
    pub const fn raw_bytes(&self) -> &[u8; MAX_REGION + 1] {
        &self.bytes
    }
}

impl Ord for ShortString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for ShortString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq<str> for ShortString {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl PartialEq<&str> for ShortString {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.eq(*other)
    }
}

impl core::fmt::Debug for ShortString {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "\"{}\"", self.as_str())
    }
}

const _: () = assert!(core::mem::size_of::<ShortString>() == 15);
const _: () = assert!(core::mem::align_of::<ShortString>() == 1);
