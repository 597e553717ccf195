// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// 4-byte `{chunk, pos}` handle into a [CompactPool](super::CompactPool),
/// used in place of 8-byte raw pointers wherever the string pool stores a
/// link.
///
/// `chunk == 0xFFFF` is the null handle; `chunk == 0xFFFE` addresses the
/// fallback list, with `pos` counting from the first fallback record ever
/// made (so the handle stays valid as records come and go).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub struct CompactRef {
    chunk: u16,
    pos: u16,
}

impl CompactRef {
    pub const NULL: CompactRef = CompactRef {
        chunk: u16::MAX,
        pos: u16::MAX,
    };

    pub(crate) const FALLBACK_CHUNK: u16 = u16::MAX - 1;

    pub(crate) const fn new(chunk: u16, pos: u16) -> CompactRef {
        CompactRef { chunk, pos }
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.chunk == u16::MAX
    }

    #[inline]
    pub(crate) const fn chunk(self) -> u16 {
        self.chunk
    }

    #[inline]
    pub(crate) const fn pos(self) -> u16 {
        self.pos
    }

    #[inline]
    pub(crate) const fn is_fallback(self) -> bool {
        self.chunk == Self::FALLBACK_CHUNK
    }
}

const _: () = assert!(std::mem::size_of::<CompactRef>() == 4);
