// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Errors reported by the checked accessors of the editor and read cursors.
///
/// Everything else in the core is either infallible or a programming error:
/// wrong-tag access panics, allocator exhaustion surfaces as an allocation
/// fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: u32, len: u32 },
    #[error("object has no member with the requested key")]
    KeyNotFound,
    #[error("path step does not match the container kind at that depth")]
    NotAContainer,
    #[error("swap targets overlap (one path is a prefix of the other)")]
    OverlappingSwap,
}
