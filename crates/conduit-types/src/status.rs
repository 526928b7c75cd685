//! Bitwise status flags shared by outbox and inbox rows.
//!
//! See SPEC_FULL.md §3 and the Open Question decision recorded in DESIGN.md: `Published` and
//! `EventStored` are orthogonal bits, not overlapping ones. `Published` means "handed to the
//! transport successfully"; `EventStored` means "the originating domain event was durably
//! appended to the event log before this row was created".

use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Bitwise status flags for an outbox or inbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    /// Row has been durably stored (set on insert, never cleared).
    pub const STORED: StatusFlags = StatusFlags(1);
    /// Row's envelope has been handed to the transport successfully.
    pub const PUBLISHED: StatusFlags = StatusFlags(2);
    /// Row is terminally failed (retry budget exhausted or non-retryable error).
    pub const FAILED: StatusFlags = StatusFlags(4);
    /// Row's originating domain event was durably appended before this row was created.
    pub const EVENT_STORED: StatusFlags = StatusFlags(8);
    /// No flags set.
    pub const NONE: StatusFlags = StatusFlags(0);

    /// True if `other`'s bits are all present in `self`.
    pub fn contains(self, other: StatusFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the row is terminal-success (`Published` set for a non-event row) or
    /// terminal-failure (`Failed` set). Per SPEC_FULL §4.2 step 2, an event-carrying row is only
    /// terminal once both `Published` and `EventStored` are set.
    pub fn is_terminal(self, carries_event: bool) -> bool {
        if self.contains(StatusFlags::FAILED) {
            return true;
        }
        if carries_event {
            self.contains(StatusFlags::PUBLISHED) && self.contains(StatusFlags::EVENT_STORED)
        } else {
            self.contains(StatusFlags::PUBLISHED)
        }
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        Self::NONE
    }
}

impl BitOr for StatusFlags {
    type Output = StatusFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        StatusFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for StatusFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_requires_both_bits_for_event_rows() {
        let published_only = StatusFlags::STORED | StatusFlags::PUBLISHED;
        assert!(!published_only.is_terminal(true));
        assert!(published_only.is_terminal(false));

        let both = published_only | StatusFlags::EVENT_STORED;
        assert!(both.is_terminal(true));
    }

    #[test]
    fn failed_is_always_terminal() {
        let failed = StatusFlags::STORED | StatusFlags::FAILED;
        assert!(failed.is_terminal(true));
        assert!(failed.is_terminal(false));
    }

    #[test]
    fn contains_checks_all_bits() {
        let flags = StatusFlags::STORED | StatusFlags::PUBLISHED;
        assert!(flags.contains(StatusFlags::STORED));
        assert!(!flags.contains(StatusFlags::FAILED));
        assert!(flags.contains(StatusFlags::STORED | StatusFlags::PUBLISHED));
    }
}
