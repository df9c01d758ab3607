//! Per-device action sequence numbers.
//!
//! Every outbound control call is tagged with a `SeqNo` taken from the
//! device's `SeqCounter`. Completions echo the tag back, which lets the
//! state machine know which calls the renderer has acknowledged.
//!
//! Numbers wrap around. Comparisons are only meaningful inside a window of
//! `IN_FLIGHT_WINDOW` numbers: a tag further than that behind the reference
//! is considered to be *ahead* of it (it belongs to the next lap).

use std::fmt;

/// Maximum distance between two sequence numbers that are still compared
/// as "before / after" each other.
pub const IN_FLIGHT_WINDOW: u32 = 1 << 30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SeqNo(pub u32);

impl SeqNo {
    /// True if `self` was issued at or before `reference`.
    pub fn is_at_or_before(self, reference: SeqNo) -> bool {
        reference.0.wrapping_sub(self.0) < IN_FLIGHT_WINDOW
    }

    /// True if `self` was issued strictly after `reference`.
    pub fn is_after(self, reference: SeqNo) -> bool {
        !self.is_at_or_before(reference)
    }

    pub fn next(self) -> SeqNo {
        SeqNo(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic (modulo wrap-around) generator of `SeqNo`s.
#[derive(Clone, Debug, Default)]
pub struct SeqCounter {
    last: SeqNo,
}

impl SeqCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts counting right after `last`.
    pub fn starting_after(last: SeqNo) -> Self {
        Self { last }
    }

    /// Allocates the tag for a new outbound call.
    pub fn advance(&mut self) -> SeqNo {
        self.last = self.last.next();
        self.last
    }

    /// Tag of the most recently issued call.
    pub fn last_issued(&self) -> SeqNo {
        self.last
    }
}
