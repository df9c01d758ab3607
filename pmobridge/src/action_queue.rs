//! Pending transport intents of a renderer.
//!
//! Host commands that must not race the renderer (PLAY, PAUSE, …) are not
//! sent right away: they wait here until the state machine decides they can
//! be issued. An *ordered* entry additionally waits until the call it
//! depends on (`wait_for`) has been acknowledged by the renderer.
//!
//! The queue has no lock of its own. It lives inside the device state and
//! is only touched while the device lock is held.

use std::collections::VecDeque;

use crate::sequence::SeqNo;
use crate::table::DeviceHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Play,
    Pause,
    Unpause,
    Stop,
}

impl ActionKind {
    /// PLAY and UNPAUSE both end with the renderer in PLAYING.
    pub fn starts_playback(self) -> bool {
        matches!(self, ActionKind::Play | ActionKind::Unpause)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedAction {
    pub kind: ActionKind,
    /// Call this entry depends on; for unordered entries it is simply the
    /// tag that was current when the entry was queued.
    pub wait_for: SeqNo,
    pub ordered: bool,
    pub device: DeviceHandle,
}

impl QueuedAction {
    /// An entry is ready once it is unordered or its dependency is acked.
    pub fn is_ready(&self, last_acked: SeqNo) -> bool {
        !self.ordered || self.wait_for.is_at_or_before(last_acked)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ActionQueue {
    entries: VecDeque<QueuedAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, device: DeviceHandle, kind: ActionKind, wait_for: SeqNo, ordered: bool) {
        self.entries.push_back(QueuedAction {
            kind,
            wait_for,
            ordered,
            device,
        });
    }

    /// Oldest entry, left in place.
    pub fn peek_head(&self) -> Option<&QueuedAction> {
        self.entries.front()
    }

    /// Removes and returns the head if it may be issued given `last_acked`.
    pub fn dequeue_if_ready(&mut self, last_acked: SeqNo) -> Option<QueuedAction> {
        if self.entries.front()?.is_ready(last_acked) {
            self.entries.pop_front()
        } else {
            None
        }
    }

    /// Drops the head if it is of one of the given kinds. Used when the
    /// renderer reaches the state the entry was meant to produce.
    pub fn release_head_if(&mut self, accept: impl Fn(ActionKind) -> bool) -> Option<QueuedAction> {
        if accept(self.entries.front()?.kind) {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn flush(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
