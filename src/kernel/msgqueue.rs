//! Engine message port
//!
//! Search drivers report what changed during a turn by setting bits in a
//! per-session mask. The owning session drains the mask once per scheduler
//! turn, so many updates between two drains collapse into one bit and each
//! bit is delivered at most once per drain.
//!
//! Completion is special: the done bit carries the serial of the search
//! that finished, so a completion posted by a search that has since been
//! aborted can be recognised and dropped.

use std::cell::RefCell;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;

/// Set of pending engine events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EngineMessages(u32);

impl EngineMessages {
    pub const MAIN_LINE: Self = Self(1 << 0);
    pub const SCORE: Self = Self(1 << 1);
    pub const DEPTH: Self = Self(1 << 2);
    pub const NODES: Self = Self(1 << 3);
    pub const CURRENT_MOVE: Self = Self(1 << 4);
    pub const HINT: Self = Self(1 << 5);
    pub const SEARCH_DONE: Self = Self(1 << 6);

    /// Every event, in dispatch order
    pub const ALL: [Self; 7] = [
        Self::MAIN_LINE,
        Self::SCORE,
        Self::DEPTH,
        Self::NODES,
        Self::CURRENT_MOVE,
        Self::HINT,
        Self::SEARCH_DONE,
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep only known bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & 0x7f)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// The single-bit events in this set, in dispatch order
    pub fn iter(self) -> impl Iterator<Item = EngineMessages> {
        Self::ALL.into_iter().filter(move |bit| self.contains(*bit))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::MAIN_LINE => "main-line",
            Self::SCORE => "score",
            Self::DEPTH => "depth",
            Self::NODES => "nodes",
            Self::CURRENT_MOVE => "current-move",
            Self::HINT => "hint",
            Self::SEARCH_DONE => "search-done",
            _ => "mixed",
        }
    }
}

impl BitOr for EngineMessages {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EngineMessages {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EngineMessages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|bit| bit.name()).collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// What a drain picked up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    pub messages: EngineMessages,
    /// Serial of the search that posted `SEARCH_DONE`
    pub completed: Option<u64>,
}

#[derive(Debug, Default)]
struct PortState {
    pending: EngineMessages,
    completed: Option<u64>,
    posted: u64,
    drained: u64,
}

/// Shared mailbox between a session and its search driver task
#[derive(Debug, Clone, Default)]
pub struct MessagePort {
    inner: Rc<RefCell<PortState>>,
}

impl MessagePort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record progress events; completion must go through `post_done`
    pub fn post(&self, mut messages: EngineMessages) {
        messages.remove(EngineMessages::SEARCH_DONE);
        if messages.is_empty() {
            return;
        }
        let mut state = self.inner.borrow_mut();
        state.pending |= messages;
        state.posted += 1;
    }

    /// Record that search `serial` finished
    pub fn post_done(&self, serial: u64) {
        let mut state = self.inner.borrow_mut();
        state.pending |= EngineMessages::SEARCH_DONE;
        state.completed = Some(serial);
        state.posted += 1;
    }

    /// Take every pending event, clearing the mask
    pub fn drain(&self) -> Delivery {
        let mut state = self.inner.borrow_mut();
        let delivery = Delivery {
            messages: std::mem::take(&mut state.pending),
            completed: state.completed.take(),
        };
        if !delivery.messages.is_empty() {
            state.drained += 1;
        }
        delivery
    }

    /// Events posted since the last drain
    pub fn pending(&self) -> EngineMessages {
        self.inner.borrow().pending
    }

    /// Forget a pending completion (its search was aborted)
    pub fn discard_done(&self) {
        let mut state = self.inner.borrow_mut();
        state.pending.remove(EngineMessages::SEARCH_DONE);
        state.completed = None;
    }

    /// (posts, non-empty drains) since creation
    pub fn counts(&self) -> (u64, u64) {
        let state = self.inner.borrow();
        (state.posted, state.drained)
    }
}
